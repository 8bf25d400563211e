mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post, put};
use log::warn;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

pub use self::error::{ApiError, AppError};
pub use self::state::*;
pub use self::types::{ReferenceSummary, parse_ingredients};
use crate::analysis::*;
use crate::escalate::Assessment;
use crate::matcher::{Decision, IndexStats, MatchCandidate};
use crate::model::InferenceResult;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(title = "Food Vision API"),
    paths(
        api::classify_handler,
        api::batch_handler,
        api::list_references_handler,
        api::add_reference_handler,
        api::delete_reference_handler,
        api::delete_label_handler,
        api::update_ingredients_handler,
        api::reload_handler,
        api::health_handler,
        api::ready_handler,
    ),
    components(schemas(
        types::ClassifyForm,
        types::BatchClassifyForm,
        types::AddReferenceForm,
        types::ReferenceSummary,
        types::ReferenceListResponse,
        types::AddReferenceResponse,
        types::DeleteReferenceResponse,
        types::UpdateIngredientsRequest,
        types::LabelResponse,
        types::HealthResponse,
        types::ReadyResponse,
        AnalysisResponse,
        BatchResponse,
        BatchItem,
        EscalationOutcome,
        EscalationStatus,
        ScoreBreakdown,
        Latency,
        Assessment,
        InferenceResult,
        MatchCandidate,
        Decision,
        IndexStats,
    )),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// 解析允许跨域的来源，`*` 表示任意来源
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("忽略无效的跨域来源 {origin}: {e}");
                None
            }
        })
        .collect::<Vec<_>>();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// 构建API服务器
pub fn create_app(state: Arc<AppState>, allowed_origins: &[String]) -> Router {
    let protected = Router::new()
        .route("/references", post(api::add_reference_handler))
        .route("/references/{id}", delete(api::delete_reference_handler))
        .route("/labels/{label}", delete(api::delete_label_handler))
        .route("/labels/{label}/ingredients", put(api::update_ingredients_handler))
        .route("/reload", post(api::reload_handler))
        .route_layer(from_fn_with_state(state.clone(), api::require_token));

    let max_upload_bytes = state.analyzer.settings.max_upload_bytes;

    Router::new()
        .route("/", get(api::banner_handler))
        .route("/classify", post(api::classify_handler))
        .route("/classify/batch", post(api::batch_handler))
        .route("/references", get(api::list_references_handler))
        .route("/health", get(api::health_handler))
        .route("/ready", get(api::ready_handler))
        .route("/metrics", get(api::metrics_handler))
        .route("/redoc", get(api::redoc_handler))
        .merge(protected)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 批量上传时允许多张图片，单张图片的大小由分析流程检查
        .layer(RequestBodyLimitLayer::new(max_upload_bytes * 4))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}
