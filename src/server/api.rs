use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use axum_auth::AuthBearer;
use axum_typed_multipart::{TypedMultipart, TypedMultipartError};
use log::{info, warn};
use tokio::task::spawn_blocking;

use super::error::{ApiError, Result};
use super::state::AppState;
use super::types::*;
use crate::analysis::{AnalysisResponse, BatchResponse, Upload};
use crate::matcher::IndexStats;
use crate::metrics;
use crate::storage::{ReferenceMeta, StorageError};

/// 在阻塞线程池中执行文件或计算密集的操作
async fn blocking<T, E, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    spawn_blocking(f).await?.map_err(Into::into)
}

async fn refresh_index(state: &AppState) -> anyhow::Result<IndexStats> {
    let analyzer = &state.analyzer;
    analyzer.matcher.refresh_in_background(analyzer.storage.clone()).await
}

/// 保存到一半出错时，已写入的参考图仍然要进入索引
async fn abort_after_partial_save(state: &AppState, saved: bool, err: anyhow::Error) -> anyhow::Error {
    if saved {
        if let Err(e) = refresh_index(state).await {
            warn!("重建索引失败: {e:#}");
        }
    }
    err
}

/// 校验 Bearer token
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    bearer: std::result::Result<AuthBearer, (StatusCode, &'static str)>,
    request: Request,
    next: Next,
) -> Result<Response> {
    match bearer {
        Ok(AuthBearer(token)) if token == state.token => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized.into()),
    }
}

/// 分析一张图片
#[utoipa::path(
    post,
    path = "/classify",
    request_body(content = ClassifyForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = AnalysisResponse),
        (status = 400, description = "参数错误"),
        (status = 413, description = "文件过大"),
        (status = 404, description = "指定的菜品没有参考图"),
        (status = 415, description = "不支持的图片类型"),
        (status = 422, description = "无法解码的图片"),
        (status = 502, body = AnalysisResponse, description = "升级分析失败（需开启 --report-escalation-failure）"),
        (status = 503, description = "推理超时"),
    )
)]
pub async fn classify_handler(
    State(state): State<Arc<AppState>>,
    data: std::result::Result<TypedMultipart<ClassifyRequest>, TypedMultipartError>,
) -> Result<Response> {
    let TypedMultipart(data) = data.map_err(ApiError::from)?;
    let opts = data.options();
    let response = state.analyzer.analyze(data.file.into(), opts).await?;

    let status = if response.escalation_failed && state.report_escalation_failure {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)).into_response())
}

/// 批量分析图片
#[utoipa::path(
    post,
    path = "/classify/batch",
    request_body(content = BatchClassifyForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = BatchResponse),
    )
)]
pub async fn batch_handler(
    State(state): State<Arc<AppState>>,
    data: std::result::Result<TypedMultipart<BatchClassifyRequest>, TypedMultipartError>,
) -> Result<Json<BatchResponse>> {
    let TypedMultipart(data) = data.map_err(ApiError::from)?;
    if data.file.is_empty() {
        return Err(ApiError::BadRequest("至少需要上传一张图片".to_string()).into());
    }
    let opts = data.options();
    let uploads = data.file.into_iter().map(Upload::from).collect();
    Ok(Json(state.analyzer.analyze_batch(uploads, opts).await))
}

/// 列出所有参考图
#[utoipa::path(
    get,
    path = "/references",
    responses(
        (status = 200, body = ReferenceListResponse),
    )
)]
pub async fn list_references_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReferenceListResponse>> {
    let storage = state.analyzer.storage.clone();
    let version = state.analyzer.model.version().to_string();
    let mut references = blocking(move || {
        storage.load_all_references().map(|refs| {
            refs.map(|r| ReferenceSummary::new(r, &version)).collect::<Vec<_>>()
        })
    })
    .await?;
    references.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let index = state.analyzer.matcher.snapshot().stats();
    Ok(Json(ReferenceListResponse { references, index }))
}

/// 添加参考图，完成后重建索引
#[utoipa::path(
    post,
    path = "/references",
    request_body(content = AddReferenceForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = AddReferenceResponse),
        (status = 401, description = "缺少或无效的 token"),
        (status = 409, description = "参考图已存在"),
        (status = 422, description = "无法解码的图片，此时不会保存任何图片"),
    ),
    security(("bearer" = []))
)]
pub async fn add_reference_handler(
    State(state): State<Arc<AppState>>,
    data: std::result::Result<TypedMultipart<AddReferenceRequest>, TypedMultipartError>,
) -> Result<Json<AddReferenceResponse>> {
    let TypedMultipart(data) = data.map_err(ApiError::from)?;
    let label = data.label.trim().to_string();
    if label.is_empty() {
        return Err(ApiError::BadRequest("label 不能为空".to_string()).into());
    }
    if data.file.is_empty() {
        return Err(ApiError::BadRequest("至少需要上传一张图片".to_string()).into());
    }
    let ingredients = data.ingredients();

    let analyzer = &state.analyzer;

    // 先校验并计算全部图片的特征，任何一张失败都不会写入存储
    let mut prepared = Vec::with_capacity(data.file.len());
    for file in data.file {
        let upload = Upload::from(file);
        let content_type = analyzer.validate(&upload)?;
        let model = analyzer.model.clone();
        let bytes = upload.data.clone();
        let embedding = blocking(move || model.embed(&bytes)).await?;
        prepared.push((upload, content_type, embedding));
    }

    let mut added = vec![];
    let mut duplicates = vec![];
    let mut last_duplicate = None;
    for (upload, content_type, embedding) in prepared {
        let meta = ReferenceMeta {
            label: label.clone(),
            ingredients: ingredients.clone(),
            original_name: upload.file_name.clone(),
            content_type,
        };
        let storage = analyzer.storage.clone();
        let bytes = upload.data.clone();
        let saved = spawn_blocking(move || storage.save_reference(&bytes, meta, embedding)).await;
        match saved {
            Ok(Ok(reference)) => added.push(ReferenceSummary::new(reference, analyzer.model.version())),
            Ok(Err(e @ StorageError::DuplicateReference { .. })) => {
                info!("跳过重复的参考图: {:?}", upload.file_name);
                duplicates.push(upload.file_name.unwrap_or_default());
                last_duplicate = Some(e);
            }
            Ok(Err(e)) => return Err(abort_after_partial_save(&state, !added.is_empty(), e.into()).await.into()),
            Err(e) => return Err(abort_after_partial_save(&state, !added.is_empty(), e.into()).await.into()),
        }
    }

    if added.is_empty() {
        if let Some(e) = last_duplicate {
            return Err(e.into());
        }
    }

    let index = refresh_index(&state).await?;
    Ok(Json(AddReferenceResponse { added, duplicates, index }))
}

/// 删除参考图，完成后重建索引
#[utoipa::path(
    delete,
    path = "/references/{id}",
    params(("id" = String, Path, description = "参考图 ID")),
    responses(
        (status = 200, body = DeleteReferenceResponse),
        (status = 401, description = "缺少或无效的 token"),
        (status = 404, description = "参考图不存在"),
    ),
    security(("bearer" = []))
)]
pub async fn delete_reference_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteReferenceResponse>> {
    let storage = state.analyzer.storage.clone();
    let reference = blocking(move || storage.delete_reference(&id)).await?;
    let deleted = ReferenceSummary::new(reference, state.analyzer.model.version());
    let index = refresh_index(&state).await?;
    Ok(Json(DeleteReferenceResponse { deleted, index }))
}

/// 删除某个菜品的全部参考图，完成后重建索引
#[utoipa::path(
    delete,
    path = "/labels/{label}",
    params(("label" = String, Path, description = "菜品名称")),
    responses(
        (status = 200, body = LabelResponse),
        (status = 401, description = "缺少或无效的 token"),
        (status = 404, description = "没有该菜品的参考图"),
    ),
    security(("bearer" = []))
)]
pub async fn delete_label_handler(
    State(state): State<Arc<AppState>>,
    Path(label): Path<String>,
) -> Result<Json<LabelResponse>> {
    let storage = state.analyzer.storage.clone();
    let target = label.clone();
    let deleted = blocking(move || storage.delete_label(&target)).await?;
    let version = state.analyzer.model.version();
    let references = deleted.into_iter().map(|r| ReferenceSummary::new(r, version)).collect();
    let index = refresh_index(&state).await?;
    Ok(Json(LabelResponse { label, references, index }))
}

/// 替换某个菜品全部参考图的配料
#[utoipa::path(
    put,
    path = "/labels/{label}/ingredients",
    params(("label" = String, Path, description = "菜品名称")),
    request_body = UpdateIngredientsRequest,
    responses(
        (status = 200, body = LabelResponse),
        (status = 400, description = "请求体格式错误"),
        (status = 401, description = "缺少或无效的 token"),
        (status = 404, description = "没有该菜品的参考图"),
    ),
    security(("bearer" = []))
)]
pub async fn update_ingredients_handler(
    State(state): State<Arc<AppState>>,
    Path(label): Path<String>,
    body: std::result::Result<Json<UpdateIngredientsRequest>, JsonRejection>,
) -> Result<Json<LabelResponse>> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let ingredients = body.ingredients();
    let storage = state.analyzer.storage.clone();
    let target = label.clone();
    let updated = blocking(move || storage.update_ingredients(&target, ingredients)).await?;
    let version = state.analyzer.model.version();
    let references = updated.into_iter().map(|r| ReferenceSummary::new(r, version)).collect();
    // 匹配结果里的配料来自索引
    let index = refresh_index(&state).await?;
    Ok(Json(LabelResponse { label, references, index }))
}

/// 从磁盘重新加载参考图并重建索引
#[utoipa::path(
    post,
    path = "/reload",
    responses(
        (status = 200, body = IndexStats),
        (status = 401, description = "缺少或无效的 token"),
    ),
    security(("bearer" = []))
)]
pub async fn reload_handler(State(state): State<Arc<AppState>>) -> Result<Json<IndexStats>> {
    Ok(Json(refresh_index(&state).await?))
}

/// 存活检查
#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)))]
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// 就绪检查
#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, body = ReadyResponse),
        (status = 503, body = ReadyResponse),
    )
)]
pub async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    let ready = state.is_ready();
    let body = ReadyResponse {
        ready,
        model_version: state.analyzer.model.version().to_string(),
        index: state.analyzer.matcher.snapshot().stats(),
        escalation_enabled: state.analyzer.escalator.is_some(),
    };
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

pub async fn banner_handler(State(state): State<Arc<AppState>>) -> Json<BannerResponse> {
    Json(BannerResponse {
        service: "Food Vision API",
        version: env!("CARGO_PKG_VERSION"),
        model_version: state.analyzer.model.version().to_string(),
        docs: "/docs",
        redoc: "/redoc",
    })
}

pub async fn metrics_handler() -> Result<Response> {
    let text = metrics::render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}

const REDOC_PAGE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <title>Food Vision API</title>
    <meta charset="utf-8"/>
    <meta name="viewport" content="width=device-width, initial-scale=1">
  </head>
  <body>
    <redoc spec-url="/api-docs/openapi.json"></redoc>
    <script src="https://cdn.redoc.ly/redoc/latest/bundles/redoc.standalone.js"></script>
  </body>
</html>
"#;

pub async fn redoc_handler() -> Html<&'static str> {
    Html(REDOC_PAGE)
}
