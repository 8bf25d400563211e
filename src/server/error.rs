use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_typed_multipart::TypedMultipartError;
use log::error;
use serde_json::json;
use thiserror::Error;

use crate::analysis::AnalyzeError;
use crate::model::ModelError;
use crate::storage::StorageError;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// 接口层自身的错误
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("缺少或无效的 token")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{message}")]
    Multipart { status: StatusCode, message: String },
}

impl From<TypedMultipartError> for ApiError {
    fn from(err: TypedMultipartError) -> Self {
        Self::Multipart { status: err.get_status(), message: err.to_string() }
    }
}

/// API错误类型
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// 根据错误类型决定状态码，未知错误不向调用方暴露细节
    fn classify(&self) -> (StatusCode, &'static str, Option<String>) {
        let err = &self.0;
        if let Some(e) = err.downcast_ref::<ApiError>() {
            return match e {
                ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", Some(e.to_string())),
                ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation", Some(e.to_string())),
                ApiError::Multipart { status, .. } => {
                    let kind = match *status {
                        StatusCode::PAYLOAD_TOO_LARGE => "payload_too_large",
                        s if s.is_server_error() => "internal",
                        _ => "validation",
                    };
                    (*status, kind, Some(e.to_string()))
                }
            };
        }
        if let Some(e) = err.downcast_ref::<AnalyzeError>() {
            return match e {
                AnalyzeError::Validation(_) => (StatusCode::BAD_REQUEST, "validation", Some(e.to_string())),
                AnalyzeError::UnsupportedMediaType(_) => {
                    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media_type", Some(e.to_string()))
                }
                AnalyzeError::PayloadTooLarge { .. } => {
                    (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", Some(e.to_string()))
                }
                AnalyzeError::Storage(e) => classify_storage(e),
                AnalyzeError::Model(e) => classify_model(e),
                AnalyzeError::UnknownLabel(_) => (StatusCode::NOT_FOUND, "not_found", Some(e.to_string())),
                AnalyzeError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
            };
        }
        if let Some(e) = err.downcast_ref::<StorageError>() {
            return classify_storage(e);
        }
        if let Some(e) = err.downcast_ref::<ModelError>() {
            return classify_model(e);
        }
        (StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
    }
}

fn classify_storage(e: &StorageError) -> (StatusCode, &'static str, Option<String>) {
    match e {
        StorageError::DuplicateReference { .. } => (StatusCode::CONFLICT, "duplicate_reference", Some(e.to_string())),
        StorageError::NotFound { .. } | StorageError::LabelNotFound { .. } => {
            (StatusCode::NOT_FOUND, "not_found", Some(e.to_string()))
        }
        StorageError::Io { .. } | StorageError::CorruptStore { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
        }
    }
}

fn classify_model(e: &ModelError) -> (StatusCode, &'static str, Option<String>) {
    match e {
        ModelError::InvalidImage(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_image", Some(e.to_string())),
        ModelError::InferenceTimeout(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "inference_timeout", Some(e.to_string()))
        }
        ModelError::Load { .. } | ModelError::VersionMismatch { .. } | ModelError::Worker(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = self.classify();
        if status.is_server_error() {
            error!("请求处理失败: {:?}", self.0);
        }
        let message = message.unwrap_or_else(|| "服务器内部错误".to_string());
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use rstest::*;

    use super::*;

    #[rstest]
    #[case(AnalyzeError::Validation("x".into()).into(), StatusCode::BAD_REQUEST)]
    #[case(AnalyzeError::UnsupportedMediaType("text/plain".into()).into(), StatusCode::UNSUPPORTED_MEDIA_TYPE)]
    #[case(AnalyzeError::PayloadTooLarge { size: 2, limit: 1 }.into(), StatusCode::PAYLOAD_TOO_LARGE)]
    #[case(AnalyzeError::Model(ModelError::InvalidImage("bad".into())).into(), StatusCode::UNPROCESSABLE_ENTITY)]
    #[case(ModelError::InferenceTimeout(Duration::from_secs(1)).into(), StatusCode::SERVICE_UNAVAILABLE)]
    #[case(StorageError::DuplicateReference { id: "a".into() }.into(), StatusCode::CONFLICT)]
    #[case(StorageError::NotFound { id: "a".into() }.into(), StatusCode::NOT_FOUND)]
    #[case(StorageError::LabelNotFound { label: "a".into() }.into(), StatusCode::NOT_FOUND)]
    #[case(AnalyzeError::UnknownLabel("pizza".into()).into(), StatusCode::NOT_FOUND)]
    #[case(ApiError::Unauthorized.into(), StatusCode::UNAUTHORIZED)]
    #[case(anyhow::anyhow!("secret internals").into(), StatusCode::INTERNAL_SERVER_ERROR)]
    fn test_status_mapping(#[case] err: AppError, #[case] status: StatusCode) {
        assert_eq!(err.into_response().status(), status);
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err: AppError = StorageError::CorruptStore {
            path: PathBuf::from("/srv/storage/references/x.json"),
            reason: "eof".into(),
        }
        .into();
        let (status, kind, message) = err.classify();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(kind, "internal");
        assert!(message.is_none());
    }
}
