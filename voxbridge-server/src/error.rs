//! HTTP error mapping.
//!
//! Every failed request answers with
//! `{"error": {"type", "message", "timestamp"}}` and a status derived from the
//! error kind: caller mistakes are 400, saturation is 503, everything else 500.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;
use voxbridge_core::VoxError;

#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed request: missing field, bad number, oversized upload.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Vox(#[from] VoxError),

    /// All conversion slots are taken.
    #[error("server busy: {0}")]
    Busy(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Vox(e) => e.kind(),
            AppError::Busy(_) => "busy",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Vox(e) => match e {
                VoxError::Config(_) | VoxError::Reference(_) | VoxError::InvalidState { .. } => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }))
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::Validation(format!("multipart: {err}"))
    }
}

impl From<actix_web::error::BlockingError> for AppError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        AppError::Internal(format!("conversion worker: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("IO error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn status_follows_error_kind() {
        let cases = [
            (AppError::Validation("x".into()), 400),
            (AppError::Vox(VoxError::Reference("short".into())), 400),
            (AppError::Vox(VoxError::Config("port".into())), 400),
            (AppError::Busy("2 of 2".into()), 503),
            (AppError::Vox(VoxError::Model("nan".into())), 500),
            (
                AppError::Vox(VoxError::Timeout {
                    what: "sink".into(),
                    after_ms: 10,
                }),
                500,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code().as_u16(), status, "{err:?}");
        }
    }

    #[actix_web::test]
    async fn payload_carries_type_and_message() {
        let err = AppError::Vox(VoxError::Reference("reference clip too short".into()));
        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "reference_error");
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("too short"));
        assert!(value["error"]["timestamp"].is_string());
    }
}
