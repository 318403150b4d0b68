use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no destination for {scope} event '{name}'")]
    UnresolvedTarget { name: String, scope: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Redis(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Serialization(e.to_string())
    }
}

impl AppError {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Redis(_) | AppError::ServiceUnavailable(_))
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_)
            | AppError::UnresolvedTarget { .. }
            | AppError::InvalidPayload(_)
            | AppError::MalformedFrame(_) => 400,
            AppError::NotFound(_) => 404,
            AppError::ConnectionClosed(_) => 410,
            AppError::FrameTooLarge { .. } => 413,
            AppError::Redis(_) | AppError::ServiceUnavailable(_) => 503,
            _ => 500,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::StartServer(_) => "start_failure",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::UnresolvedTarget { .. } => "unresolved_target",
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::MalformedFrame(_) => "malformed_frame",
            AppError::FrameTooLarge { .. } => "frame_too_large",
            AppError::Serialization(_) => "serialization_error",
            AppError::ConnectionClosed(_) => "connection_closed",
            AppError::Redis(_) => "redis_error",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let status = ResponseError::status_code(self);
        HttpResponse::build(status).json(json!({
            "error": self.code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(
            AppError::UnresolvedTarget {
                name: "ping".into(),
                scope: "CHANNEL".into()
            }
            .status_code(),
            400
        );
        assert_eq!(AppError::NotFound("session".into()).status_code(), 404);
        assert_eq!(AppError::Redis("down".into()).status_code(), 503);
        assert_eq!(AppError::Internal("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_retryable() {
        assert!(AppError::Redis("timeout".into()).is_retryable());
        assert!(!AppError::BadRequest("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_response_status() {
        let resp = AppError::FrameTooLarge { size: 10, max: 5 }.error_response();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
