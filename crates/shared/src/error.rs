use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 409 | 422 => Self::Validation,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// FastAPI error body. `detail` is a string for handled errors and a list of
/// objects for request validation failures.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

#[derive(Debug, Error)]
#[error("{code:?} ({status}): {message}")]
pub struct ApiException {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
}

impl ApiException {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status: 0,
            message: message.into(),
        }
    }

    /// Builds an exception from a non-success HTTP response.
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = match serde_json::from_str::<ErrorBody>(body) {
            Ok(ErrorBody {
                detail: serde_json::Value::String(detail),
            }) => detail,
            Ok(ErrorBody { detail }) => detail.to_string(),
            Err(_) if body.trim().is_empty() => format!("request failed with status {status}"),
            Err(_) => body.trim().to_string(),
        };
        Self {
            code: ErrorCode::from_status(status),
            status,
            message,
        }
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(self.code, ErrorCode::Unauthorized | ErrorCode::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_string_detail() {
        let err = ApiException::from_response(401, r#"{"detail":"Could not validate credentials"}"#);
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(err.message, "Could not validate credentials");
        assert!(err.requires_reauth());
    }

    #[test]
    fn keeps_structured_detail_as_json() {
        let err = ApiException::from_response(422, r#"{"detail":[{"msg":"field required"}]}"#);
        assert_eq!(err.code, ErrorCode::Validation);
        assert!(err.message.contains("field required"));
    }

    #[test]
    fn falls_back_to_status_for_empty_body() {
        let err = ApiException::from_response(502, "");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "request failed with status 502");
    }
}
