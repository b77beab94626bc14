use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Build a status error, preferring the server's `detail` message.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let detail = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("detail").cloned())
            .and_then(|d| match d {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            });

        let message = match detail {
            Some(detail) => Self::truncate_body(&detail),
            None => format!("request failed with status {}", status),
        };
        ApiError::Status { status, message }
    }

    /// True for 401 responses.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Status { status: 401, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_message_is_used() {
        let err = ApiError::from_status(400, br#"{"detail":"Invalid OTP or user."}"#);
        match err {
            ApiError::Status { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid OTP or user.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_structured_detail_is_stringified() {
        let err = ApiError::from_status(422, br#"{"detail":[{"loc":["body"]}]}"#);
        assert_eq!(
            err.to_string(),
            r#"HTTP 422: [{"loc":["body"]}]"#
        );
    }

    #[test]
    fn test_fallback_message() {
        let err = ApiError::from_status(502, b"<html>bad gateway</html>");
        assert_eq!(err.to_string(), "HTTP 502: request failed with status 502");
        assert!(!err.is_unauthorized());
        assert!(ApiError::from_status(401, b"").is_unauthorized());
    }

    #[test]
    fn test_long_detail_truncated() {
        let long = "x".repeat(800);
        let body = serde_json::json!({ "detail": long }).to_string();
        let err = ApiError::from_status(500, body.as_bytes());
        assert!(err.to_string().contains("truncated, 800 total bytes"));
    }
}
