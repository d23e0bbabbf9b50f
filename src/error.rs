use std::fmt;

use reqwest::StatusCode;

/// Transport-level failures from the agent API.
#[derive(Debug)]
pub enum ApiError {
    InvalidBaseUrl(String),
    Request(reqwest::Error),
    /// Non-2xx response; the message is the response body (or the canonical
    /// status reason when the body is empty).
    Status(StatusCode, String),
    Decode(serde_json::Error),
    Attachment(std::io::Error),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBaseUrl(value) => write!(f, "invalid base URL: {value}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Status(status, message) => write!(f, "HTTP {status}: {message}"),
            Self::Decode(error) => write!(f, "malformed response body: {error}"),
            Self::Attachment(error) => write!(f, "failed to read attachment: {error}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(error) => Some(error),
            Self::Decode(error) => Some(error),
            Self::Attachment(error) => Some(error),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        Self::Decode(error)
    }
}

/// Run-level failure taxonomy. Submission and poll failures terminate the
/// run; clarification failures are reported and otherwise ignored.
#[derive(Debug)]
pub enum RunError {
    Submission(ApiError),
    Poll(ApiError),
    Clarification(ApiError),
    Cancelled,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submission(error) => write!(f, "failed to start run: {error}"),
            Self::Poll(error) => write!(f, "status fetch failed: {error}"),
            Self::Clarification(error) => write!(f, "answer delivery failed: {error}"),
            Self::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Submission(error) | Self::Poll(error) | Self::Clarification(error) => {
                Some(error)
            }
            Self::Cancelled => None,
        }
    }
}

/// Extract a display message from a non-2xx response body, falling back to the
/// canonical status reason.
pub fn status_error_message(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        // FastAPI-style error bodies carry the message under "detail".
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => value
                .get("detail")
                .and_then(|d| d.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| trimmed.to_string()),
            Err(_) => trimmed.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_message_prefers_detail_field() {
        let msg = status_error_message(
            StatusCode::BAD_REQUEST,
            r#"{"detail": "prompt is required"}"#,
        );
        assert_eq!(msg, "prompt is required");
    }

    #[test]
    fn status_message_falls_back_to_raw_body() {
        let msg = status_error_message(StatusCode::BAD_GATEWAY, "upstream unavailable");
        assert_eq!(msg, "upstream unavailable");
    }

    #[test]
    fn status_message_uses_canonical_reason_for_empty_body() {
        let msg = status_error_message(StatusCode::NOT_FOUND, "  ");
        assert_eq!(msg, "Not Found");
    }

    #[test]
    fn run_error_display_names_the_phase() {
        let err = RunError::Submission(ApiError::InvalidBaseUrl("nope".into()));
        assert!(err.to_string().contains("failed to start run"));
        let err = RunError::Cancelled;
        assert_eq!(err.to_string(), "run cancelled");
    }
}
