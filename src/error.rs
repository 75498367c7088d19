//! 统一的网关错误类型与 HTTP 状态映射。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors surfaced by providers, the auth manager, and the router.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Item missing, or the provider has no thumbnail for it.
    #[error("not found")]
    NotFound,
    /// No usable credentials for the account.
    #[error("unauthenticated")]
    Unauthenticated,
    /// The OAuth refresh round-trip failed; the account needs re-authorisation.
    #[error("auth refresh failed: {0}")]
    AuthRefreshFailed(String),
    /// Capability not implemented by the concrete provider.
    #[error("unsupported operation")]
    Unsupported,
    /// Requested range lies outside the resource bounds.
    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: Option<u64> },
    /// Network or protocol failure from the HTTP client.
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed JSON, a missing field, or an unrecognised player script.
    #[error("parse error: {0}")]
    Parse(String),
    /// Cooperative cancellation.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify a non-2xx upstream status.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Error::Unauthenticated,
            404 | 410 => Error::NotFound,
            416 => Error::RangeNotSatisfiable { size: None },
            _ => Error::Transport(format!("upstream status {status}")),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Error::Parse(message.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Unauthenticated | Error::AuthRefreshFailed(_) => StatusCode::UNAUTHORIZED,
            Error::Unsupported => StatusCode::NOT_IMPLEMENTED,
            Error::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // 499: client closed request.
            Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
        };
        if let Error::RangeNotSatisfiable { size: Some(size) } = &self {
            return (
                status,
                [(axum::http::header::CONTENT_RANGE, format!("bytes */{size}"))],
                self.to_string(),
            )
                .into_response();
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn status_mapping() {
        assert_eq!(
            Error::NotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Unsupported.into_response().status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            Error::Transport("boom".into()).into_response().status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(Error::Cancelled.into_response().status().as_u16(), 499);
    }

    #[test]
    fn range_error_carries_content_range() {
        let response = Error::RangeNotSatisfiable { size: Some(100) }.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response
                .headers()
                .get(axum::http::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok()),
            Some("bytes */100")
        );
    }
}
