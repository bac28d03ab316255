//! Backend API Error Types
//!
//! Structured error handling for recording server requests.
//! Maps HTTP status codes to specific error variants so callers can tell
//! an empty preview apart from a transport failure.

/// Recording server error types
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Empty response body (HTTP {status})")]
    EmptyResponse { status: u16 },

    #[error("Unauthorized: check user and password")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport failure, carrying the client's message as is
    #[error("{0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl BackendError {
    /// Create a BackendError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => BackendError::Unauthorized,
            404 => BackendError::NotFound(body.to_string()),
            408 => BackendError::Timeout,
            500..=599 => BackendError::Server(status, body.to_string()),
            _ => BackendError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            BackendError::Network(err.to_string())
        } else {
            BackendError::Request(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(matches!(
            BackendError::from_status(401, ""),
            BackendError::Unauthorized
        ));
        assert!(matches!(
            BackendError::from_status(404, "no such recording"),
            BackendError::NotFound(ref body) if body == "no such recording"
        ));
        assert!(matches!(
            BackendError::from_status(503, "busy"),
            BackendError::Server(503, _)
        ));
        assert!(matches!(
            BackendError::from_status(418, "teapot"),
            BackendError::Request(_)
        ));
    }

    #[test]
    fn test_network_message_passes_through() {
        let err = BackendError::Network("connection reset by peer".to_string());
        assert_eq!(err.to_string(), "connection reset by peer");
    }

    #[test]
    fn test_empty_response_message() {
        let err = BackendError::EmptyResponse { status: 200 };
        assert_eq!(err.to_string(), "Empty response body (HTTP 200)");
    }
}
