//! Error types for sigil-ai

use thiserror::Error;

/// Result type alias using sigil-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a chat-completions backend
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed at the transport level
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend returned a non-200 status
    #[error("{reason}: {message} (HTTP {status})")]
    Api {
        status: u16,
        reason: &'static str,
        message: String,
    },

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Network-level failure, rewritten to a human-readable reason
    #[error("Network error: {0}")]
    Network(String),

    /// Request was cancelled
    #[error("Request aborted")]
    Aborted,

    /// Invalid or missing API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,
}

impl Error {
    /// Build an API error with a human-readable reason for the status code.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            reason: describe_status(status),
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying.
    ///
    /// Transient: 429, 5xx, and network-level failures. Fatal: other 4xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api { status, .. } => *status == 429 || *status >= 500,
            Error::Http(_) | Error::Network(_) | Error::Sse(_) => true,
            _ => false,
        }
    }
}

/// Map an HTTP status code to a human-readable reason.
pub fn describe_status(status: u16) -> &'static str {
    match status {
        400 => "Bad request",
        401 => "Authentication failed (check your API key)",
        403 => "Access forbidden",
        404 => "Endpoint or model not found",
        408 => "Request timed out",
        413 => "Request too large",
        429 => "Rate limited",
        500 => "Server error",
        502 => "Bad gateway",
        503 => "Service unavailable",
        504 => "Gateway timed out",
        s if s >= 500 => "Server error",
        _ => "Request failed",
    }
}

/// Rewrite a reqwest transport error into a human-readable network error.
pub fn rewrite_network_error(err: &reqwest::Error) -> Error {
    let raw = err.to_string();
    let msg = if err.is_connect() || raw.contains("Connection refused") {
        "connection refused".to_string()
    } else if err.is_timeout() {
        "request timed out".to_string()
    } else if raw.contains("dns") || raw.contains("resolve") {
        "host not found".to_string()
    } else if raw.contains("reset by peer") {
        "connection reset by peer".to_string()
    } else {
        raw
    };
    Error::Network(msg)
}

/// Check if an error string contains a transient-failure marker.
///
/// Used by the retry wrapper as a fallback for stringly-wrapped errors.
pub fn is_transient_error(error: &str) -> bool {
    const MARKERS: &[&str] = &[
        "429",
        "500",
        "502",
        "503",
        "504",
        "connection refused",
        "timeout",
        "timed out",
        "EOF",
        "reset by peer",
        "overloaded",
    ];
    MARKERS.iter().any(|m| error.contains(m))
}
