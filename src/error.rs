//! Error types for the listing radar

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the listing radar
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Event log errors
    #[error("Event log error: {0}")]
    EventLog(String),

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Unknown consumer group: {group} on stream {stream}")]
    UnknownGroup { stream: String, group: String },

    // HTTP / source errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP timeout after {0}ms")]
    HttpTimeout(u64),

    #[error("Rate limited by {exchange}, retry after {retry_after_secs}s")]
    RateLimited { exchange: String, retry_after_secs: u64 },

    #[error("Access denied by {exchange} (status {status})")]
    AccessDenied { exchange: String, status: u16 },

    #[error("Server error from {exchange} (status {status})")]
    ServerError { exchange: String, status: u16 },

    // WebSocket errors
    #[error("WebSocket connection failed: {0}")]
    WsConnection(String),

    #[error("WebSocket disconnected")]
    WsDisconnected,

    // Parsing errors
    #[error("Malformed payload from {exchange}: {detail}")]
    MalformedPayload { exchange: String, detail: String },

    #[error("Parser spec missing for exchange: {0}")]
    MissingParserSpec(String),

    // Delivery errors
    #[error("Push failed to {sink}: {detail}")]
    PushFailed { sink: String, detail: String },

    #[error("Push rejected by {sink} success predicate")]
    PushRejected { sink: String },

    // Internal invariants - fatal, the stage must terminate
    #[error("Invariant violation: {0}")]
    Invariant(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is transient (caller should back off and retry)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_)
                | Error::HttpTimeout(_)
                | Error::ServerError { .. }
                | Error::WsConnection(_)
                | Error::WsDisconnected
                | Error::EventLog(_)
                | Error::PushFailed { .. }
        )
    }

    /// Check if this error is fatal (the stage must stop and rely on supervision)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::MissingEnvVar(_) | Error::Invariant(_)
        )
    }

    /// Server-provided delay for rate-limit errors; callers apply their
    /// own floor where the source demands one
    pub fn rate_limit_delay_secs(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::HttpTimeout(0)
        } else {
            Error::Http(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

// Conversion from tungstenite errors
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WsConnection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::WsDisconnected.is_transient());
        assert!(Error::HttpTimeout(15000).is_transient());
        assert!(!Error::Config("bad".into()).is_transient());
        assert!(!Error::RateLimited { exchange: "binance".into(), retry_after_secs: 60 }.is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Invariant("fired group without reason".into()).is_fatal());
        assert!(Error::Config("missing tier tables".into()).is_fatal());
        assert!(!Error::WsDisconnected.is_fatal());
    }

    #[test]
    fn test_rate_limit_delay_passthrough() {
        let e = Error::RateLimited { exchange: "gate".into(), retry_after_secs: 120 };
        assert_eq!(e.rate_limit_delay_secs(), Some(120));
        assert_eq!(Error::WsDisconnected.rate_limit_delay_secs(), None);
    }
}
