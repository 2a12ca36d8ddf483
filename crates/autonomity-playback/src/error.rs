//! Error types for autonomity-playback.

use std::time::Duration;

use thiserror::Error;

/// Result type for playback and client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur talking to the simulation service.
#[derive(Debug, Error)]
pub enum Error {
    /// The request never produced a usable HTTP response.
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request exceeded its timeout budget.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The service answered, but the reply carries an `error` field.
    #[error("server error: {message}")]
    Server {
        status: Option<u16>,
        message: String,
    },

    /// The reply body is not a snapshot.
    #[error("malformed reply: {0}")]
    Decode(#[from] serde_json::Error),

    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Message published to the dashboard as `last_error`.
    ///
    /// Server errors are shown verbatim; everything else uses its display form.
    pub fn user_message(&self) -> String {
        match self {
            Error::Server { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the failure came from the service rather than the transport.
    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_is_verbatim() {
        let err = Error::Server {
            status: Some(400),
            message: "rate limited".into(),
        };
        assert_eq!(err.user_message(), "rate limited");
        assert!(err.is_server());
    }

    #[test]
    fn timeout_message_names_budget() {
        let err = Error::Timeout(Duration::from_secs(30));
        assert_eq!(err.user_message(), "request timed out after 30s");
        assert!(!err.is_server());
    }
}
