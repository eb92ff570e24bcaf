//! Client error types

use std::io;

/// Client result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the chat client.
///
/// Transport and protocol failures that happen after the initial connect are
/// handled by the session supervisor and only reach the application through
/// `SessionEvent::Disconnected` once reconnection gives up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reconnect gave up after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
}

impl Error {
    /// Whether the reconnect loop should try again after this error.
    /// Credential rejections and configuration errors are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Auth(_) | Error::Config(_) | Error::ReconnectExhausted { .. }
        )
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
