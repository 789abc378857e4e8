//! Error types for SDCP printer operations.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::upload::PushAttempt;

/// Errors from SDCP printer operations.
#[derive(Error, Debug)]
pub enum SdcpError {
    /// Operation attempted before `connect` succeeded or after `close`.
    #[error("not connected")]
    NotConnected,

    /// No transport candidate accepted the opening handshake.
    #[error("timed out during opening handshake ({attempts} candidates tried)")]
    Handshake {
        /// Number of (port, path) candidates that were tried.
        attempts: usize,
        /// Failure of the last candidate.
        #[source]
        source: Option<Box<SdcpError>>,
    },

    /// No response to a command within its budget.
    #[error("command {code} timed out after {timeout:?}")]
    CommandTimeout {
        /// SDCP command code.
        code: u16,
        /// Time waited.
        timeout: Duration,
    },

    /// The connection went away while a request was waiting.
    #[error("connection closed while awaiting response")]
    ConnectionClosed,

    /// The command is known but deliberately not implemented.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The mainboard id has not been learned yet.
    #[error("mainboard id not known; call get_attributes first")]
    MissingMainboardId,

    /// The printer reported a failed file transfer.
    #[error("file transfer of {filename} failed: {detail}")]
    TransferFailed {
        /// Target filename.
        filename: String,
        /// What the printer reported.
        detail: String,
    },

    /// The printer never reported a terminal transfer state.
    #[error("timed out after {timeout:?} waiting for transfer of {filename}")]
    TransferTimeout {
        /// Target filename.
        filename: String,
        /// Time waited.
        timeout: Duration,
    },

    /// Every push endpoint failed after the pull transfer failed.
    #[error("all upload attempts failed ({})", summarize(.attempts))]
    UploadExhausted {
        /// Every push attempt, in order.
        attempts: Vec<PushAttempt>,
        /// Why the pull transfer was abandoned.
        pull_error: Option<Box<SdcpError>>,
    },

    /// A correlation id is already waiting for a response.
    #[error("duplicate request id: {0}")]
    DuplicateRequestId(String),

    /// Discovery error.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// MQTT error.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<tungstenite::Error> for SdcpError {
    fn from(err: tungstenite::Error) -> Self {
        SdcpError::WebSocket(Box::new(err))
    }
}

fn summarize(attempts: &[PushAttempt]) -> String {
    if attempts.is_empty() {
        return "no attempts".into();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for SDCP operations.
pub type Result<T> = std::result::Result<T, SdcpError>;
