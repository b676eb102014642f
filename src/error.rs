//! Error type shared by the transport, the signaling machine and the media
//! engine adapter.

use thiserror::Error;

/// Errors that can occur while signaling
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Signaling URL scheme is not secure web socket (wss): {0}")]
    InsecureScheme(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Failed to connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("Malformed signaling message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Signaling message '{command}' is missing field '{field}'")]
    MissingField { command: String, field: &'static str },

    #[error("Signaling message '{command}' has unexpected {field} '{value}'")]
    UnexpectedValue {
        command: String,
        field: &'static str,
        value: String,
    },

    #[error("Media engine error: {0}")]
    MediaEngine(String),

    #[error("DataChannel is not ready for stream '{0}'")]
    DataChannelNotReady(String),

    #[error("Signaling control context has shut down")]
    ControlClosed,

    #[error("Async runtime unavailable: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, SignalingError>;
