//! Error types for the Parley gateway

use thiserror::Error;

use crate::protocol::FrameError;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Parley gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Binary frame could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// Speech recognition error
    #[error("ASR error: {0}")]
    Asr(String),

    /// Speech synthesis error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Reasoning collaborator error
    #[error("agent error: {0}")]
    Agent(String),

    /// Outbound peer has gone away
    #[error("session closed")]
    SessionClosed,

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding or decoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}
