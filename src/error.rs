//! Error types for the voice-call pipeline.

/// Top-level error type for the voice-conversation client.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Capture device denied or unavailable. Fatal to starting a call.
    #[error("permission error: {0}")]
    Permission(String),

    /// `start()` called while a capture is already running.
    #[error("already recording")]
    AlreadyRecording,

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Transient channel/transport failure (closed socket, request timeout).
    #[error("network error: {0}")]
    Network(String),

    /// An external transcription/coach/synthesis call failed. Per-turn,
    /// never fatal to the session.
    #[error("{service} service error: {message}")]
    UpstreamService {
        /// Which external service failed (`stt`, `coach`, `tts`).
        service: &'static str,
        /// Provider-reported detail.
        message: String,
    },

    /// Unparseable wire payload. Logged and dropped by the channel.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Reconnect attempts exceeded the budget. Terminal for the
    /// session's connection.
    #[error("cannot reach voice service: reconnect attempts exhausted")]
    ConnectivityExhausted,

    /// Channel send/receive error between pipeline stages.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`CallError`], recorded on failed turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Permission,
    AlreadyRecording,
    Audio,
    Network,
    UpstreamService,
    MalformedMessage,
    ConnectivityExhausted,
    Channel,
    Config,
    Io,
}

impl CallError {
    /// The taxonomy bucket this error belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Permission(_) => ErrorKind::Permission,
            Self::AlreadyRecording => ErrorKind::AlreadyRecording,
            Self::Audio(_) => ErrorKind::Audio,
            Self::Network(_) => ErrorKind::Network,
            Self::UpstreamService { .. } => ErrorKind::UpstreamService,
            Self::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Self::ConnectivityExhausted => ErrorKind::ConnectivityExhausted,
            Self::Channel(_) => ErrorKind::Channel,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CallError>;
