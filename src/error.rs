use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransceiverError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Audio graph busy: {0}")]
    GraphBusy(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransceiverError>;
