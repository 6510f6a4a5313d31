//! Audio error types

use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("no default input device")]
    NoInputDevice,

    #[error("no default output device")]
    NoOutputDevice,

    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("codec initialization failed: {0}")]
    CodecInit(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),
}
