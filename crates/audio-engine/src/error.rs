//! Engine error taxonomy.

use std::path::PathBuf;

use audio_engine_types::ErrorKind;
use thiserror::Error;

/// Errors surfaced by the decoder, ring buffer, output and transport layers.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Container or codec not supported by the decoder
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Source path does not exist
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Source could not be read or decoded past the recovery threshold
    #[error("Corrupt stream: {0}")]
    CorruptStream(String),

    /// Source lacks random access
    #[error("Seek not supported by this source")]
    SeekUnsupported,

    /// Output device open/write failure or disconnect
    #[error("Output device error: {0}")]
    DeviceError(String),

    /// Output ran dry; recovered with silence
    #[error("Buffer underrun")]
    BufferUnderrun,

    #[error("Queue is empty")]
    EmptyQueue,

    #[error("History is empty")]
    EmptyHistory,

    /// Non-blocking ring write without enough free space
    #[error("Ring buffer full")]
    BufferFull,

    #[error("Seek position {position} outside track (duration {duration} frames)")]
    InvalidSeek { position: u64, duration: u64 },

    #[error("Index {index} out of range (len {len})")]
    InvalidIndex { index: usize, len: usize },

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The engine thread is gone
    #[error("Engine closed")]
    EngineClosed,
}

impl EngineError {
    /// Serializable classification used for telemetry.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::FileNotFound(_) => ErrorKind::FileNotFound,
            Self::CorruptStream(_) => ErrorKind::CorruptStream,
            Self::SeekUnsupported => ErrorKind::SeekUnsupported,
            Self::DeviceError(_) => ErrorKind::DeviceError,
            Self::BufferUnderrun => ErrorKind::BufferUnderrun,
            Self::EmptyQueue => ErrorKind::EmptyQueue,
            Self::EmptyHistory => ErrorKind::EmptyHistory,
            Self::BufferFull => ErrorKind::BufferFull,
            Self::InvalidSeek { .. } | Self::InvalidIndex { .. } => ErrorKind::InvalidArgument,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::EngineClosed => ErrorKind::EngineClosed,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_argument_errors_together() {
        let seek = EngineError::InvalidSeek {
            position: 10,
            duration: 5,
        };
        let index = EngineError::InvalidIndex { index: 3, len: 1 };
        assert_eq!(seek.kind(), ErrorKind::InvalidArgument);
        assert_eq!(index.kind(), ErrorKind::InvalidArgument);
        assert_eq!(EngineError::SeekUnsupported.kind(), ErrorKind::SeekUnsupported);
    }

    #[test]
    fn messages_name_the_path() {
        let err = EngineError::FileNotFound(PathBuf::from("/music/missing.flac"));
        assert_eq!(err.to_string(), "File not found: /music/missing.flac");
    }
}
