//! Error types for media-compressor-rust

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompressError>;

#[derive(Error, Debug)]
pub enum CompressError {
    /// The external encoder is missing or cannot be started. Fatal, no search is attempted.
    #[error("{encoder} is not available: {reason}")]
    EncoderUnavailable { encoder: String, reason: String },

    /// A single probe failed (bad input, crash, non-zero exit).
    #[error("{encoder} failed: {reason}")]
    EncoderFailure { encoder: String, reason: String },

    /// Malformed target, bounds or source artifact. Rejected before any probe.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("compression cancelled")]
    Cancelled,

    #[error("compression deadline exceeded")]
    DeadlineExceeded,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CompressError {
    pub fn unavailable(encoder: impl Into<String>, reason: impl Into<String>) -> Self {
        CompressError::EncoderUnavailable {
            encoder: encoder.into(),
            reason: reason.into(),
        }
    }

    pub fn failure(encoder: impl Into<String>, reason: impl Into<String>) -> Self {
        CompressError::EncoderFailure {
            encoder: encoder.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        CompressError::InvalidRequest(reason.into())
    }

    /// True for the one error kind a search loop may absorb by moving away from the probed point.
    pub fn is_probe_failure(&self) -> bool {
        matches!(self, CompressError::EncoderFailure { .. })
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_probe_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_encoder_failures_are_absorbable() {
        assert!(CompressError::failure("gs", "exit 1").is_probe_failure());
        assert!(!CompressError::unavailable("gs", "not found").is_probe_failure());
        assert!(!CompressError::invalid("empty").is_probe_failure());
        assert!(!CompressError::Cancelled.is_probe_failure());
    }

    #[test]
    fn messages_name_the_encoder() {
        let err = CompressError::failure("ffmpeg", "exit status 1");
        assert_eq!(err.to_string(), "ffmpeg failed: exit status 1");
    }
}
