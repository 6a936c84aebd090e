//! Error types shared across Reframe crates.

use std::path::PathBuf;

/// Top-level error type for Reframe operations.
#[derive(Debug, thiserror::Error)]
pub enum ReframeError {
    #[error("Codec configuration error: {message}")]
    CodecConfig { message: String },

    #[error("Muxer start error: {message}")]
    MuxerStart { message: String },

    #[error("Muxer error: {message}")]
    Muxer { message: String },

    #[error("Demux error: {message}")]
    Demux { message: String },

    #[error("Container format error: {message}")]
    Container { message: String },

    #[error("Render error: {message}")]
    Render { message: String },

    #[error("Missing elementary output: {track}")]
    MissingOutput { track: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("Job cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using ReframeError.
pub type ReframeResult<T> = Result<T, ReframeError>;

impl ReframeError {
    pub fn codec_config(msg: impl Into<String>) -> Self {
        Self::CodecConfig {
            message: msg.into(),
        }
    }

    pub fn muxer_start(msg: impl Into<String>) -> Self {
        Self::MuxerStart {
            message: msg.into(),
        }
    }

    pub fn muxer(msg: impl Into<String>) -> Self {
        Self::Muxer {
            message: msg.into(),
        }
    }

    pub fn demux(msg: impl Into<String>) -> Self {
        Self::Demux {
            message: msg.into(),
        }
    }

    pub fn container(msg: impl Into<String>) -> Self {
        Self::Container {
            message: msg.into(),
        }
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    pub fn missing_output(track: impl Into<String>) -> Self {
        Self::MissingOutput {
            track: track.into(),
        }
    }

    /// Whether this error is an external stop request rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_distinct_from_failures() {
        assert!(ReframeError::Cancelled.is_cancellation());
        assert!(!ReframeError::muxer_start("no tracks").is_cancellation());
    }

    #[test]
    fn io_errors_convert_transparently() {
        let err: ReframeError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into();
        assert_eq!(err.to_string(), "read-only");
    }

    #[test]
    fn display_includes_message() {
        let err = ReframeError::codec_config("video/x-unknown is not supported");
        assert_eq!(
            err.to_string(),
            "Codec configuration error: video/x-unknown is not supported"
        );
    }
}
