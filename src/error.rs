use thiserror::Error;

/// Application-wide error type
///
/// Open-time errors (`DeviceNotFound`, `FormatNegotiation`, `EncoderInit`,
/// `MuxerInit`, `InvalidOutput`, `DeviceBusy`) are returned synchronously
/// when a session starts and never retried. Mid-stream errors
/// (`Disconnected`, `Timeout`, `SegmentWrite`) end the session; only
/// `Disconnected` is retried internally before the session fails.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("No capture device matching \"{0}\" was found")]
    DeviceNotFound(String),

    #[error("A session is already active for device {0}")]
    DeviceBusy(String),

    #[error("Format negotiation failed on {device}: {reason}")]
    FormatNegotiation { device: String, reason: String },

    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Muxer initialization failed: {0}")]
    MuxerInit(String),

    #[error("Capture device lost [{device}]: {reason}")]
    Disconnected { device: String, reason: String },

    #[error("No frame from {device} within {timeout_ms} ms")]
    Timeout { device: String, timeout_ms: u64 },

    #[error("Segment write failed: {0}")]
    SegmentWrite(String),

    #[error("No output path defined to write captures to")]
    InvalidOutput,

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// True for conditions that end a session without internal retry.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, AppError::Disconnected { .. })
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_is_retryable() {
        let err = AppError::Disconnected {
            device: "/dev/video0".into(),
            reason: "ENODEV".into(),
        };
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn timeout_is_fatal() {
        let err = AppError::Timeout {
            device: "/dev/video0".into(),
            timeout_ms: 2000,
        };
        assert!(err.is_session_fatal());
    }
}
