#![forbid(unsafe_code)]

//! Error taxonomy shared by the fetcher, the download manager and the HTTP
//! layer.

use std::time::Duration;

use thiserror::Error;

/// Failures surfaced to API callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    FetchFailed(String),

    #[error("video info not found: {0}")]
    DescriptorMissing(String),

    #[error("No formats found in video info")]
    NoFormatsAvailable,

    #[error("{0}")]
    DownloadFailed(String),

    #[error("download job not found: {0}")]
    JobNotFound(String),

    #[error("{0} is already being downloaded")]
    OutputInUse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

/// Failures while driving the yt-dlp child process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is not installed or not in PATH")]
    NotInstalled(String),

    #[error("yt-dlp did not finish within {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(String),

    #[error("running yt-dlp: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_timeout_reports_seconds() {
        let err = EngineError::TimedOut(Duration::from_secs(180));
        assert_eq!(err.to_string(), "yt-dlp did not finish within 180s");
    }

    #[test]
    fn output_in_use_names_the_file() {
        let err = ServiceError::OutputInUse("T.mp4".into());
        assert_eq!(err.to_string(), "T.mp4 is already being downloaded");
    }

    #[test]
    fn io_errors_convert_into_service_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ServiceError = io.into();
        assert!(matches!(err, ServiceError::Io(_)));
        assert_eq!(err.to_string(), "denied");
    }
}
