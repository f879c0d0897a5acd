//! Error types for the download pipeline.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for tidalrip operations.
pub type Result<T> = std::result::Result<T, RipError>;

/// Every variant is terminal for the run: it becomes the final JSON result
/// line on stdout and a non-zero exit code.
#[derive(Debug, Error)]
pub enum RipError {
    /// The input is not a recognizable Tidal track URL
    #[error("invalid Tidal track URL: {0}")]
    InvalidUrl(String),

    /// The conversion service rejected a request or answered with a
    /// malformed payload
    #[error("conversion service error: {0}")]
    Service(String),

    /// The service reported the job itself as failed
    #[error("conversion job failed: {0}")]
    JobFailed(String),

    /// The poll budget ran out before a terminal status arrived
    #[error("no terminal status after {polls} polls ({}s elapsed)", .elapsed.as_secs())]
    PollTimeout { polls: u32, elapsed: Duration },

    /// Transport-level failure talking to the service
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Filesystem write failure
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_display_names_the_input() {
        let err = RipError::InvalidUrl("https://tidal.com/album/1".into());
        assert!(err.to_string().contains("https://tidal.com/album/1"));
    }

    #[test]
    fn poll_timeout_display_reports_polls_and_elapsed() {
        let err = RipError::PollTimeout {
            polls: 150,
            elapsed: Duration::from_secs(300),
        };
        let msg = err.to_string();
        assert!(msg.contains("150 polls"));
        assert!(msg.contains("300s"));
    }

    #[test]
    fn write_display_names_the_path() {
        let err = RipError::Write {
            path: PathBuf::from("/nope/out.flac"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/nope/out.flac"));
        assert!(msg.contains("denied"));
    }
}
