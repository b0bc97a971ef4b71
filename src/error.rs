use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by trackers, the feed multiplexer, and the upstream client.
#[derive(Error, Debug)]
pub enum Error {
    #[error("tracker not found: {0}")]
    TrackerNotFound(String),

    #[error("tracker {0} has no valid targets to track")]
    NoTargets(String),

    #[error("invalid parameters for tracker {tracker_id}: {reason}")]
    InvalidParameters { tracker_id: String, reason: String },

    #[error("tracker {0} is running; stop it before deleting")]
    TrackerRunning(String),

    #[error("feed transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_parameters(tracker_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            tracker_id: tracker_id.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Configuration errors fail `start` before any side effect happens.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::TrackerNotFound(_) | Error::NoTargets(_) | Error::InvalidParameters { .. }
        )
    }

    /// Rate limiting or a server-side failure worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Upstream { status, .. } => *status == 429 || *status >= 500,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
