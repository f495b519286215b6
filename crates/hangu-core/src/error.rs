//! Error types shared by the synthesis and playback halves of the core.
//!
//! Marker parse failures have no variant here: a bad line only degrades the
//! marker sequence and never surfaces as an error.

use thiserror::Error;

/// Failure of one synthesis attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    /// Transport failure while fetching a locator or downloading it
    #[error("network error during {leg} leg: {message}")]
    Network { leg: &'static str, message: String },

    /// The remote service answered with an error
    #[error("service error during {leg} leg (status {status:?}): {message}")]
    Service {
        leg: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// Both legs finished but the payload can't be played or highlighted
    #[error("incomplete synthesis result: {0}")]
    IncompleteResult(String),

    /// The downloaded audio could not be written to its transient location
    #[error("failed to store synthesized audio: {0}")]
    Io(String),

    /// The owning session went away before the attempt finished
    #[error("synthesis cancelled")]
    Cancelled,
}

impl SynthesisError {
    pub fn network(leg: &'static str, message: impl Into<String>) -> Self {
        Self::Network {
            leg,
            message: message.into(),
        }
    }

    pub fn service(leg: &'static str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Service {
            leg,
            status,
            message: message.into(),
        }
    }

    /// Short machine-friendly label, used in logs and snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Service { .. } => "service",
            Self::IncompleteResult(_) => "incomplete_result",
            Self::Io(_) => "io",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<std::io::Error> for SynthesisError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Decode or audio-session failure reported by an `AudioEngine`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error("audio session failed: {0}")]
    Session(String),
}
