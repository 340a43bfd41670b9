//! Error taxonomy for probe and sweep runs

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Why a single load attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadFailure {
    /// Daemon refused the request (unknown model, unsupported context length)
    Rejected,
    /// Load did not complete within the load timeout
    Timeout,
    /// Daemon ran out of memory while loading
    Oom,
}

impl std::fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "rejected"),
            Self::Timeout => write!(f, "timeout"),
            Self::Oom => write!(f, "oom"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The serving daemon cannot be reached at all
    #[error("serving daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("load of {model} at context {context} failed ({reason}): {message}")]
    Load {
        model: String,
        context: u32,
        reason: LoadFailure,
        message: String,
    },

    /// Load returned but the model never showed up as resident
    #[error("{model} at context {context} never became resident")]
    NotResident { model: String, context: u32 },

    #[error("failed to unload {model}: {message}")]
    UnloadFailure { model: String, message: String },

    #[error("invalid model descriptor for {model}: {message}")]
    InvalidDescriptor { model: String, message: String },

    /// Attempt to load while another model still holds the residency slot
    #[error("residency slot already held by {held} (requested {requested})")]
    Residency { held: String, requested: String },

    #[error("model catalog is empty")]
    EmptyCatalog,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("report error: {0}")]
    Report(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProbeError {
    /// Whether this error must abort the whole run rather than one model
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProbeError::DaemonUnavailable(_)
                | ProbeError::EmptyCatalog
                | ProbeError::Residency { .. }
                | ProbeError::Report(_)
                | ProbeError::Io(_)
        )
    }

    /// Load-level failure reason, if the error counts as "does not fit"
    pub fn load_failure(&self) -> Option<LoadFailure> {
        match self {
            ProbeError::Load { reason, .. } => Some(*reason),
            ProbeError::NotResident { .. } => Some(LoadFailure::Timeout),
            _ => None,
        }
    }

    pub fn is_unload_failure(&self) -> bool {
        matches!(self, ProbeError::UnloadFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProbeError::DaemonUnavailable("refused".into()).is_fatal());
        assert!(
            !ProbeError::Load {
                model: "m".into(),
                context: 2048,
                reason: LoadFailure::Oom,
                message: "cuda".into(),
            }
            .is_fatal()
        );
        assert!(
            !ProbeError::UnloadFailure {
                model: "m".into(),
                message: "still resident".into(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_load_failure_mapping() {
        let err = ProbeError::NotResident {
            model: "m".into(),
            context: 4096,
        };
        assert_eq!(err.load_failure(), Some(LoadFailure::Timeout));
        assert_eq!(
            ProbeError::DaemonUnavailable("x".into()).load_failure(),
            None
        );
    }

    #[test]
    fn test_load_failure_display() {
        assert_eq!(LoadFailure::Rejected.to_string(), "rejected");
        assert_eq!(LoadFailure::Timeout.to_string(), "timeout");
        assert_eq!(LoadFailure::Oom.to_string(), "oom");
    }
}
