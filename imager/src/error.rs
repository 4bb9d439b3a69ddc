//! Error types for the imaging orchestrator
//!
//! # Error Categories
//!
//! - Peer errors: missing, timed out or lost peers
//! - Run outcomes: cancellation, failed exposures, focus convergence
//! - Configuration errors: unknown sequencer keys, unconfigured roles
//! - System errors: file I/O and serialization

use std::time::Duration;
use thiserror::Error;

use nightshade_indi::{IndiError, PeerRole};

#[derive(Error, Debug)]
pub enum ImagerError {
    // =========================================================================
    // Peer Errors
    // =========================================================================

    #[error("No {role} is selected")]
    PeerMissing { role: PeerRole },

    #[error("{device} did not respond to {operation} within {duration:?}")]
    PeerTimeout {
        device: String,
        operation: String,
        duration: Duration,
    },

    #[error("{device} was removed")]
    PeerLost { device: String },

    #[error(transparent)]
    Peer(IndiError),

    // =========================================================================
    // Run Outcomes
    // =========================================================================

    /// Cooperative cancellation, not a failure
    #[error("Aborted")]
    Aborted,

    #[error("Received garbage from the camera")]
    ReceivedGarbage,

    #[error("No stars detected")]
    NoStarsDetected,

    #[error("{0}")]
    ConvergenceFailure(String),

    #[error("Exposure failed after {attempts} attempts")]
    ExposureFailed { attempts: u32 },

    /// Another action is already running
    #[error("{0} is already in progress")]
    Busy(String),

    // =========================================================================
    // Configuration & System Errors
    // =========================================================================

    #[error("{0}")]
    InvalidConfiguration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ImagerError {
    /// Cancellation rather than failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, ImagerError::Aborted)
    }

    /// Conditions the capture loop may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImagerError::PeerTimeout { .. } | ImagerError::ExposureFailed { .. }
        )
    }
}

impl From<IndiError> for ImagerError {
    fn from(err: IndiError) -> Self {
        match err {
            IndiError::PeerMissing(role) => ImagerError::PeerMissing { role },
            IndiError::PropertyTimeout {
                device,
                property,
                duration,
                ..
            } => ImagerError::PeerTimeout {
                device,
                operation: property,
                duration,
            },
            IndiError::PeerLost { device } => ImagerError::PeerLost { device },
            other => ImagerError::Peer(other),
        }
    }
}

pub type ImagerResult<T> = Result<T, ImagerError>;
