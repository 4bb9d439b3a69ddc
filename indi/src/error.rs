//! Peer error types
//!
//! Provides structured error types for peer operations.

use std::fmt;
use std::time::Duration;

use crate::peer::PeerRole;

/// Peer operation errors
#[derive(Debug, Clone)]
pub enum IndiError {
    /// A role has no configured peer
    PeerMissing(PeerRole),
    /// Peer property did not reach the expected state in time
    PropertyTimeout {
        device: String,
        property: String,
        duration: Duration,
        last_state: Option<String>,
    },
    /// Peer disappeared while an operation was in flight
    PeerLost { device: String },
    /// Device reported Alert state
    DeviceAlert(String),
    /// Property not found on the peer
    PropertyNotFound { device: String, property: String },
    /// Value rejected by the peer
    InvalidValue {
        device: String,
        property: String,
        value: String,
    },
    /// Notification or command channel closed
    ChannelClosed(String),
}

impl std::error::Error for IndiError {}

impl fmt::Display for IndiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndiError::PeerMissing(role) => write!(f, "No {} is selected", role),
            IndiError::PropertyTimeout {
                device,
                property,
                duration,
                last_state,
            } => {
                let state_info = last_state
                    .as_ref()
                    .map(|s| format!(" (last state: {})", s))
                    .unwrap_or_default();
                write!(
                    f,
                    "Property timeout for {}.{} after {:?}{}",
                    device, property, duration, state_info
                )
            }
            IndiError::PeerLost { device } => write!(f, "Peer {} was removed", device),
            IndiError::DeviceAlert(msg) => write!(f, "Device alert: {}", msg),
            IndiError::PropertyNotFound { device, property } => {
                write!(f, "Property not found: {}.{}", device, property)
            }
            IndiError::InvalidValue {
                device,
                property,
                value,
            } => write!(f, "Invalid value '{}' for {}.{}", value, device, property),
            IndiError::ChannelClosed(msg) => write!(f, "Channel closed: {}", msg),
        }
    }
}

impl From<IndiError> for String {
    fn from(err: IndiError) -> String {
        err.to_string()
    }
}

/// Result type for peer operations
pub type IndiResult<T> = Result<T, IndiError>;
