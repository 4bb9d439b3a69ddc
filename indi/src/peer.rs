//! Peer role interfaces
//!
//! Each role the imager talks to is an async trait. Implementations wrap a
//! device bus client or, in tests, one of the simulated peers in [`crate::sim`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::IndiResult;
use crate::setting::{RawSetting, SwitchOption};
use crate::PropertyState;

/// Roles a peer can play for an imager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    Camera,
    AuxShutter,
    Focuser,
    Wheel,
    Guider,
    Mount,
    Solver,
    RelatedImager,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerRole::Camera => "CCD",
            PeerRole::AuxShutter => "auxiliary shutter",
            PeerRole::Focuser => "focuser",
            PeerRole::Wheel => "filter wheel",
            PeerRole::Guider => "guider agent",
            PeerRole::Mount => "mount agent",
            PeerRole::Solver => "solver agent",
            PeerRole::RelatedImager => "imager agent",
        };
        f.write_str(s)
    }
}

/// Focuser travel direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusDirection {
    Inward,
    Outward,
}

impl FocusDirection {
    pub fn opposite(self) -> Self {
        match self {
            FocusDirection::Inward => FocusDirection::Outward,
            FocusDirection::Outward => FocusDirection::Inward,
        }
    }

    /// +1 for outward, -1 for inward
    pub fn sign(self) -> f64 {
        match self {
            FocusDirection::Inward => -1.0,
            FocusDirection::Outward => 1.0,
        }
    }

    pub fn is_outward(self) -> bool {
        self == FocusDirection::Outward
    }
}

/// Exposure progress as reported by a camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureStatus {
    pub state: PropertyState,
    /// Remaining exposure time in seconds
    pub remaining: f64,
}

/// Streaming progress as reported by a camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamingStatus {
    pub state: PropertyState,
    /// Frames still to be streamed
    pub remaining_frames: i32,
}

/// Sensor window in unbinned pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Raw property access used by free-form sequencer settings
#[async_trait]
pub trait RawProperties: Send + Sync {
    /// Options of a switch property, None if the peer does not define it
    async fn switch_options(&self, property: &str) -> IndiResult<Option<Vec<SwitchOption>>>;

    /// Whether the peer defines the property at all
    async fn has_property(&self, property: &str) -> IndiResult<bool>;

    /// Request a property change
    async fn apply(&self, setting: RawSetting) -> IndiResult<()>;

    /// Current state of a property
    async fn property_state(&self, property: &str) -> IndiResult<PropertyState>;
}

#[async_trait]
pub trait Camera: RawProperties {
    fn name(&self) -> &str;

    // ========================================================================
    // Exposure
    // ========================================================================

    /// Switch image delivery to the raw in-memory format
    async fn select_raw_format(&self) -> IndiResult<()>;

    async fn start_exposure(&self, seconds: f64) -> IndiResult<()>;

    async fn abort_exposure(&self) -> IndiResult<()>;

    async fn exposure_status(&self) -> IndiResult<ExposureStatus>;

    /// Bytes of the last delivered image
    async fn last_image(&self) -> IndiResult<Option<Vec<u8>>>;

    async fn is_light_frame(&self) -> IndiResult<bool>;

    // ========================================================================
    // Geometry
    // ========================================================================

    async fn binning(&self) -> IndiResult<(u32, u32)>;

    /// Current sensor window, None when the camera does not allow changing it
    async fn frame(&self) -> IndiResult<Option<FrameRect>>;

    async fn set_frame(&self, rect: FrameRect) -> IndiResult<()>;

    // ========================================================================
    // Streaming
    // ========================================================================

    async fn start_streaming(&self, count: i32, exposure: f64) -> IndiResult<()>;

    async fn streaming_status(&self) -> IndiResult<StreamingStatus>;

    async fn abort_streaming(&self) -> IndiResult<()>;

    // ========================================================================
    // Headers
    // ========================================================================

    /// Set a header keyword on future images, or remove it with None
    async fn set_header(&self, keyword: &str, value: Option<String>) -> IndiResult<()>;
}

#[async_trait]
pub trait Focuser: Send + Sync {
    fn name(&self) -> &str;

    async fn position(&self) -> IndiResult<f64>;

    /// Driver side backlash, None when the driver does not compensate
    async fn backlash(&self) -> IndiResult<Option<f64>>;

    async fn set_backlash(&self, steps: f64) -> IndiResult<()>;

    /// Start a relative move, completion is observed through `motion_state`
    async fn start_move(&self, direction: FocusDirection, steps: f64) -> IndiResult<()>;

    async fn motion_state(&self) -> IndiResult<PropertyState>;

    async fn abort_motion(&self) -> IndiResult<()>;
}

#[async_trait]
pub trait Wheel: Send + Sync {
    fn name(&self) -> &str;

    /// Slots in order, slot `i` is selected with `select_slot(i + 1)`
    async fn slots(&self) -> IndiResult<Vec<SwitchOption>>;

    async fn select_slot(&self, slot: u32) -> IndiResult<()>;

    async fn slot_state(&self) -> IndiResult<PropertyState>;

    /// Active slot, 1-based
    async fn current_slot(&self) -> IndiResult<Option<u32>>;
}

#[async_trait]
pub trait Guider: Send + Sync {
    fn name(&self) -> &str;

    async fn trigger_dither(&self) -> IndiResult<()>;

    async fn calibrate(&self, exposure: f64) -> IndiResult<()>;

    async fn start_guiding(&self, exposure: f64) -> IndiResult<()>;

    async fn stop(&self) -> IndiResult<()>;
}

#[async_trait]
pub trait Mount: Send + Sync {
    fn name(&self) -> &str;

    async fn park(&self) -> IndiResult<()>;

    async fn unpark(&self) -> IndiResult<()>;

    /// Allow the mount agent to abort this imager, e.g. on a meridian flip
    async fn allow_imager_abort(&self, allowed: bool) -> IndiResult<()>;
}

#[async_trait]
pub trait Solver: Send + Sync {
    fn name(&self) -> &str;

    /// Slew, solve and correct until the mount points at the target
    async fn precise_goto(&self, ra: f64, dec: f64) -> IndiResult<()>;

    async fn abort(&self) -> IndiResult<()>;

    async fn disable(&self) -> IndiResult<()>;
}

/// Another imager instance taking part in barrier synchronisation
#[async_trait]
pub trait RelatedImager: Send + Sync {
    fn name(&self) -> &str;

    /// Clear the pause flag of that instance
    async fn release_pause(&self) -> IndiResult<()>;

    async fn start_batch(&self) -> IndiResult<()>;

    async fn abort(&self) -> IndiResult<()>;
}

pub type SharedCamera = Arc<dyn Camera>;
pub type SharedFocuser = Arc<dyn Focuser>;
pub type SharedWheel = Arc<dyn Wheel>;
pub type SharedGuider = Arc<dyn Guider>;
pub type SharedMount = Arc<dyn Mount>;
pub type SharedSolver = Arc<dyn Solver>;
pub type SharedRelatedImager = Arc<dyn RelatedImager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_helpers() {
        assert_eq!(FocusDirection::Inward.opposite(), FocusDirection::Outward);
        assert_eq!(FocusDirection::Outward.sign(), 1.0);
        assert_eq!(FocusDirection::Inward.sign(), -1.0);
    }

    #[test]
    fn test_role_names() {
        assert_eq!(PeerRole::Wheel.to_string(), "filter wheel");
        assert_eq!(PeerRole::Solver.to_string(), "solver agent");
        assert_eq!(PeerRole::Camera.to_string(), "CCD");
    }
}
