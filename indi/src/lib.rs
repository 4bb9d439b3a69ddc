//! Peer controller layer
//!
//! Typed access to the devices and agents an imager orchestrates: camera,
//! focuser, filter wheel, guider, mount, solver and related imager instances.
//!
//! ## Features
//!
//! - One async trait per peer role, shared as `Arc<dyn Role>`
//! - Raw property fallback (`RawSetting`) for free-form sequencer settings
//! - Asynchronous peer notifications (dither state, guider stats, barrier state)
//! - Cancellable deadline polling used by every busy/terminal wait
//! - Simulated peers for tests and dry runs

mod error;
pub mod notification;
pub mod peer;
pub mod setting;
pub mod sim;
pub mod wait;

pub use error::{IndiError, IndiResult};
pub use notification::{GuiderPhase, NotificationBus, PeerNotification};
pub use peer::{
    Camera, ExposureStatus, FocusDirection, Focuser, FrameRect, Guider, Mount, PeerRole,
    RawProperties, RelatedImager, SharedCamera, SharedFocuser, SharedGuider, SharedMount,
    SharedRelatedImager, SharedSolver, SharedWheel, Solver, StreamingStatus, Wheel,
};
pub use setting::{
    camera_properties, RawSetting, SettingKind, SettingTable, SettingTarget, SwitchOption,
};
pub use wait::{poll_until, sleep_or_cancel, WaitOutcome};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Property state tag shared by every peer control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    /// True for Ok and Alert, the states a busy property settles into
    pub fn is_terminal(&self) -> bool {
        matches!(self, PropertyState::Ok | PropertyState::Alert)
    }
}

impl std::fmt::Display for PropertyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "Ok",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        };
        f.write_str(s)
    }
}

/// Timeout and polling configuration for peer waits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerTimeoutConfig {
    /// How long a peer may take to report Busy after a change (default: 5000ms)
    pub busy_timeout_ms: u64,
    /// Coarse polling tick while a peer is busy (default: 200ms)
    pub poll_tick_ms: u64,
    /// Fine polling tick used below one second of remaining exposure (default: 10ms)
    pub fine_tick_ms: u64,
    /// Backoff after a failed exposure attempt (default: 1000ms)
    pub retry_backoff_ms: u64,
    /// Breakpoint release check interval (default: 1ms)
    pub breakpoint_tick_ms: u64,
    /// Time allowed for a dither to start (default: 3000ms)
    pub dither_start_timeout_ms: u64,
    /// Time allowed for a dither to settle (default: 300000ms)
    pub dither_settle_timeout_ms: u64,
    /// Settle time before the restore frame after a subframe (default: 500ms)
    pub subframe_settle_ms: u64,
    /// Streaming progress poll interval (default: 20ms)
    pub streaming_tick_ms: u64,
}

impl Default for PeerTimeoutConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            poll_tick_ms: 200,
            fine_tick_ms: 10,
            retry_backoff_ms: 1000,
            breakpoint_tick_ms: 1,
            dither_start_timeout_ms: 3000,
            dither_settle_timeout_ms: 300_000,
            subframe_settle_ms: 500,
            streaming_tick_ms: 20,
        }
    }
}

impl PeerTimeoutConfig {
    /// Get the busy timeout as a Duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Get the coarse poll tick as a Duration
    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }

    /// Get the fine poll tick as a Duration
    pub fn fine_tick(&self) -> Duration {
        Duration::from_millis(self.fine_tick_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn breakpoint_tick(&self) -> Duration {
        Duration::from_millis(self.breakpoint_tick_ms.max(1))
    }

    pub fn dither_start_timeout(&self) -> Duration {
        Duration::from_millis(self.dither_start_timeout_ms)
    }

    pub fn dither_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.dither_settle_timeout_ms)
    }

    pub fn subframe_settle(&self) -> Duration {
        Duration::from_millis(self.subframe_settle_ms)
    }

    pub fn streaming_tick(&self) -> Duration {
        Duration::from_millis(self.streaming_tick_ms)
    }

    /// Compressed timings for tests, keeping the ratios between waits
    pub fn fast() -> Self {
        Self {
            busy_timeout_ms: 500,
            poll_tick_ms: 10,
            fine_tick_ms: 2,
            retry_backoff_ms: 20,
            breakpoint_tick_ms: 1,
            dither_start_timeout_ms: 150,
            dither_settle_timeout_ms: 1000,
            subframe_settle_ms: 5,
            streaming_tick_ms: 5,
        }
    }
}
