//! Asynchronous peer notifications
//!
//! Peers report state changes the imager did not ask for (dither progress,
//! guider statistics, related imager pause state, ...) through a broadcast bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::peer::PeerRole;
use crate::PropertyState;

/// Guider agent phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuiderPhase {
    Idle,
    Calibrating,
    Guiding,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerNotification {
    /// Dither trigger property of the guider changed
    DitherState {
        state: PropertyState,
        triggered: bool,
    },
    GuiderStats {
        phase: GuiderPhase,
        frame: u32,
        dithering_rms: f64,
    },
    GuiderProcessState(PropertyState),
    SolverProcessState(PropertyState),
    /// Pause state of a related imager instance
    ImagerPauseState {
        instance: String,
        state: PropertyState,
    },
    /// The set of related imager instances changed
    RelatedImagers(Vec<String>),
    /// Hours until the target transits, negative after transit
    TimeToTransit(f64),
    CameraBinning {
        x: u32,
        y: u32,
    },
    FocuserPosition(f64),
    PeerRemoved(PeerRole),
}

/// Broadcast bus peers publish notifications on
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<PeerNotification>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish a notification, dropped silently when nobody listens
    pub fn publish(&self, notification: PeerNotification) {
        tracing::trace!("Peer notification: {:?}", notification);
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerNotification> {
        self.tx.subscribe()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
