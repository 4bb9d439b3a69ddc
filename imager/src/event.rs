//! Events published by an imager instance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nightshade_indi::PropertyState;

use crate::config::{Selection, StarPosition};
use crate::control::StartAction;
use crate::stats::RunStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ImagerEvent {
    /// Operator-facing message
    Message {
        text: String,
        state: PropertyState,
        at: DateTime<Utc>,
    },
    StatsUpdated(RunStats),
    /// A top-level action started or reached a terminal state
    ProcessStateChanged {
        action: StartAction,
        state: PropertyState,
        run_id: Uuid,
    },
    PauseChanged {
        state: PropertyState,
    },
    AbortChanged {
        state: PropertyState,
    },
    /// Last observed pause state of every related imager
    BarrierChanged(Vec<(String, PropertyState)>),
    StarsDetected {
        stars: Vec<StarPosition>,
        state: PropertyState,
    },
    SelectionChanged(Selection),
    /// One point of the U-curve search
    FocusSample {
        position: f64,
        hfd: f64,
    },
}

impl ImagerEvent {
    pub fn message(text: impl Into<String>, state: PropertyState) -> Self {
        ImagerEvent::Message {
            text: text.into(),
            state,
            at: Utc::now(),
        }
    }
}
