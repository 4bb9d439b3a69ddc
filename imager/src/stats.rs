//! Run statistics
//!
//! The running action mutates one [`RunStats`] under a lock and every change
//! is published as a value copy, so observers never share the worker's state.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::event::ImagerEvent;

/// What the running action is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    Capturing,
    Waiting,
    Dithering,
    SettingFilter,
    Slewing,
    Calibrating,
    Focusing,
    TransitPause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Remaining exposure time in seconds
    pub exposure: f64,
    /// Remaining delay in seconds
    pub delay: f64,
    /// Current frame index within the batch
    pub frame: i32,
    /// Frames planned for the batch
    pub frames: i32,
    pub batch_index: i32,
    pub batches: i32,
    pub phase: Phase,
    pub drift_x: f64,
    pub drift_y: f64,
    pub fwhm: f64,
    pub hfd: f64,
    pub peak: f64,
    pub rms_contrast: f64,
    pub dithering: f64,
    pub focus_offset: f64,
    /// Distance from the best observed quality in percent
    pub focus_deviation: f64,
    pub frames_to_dithering: i32,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            exposure: 0.0,
            delay: 0.0,
            frame: 0,
            frames: 0,
            batch_index: 0,
            batches: 0,
            phase: Phase::Idle,
            drift_x: 0.0,
            drift_y: 0.0,
            fwhm: 0.0,
            hfd: 0.0,
            peak: 0.0,
            rms_contrast: 0.0,
            dithering: 0.0,
            focus_offset: 0.0,
            focus_deviation: 100.0,
            frames_to_dithering: 0,
        }
    }
}

impl RunStats {
    /// Clear the per-frame measurements
    pub fn clear_measurements(&mut self) {
        self.fwhm = 0.0;
        self.hfd = 0.0;
        self.peak = 0.0;
        self.drift_x = 0.0;
        self.drift_y = 0.0;
        self.rms_contrast = 0.0;
    }
}

/// Owner of the live statistics
pub struct StatsPublisher {
    current: Mutex<RunStats>,
    events: broadcast::Sender<ImagerEvent>,
}

impl StatsPublisher {
    pub fn new(events: broadcast::Sender<ImagerEvent>) -> Self {
        Self {
            current: Mutex::new(RunStats::default()),
            events,
        }
    }

    pub fn snapshot(&self) -> RunStats {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` and publish the resulting snapshot
    pub fn update<R>(&self, change: impl FnOnce(&mut RunStats) -> R) -> R {
        let (result, snapshot) = {
            let mut stats = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let result = change(&mut stats);
            (result, stats.clone())
        };
        let _ = self.events.send(ImagerEvent::StatsUpdated(snapshot));
        result
    }

    /// Apply `change` without publishing, for compound updates
    pub fn update_quietly<R>(&self, change: impl FnOnce(&mut RunStats) -> R) -> R {
        let mut stats = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut stats)
    }

    pub fn publish(&self) {
        let _ = self.events.send(ImagerEvent::StatsUpdated(self.snapshot()));
    }

    pub fn set_phase(&self, phase: Phase) {
        self.update(|stats| stats.phase = phase);
    }

    /// Reset to the state every run starts from
    pub fn reset(&self) {
        self.update(|stats| *stats = RunStats::default());
    }
}
