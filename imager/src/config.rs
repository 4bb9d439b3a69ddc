//! Imager configuration
//!
//! Everything an operator sets on an imager instance, persisted as one
//! [`ImagerConfig`] by [`crate::persistence::ConfigStore`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Maximum number of stars measured at once
pub const MAX_STARS: usize = 24;

/// Default number of sequence scripts
pub const DEFAULT_SEQUENCE_SIZE: usize = 16;

/// Maximum number of sequence scripts
pub const MAX_SEQUENCE_SIZE: usize = 128;

/// Batch parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Number of frames, -1 for an unbounded batch
    pub count: i32,
    /// Exposure time in seconds
    pub exposure: f64,
    /// Delay between frames in seconds
    pub delay: f64,
    /// Frames to take between dithers (-1..=1000)
    #[serde(default)]
    pub frames_to_skip_before_dither: i32,
    /// Hours relative to transit at which the batch pauses (-2..=2)
    #[serde(default)]
    pub pause_after_transit: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            count: 1,
            exposure: 1.0,
            delay: 0.0,
            frames_to_skip_before_dither: 0,
            pause_after_transit: 0.0,
        }
    }
}

impl BatchConfig {
    pub fn is_unbounded(&self) -> bool {
        self.count == -1
    }
}

/// Focus quality estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FocusEstimator {
    #[default]
    UCurve,
    /// Peak over HFD ratio
    HfdPeak,
    RmsContrast,
}

impl FocusEstimator {
    pub fn uses_hfd(self) -> bool {
        matches!(self, FocusEstimator::UCurve | FocusEstimator::HfdPeak)
    }

    pub fn uses_rms(self) -> bool {
        self == FocusEstimator::RmsContrast
    }
}

/// Autofocus parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusConfig {
    pub initial_step: f64,
    pub final_step: f64,
    /// U-curve sample count (6..=24)
    pub ucurve_samples: usize,
    /// Combined backlash, used when no directional value is set
    pub backlash: f64,
    pub backlash_in: f64,
    pub backlash_out: f64,
    /// Overshoot factor applied to backlash on outward moves (1..=3)
    pub backlash_overshoot: f64,
    /// Frames per quality sample (1..=5)
    pub stack: u32,
    /// Additional attempts after a failed autofocus (0..=10)
    pub repeat: u32,
    /// Base delay between attempts in seconds, doubled on every retry
    pub repeat_delay: f64,
    pub estimator: FocusEstimator,
    #[serde(default = "default_restore_on_failure")]
    pub restore_on_failure: bool,
}

fn default_restore_on_failure() -> bool {
    true
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            initial_step: 20.0,
            final_step: 5.0,
            ucurve_samples: 10,
            backlash: 0.0,
            backlash_in: 0.0,
            backlash_out: 0.0,
            backlash_overshoot: 1.0,
            stack: 3,
            repeat: 0,
            repeat_delay: 0.0,
            estimator: FocusEstimator::UCurve,
            restore_on_failure: true,
        }
    }
}

/// A star centroid in binned pixels, (0, 0) when unpinned
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StarPosition {
    pub x: f64,
    pub y: f64,
}

impl StarPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_pinned(&self) -> bool {
        self.x > 0.0 && self.y > 0.0
    }

    pub fn is_unset(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }
}

/// Stars measured during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Measurement radius in binned pixels (1..=75)
    pub radius: f64,
    /// Sub-frame size in multiples of the radius (0..=10), 0 disables sub-framing
    pub subframe: u32,
    /// Requested star count (1..=24)
    pub star_count: usize,
    /// Index 0 is the primary star
    pub stars: Vec<StarPosition>,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            radius: 12.0,
            subframe: 0,
            star_count: 1,
            stars: vec![StarPosition::default()],
        }
    }
}

impl Selection {
    pub fn primary(&self) -> StarPosition {
        self.stars.first().copied().unwrap_or_default()
    }

    pub fn set_primary(&mut self, position: StarPosition) {
        if self.stars.is_empty() {
            self.stars.push(position);
        } else {
            self.stars[0] = position;
        }
    }

    /// Rescale every centroid after the camera binning changed from `old` to `new`
    pub fn rescale(&mut self, old: (u32, u32), new: (u32, u32)) {
        if new.0 == 0 || new.1 == 0 {
            return;
        }
        let ratio_x = old.0 as f64 / new.0 as f64;
        let ratio_y = old.1 as f64 / new.1 as f64;
        for star in &mut self.stars {
            star.x *= ratio_x;
            star.y *= ratio_y;
        }
    }

    /// Shift every centroid by (dx, dy)
    pub fn shift(&mut self, dx: f64, dy: f64) {
        for star in &mut self.stars {
            if !star.is_unset() {
                star.x += dx;
                star.y += dy;
            }
        }
    }

    fn normalize(&mut self) {
        self.radius = self.radius.clamp(1.0, 75.0);
        self.subframe = self.subframe.min(10);
        self.star_count = self.star_count.clamp(1, MAX_STARS);
        self.stars.resize(self.star_count, StarPosition::default());
    }
}

/// Scripts driving the sequencer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Script 0 is the top level script, scripts 1.. are batch scripts
    pub scripts: Vec<String>,
}

impl Default for Sequence {
    fn default() -> Self {
        Self {
            scripts: vec![String::new(); DEFAULT_SEQUENCE_SIZE + 1],
        }
    }
}

impl Sequence {
    /// Build a sequence from a top level script and batch scripts 1..
    pub fn new(top_level: &str, batches: &[&str]) -> Self {
        let mut sequence = Self::default();
        sequence.scripts[0] = top_level.to_string();
        if batches.len() > DEFAULT_SEQUENCE_SIZE {
            sequence
                .scripts
                .resize(batches.len().min(MAX_SEQUENCE_SIZE) + 1, String::new());
        }
        for (i, batch) in batches.iter().take(MAX_SEQUENCE_SIZE).enumerate() {
            sequence.scripts[i + 1] = batch.to_string();
        }
        sequence
    }

    /// Number of batch scripts
    pub fn size(&self) -> usize {
        self.scripts.len().saturating_sub(1)
    }

    pub fn top_level(&self) -> &str {
        self.scripts.first().map(String::as_str).unwrap_or("")
    }

    /// Batch script `index`, None when out of range
    pub fn batch(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.scripts.get(index).map(String::as_str)
    }

    pub fn resize(&mut self, size: usize) {
        let size = size.clamp(1, MAX_SEQUENCE_SIZE);
        self.scripts.resize(size + 1, String::new());
    }
}

/// Named checkpoints of the batch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Checkpoint {
    PreBatch,
    PreCapture,
    PostCapture,
    PreDelay,
    PostDelay,
    PostBatch,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 6] = [
        Checkpoint::PreBatch,
        Checkpoint::PreCapture,
        Checkpoint::PostCapture,
        Checkpoint::PreDelay,
        Checkpoint::PostDelay,
        Checkpoint::PostBatch,
    ];
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Checkpoint::PreBatch => "pre-batch",
            Checkpoint::PreCapture => "pre-capture",
            Checkpoint::PostCapture => "post-capture",
            Checkpoint::PreDelay => "pre-delay",
            Checkpoint::PostDelay => "post-delay",
            Checkpoint::PostBatch => "post-batch",
        };
        f.write_str(s)
    }
}

/// Armed breakpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BreakpointSet {
    pub pre_batch: bool,
    pub pre_capture: bool,
    pub post_capture: bool,
    pub pre_delay: bool,
    pub post_delay: bool,
    pub post_batch: bool,
}

impl BreakpointSet {
    pub fn is_armed(&self, checkpoint: Checkpoint) -> bool {
        match checkpoint {
            Checkpoint::PreBatch => self.pre_batch,
            Checkpoint::PreCapture => self.pre_capture,
            Checkpoint::PostCapture => self.post_capture,
            Checkpoint::PreDelay => self.pre_delay,
            Checkpoint::PostDelay => self.post_delay,
            Checkpoint::PostBatch => self.post_batch,
        }
    }

    pub fn arm(&mut self, checkpoint: Checkpoint, armed: bool) {
        let flag = match checkpoint {
            Checkpoint::PreBatch => &mut self.pre_batch,
            Checkpoint::PreCapture => &mut self.pre_capture,
            Checkpoint::PostCapture => &mut self.post_capture,
            Checkpoint::PreDelay => &mut self.pre_delay,
            Checkpoint::PostDelay => &mut self.post_delay,
            Checkpoint::PostBatch => &mut self.post_batch,
        };
        *flag = armed;
    }

    pub fn any_armed(&self) -> bool {
        Checkpoint::ALL.iter().any(|c| self.is_armed(*c))
    }
}

/// How a breakpoint pause is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResumeMode {
    /// Manual resume or an external trigger
    #[default]
    Manual,
    /// Resume once every related imager is paused too
    Barrier,
}

/// Persisted feature switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFeatures {
    pub dithering: bool,
    pub dither_after_batch: bool,
    pub pause_after_transit: bool,
}

impl Default for ProcessFeatures {
    fn default() -> Self {
        Self {
            dithering: true,
            dither_after_batch: false,
            pause_after_transit: false,
        }
    }
}

/// Complete persisted state of one imager instance
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImagerConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub selection: Selection,
    #[serde(default)]
    pub sequence: Sequence,
    #[serde(default)]
    pub breakpoints: BreakpointSet,
    #[serde(default)]
    pub resume_mode: ResumeMode,
    #[serde(default)]
    pub features: ProcessFeatures,
    /// Folder the image listing and download operate on
    #[serde(default)]
    pub image_folder: Option<PathBuf>,
}

impl ImagerConfig {
    /// Clamp every value into its valid range
    pub fn validate(&mut self) {
        let batch = &mut self.batch;
        if batch.count < -1 {
            batch.count = -1;
        }
        batch.exposure = batch.exposure.max(0.0);
        batch.delay = batch.delay.max(0.0);
        batch.frames_to_skip_before_dither = batch.frames_to_skip_before_dither.clamp(-1, 1000);
        batch.pause_after_transit = batch.pause_after_transit.clamp(-2.0, 2.0);

        let focus = &mut self.focus;
        focus.initial_step = focus.initial_step.max(1.0);
        focus.final_step = focus.final_step.clamp(1.0, focus.initial_step);
        focus.ucurve_samples = focus.ucurve_samples.clamp(6, 24);
        focus.backlash = focus.backlash.max(0.0);
        focus.backlash_in = focus.backlash_in.max(0.0);
        focus.backlash_out = focus.backlash_out.max(0.0);
        focus.backlash_overshoot = focus.backlash_overshoot.clamp(1.0, 3.0);
        focus.stack = focus.stack.clamp(1, 5);
        focus.repeat = focus.repeat.min(10);
        focus.repeat_delay = focus.repeat_delay.max(0.0);

        self.selection.normalize();
        let size = self.sequence.size();
        self.sequence.resize(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ImagerConfig::default();
        assert_eq!(config.batch.count, 1);
        assert_eq!(config.batch.exposure, 1.0);
        assert_eq!(config.focus.initial_step, 20.0);
        assert_eq!(config.focus.final_step, 5.0);
        assert_eq!(config.focus.ucurve_samples, 10);
        assert_eq!(config.focus.stack, 3);
        assert!(config.focus.restore_on_failure);
        assert_eq!(config.focus.estimator, FocusEstimator::UCurve);
        assert_eq!(config.selection.radius, 12.0);
        assert_eq!(config.sequence.size(), DEFAULT_SEQUENCE_SIZE);
        assert_eq!(config.resume_mode, ResumeMode::Manual);
        assert!(config.features.dithering);
        assert!(!config.features.dither_after_batch);
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = ImagerConfig::default();
        config.batch.count = -7;
        config.batch.frames_to_skip_before_dither = 5000;
        config.focus.ucurve_samples = 3;
        config.focus.backlash_overshoot = 10.0;
        config.focus.final_step = 50.0;
        config.selection.radius = 200.0;
        config.selection.star_count = 40;
        config.validate();
        assert_eq!(config.batch.count, -1);
        assert_eq!(config.batch.frames_to_skip_before_dither, 1000);
        assert_eq!(config.focus.ucurve_samples, 6);
        assert_eq!(config.focus.backlash_overshoot, 3.0);
        assert_eq!(config.focus.final_step, 20.0);
        assert_eq!(config.selection.radius, 75.0);
        assert_eq!(config.selection.stars.len(), MAX_STARS);
    }

    #[test]
    fn test_selection_rescale() {
        let mut selection = Selection::default();
        selection.set_primary(StarPosition::new(100.0, 60.0));
        selection.rescale((1, 1), (2, 2));
        assert_eq!(selection.primary(), StarPosition::new(50.0, 30.0));
        selection.rescale((2, 2), (1, 1));
        assert_eq!(selection.primary(), StarPosition::new(100.0, 60.0));
    }

    #[test]
    fn test_sequence_batches() {
        let sequence = Sequence::new("1;2", &["exposure=5;count=3", "count=0"]);
        assert_eq!(sequence.top_level(), "1;2");
        assert_eq!(sequence.batch(1), Some("exposure=5;count=3"));
        assert_eq!(sequence.batch(2), Some("count=0"));
        assert_eq!(sequence.batch(0), None);
        assert_eq!(sequence.batch(DEFAULT_SEQUENCE_SIZE + 1), None);
    }

    #[test]
    fn test_breakpoints() {
        let mut breakpoints = BreakpointSet::default();
        assert!(!breakpoints.any_armed());
        breakpoints.arm(Checkpoint::PreDelay, true);
        assert!(breakpoints.is_armed(Checkpoint::PreDelay));
        assert!(breakpoints.any_armed());
        assert_eq!(Checkpoint::PostBatch.to_string(), "post-batch");
    }
}
