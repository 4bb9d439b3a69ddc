//! Imager instance context
//!
//! One [`ImagerContext`] per orchestrator instance, shared as an `Arc` by the
//! worker task and the notification dispatch task. It replaces any global
//! state: every component receives the context explicitly.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use nightshade_indi::{
    FrameRect, GuiderPhase, NotificationBus, PeerNotification, PeerRole, PeerTimeoutConfig,
    PropertyState, SharedCamera, SharedFocuser, SharedGuider, SharedMount, SharedRelatedImager,
    SharedSolver, SharedWheel,
};

use crate::analysis::{BasicAnalyzer, DetectedStar, FrameAnalyzer, FrameDigest, SaturationMask};
use crate::config::{ImagerConfig, Selection};
use crate::control::ProcessControl;
use crate::error::{ImagerError, ImagerResult};
use crate::event::ImagerEvent;
use crate::stats::StatsPublisher;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Peers selected for each role
#[derive(Clone, Default)]
pub struct PeerSet {
    pub camera: Option<SharedCamera>,
    /// Shutter that exposes while the camera only digitizes
    pub aux_shutter: Option<SharedCamera>,
    pub focuser: Option<SharedFocuser>,
    pub wheel: Option<SharedWheel>,
    pub guider: Option<SharedGuider>,
    pub mount: Option<SharedMount>,
    pub solver: Option<SharedSolver>,
    /// Other imager instances taking part in barrier synchronisation
    pub related: Vec<SharedRelatedImager>,
}

impl PeerSet {
    fn clear(&mut self, role: PeerRole) {
        match role {
            PeerRole::Camera => self.camera = None,
            PeerRole::AuxShutter => self.aux_shutter = None,
            PeerRole::Focuser => self.focuser = None,
            PeerRole::Wheel => self.wheel = None,
            PeerRole::Guider => self.guider = None,
            PeerRole::Mount => self.mount = None,
            PeerRole::Solver => self.solver = None,
            PeerRole::RelatedImager => self.related.clear(),
        }
    }
}

/// State snooped from peer notifications
#[derive(Debug, Clone)]
pub struct PeerWatch {
    pub dither_started: bool,
    pub dither_finished: bool,
    /// Guider is past its first frames in the Guiding phase
    pub guiding: bool,
    pub guider_state: PropertyState,
    pub solver_state: PropertyState,
    /// Last observed pause state of every related imager
    pub barrier: Vec<(String, PropertyState)>,
    /// Every related imager is paused
    pub barrier_resume: bool,
    /// Hours to transit as reported by the mount agent
    pub time_to_transit: Option<f64>,
    pub binning: (u32, u32),
    pub focuser_position: Option<f64>,
    /// A peer disappeared since the flag was last reset
    pub property_removed: bool,
}

impl Default for PeerWatch {
    fn default() -> Self {
        Self {
            dither_started: false,
            dither_finished: false,
            guiding: false,
            guider_state: PropertyState::Idle,
            solver_state: PropertyState::Idle,
            barrier: Vec::new(),
            barrier_resume: true,
            time_to_transit: None,
            binning: (1, 1),
            focuser_position: None,
            property_removed: false,
        }
    }
}

impl PeerWatch {
    fn recompute_barrier(&mut self) {
        self.barrier_resume = self
            .barrier
            .iter()
            .all(|(_, state)| *state == PropertyState::Busy);
    }
}

/// Sensor window replaced by a sub-frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SavedFrame {
    pub rect: FrameRect,
    /// Selection shift applied when the sub-frame was set, in binned pixels
    pub shift_x: f64,
    pub shift_y: f64,
}

/// Analysis state carried between the captures of one run
#[derive(Debug, Default)]
pub struct CaptureSession {
    pub saturation_mask: Option<SaturationMask>,
    pub frame_saturated: bool,
    pub reference: Option<FrameDigest>,
    pub allow_subframing: bool,
    pub find_stars: bool,
    pub saved_frame: Option<SavedFrame>,
    pub stars: Vec<DetectedStar>,
}

impl CaptureSession {
    /// Forget per-run analysis state, keeping the saved frame
    pub fn reset(&mut self) {
        self.saturation_mask = None;
        self.frame_saturated = false;
        self.reference = None;
    }
}

pub struct ImagerContext {
    name: String,
    config: Mutex<ImagerConfig>,
    peers: RwLock<PeerSet>,
    watch: Mutex<PeerWatch>,
    session: Mutex<CaptureSession>,
    events: broadcast::Sender<ImagerEvent>,
    analyzer: Arc<dyn FrameAnalyzer>,
    timeouts: PeerTimeoutConfig,
    pub stats: StatsPublisher,
    pub control: ProcessControl,
}

impl ImagerContext {
    pub fn new(name: impl Into<String>, config: ImagerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            name: name.into(),
            config: Mutex::new(config),
            peers: RwLock::new(PeerSet::default()),
            watch: Mutex::new(PeerWatch::default()),
            session: Mutex::new(CaptureSession::default()),
            stats: StatsPublisher::new(events.clone()),
            control: ProcessControl::new(events.clone()),
            events,
            analyzer: Arc::new(BasicAnalyzer::new()),
            timeouts: PeerTimeoutConfig::default(),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn FrameAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_timeouts(mut self, timeouts: PeerTimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeouts(&self) -> &PeerTimeoutConfig {
        &self.timeouts
    }

    pub fn analyzer(&self) -> &dyn FrameAnalyzer {
        self.analyzer.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImagerEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ImagerEvent) {
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Operator facing message
    pub fn send_message(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("[{}] {}", self.name, text);
        self.emit(ImagerEvent::message(text, PropertyState::Ok));
    }

    /// Operator facing message for a failure
    pub fn send_alert(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!("[{}] {}", self.name, text);
        self.emit(ImagerEvent::message(text, PropertyState::Alert));
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn config(&self) -> ImagerConfig {
        lock(&self.config).clone()
    }

    pub fn update_config<R>(&self, change: impl FnOnce(&mut ImagerConfig) -> R) -> R {
        let mut config = lock(&self.config);
        let result = change(&mut config);
        config.validate();
        result
    }

    pub fn selection(&self) -> Selection {
        lock(&self.config).selection.clone()
    }

    /// Change the selection and publish it
    pub fn update_selection<R>(&self, change: impl FnOnce(&mut Selection) -> R) -> R {
        let (result, selection) = {
            let mut config = lock(&self.config);
            let result = change(&mut config.selection);
            (result, config.selection.clone())
        };
        self.emit(ImagerEvent::SelectionChanged(selection));
        result
    }

    // ========================================================================
    // Peers
    // ========================================================================

    pub fn peers(&self) -> PeerSet {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_peers(&self, change: impl FnOnce(&mut PeerSet)) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut peers);
    }

    pub fn camera(&self) -> ImagerResult<SharedCamera> {
        self.peers().camera.ok_or(ImagerError::PeerMissing {
            role: PeerRole::Camera,
        })
    }

    pub fn focuser(&self) -> ImagerResult<SharedFocuser> {
        self.peers().focuser.ok_or(ImagerError::PeerMissing {
            role: PeerRole::Focuser,
        })
    }

    pub fn wheel(&self) -> ImagerResult<SharedWheel> {
        self.peers().wheel.ok_or(ImagerError::PeerMissing {
            role: PeerRole::Wheel,
        })
    }

    pub fn guider(&self) -> Option<SharedGuider> {
        self.peers().guider
    }

    pub fn mount(&self) -> Option<SharedMount> {
        self.peers().mount
    }

    pub fn solver(&self) -> Option<SharedSolver> {
        self.peers().solver
    }

    pub fn related_imagers(&self) -> Vec<SharedRelatedImager> {
        self.peers().related
    }

    /// Let the mount agent abort this instance, ignored without a mount
    pub async fn allow_abort_by_mount(&self, allowed: bool) {
        if let Some(mount) = self.mount() {
            if let Err(err) = mount.allow_imager_abort(allowed).await {
                tracing::warn!("[{}] Failed to change abort permission on {}: {}", self.name, mount.name(), err);
            }
        }
    }

    pub async fn disable_solver(&self) {
        if let Some(solver) = self.solver() {
            if let Err(err) = solver.disable().await {
                tracing::warn!("[{}] Failed to disable {}: {}", self.name, solver.name(), err);
            }
        }
    }

    // ========================================================================
    // Snooped peer state
    // ========================================================================

    pub fn watch(&self) -> PeerWatch {
        lock(&self.watch).clone()
    }

    pub fn update_watch<R>(&self, change: impl FnOnce(&mut PeerWatch) -> R) -> R {
        change(&mut lock(&self.watch))
    }

    pub fn session(&self) -> MutexGuard<'_, CaptureSession> {
        lock(&self.session)
    }

    /// Forward peer notifications from `bus` into this context
    pub fn attach(self: &Arc<Self>, bus: &NotificationBus) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        let Some(context) = weak.upgrade() else {
                            break;
                        };
                        context.handle_notification(notification);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Notification dispatch lagged, {} notifications dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn handle_notification(&self, notification: PeerNotification) {
        match notification {
            PeerNotification::DitherState { state, triggered } => {
                let mut watch = lock(&self.watch);
                if watch.dither_finished {
                    return;
                }
                match state {
                    PropertyState::Busy if triggered && !watch.dither_started => {
                        tracing::debug!("[{}] Dithering started", self.name);
                        watch.dither_started = true;
                    }
                    PropertyState::Ok if watch.dither_started => {
                        tracing::debug!("[{}] Dithering finished", self.name);
                        watch.dither_finished = true;
                    }
                    PropertyState::Ok => {
                        tracing::debug!("[{}] Dithering finished without start", self.name);
                        watch.dither_finished = true;
                    }
                    PropertyState::Alert => {
                        tracing::debug!("[{}] Dithering failed", self.name);
                        watch.dither_started = true;
                        watch.dither_finished = true;
                    }
                    _ => {}
                }
            }
            PeerNotification::GuiderStats {
                phase,
                frame,
                dithering_rms,
            } => {
                lock(&self.watch).guiding = phase == GuiderPhase::Guiding && frame > 5;
                self.stats.update(|stats| stats.dithering = dithering_rms);
            }
            PeerNotification::GuiderProcessState(state) => {
                lock(&self.watch).guider_state = state;
            }
            PeerNotification::SolverProcessState(state) => {
                lock(&self.watch).solver_state = state;
            }
            PeerNotification::ImagerPauseState { instance, state } => {
                let barrier = {
                    let mut watch = lock(&self.watch);
                    let Some(entry) = watch.barrier.iter_mut().find(|(name, _)| *name == instance)
                    else {
                        return;
                    };
                    entry.1 = state;
                    watch.recompute_barrier();
                    watch.barrier.clone()
                };
                self.emit(ImagerEvent::BarrierChanged(barrier));
            }
            PeerNotification::RelatedImagers(names) => {
                let barrier = {
                    let mut watch = lock(&self.watch);
                    let barrier = names
                        .into_iter()
                        .map(|name| {
                            let state = watch
                                .barrier
                                .iter()
                                .find(|(known, _)| *known == name)
                                .map(|(_, state)| *state)
                                .unwrap_or(PropertyState::Idle);
                            (name, state)
                        })
                        .collect();
                    watch.barrier = barrier;
                    watch.recompute_barrier();
                    watch.barrier.clone()
                };
                self.emit(ImagerEvent::BarrierChanged(barrier));
            }
            PeerNotification::TimeToTransit(hours) => {
                lock(&self.watch).time_to_transit = Some(hours);
            }
            PeerNotification::CameraBinning { x, y } => {
                let old = {
                    let mut watch = lock(&self.watch);
                    std::mem::replace(&mut watch.binning, (x, y))
                };
                if old != (x, y) {
                    self.update_selection(|selection| selection.rescale(old, (x, y)));
                }
            }
            PeerNotification::FocuserPosition(position) => {
                lock(&self.watch).focuser_position = Some(position);
            }
            PeerNotification::PeerRemoved(role) => {
                tracing::warn!("[{}] {} removed", self.name, role);
                self.update_peers(|peers| peers.clear(role));
                lock(&self.watch).property_removed = true;
            }
        }
    }
}
