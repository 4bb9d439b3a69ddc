//! Imaging orchestrator
//!
//! Drives a camera together with its focuser, filter wheel, guider, mount and
//! solver peers through previews, exposure batches, streaming, autofocus and
//! scripted sequences.
//!
//! ## Features
//!
//! - Capture step with retries, abort-coupled pause redo and sub-framing
//! - Batches with dithering, transit pause, breakpoints and barrier release
//! - Hill-climbing and U-curve autofocus with backlash compensation
//! - Sequencer scripts with per-batch camera, filter and mount settings
//! - Statistics and state changes published as [`ImagerEvent`]s
//! - JSON persisted configuration and image folder access

pub mod analysis;
pub mod batch;
pub mod breakpoint;
pub mod capture;
pub mod config;
pub mod context;
pub mod control;
pub mod controller;
pub mod dither;
mod error;
pub mod event;
pub mod files;
pub mod focus;
pub mod persistence;
pub mod sequencer;
pub mod stats;

pub use analysis::{BasicAnalyzer, FrameAnalyzer};
pub use config::{
    BatchConfig, BreakpointSet, Checkpoint, FocusConfig, FocusEstimator, ImagerConfig,
    ProcessFeatures, ResumeMode, Selection, Sequence, StarPosition,
};
pub use context::{ImagerContext, PeerSet};
pub use control::{PauseMode, PauseToggle, StartAction};
pub use controller::Imager;
pub use error::{ImagerError, ImagerResult};
pub use event::ImagerEvent;
pub use files::{ImageDownload, ImageFile, ImageFolder};
pub use persistence::ConfigStore;
pub use stats::{Phase, RunStats};

#[cfg(test)]
pub(crate) mod testing {
    //! Simulated rig shared by the orchestrator tests

    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast;

    use nightshade_indi::sim::{SimCamera, SimFocuser, SimGuider, SimMount, SimSolver, SimWheel};
    use nightshade_indi::{NotificationBus, PeerTimeoutConfig};

    use crate::analysis::{Contrast, DetectedStar, FrameAnalyzer, FrameDigest, Psf, RawFrame, SaturationMask};
    use crate::config::{ImagerConfig, StarPosition};
    use crate::context::ImagerContext;
    use crate::event::ImagerEvent;

    pub struct Rig {
        pub ctx: Arc<ImagerContext>,
        pub bus: NotificationBus,
        pub camera: Arc<SimCamera>,
        pub focuser: Arc<SimFocuser>,
        pub wheel: Arc<SimWheel>,
        pub guider: Arc<SimGuider>,
        pub mount: Arc<SimMount>,
        pub solver: Arc<SimSolver>,
        pub messages: MessageLog,
    }

    pub async fn rig() -> Rig {
        rig_with(ImagerConfig::default()).await
    }

    pub async fn rig_with(config: ImagerConfig) -> Rig {
        assemble(config, |_| None).await
    }

    /// Rig whose HFD at the star follows `curve` of the focuser position
    pub async fn rig_with_curve(
        config: ImagerConfig,
        curve: impl Fn(f64) -> f64 + Send + Sync + 'static,
    ) -> Rig {
        assemble(config, move |focuser| {
            Some(Arc::new(ScriptedAnalyzer {
                focuser: focuser.clone(),
                curve: Box::new(curve),
            }) as Arc<dyn FrameAnalyzer>)
        })
        .await
    }

    async fn assemble(
        config: ImagerConfig,
        analyzer: impl FnOnce(&Arc<SimFocuser>) -> Option<Arc<dyn FrameAnalyzer>>,
    ) -> Rig {
        let bus = NotificationBus::new();
        let camera = Arc::new(SimCamera::new("CCD Imager Simulator", 0.001));
        let focuser = Arc::new(SimFocuser::new("Focuser Simulator", 10000.0).with_bus(bus.clone()));
        let wheel = Arc::new(SimWheel::new(
            "Filter Wheel Simulator",
            &["Luminance", "Red", "Green", "Blue"],
        ));
        let guider = Arc::new(SimGuider::new("Guider Agent", bus.clone()));
        let mount = Arc::new(SimMount::new("Mount Agent"));
        let solver = Arc::new(SimSolver::new("Astrometry Agent", bus.clone()));

        let mut ctx = ImagerContext::new("Imager Agent", config).with_timeouts(PeerTimeoutConfig::fast());
        if let Some(analyzer) = analyzer(&focuser) {
            ctx = ctx.with_analyzer(analyzer);
        }
        let ctx = Arc::new(ctx);
        ctx.update_peers(|peers| {
            peers.camera = Some(camera.clone());
            peers.focuser = Some(focuser.clone());
            peers.wheel = Some(wheel.clone());
            peers.guider = Some(guider.clone());
            peers.mount = Some(mount.clone());
            peers.solver = Some(solver.clone());
        });
        ctx.attach(&bus);
        let messages = MessageLog::new(&ctx);

        Rig {
            ctx,
            bus,
            camera,
            focuser,
            wheel,
            guider,
            mount,
            solver,
            messages,
        }
    }

    /// Operator messages sent by a context
    pub struct MessageLog {
        inner: Arc<Mutex<LogState>>,
    }

    struct LogState {
        events: broadcast::Receiver<ImagerEvent>,
        texts: Vec<String>,
    }

    impl LogState {
        fn drain(&mut self) -> bool {
            loop {
                match self.events.try_recv() {
                    Ok(ImagerEvent::Message { text, .. }) => self.texts.push(text),
                    Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                    Err(broadcast::error::TryRecvError::Empty) => return true,
                    Err(broadcast::error::TryRecvError::Closed) => return false,
                }
            }
        }
    }

    impl MessageLog {
        fn new(ctx: &ImagerContext) -> Self {
            let inner = Arc::new(Mutex::new(LogState {
                events: ctx.subscribe(),
                texts: Vec::new(),
            }));
            // Keep up with busy event streams between assertions
            let collector = Arc::downgrade(&inner);
            tokio::spawn(async move {
                loop {
                    let Some(state) = collector.upgrade() else {
                        break;
                    };
                    if !state.lock().unwrap_or_else(PoisonError::into_inner).drain() {
                        break;
                    }
                    drop(state);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            });
            Self { inner }
        }

        pub fn texts(&self) -> Vec<String> {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            state.drain();
            state.texts.clone()
        }

        pub fn contains(&self, text: &str) -> bool {
            self.texts().iter().any(|message| message == text)
        }
    }

    /// Poll `condition` until it holds or `timeout` passes
    pub async fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            if condition() {
                return true;
            }
            if started.elapsed() > timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Analyzer reporting one centered star whose HFD follows a focus curve
    struct ScriptedAnalyzer {
        focuser: Arc<SimFocuser>,
        curve: Box<dyn Fn(f64) -> f64 + Send + Sync>,
    }

    impl ScriptedAnalyzer {
        fn hfd(&self) -> f64 {
            (self.curve)(self.focuser.current_position())
        }
    }

    impl FrameAnalyzer for ScriptedAnalyzer {
        fn contrast(&self, _frame: &RawFrame, _mask: Option<&SaturationMask>) -> Contrast {
            Contrast {
                contrast: 10.0 / self.hfd(),
                saturated: false,
            }
        }

        fn update_saturation_mask(&self, _frame: &RawFrame, _mask: &mut Option<SaturationMask>) {}

        fn find_stars(&self, _frame: &RawFrame, _radius: f64, _max: usize) -> Vec<DetectedStar> {
            vec![DetectedStar {
                x: 64.0,
                y: 64.0,
                luminance: 1.0,
                oversaturated: false,
                nc_distance: 0.0,
                close_to_other: false,
            }]
        }

        fn psf(&self, _frame: &RawFrame, _stars: &[StarPosition], _radius: f64) -> Option<Psf> {
            let hfd = self.hfd();
            Some(Psf {
                fwhm: hfd * 0.8,
                hfd,
                peak: 1000.0,
            })
        }

        fn digest(&self, _frame: &RawFrame, stars: &mut [StarPosition], _radius: f64) -> Option<FrameDigest> {
            let count = stars.len().max(1) as f64;
            Some(FrameDigest {
                centroid_x: stars.iter().map(|star| star.x).sum::<f64>() / count,
                centroid_y: stars.iter().map(|star| star.y).sum::<f64>() / count,
                stars: stars.len(),
            })
        }
    }
}
