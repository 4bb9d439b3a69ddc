//! Imager instance facade
//!
//! [`Imager`] owns one context and its worker task. Start requests spawn the
//! process body for the requested action; pause and abort act on the running
//! process and, in barrier mode, on every linked instance.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use nightshade_indi::{
    IndiError, IndiResult, NotificationBus, PeerNotification, PropertyState, RelatedImager,
    SharedRelatedImager,
};

use crate::batch::{exposure_process, streaming_process};
use crate::capture::{capture, restore_subframe, CaptureRequest};
use crate::config::{ImagerConfig, ResumeMode};
use crate::context::{ImagerContext, PeerSet};
use crate::control::{PauseMode, PauseToggle, StartAction};
use crate::error::{ImagerError, ImagerResult};
use crate::event::ImagerEvent;
use crate::files::ImageFolder;
use crate::focus::focus_process;
use crate::persistence::ConfigStore;
use crate::sequencer::sequence_process;
use crate::stats::Phase;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    ctx: Arc<ImagerContext>,
    store: Option<ConfigStore>,
    worker: Mutex<Option<JoinHandle<PropertyState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Handle to one imager instance, cheap to clone
#[derive(Clone)]
pub struct Imager {
    inner: Arc<Inner>,
}

impl Imager {
    pub fn new(ctx: ImagerContext) -> Self {
        Self::build(ctx, None)
    }

    /// Instance whose configuration is saved to `store`
    pub fn with_store(ctx: ImagerContext, store: ConfigStore) -> Self {
        Self::build(ctx, Some(store))
    }

    /// Instance named `name` with the configuration last saved to `store`
    pub fn open(name: &str, store: ConfigStore) -> ImagerResult<Self> {
        let config = store.load()?;
        Ok(Self::with_store(ImagerContext::new(name, config), store))
    }

    fn build(ctx: ImagerContext, store: Option<ConfigStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: Arc::new(ctx),
                store,
                worker: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.ctx.name()
    }

    pub fn context(&self) -> &Arc<ImagerContext> {
        &self.inner.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImagerEvent> {
        self.inner.ctx.subscribe()
    }

    /// Dispatch notifications from `bus` and report pause changes on it
    pub fn attach(&self, bus: &NotificationBus) {
        let ctx = &self.inner.ctx;
        let dispatch = ctx.attach(bus);

        let mut events = ctx.subscribe();
        let instance = ctx.name().to_string();
        let bus = bus.clone();
        let forward = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ImagerEvent::PauseChanged { state }) => {
                        bus.publish(PeerNotification::ImagerPauseState {
                            instance: instance.clone(),
                            state,
                        });
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        lock(&self.inner.tasks).extend([dispatch, forward]);
    }

    pub fn update_peers(&self, change: impl FnOnce(&mut PeerSet)) {
        self.inner.ctx.update_peers(change);
    }

    /// Take part in barrier synchronisation with `others`
    pub fn link(&self, others: &[Imager]) {
        let related: Vec<SharedRelatedImager> = others
            .iter()
            .filter(|other| !Arc::ptr_eq(&other.inner, &self.inner))
            .map(|other| {
                Arc::new(LinkedImager {
                    name: other.name().to_string(),
                    inner: Arc::downgrade(&other.inner),
                }) as SharedRelatedImager
            })
            .collect();
        let names = related.iter().map(|imager| imager.name().to_string()).collect();
        self.inner.ctx.update_peers(|peers| peers.related = related);
        self.inner
            .ctx
            .handle_notification(PeerNotification::RelatedImagers(names));
    }

    // ========================================================================
    // Process control
    // ========================================================================

    /// Start `action` on the worker, rejected while another action runs
    pub fn start(&self, action: StartAction) -> ImagerResult<Uuid> {
        let ctx = self.inner.ctx.clone();
        let (run_id, _) = ctx.control.begin(action)?;
        tracing::info!("[{}] Starting {} ({})", ctx.name(), action, run_id);
        let worker = tokio::spawn(async move {
            let state = run_process(&ctx, action).await;
            ctx.control.finish(state);
            state
        });
        *lock(&self.inner.worker) = Some(worker);
        Ok(run_id)
    }

    /// Wait for the last started action, None when nothing was started
    pub async fn wait(&self) -> Option<PropertyState> {
        let worker = lock(&self.inner.worker).take()?;
        match worker.await {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::error!("[{}] Worker failed: {}", self.name(), err);
                Some(PropertyState::Alert)
            }
        }
    }

    /// Operator pause toggle
    pub async fn pause(&self, mode: PauseMode) -> PauseToggle {
        let ctx = &self.inner.ctx;
        let toggle = ctx.control.request_pause(mode);
        tracing::debug!("[{}] Pause request {:?}: {:?}", ctx.name(), mode, toggle);
        if toggle == PauseToggle::Paused(PauseMode::WithAbort) {
            abort_exposures(ctx).await;
        }
        toggle
    }

    /// Abort the running action. Returns false when nothing was aborted.
    pub async fn abort(&self) -> bool {
        let ctx = &self.inner.ctx;
        if ctx.control.abort_state() == PropertyState::Busy {
            return false;
        }
        if !ctx.control.request_abort() {
            return false;
        }
        tracing::info!("[{}] Abort requested", ctx.name());
        abort_exposures(ctx).await;
        if let Ok(focuser) = ctx.focuser() {
            if let Err(err) = focuser.abort_motion().await {
                tracing::warn!("[{}] Failed to stop {}: {}", ctx.name(), focuser.name(), err);
            }
        }
        if ctx.config().resume_mode == ResumeMode::Barrier {
            let related = ctx.related_imagers();
            let results = join_all(related.iter().map(|imager| imager.abort())).await;
            for (imager, result) in related.iter().zip(results) {
                if let Err(err) = result {
                    tracing::warn!("[{}] Failed to abort {}: {}", ctx.name(), imager.name(), err);
                }
            }
        }
        true
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn config(&self) -> ImagerConfig {
        self.inner.ctx.config()
    }

    pub fn configure<R>(&self, change: impl FnOnce(&mut ImagerConfig) -> R) -> R {
        self.inner.ctx.update_config(change)
    }

    pub fn save(&self) -> ImagerResult<()> {
        let Some(store) = &self.inner.store else {
            return Err(ImagerError::InvalidConfiguration(format!(
                "{} has no configuration store",
                self.name()
            )));
        };
        store.save(&self.inner.ctx.config())
    }

    pub fn image_folder(&self) -> ImagerResult<ImageFolder> {
        self.inner
            .ctx
            .config()
            .image_folder
            .map(ImageFolder::new)
            .ok_or_else(|| ImagerError::InvalidConfiguration("No image folder is configured".to_string()))
    }
}

async fn abort_exposures(ctx: &ImagerContext) {
    let peers = ctx.peers();
    for camera in peers.camera.iter().chain(peers.aux_shutter.iter()) {
        if let Err(err) = camera.abort_exposure().await {
            tracing::warn!("[{}] Failed to abort exposure on {}: {}", ctx.name(), camera.name(), err);
        }
    }
}

/// Another instance of this process seen through the peer interface
struct LinkedImager {
    name: String,
    inner: Weak<Inner>,
}

impl LinkedImager {
    fn imager(&self) -> IndiResult<Imager> {
        self.inner
            .upgrade()
            .map(|inner| Imager { inner })
            .ok_or_else(|| IndiError::PeerLost {
                device: self.name.clone(),
            })
    }
}

#[async_trait]
impl RelatedImager for LinkedImager {
    fn name(&self) -> &str {
        &self.name
    }

    async fn release_pause(&self) -> IndiResult<()> {
        self.imager()?.inner.ctx.control.release_pause();
        Ok(())
    }

    async fn start_batch(&self) -> IndiResult<()> {
        self.imager()?
            .start(StartAction::Exposure)
            .map(|_| ())
            .map_err(|err| IndiError::DeviceAlert(err.to_string()))
    }

    async fn abort(&self) -> IndiResult<()> {
        self.imager()?.abort().await;
        Ok(())
    }
}

// ============================================================================
// Processes
// ============================================================================

async fn run_process(ctx: &ImagerContext, action: StartAction) -> PropertyState {
    match action {
        StartAction::Preview => preview_process(ctx).await,
        StartAction::Exposure => exposure_process(ctx).await,
        StartAction::Streaming => streaming_process(ctx).await,
        StartAction::Focus => focus_process(ctx).await,
        StartAction::Sequence => sequence_process(ctx).await,
        StartAction::FindStars => find_stars_process(ctx).await,
    }
}

/// Capture and analyze until a frame fails or the run is aborted
async fn preview_process(ctx: &ImagerContext) -> PropertyState {
    ctx.stats.update(|stats| {
        stats.exposure = 0.0;
        stats.delay = 0.0;
        stats.frame = 0;
        stats.frames = 0;
        stats.clear_measurements();
        stats.focus_deviation = 100.0;
    });
    {
        let mut session = ctx.session();
        session.reset();
        session.allow_subframing = true;
        session.find_stars = false;
    }
    ctx.allow_abort_by_mount(false).await;
    ctx.disable_solver().await;

    let exposure = ctx.config().batch.exposure;
    loop {
        if let Err(err) = capture(ctx, CaptureRequest::preview(exposure)).await {
            tracing::debug!("[{}] Preview ended: {}", ctx.name(), err);
            break;
        }
    }
    restore_subframe(ctx, exposure).await;
    ctx.stats.set_phase(Phase::Idle);
    PropertyState::Ok
}

/// Detect stars on one frame
async fn find_stars_process(ctx: &ImagerContext) -> PropertyState {
    {
        let mut session = ctx.session();
        session.reset();
        session.allow_subframing = false;
        session.find_stars = true;
    }
    ctx.stats.update(|stats| stats.frame = 0);
    ctx.disable_solver().await;

    let exposure = ctx.config().batch.exposure;
    if let Err(err) = capture(ctx, CaptureRequest::analyzed(exposure)).await {
        tracing::warn!("[{}] Star detection failed: {}", ctx.name(), err);
        ctx.session().stars.clear();
        ctx.emit(ImagerEvent::StarsDetected {
            stars: Vec::new(),
            state: PropertyState::Alert,
        });
    }
    ctx.stats.set_phase(Phase::Idle);
    PropertyState::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Checkpoint;
    use crate::testing::wait_for;
    use nightshade_indi::sim::SimCamera;
    use nightshade_indi::{PeerTimeoutConfig, SharedCamera};
    use std::time::Duration;

    fn instance(name: &str, config: ImagerConfig) -> (Imager, Arc<SimCamera>) {
        let camera = Arc::new(SimCamera::new(&format!("{} CCD", name), 0.001));
        let ctx = ImagerContext::new(name, config).with_timeouts(PeerTimeoutConfig::fast());
        let imager = Imager::new(ctx);
        let shared: SharedCamera = camera.clone();
        imager.update_peers(|peers| peers.camera = Some(shared));
        (imager, camera)
    }

    fn barrier_config(armed: bool) -> ImagerConfig {
        let mut config = ImagerConfig::default();
        config.batch.count = 1;
        config.resume_mode = ResumeMode::Barrier;
        config.breakpoints.arm(Checkpoint::PostCapture, armed);
        config
    }

    fn linked(configs: Vec<ImagerConfig>) -> Vec<(Imager, Arc<SimCamera>)> {
        let bus = NotificationBus::new();
        let instances: Vec<_> = configs
            .into_iter()
            .enumerate()
            .map(|(i, config)| instance(&format!("Imager Agent {}", i), config))
            .collect();
        let imagers: Vec<Imager> = instances.iter().map(|(imager, _)| imager.clone()).collect();
        for imager in &imagers {
            imager.attach(&bus);
            imager.link(&imagers);
        }
        instances
    }

    async fn outcome(imager: &Imager) -> Option<PropertyState> {
        tokio::time::timeout(Duration::from_secs(5), imager.wait())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_barrier_releases_all_instances() {
        let instances = linked(vec![barrier_config(true), barrier_config(true), barrier_config(true)]);
        let barrier = instances[0].0.context().watch().barrier;
        assert_eq!(barrier.len(), 2);

        instances[0].0.start(StartAction::Exposure).unwrap();
        assert!(
            wait_for(
                || instances
                    .iter()
                    .all(|(imager, _)| imager.context().control.start_state() != PropertyState::Idle),
                Duration::from_secs(2)
            )
            .await
        );
        for (imager, camera) in &instances {
            assert_eq!(outcome(imager).await, Some(PropertyState::Ok), "{}", imager.name());
            assert_eq!(camera.exposures().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_incomplete_barrier_waits_until_abort() {
        let instances = linked(vec![barrier_config(true), barrier_config(true), barrier_config(false)]);
        let (a, b, c) = (&instances[0].0, &instances[1].0, &instances[2].0);
        a.start(StartAction::Exposure).unwrap();
        assert!(
            wait_for(
                || a.context().control.is_paused()
                    && b.context().control.is_paused()
                    && c.context().control.start_state() == PropertyState::Ok,
                Duration::from_secs(2)
            )
            .await
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(a.context().control.is_paused());
        assert!(b.context().control.is_paused());

        assert!(a.abort().await);
        assert_eq!(outcome(a).await, Some(PropertyState::Alert));
        assert_eq!(outcome(b).await, Some(PropertyState::Alert));
        assert_eq!(outcome(c).await, Some(PropertyState::Ok));
        assert!(!a.abort().await);
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let mut config = ImagerConfig::default();
        config.batch.count = -1;
        let (imager, camera) = instance("Imager Agent", config);
        imager.start(StartAction::Exposure).unwrap();
        assert!(matches!(imager.start(StartAction::Preview), Err(ImagerError::Busy(_))));
        assert!(wait_for(|| !camera.exposures().is_empty(), Duration::from_secs(2)).await);
        assert!(imager.abort().await);
        assert_eq!(outcome(&imager).await, Some(PropertyState::Ok));
        assert!(imager.start(StartAction::Preview).is_ok());
        imager.abort().await;
        outcome(&imager).await;
    }

    #[tokio::test]
    async fn test_preview_runs_until_abort() {
        let (imager, camera) = instance("Imager Agent", ImagerConfig::default());
        imager.start(StartAction::Preview).unwrap();
        assert!(wait_for(|| camera.exposures().len() >= 3, Duration::from_secs(2)).await);
        assert!(imager.abort().await);
        assert_eq!(outcome(&imager).await, Some(PropertyState::Ok));
        let control = &imager.context().control;
        assert_eq!(control.start_state(), PropertyState::Ok);
        assert_eq!(control.abort_state(), PropertyState::Ok);
        assert!(imager.context().stats.snapshot().hfd > 0.0);
    }

    #[tokio::test]
    async fn test_find_stars() {
        let (imager, camera) = instance("Imager Agent", ImagerConfig::default());
        let mut events = imager.subscribe();
        imager.start(StartAction::FindStars).unwrap();
        assert_eq!(outcome(&imager).await, Some(PropertyState::Ok));
        assert_eq!(camera.exposures().len(), 1);
        let mut detected = None;
        while let Ok(event) = events.try_recv() {
            if let ImagerEvent::StarsDetected { stars, state } = event {
                detected = Some((stars, state));
            }
        }
        let (stars, state) = detected.unwrap();
        assert_eq!(state, PropertyState::Ok);
        assert!(!stars.is_empty());

        camera.set_star_position(-50.0, -50.0);
        imager.start(StartAction::FindStars).unwrap();
        assert_eq!(outcome(&imager).await, Some(PropertyState::Ok));
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            if let ImagerEvent::StarsDetected { stars, state } = event {
                last = Some((stars, state));
            }
        }
        assert_eq!(last, Some((Vec::new(), PropertyState::Alert)));
    }

    #[tokio::test]
    async fn test_pause_with_abort_redoes_exposure() {
        let mut config = ImagerConfig::default();
        config.batch.count = 2;
        config.batch.exposure = 100.0;
        let (imager, camera) = instance("Imager Agent", config);
        imager.start(StartAction::Exposure).unwrap();
        assert!(wait_for(|| camera.exposures().len() == 1, Duration::from_secs(2)).await);
        assert_eq!(
            imager.pause(PauseMode::WithAbort).await,
            PauseToggle::Paused(PauseMode::WithAbort)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(imager.pause(PauseMode::WithAbort).await, PauseToggle::Resumed);
        assert_eq!(outcome(&imager).await, Some(PropertyState::Ok));
        assert!(camera.exposures().len() >= 2);
    }

    #[tokio::test]
    async fn test_pause_without_action_rejected() {
        let (imager, _) = instance("Imager Agent", ImagerConfig::default());
        assert_eq!(imager.pause(PauseMode::WithWait).await, PauseToggle::Rejected);
        assert!(!imager.abort().await);
        assert_eq!(imager.wait().await, None);
    }

    #[tokio::test]
    async fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::for_instance(dir.path(), "Imager Agent");
        let imager = Imager::open("Imager Agent", store.clone()).unwrap();
        assert_eq!(imager.config(), ImagerConfig::default());
        assert!(imager.image_folder().is_err());

        imager.configure(|config| {
            config.batch.count = 12;
            config.batch.exposure = 300.0;
            config.image_folder = Some(dir.path().to_path_buf());
        });
        imager.save().unwrap();

        let reopened = Imager::open("Imager Agent", store).unwrap();
        assert_eq!(reopened.config().batch.count, 12);
        assert_eq!(reopened.config().batch.exposure, 300.0);
        assert_eq!(reopened.image_folder().unwrap().dir(), dir.path());

        let (unsaved, _) = instance("Imager Agent B", ImagerConfig::default());
        assert!(unsaved.save().is_err());
    }
}
