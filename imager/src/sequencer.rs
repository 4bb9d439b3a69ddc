//! Sequencer
//!
//! Walks the top level script token by token. `key=value` tokens change a
//! setting, `park`/`unpark` command the mount and bare numbers run the
//! referenced batch script: its settings, an optional autofocus pass and one
//! batch.

use std::time::Duration;

use nightshade_indi::{
    poll_until, sleep_or_cancel, IndiError, PeerRole, PropertyState, SettingKind, SettingTable,
    SettingTarget, SharedGuider, WaitOutcome,
};

use crate::batch::run_batch;
use crate::config::Sequence;
use crate::context::{ImagerContext, PeerSet};
use crate::error::{ImagerError, ImagerResult};
use crate::focus::autofocus_repeat;
use crate::stats::Phase;

const WHEEL_SLOT: &str = "WHEEL_SLOT";

/// Peer roles a sequence refers to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prerequisites {
    pub focuser: bool,
    pub wheel: bool,
    pub mount: bool,
    pub guider: bool,
    pub solver: bool,
}

impl Prerequisites {
    /// Roles one script mentions, by keyword
    pub fn scan(script: &str) -> Self {
        Self {
            focuser: script.contains("focus"),
            wheel: script.contains("filter"),
            mount: script.contains("park"),
            guider: script.contains("guide") || script.contains("calibrate"),
            solver: script.contains("precise"),
        }
    }

    fn merge(&mut self, other: Prerequisites) {
        self.focuser |= other.focuser;
        self.wheel |= other.wheel;
        self.mount |= other.mount;
        self.guider |= other.guider;
        self.solver |= other.solver;
    }

    /// Roles the whole sequence needs and the number of batch references
    pub fn for_sequence(sequence: &Sequence) -> (Self, usize) {
        let top_level = sequence.top_level();
        let mut needs = Self::scan(top_level);
        let mut batches = 0;
        for token in tokens(top_level) {
            if token.contains('=') {
                continue;
            }
            if let Some(script) = batch_reference(token, sequence) {
                batches += 1;
                needs.merge(Self::scan(script));
            }
        }
        (needs, batches)
    }

    /// Fail on the first needed role without a peer
    pub fn check(&self, peers: &PeerSet) -> ImagerResult<()> {
        let missing = [
            (self.focuser && peers.focuser.is_none(), PeerRole::Focuser),
            (self.wheel && peers.wheel.is_none(), PeerRole::Wheel),
            (self.mount && peers.mount.is_none(), PeerRole::Mount),
            (self.guider && peers.guider.is_none(), PeerRole::Guider),
            (self.solver && peers.solver.is_none(), PeerRole::Solver),
        ];
        match missing.iter().find(|(absent, _)| *absent) {
            Some((_, role)) => Err(ImagerError::PeerMissing { role: *role }),
            None => Ok(()),
        }
    }
}

fn tokens(script: &str) -> impl Iterator<Item = &str> {
    script.split(';').map(str::trim).filter(|token| !token.is_empty())
}

/// Batch index a bare token refers to, if it is in range
fn batch_index(token: &str, sequence: &Sequence) -> Option<usize> {
    token
        .parse::<usize>()
        .ok()
        .filter(|index| (1..=sequence.size()).contains(index))
}

fn batch_reference<'s>(token: &str, sequence: &'s Sequence) -> Option<&'s str> {
    batch_index(token, sequence).and_then(|index| sequence.batch(index))
}

fn parse_number(key: &str, value: &str) -> ImagerResult<f64> {
    value.trim().parse::<f64>().map_err(|_| {
        ImagerError::InvalidConfiguration(format!("Invalid value '{}' for '{}'", value, key))
    })
}

/// Runs one sequence, carrying the settings that only live for the run
pub struct Sequencer<'a> {
    ctx: &'a ImagerContext,
    /// Exposure of the autofocus pass before the next batch, 0 for none
    focus_exposure: f64,
    ra: f64,
    dec: f64,
}

impl<'a> Sequencer<'a> {
    pub fn new(ctx: &'a ImagerContext) -> Self {
        Self {
            ctx,
            focus_exposure: 0.0,
            ra: 0.0,
            dec: 0.0,
        }
    }

    /// Walk the top level script. Only an abort or a failed autofocus ends it early.
    pub async fn run(&mut self, sequence: &Sequence) -> ImagerResult<()> {
        let ctx = self.ctx;
        let cancel = ctx.control.cancel_token();
        let mut ordinal = 0;
        for token in tokens(sequence.top_level()) {
            if cancel.is_cancelled() {
                return Err(ImagerError::Aborted);
            }
            ctx.allow_abort_by_mount(false).await;
            ctx.disable_solver().await;

            if let Some((key, value)) = token.split_once('=') {
                if let Err(err) = self.apply(key.trim(), value.trim()).await {
                    tracing::warn!("[{}] Setting '{}' failed: {}", ctx.name(), token, err);
                }
                continue;
            }
            match token {
                "park" | "unpark" => {
                    self.command_mount(token).await;
                    continue;
                }
                _ => {}
            }
            let (Some(index), Some(script)) = (
                batch_index(token, sequence),
                batch_reference(token, sequence),
            ) else {
                tracing::debug!("[{}] Skipping '{}'", ctx.name(), token);
                continue;
            };
            ordinal += 1;
            self.run_batch_script(index, ordinal, script).await?;
        }
        Ok(())
    }

    async fn command_mount(&self, command: &str) {
        let ctx = self.ctx;
        let Some(mount) = ctx.mount() else {
            tracing::warn!("[{}] No mount agent for '{}'", ctx.name(), command);
            return;
        };
        let result = if command == "park" {
            mount.park().await
        } else {
            mount.unpark().await
        };
        if let Err(err) = result {
            tracing::warn!("[{}] Failed to {} {}: {}", ctx.name(), command, mount.name(), err);
        }
    }

    async fn run_batch_script(&mut self, index: usize, ordinal: usize, script: &str) -> ImagerResult<()> {
        let ctx = self.ctx;
        ctx.send_message(format!("Batch {} started", index));
        ctx.stats.update(|stats| {
            stats.frame = 0;
            stats.frames = 0;
            stats.batch_index = index as i32;
        });
        tracing::debug!("[{}] Batch script {} is run {} of the sequence", ctx.name(), index, ordinal);

        let mut valid = true;
        for token in tokens(script) {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            if let Err(err) = self.apply(key.trim(), value.trim()).await {
                tracing::warn!("[{}] Setting '{}' failed: {}", ctx.name(), token, err);
                valid = false;
            }
        }
        if !valid {
            ctx.send_alert(format!("Batch {} failed", index));
            return Ok(());
        }

        ctx.allow_abort_by_mount(true).await;
        if self.focus_exposure > 0.0 {
            self.focus_before_batch().await?;
        }
        if ctx.control.cancel_token().is_cancelled() {
            return Err(ImagerError::Aborted);
        }
        match run_batch(ctx).await {
            Ok(()) => {
                ctx.send_message(format!("Batch {} finished", index));
                Ok(())
            }
            Err(err) => {
                tracing::warn!("[{}] Batch {} failed: {}", ctx.name(), index, err);
                ctx.send_alert(format!("Batch {} failed", index));
                if err.is_aborted() {
                    Err(err)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Autofocus with the `focus` exposure, then put the batch exposure back
    async fn focus_before_batch(&mut self) -> ImagerResult<()> {
        let ctx = self.ctx;
        ctx.stats.set_phase(Phase::Focusing);
        let focus_exposure = self.focus_exposure;
        let exposure = ctx.update_config(|config| {
            std::mem::replace(&mut config.batch.exposure, focus_exposure)
        });
        let primary_unset = ctx.selection().primary().is_unset();
        ctx.session().find_stars = primary_unset;

        ctx.send_message("Autofocus started");
        let result = autofocus_repeat(ctx, true).await;
        match &result {
            Ok(()) => ctx.send_message("Autofocus finished"),
            Err(err) if err.is_aborted() => ctx.send_alert("Autofocus aborted"),
            Err(err) => {
                tracing::warn!("[{}] Autofocus failed: {}", ctx.name(), err);
                ctx.send_alert("Autofocus failed");
            }
        }
        ctx.update_config(|config| config.batch.exposure = exposure);
        self.focus_exposure = 0.0;
        result
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Apply one `key=value` setting, waiting for the peer it touches
    pub async fn apply(&mut self, key: &str, value: &str) -> ImagerResult<()> {
        let ctx = self.ctx;
        ctx.update_watch(|watch| watch.property_removed = false);
        match key.to_ascii_lowercase().as_str() {
            "object" | "start" => Ok(()),
            "sleep" => self.sleep(parse_number(key, value)?).await,
            "focus" => {
                self.focus_exposure = parse_number(key, value)?;
                Ok(())
            }
            "count" => {
                let count = value.trim().parse::<i32>().map_err(|_| {
                    ImagerError::InvalidConfiguration(format!("Invalid value '{}' for '{}'", value, key))
                })?;
                ctx.update_config(|config| config.batch.count = count);
                Ok(())
            }
            "exposure" => {
                let exposure = parse_number(key, value)?;
                ctx.update_config(|config| config.batch.exposure = exposure);
                Ok(())
            }
            "delay" => {
                let delay = parse_number(key, value)?;
                ctx.update_config(|config| config.batch.delay = delay);
                Ok(())
            }
            "filter" => self.select_filter(value).await,
            "ra" => {
                self.ra = parse_number(key, value)?;
                Ok(())
            }
            "dec" => {
                self.dec = parse_number(key, value)?;
                Ok(())
            }
            "goto" => self.goto(value).await,
            "calibrate" => {
                let exposure = parse_number(key, value)?;
                ctx.stats.set_phase(Phase::Calibrating);
                let guider = self.guider()?;
                ctx.update_watch(|watch| {
                    watch.guider_state = PropertyState::Idle;
                    watch.guiding = false;
                });
                guider.calibrate(exposure).await?;
                self.wait_for_guiding(&guider).await
            }
            "guide" => {
                let guider = self.guider()?;
                if value.eq_ignore_ascii_case("off") {
                    guider.stop().await?;
                    return Ok(());
                }
                let exposure = parse_number(key, value)?;
                ctx.update_watch(|watch| {
                    watch.guider_state = PropertyState::Idle;
                    watch.guiding = false;
                });
                guider.start_guiding(exposure).await?;
                self.wait_for_guiding(&guider).await
            }
            other => match SettingTable::camera().lookup(other) {
                Some(target) => self.set_camera_property(target, value).await,
                None => {
                    ctx.send_message(format!("Unknown sequencer command '{}'", key));
                    Err(ImagerError::InvalidConfiguration(format!(
                        "Unknown sequencer command '{}'",
                        key
                    )))
                }
            },
        }
    }

    /// Sleep with 10 ms resolution
    async fn sleep(&self, seconds: f64) -> ImagerResult<()> {
        let millis = (seconds.max(0.0) * 100.0).round() as u64 * 10;
        if sleep_or_cancel(&self.ctx.control.cancel_token(), Duration::from_millis(millis)).await {
            Ok(())
        } else {
            Err(ImagerError::Aborted)
        }
    }

    fn guider(&self) -> ImagerResult<SharedGuider> {
        self.ctx.guider().ok_or(ImagerError::PeerMissing {
            role: PeerRole::Guider,
        })
    }

    /// Failure for a property that did not settle in Ok
    fn failed_to_set(&self, device: &str, property: &str) -> ImagerError {
        self.ctx.send_message(format!("Failed to set '{}'", property));
        IndiError::DeviceAlert(format!("{} rejected {}", device, property)).into()
    }

    async fn set_camera_property(&self, target: &SettingTarget, value: &str) -> ImagerResult<()> {
        let ctx = self.ctx;
        let camera = ctx.camera()?;
        if !camera.has_property(target.property).await? {
            tracing::debug!("[{}] {} has no {}, '{}' ignored", ctx.name(), camera.name(), target.property, target.key);
            return Ok(());
        }
        let options = match target.kind {
            SettingKind::Switch => camera.switch_options(target.property).await?,
            _ => None,
        };
        let Some(setting) = target.resolve(value, options.as_deref())? else {
            tracing::debug!("[{}] No {} option matches '{}'", ctx.name(), target.property, value);
            return Ok(());
        };
        camera.apply(setting).await?;

        let cancel = ctx.control.cancel_token();
        let tick = ctx.timeouts().poll_tick();
        if !sleep_or_cancel(&cancel, tick).await {
            return Err(ImagerError::Aborted);
        }
        let property = target.property;
        let settled = poll_until(&cancel, None, tick, || {
            let camera = camera.clone();
            let removed = ctx.watch().property_removed;
            async move { Ok(removed || camera.property_state(property).await? != PropertyState::Busy) }
        })
        .await?;
        if settled == WaitOutcome::Cancelled {
            return Err(ImagerError::Aborted);
        }
        if ctx.watch().property_removed {
            return Err(ImagerError::PeerLost {
                device: camera.name().to_string(),
            });
        }
        match camera.property_state(property).await? {
            PropertyState::Ok => Ok(()),
            _ => Err(self.failed_to_set(camera.name(), property)),
        }
    }

    async fn select_filter(&self, value: &str) -> ImagerResult<()> {
        let ctx = self.ctx;
        ctx.stats.set_phase(Phase::SettingFilter);
        let wheel = ctx.wheel()?;
        let slots = wheel.slots().await?;
        let Some(index) = slots.iter().position(|slot| slot.matches(value)) else {
            return Err(ImagerError::InvalidConfiguration(format!(
                "{} has no filter '{}'",
                wheel.name(),
                value
            )));
        };
        wheel.select_slot(index as u32 + 1).await?;

        let cancel = ctx.control.cancel_token();
        let settled = poll_until(&cancel, None, ctx.timeouts().poll_tick(), || {
            let wheel = wheel.clone();
            let removed = ctx.watch().property_removed;
            async move { Ok(removed || wheel.slot_state().await? != PropertyState::Busy) }
        })
        .await?;
        if settled == WaitOutcome::Cancelled {
            return Err(ImagerError::Aborted);
        }
        if ctx.watch().property_removed {
            return Err(ImagerError::PeerLost {
                device: wheel.name().to_string(),
            });
        }
        match wheel.slot_state().await? {
            PropertyState::Ok => Ok(()),
            _ => Err(self.failed_to_set(wheel.name(), WHEEL_SLOT)),
        }
    }

    /// Slew to the stored target through the solver and wait for it to settle
    async fn goto(&self, mode: &str) -> ImagerResult<()> {
        let ctx = self.ctx;
        if !matches!(mode, "precise" | "slew") {
            return Err(ImagerError::InvalidConfiguration(format!("Unknown goto mode '{}'", mode)));
        }
        ctx.stats.set_phase(Phase::Slewing);
        let solver = ctx.solver().ok_or(ImagerError::PeerMissing {
            role: PeerRole::Solver,
        })?;
        ctx.update_watch(|watch| watch.solver_state = PropertyState::Idle);
        solver.precise_goto(self.ra, self.dec).await?;

        let cancel = ctx.control.cancel_token();
        let tick = ctx.timeouts().poll_tick();
        let mut outcome = poll_until(&cancel, None, tick, || {
            let state = ctx.watch().solver_state;
            async move { Ok(state == PropertyState::Busy) }
        })
        .await?;
        if outcome == WaitOutcome::Ready {
            outcome = poll_until(&cancel, None, tick, || {
                let state = ctx.watch().solver_state;
                async move { Ok(state != PropertyState::Busy) }
            })
            .await?;
        }
        let state = ctx.watch().solver_state;
        if state == PropertyState::Busy {
            if let Err(err) = solver.abort().await {
                tracing::warn!("[{}] Failed to abort {}: {}", ctx.name(), solver.name(), err);
            }
        }
        ctx.disable_solver().await;
        if outcome == WaitOutcome::Cancelled {
            return Err(ImagerError::Aborted);
        }
        if state != PropertyState::Ok {
            return Err(IndiError::DeviceAlert(format!("{} failed to reach the target", solver.name())).into());
        }
        Ok(())
    }

    /// Wait until the guider is past its first guiding frames or fails
    async fn wait_for_guiding(&self, guider: &SharedGuider) -> ImagerResult<()> {
        let ctx = self.ctx;
        let cancel = ctx.control.cancel_token();
        let outcome = poll_until(&cancel, None, ctx.timeouts().poll_tick(), || {
            let watch = ctx.watch();
            async move { Ok(watch.guiding || watch.guider_state == PropertyState::Alert) }
        })
        .await?;
        if outcome == WaitOutcome::Cancelled {
            if let Err(err) = guider.stop().await {
                tracing::warn!("[{}] Failed to stop {}: {}", ctx.name(), guider.name(), err);
            }
            return Err(ImagerError::Aborted);
        }
        if ctx.watch().guiding {
            Ok(())
        } else {
            Err(IndiError::DeviceAlert(format!("{} failed to start guiding", guider.name())).into())
        }
    }
}

/// Sequence process body
pub async fn sequence_process(ctx: &ImagerContext) -> PropertyState {
    let sequence = ctx.config().sequence;
    ctx.stats.update(|stats| {
        stats.batch_index = 0;
        stats.batches = 0;
        stats.phase = Phase::Idle;
    });
    {
        let mut session = ctx.session();
        session.allow_subframing = false;
        session.find_stars = false;
    }

    let (needs, batches) = Prerequisites::for_sequence(&sequence);
    if let Err(err) = needs.check(&ctx.peers()) {
        ctx.send_alert(err.to_string());
        return PropertyState::Alert;
    }
    ctx.stats.update(|stats| stats.batches = batches as i32);
    ctx.send_message("Sequence started");

    let result = Sequencer::new(ctx).run(&sequence).await;
    ctx.allow_abort_by_mount(false).await;
    let state = match result {
        Ok(()) if !ctx.control.cancel_token().is_cancelled() => {
            ctx.send_message("Sequence finished");
            PropertyState::Ok
        }
        Ok(()) => {
            ctx.send_alert("Sequence failed");
            PropertyState::Alert
        }
        Err(err) => {
            tracing::warn!("[{}] Sequence failed: {}", ctx.name(), err);
            ctx.send_alert("Sequence failed");
            PropertyState::Alert
        }
    };
    ctx.stats.set_phase(Phase::Idle);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FocusEstimator, ImagerConfig};
    use crate::control::StartAction;
    use crate::testing::{rig_with, rig_with_curve, wait_for};
    use nightshade_indi::camera_properties;
    use std::time::Instant;

    fn sequence_config(top_level: &str, batches: &[&str]) -> ImagerConfig {
        let mut config = ImagerConfig::default();
        config.sequence = Sequence::new(top_level, batches);
        config.batch.frames_to_skip_before_dither = -1;
        config
    }

    #[test]
    fn test_prerequisite_scan() {
        let sequence = Sequence::new("park;1;3;20;unpark", &["filter=Red;count=2", "guide=2", "focus=3"]);
        let (needs, batches) = Prerequisites::for_sequence(&sequence);
        assert_eq!(batches, 2);
        assert!(needs.mount);
        assert!(needs.wheel);
        assert!(needs.focuser);
        // Batch 2 is never referenced
        assert!(!needs.guider);
        assert!(!needs.solver);

        let needs = Prerequisites::scan("calibrate=1;goto=precise");
        assert!(needs.guider && needs.solver);
        let err = needs.check(&PeerSet::default()).unwrap_err();
        assert_eq!(err.to_string(), "No guider agent is selected");
    }

    #[tokio::test]
    async fn test_batches_run_in_order() {
        let rig = rig_with(sequence_config("1;2", &["exposure=5;count=3", "count=0"])).await;
        rig.ctx.control.begin(StartAction::Sequence).unwrap();
        assert_eq!(sequence_process(&rig.ctx).await, PropertyState::Ok);

        assert_eq!(rig.camera.exposures(), vec![5.0, 5.0, 5.0]);
        let config = rig.ctx.config();
        assert_eq!(config.batch.count, 0);
        assert_eq!(config.batch.exposure, 5.0);
        for text in [
            "Sequence started",
            "Batch 1 started",
            "Batch 1 finished",
            "Batch 2 started",
            "Batch 2 finished",
            "Sequence finished",
        ] {
            assert!(rig.messages.contains(text), "missing '{}'", text);
        }
        let stats = rig.ctx.stats.snapshot();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.batch_index, 2);
        assert_eq!(stats.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_missing_peer_fails_up_front() {
        let rig = rig_with(sequence_config("1", &["filter=Red;count=1"])).await;
        rig.ctx.update_peers(|peers| peers.wheel = None);
        rig.ctx.control.begin(StartAction::Sequence).unwrap();
        assert_eq!(sequence_process(&rig.ctx).await, PropertyState::Alert);
        assert!(rig.messages.contains("No filter wheel is selected"));
        assert!(!rig.messages.contains("Sequence started"));
        assert!(rig.camera.exposures().is_empty());
    }

    #[tokio::test]
    async fn test_device_settings() {
        let rig = rig_with(sequence_config(
            "1",
            &["filter=red;gain=120;frame=Dark;cooler=on;name=M31_;count=1"],
        ))
        .await;
        rig.ctx.control.begin(StartAction::Sequence).unwrap();
        assert_eq!(sequence_process(&rig.ctx).await, PropertyState::Ok);
        assert_eq!(rig.wheel.active_slot(), 2);
        assert_eq!(rig.camera.number_value(camera_properties::CCD_GAIN), Some(120.0));
        assert_eq!(
            rig.camera.switch_value(camera_properties::CCD_FRAME_TYPE).as_deref(),
            Some("DARK")
        );
        assert_eq!(
            rig.camera.switch_value(camera_properties::CCD_COOLER).as_deref(),
            Some("ON")
        );
        assert_eq!(
            rig.camera.text_value(camera_properties::CCD_LOCAL_MODE).as_deref(),
            Some("M31_")
        );
        assert!(rig.messages.contains("Batch 1 finished"));
    }

    #[tokio::test]
    async fn test_bad_settings_fail_only_their_batch() {
        let rig = rig_with(sequence_config("1;2;3", &["bogus=1;count=1", "gain=5;count=1", "count=2"])).await;
        rig.camera.fail_property(camera_properties::CCD_GAIN);
        rig.ctx.control.begin(StartAction::Sequence).unwrap();
        assert_eq!(sequence_process(&rig.ctx).await, PropertyState::Ok);

        assert!(rig.messages.contains("Unknown sequencer command 'bogus'"));
        assert!(rig.messages.contains("Batch 1 failed"));
        assert!(rig.messages.contains("Failed to set 'CCD_GAIN'"));
        assert!(rig.messages.contains("Batch 2 failed"));
        assert!(rig.messages.contains("Batch 3 finished"));
        assert!(rig.messages.contains("Sequence finished"));
        assert_eq!(rig.camera.exposures().len(), 2);
    }

    #[tokio::test]
    async fn test_mount_guider_and_solver() {
        let rig = rig_with(sequence_config(
            "unpark;1;guide=off;park",
            &["ra=10.5;dec=45;goto=precise;calibrate=1;guide=2;count=1"],
        ))
        .await;
        rig.ctx.control.begin(StartAction::Sequence).unwrap();
        assert_eq!(sequence_process(&rig.ctx).await, PropertyState::Ok);
        assert_eq!(rig.solver.last_target(), Some((10.5, 45.0)));
        assert_eq!(rig.mount.commands(), vec!["unpark".to_string(), "park".to_string()]);
        assert!(rig.mount.is_parked());
        assert!(!rig.guider.is_guiding());
        assert!(rig.messages.contains("Batch 1 finished"));
    }

    #[tokio::test]
    async fn test_failed_goto_and_guiding_fail_batch() {
        let rig = rig_with(sequence_config("1;2", &["goto=precise;count=1", "guide=1;count=1"])).await;
        rig.solver.set_fail(true);
        rig.guider.set_fail_guiding(true);
        rig.ctx.control.begin(StartAction::Sequence).unwrap();
        assert_eq!(sequence_process(&rig.ctx).await, PropertyState::Ok);
        assert!(rig.messages.contains("Batch 1 failed"));
        assert!(rig.messages.contains("Batch 2 failed"));
        assert!(rig.camera.exposures().is_empty());
    }

    fn focus_config(top_level: &str, batches: &[&str]) -> ImagerConfig {
        let mut config = sequence_config(top_level, batches);
        config.focus.estimator = FocusEstimator::HfdPeak;
        config.focus.stack = 1;
        config
    }

    #[tokio::test]
    async fn test_autofocus_before_batch() {
        let rig = rig_with_curve(focus_config("1", &["focus=2;exposure=3;count=1"]), |position| {
            2.0 + (position - 10030.0).abs() / 200.0
        })
        .await;
        rig.ctx.control.begin(StartAction::Sequence).unwrap();
        assert_eq!(sequence_process(&rig.ctx).await, PropertyState::Ok);

        assert!(rig.messages.contains("Autofocus started"));
        assert!(rig.messages.contains("Autofocus finished"));
        assert!((rig.focuser.current_position() - 10030.0).abs() <= 5.0);
        let exposures = rig.camera.exposures();
        assert!(exposures.len() > 1);
        assert!(exposures[..exposures.len() - 1].iter().all(|e| *e == 2.0));
        assert_eq!(exposures.last(), Some(&3.0));
        assert_eq!(rig.ctx.config().batch.exposure, 3.0);
    }

    #[tokio::test]
    async fn test_failed_autofocus_ends_sequence() {
        let rig = rig_with_curve(focus_config("1;2", &["focus=2;count=1", "count=1"]), |_| 30.0).await;
        rig.ctx.control.begin(StartAction::Sequence).unwrap();
        assert_eq!(sequence_process(&rig.ctx).await, PropertyState::Alert);
        assert!(rig.messages.contains("Autofocus failed"));
        assert!(rig.messages.contains("Sequence failed"));
        assert!(!rig.messages.contains("Batch 1 finished"));
        assert!(!rig.messages.contains("Batch 2 started"));
        assert_eq!(rig.focuser.current_position(), 10000.0);
        assert_eq!(rig.ctx.config().batch.exposure, 1.0);
    }

    #[tokio::test]
    async fn test_abort_during_sleep() {
        let rig = rig_with(sequence_config("sleep=10;1", &["count=1"])).await;
        rig.ctx.control.begin(StartAction::Sequence).unwrap();
        let ctx = rig.ctx.clone();
        let task = tokio::spawn(async move { sequence_process(&ctx).await });
        assert!(wait_for(|| rig.messages.contains("Sequence started"), Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        rig.ctx.control.request_abort();
        assert_eq!(task.await.unwrap(), PropertyState::Alert);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(rig.messages.contains("Sequence failed"));
        assert!(rig.camera.exposures().is_empty());
    }
}
