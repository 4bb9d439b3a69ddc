//! Batch executor
//!
//! Runs a batch of exposures with inter-frame delay, dithering cadence,
//! transit pause and breakpoints, and the streaming variant that leaves frame
//! pacing to the camera.

use futures::future::join_all;

use nightshade_indi::{poll_until, sleep_or_cancel, IndiError, PropertyState, SharedCamera, WaitOutcome};

use crate::breakpoint::check;
use crate::capture::{capture, seconds, CaptureRequest};
use crate::config::{BatchConfig, Checkpoint, ImagerConfig, ResumeMode};
use crate::context::ImagerContext;
use crate::dither::dither;
use crate::error::{ImagerError, ImagerResult};
use crate::stats::Phase;

/// Hours as h:mm:ss
pub(crate) fn format_hours(hours: f64) -> String {
    let total = (hours.abs() * 3600.0).round() as i64;
    let sign = if hours < 0.0 { "-" } else { "" };
    format!("{}{}:{:02}:{:02}", sign, total / 3600, (total / 60) % 60, total % 60)
}

/// FOCUSPOS header value, an integer when the position is whole
pub(crate) fn format_focus_position(position: f64) -> String {
    if (position - position.round()).abs() < 0.00001 {
        format!("{}", position.round() as i64)
    } else {
        format!("{:.5}", position)
    }
}

/// Refresh the FILTER and FOCUSPOS headers, removing them without a peer
pub async fn set_headers(ctx: &ImagerContext, camera: &SharedCamera) {
    let peers = ctx.peers();
    let filter = match &peers.wheel {
        Some(wheel) => match (wheel.slots().await, wheel.current_slot().await) {
            (Ok(slots), Ok(Some(slot))) => slots
                .get(slot.saturating_sub(1) as usize)
                .map(|option| format!("'{}'", option.label)),
            _ => None,
        },
        None => None,
    };
    let focus = match &peers.focuser {
        Some(focuser) => focuser.position().await.ok().map(format_focus_position),
        None => None,
    };
    for (keyword, value) in [("FILTER", filter), ("FOCUSPOS", focus)] {
        if let Err(err) = camera.set_header(keyword, value).await {
            tracing::warn!("[{}] Failed to set {} header: {}", ctx.name(), keyword, err);
        }
    }
}

/// Whether the transit pause applies to this batch at all
fn transit_pause_armed(ctx: &ImagerContext, config: &ImagerConfig) -> bool {
    config.features.pause_after_transit
        && ctx.mount().is_some()
        && ctx.watch().time_to_transit.is_some_and(|ttt| ttt < 12.0)
}

/// Pause before exposing if the target is about to cross the window. Returns true if it paused.
async fn pause_for_transit(ctx: &ImagerContext, batch: &BatchConfig) -> ImagerResult<bool> {
    let Some(reported) = ctx.watch().time_to_transit else {
        return Ok(false);
    };
    let ttt = if reported > 12.0 { reported - 24.0 } else { reported };
    if ttt > batch.exposure / 3600.0 - batch.pause_after_transit {
        return Ok(false);
    }
    ctx.control.pause_for_transit();
    ctx.stats.set_phase(Phase::TransitPause);
    if reported >= 0.0 {
        ctx.send_message(format!("Batch paused, transit in {}", format_hours(ttt)));
    } else {
        ctx.send_message(format!("Batch paused, transit {} ago", format_hours(-ttt)));
    }
    ctx.allow_abort_by_mount(false).await;
    let resumed = ctx.control.wait_while_paused().await;
    ctx.allow_abort_by_mount(true).await;
    resumed?;
    Ok(true)
}

/// Count down the inter-frame delay, honouring pause and abort
async fn inter_frame_delay(ctx: &ImagerContext, delay: f64) -> ImagerResult<()> {
    let cancel = ctx.control.cancel_token();
    ctx.stats.update(|stats| {
        stats.delay = delay;
        stats.phase = Phase::Waiting;
    });
    let mut remaining = delay;
    while remaining > 0.0 {
        ctx.control.wait_while_paused().await?;
        if cancel.is_cancelled() {
            return Err(ImagerError::Aborted);
        }
        let shown = ctx.stats.snapshot().delay;
        if remaining < shown.floor() && shown > remaining.ceil() {
            ctx.stats.update(|stats| stats.delay = remaining.ceil());
        }
        let step = if remaining > 1.0 { 0.2 } else { 0.01 };
        remaining -= step;
        if !sleep_or_cancel(&cancel, seconds(step)).await {
            return Err(ImagerError::Aborted);
        }
    }
    ctx.stats.update(|stats| stats.delay = 0.0);
    Ok(())
}

/// Run one batch as configured
pub async fn run_batch(ctx: &ImagerContext) -> ImagerResult<()> {
    let config = ctx.config();
    let batch = config.batch.clone();
    let camera = ctx.camera()?;
    let cancel = ctx.control.cancel_token();

    ctx.stats.update(|stats| {
        stats.exposure = 0.0;
        stats.delay = 0.0;
        stats.frame = 0;
        stats.frames = batch.count;
        stats.frames_to_dithering = batch.frames_to_skip_before_dither;
    });
    let light_frame = camera.is_light_frame().await.unwrap_or(true);
    ctx.update_watch(|watch| watch.property_removed = false);
    check(ctx, Checkpoint::PreBatch).await?;
    set_headers(ctx, &camera).await;

    // Breakpoints without a barrier mean someone else paces this instance
    let controlled = config.resume_mode != ResumeMode::Barrier && config.breakpoints.any_armed();
    let mut transit_pending = transit_pause_armed(ctx, &config);
    let mut remaining = batch.count;
    while remaining != 0 {
        if cancel.is_cancelled() {
            return Err(ImagerError::Aborted);
        }
        ctx.stats.update(|stats| {
            stats.frame += 1;
            stats.phase = Phase::Capturing;
        });
        check(ctx, Checkpoint::PreCapture).await?;
        if transit_pending && pause_for_transit(ctx, &batch).await? {
            transit_pending = false;
        }
        capture(ctx, CaptureRequest::plain(batch.exposure)).await?;
        check(ctx, Checkpoint::PostCapture).await?;

        let more_frames = remaining > 1 || remaining < 0;
        if light_frame && !controlled {
            let dither_due = config.features.dithering
                && (more_frames || config.features.dither_after_batch);
            if ctx.stats.snapshot().frames_to_dithering >= 0 && dither_due {
                let dither_now = ctx.stats.update(|stats| {
                    if stats.frames_to_dithering > 0 {
                        stats.frames_to_dithering -= 1;
                        false
                    } else {
                        stats.frames_to_dithering = batch.frames_to_skip_before_dither;
                        true
                    }
                });
                if dither_now && !dither(ctx).await {
                    return Err(ImagerError::Aborted);
                }
            } else {
                ctx.stats
                    .update(|stats| stats.frames_to_dithering = batch.frames_to_skip_before_dither);
            }
            if more_frames {
                check(ctx, Checkpoint::PreDelay).await?;
                inter_frame_delay(ctx, batch.delay).await?;
                check(ctx, Checkpoint::PostDelay).await?;
            }
        }
        if remaining > 0 {
            remaining -= 1;
        }
    }
    check(ctx, Checkpoint::PostBatch).await?;
    Ok(())
}

/// Start a batch on every related imager when running in barrier mode
async fn start_related_batches(ctx: &ImagerContext) {
    if ctx.config().resume_mode != ResumeMode::Barrier {
        return;
    }
    let related = ctx.related_imagers();
    let results = join_all(related.iter().map(|imager| imager.start_batch())).await;
    for (imager, result) in related.iter().zip(results) {
        if let Err(err) = result {
            tracing::warn!("[{}] Failed to start batch on {}: {}", ctx.name(), imager.name(), err);
        }
    }
}

/// Terminal state and message for a finished batch or stream
fn conclude(ctx: &ImagerContext, what: &str, result: ImagerResult<()>) -> PropertyState {
    match result {
        Ok(()) => {
            ctx.send_message(format!("{} finished", what));
            PropertyState::Ok
        }
        // Stopping an endless batch is how it ends
        Err(ImagerError::Aborted) if ctx.config().batch.is_unbounded() => {
            ctx.send_message(format!("{} finished", what));
            PropertyState::Ok
        }
        Err(ImagerError::Aborted) => {
            ctx.send_alert(format!("{} aborted", what));
            PropertyState::Alert
        }
        Err(err) => {
            tracing::warn!("[{}] {} failed: {}", ctx.name(), what, err);
            ctx.send_alert(format!("{} failed", what));
            PropertyState::Alert
        }
    }
}

async fn begin_run(ctx: &ImagerContext) {
    {
        let mut session = ctx.session();
        session.allow_subframing = false;
        session.find_stars = false;
    }
    ctx.stats.update(|stats| {
        stats.batch_index = 1;
        stats.batches = 1;
    });
    ctx.allow_abort_by_mount(true).await;
    ctx.disable_solver().await;
}

/// Exposure batch process body
pub async fn exposure_process(ctx: &ImagerContext) -> PropertyState {
    begin_run(ctx).await;
    ctx.send_message("Batch started");
    start_related_batches(ctx).await;
    let result = run_batch(ctx).await;
    let state = conclude(ctx, "Batch", result);
    ctx.allow_abort_by_mount(false).await;
    state
}

// ============================================================================
// Streaming
// ============================================================================

/// Stream the configured batch through the camera
pub async fn run_streaming(ctx: &ImagerContext) -> ImagerResult<()> {
    let batch = ctx.config().batch;
    let camera = ctx.camera()?;
    let cancel = ctx.control.cancel_token();
    let timeouts = ctx.timeouts().clone();

    ctx.stats.update(|stats| {
        stats.exposure = 0.0;
        stats.delay = 0.0;
        stats.frame = 0;
        stats.frames = batch.count;
        stats.phase = Phase::Capturing;
    });
    set_headers(ctx, &camera).await;
    ctx.update_watch(|watch| watch.property_removed = false);
    camera.start_streaming(batch.count, batch.exposure).await?;

    let probe_camera = camera.clone();
    let started = poll_until(&cancel, Some(timeouts.busy_timeout()), timeouts.fine_tick(), || {
        let camera = probe_camera.clone();
        let paused = ctx.control.is_paused();
        async move { Ok(paused || camera.streaming_status().await?.state == PropertyState::Busy) }
    })
    .await?;
    match started {
        WaitOutcome::Cancelled => {
            let _ = camera.abort_streaming().await;
            return Err(ImagerError::Aborted);
        }
        WaitOutcome::TimedOut => {
            return Err(ImagerError::PeerTimeout {
                device: camera.name().to_string(),
                operation: "streaming".to_string(),
                duration: timeouts.busy_timeout(),
            })
        }
        WaitOutcome::Ready if ctx.control.is_paused() => {
            let _ = camera.abort_streaming().await;
            return Err(ImagerError::Peer(IndiError::DeviceAlert(format!(
                "{} streaming interrupted by pause",
                camera.name()
            ))));
        }
        WaitOutcome::Ready => {}
    }

    loop {
        let status = camera.streaming_status().await?;
        if status.state != PropertyState::Busy {
            if ctx.watch().property_removed {
                return Err(ImagerError::PeerLost {
                    device: camera.name().to_string(),
                });
            }
            return match status.state {
                PropertyState::Ok => Ok(()),
                _ => Err(ImagerError::Peer(IndiError::DeviceAlert(format!(
                    "{} streaming failed",
                    camera.name()
                )))),
            };
        }
        if ctx.stats.snapshot().frame != status.remaining_frames {
            ctx.stats.update(|stats| stats.frame = status.remaining_frames);
        }
        if !sleep_or_cancel(&cancel, timeouts.streaming_tick()).await {
            let _ = camera.abort_streaming().await;
            return Err(ImagerError::Aborted);
        }
    }
}

/// Streaming process body
pub async fn streaming_process(ctx: &ImagerContext) -> PropertyState {
    begin_run(ctx).await;
    ctx.send_message("Streaming started");
    let result = run_streaming(ctx).await;
    let state = conclude(ctx, "Streaming", result);
    ctx.allow_abort_by_mount(false).await;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{PauseMode, StartAction};
    use crate::event::ImagerEvent;
    use crate::testing::{rig, rig_with, wait_for};
    use nightshade_indi::PeerNotification;
    use std::time::Duration;

    fn batch_config(count: i32, skip: i32) -> ImagerConfig {
        let mut config = ImagerConfig::default();
        config.batch.count = count;
        config.batch.frames_to_skip_before_dither = skip;
        config
    }

    #[test]
    fn test_header_formats() {
        assert_eq!(format_focus_position(12500.0), "12500");
        assert_eq!(format_focus_position(12.25), "12.25000");
        assert_eq!(format_hours(0.5), "0:30:00");
        assert_eq!(format_hours(1.0 + 1.0 / 3600.0), "1:00:01");
    }

    #[tokio::test]
    async fn test_frame_counter_resets_per_batch() {
        let rig = rig_with(batch_config(3, -1)).await;
        let mut events = rig.ctx.subscribe();
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        run_batch(&rig.ctx).await.unwrap();
        run_batch(&rig.ctx).await.unwrap();

        let mut frames = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ImagerEvent::StatsUpdated(stats) = event {
                if frames.last() != Some(&stats.frame) {
                    frames.push(stats.frame);
                }
            }
        }
        assert_eq!(frames, vec![0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(rig.camera.exposures().len(), 6);
    }

    #[tokio::test]
    async fn test_batch_start_clears_stale_removal() {
        let rig = rig_with(batch_config(0, -1)).await;
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        rig.ctx.update_watch(|watch| watch.property_removed = true);
        run_batch(&rig.ctx).await.unwrap();
        assert!(!rig.ctx.watch().property_removed);
        assert!(rig.camera.exposures().is_empty());
    }

    #[tokio::test]
    async fn test_dither_cadence() {
        let rig = rig_with(batch_config(5, 1)).await;
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        run_batch(&rig.ctx).await.unwrap();
        assert_eq!(rig.guider.dither_count(), 2);
    }

    #[tokio::test]
    async fn test_dither_after_batch() {
        let rig = rig_with(batch_config(2, 0)).await;
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        run_batch(&rig.ctx).await.unwrap();
        assert_eq!(rig.guider.dither_count(), 1);

        rig.ctx.update_config(|c| c.features.dither_after_batch = true);
        run_batch(&rig.ctx).await.unwrap();
        assert_eq!(rig.guider.dither_count(), 3);
    }

    #[tokio::test]
    async fn test_controlled_instance_never_dithers() {
        let mut config = batch_config(3, 0);
        config.breakpoints.arm(Checkpoint::PostBatch, true);
        let rig = rig_with(config).await;
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        let ctx = rig.ctx.clone();
        let task = tokio::spawn(async move { run_batch(&ctx).await });
        assert!(wait_for(|| rig.ctx.control.is_paused(), Duration::from_secs(2)).await);
        rig.ctx.control.request_pause(PauseMode::WithWait);
        task.await.unwrap().unwrap();
        assert_eq!(rig.guider.dither_count(), 0);
    }

    #[tokio::test]
    async fn test_headers_follow_peers() {
        let rig = rig().await;
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        run_batch(&rig.ctx).await.unwrap();
        assert_eq!(rig.camera.header("FILTER").as_deref(), Some("'Luminance'"));
        assert_eq!(rig.camera.header("FOCUSPOS").as_deref(), Some("10000"));

        rig.ctx.update_peers(|peers| {
            peers.wheel = None;
            peers.focuser = None;
        });
        run_batch(&rig.ctx).await.unwrap();
        assert_eq!(rig.camera.header("FILTER"), None);
        assert_eq!(rig.camera.header("FOCUSPOS"), None);
    }

    #[tokio::test]
    async fn test_transit_pause() {
        let mut config = batch_config(2, -1);
        config.features.pause_after_transit = true;
        config.batch.pause_after_transit = -1.0;
        let rig = rig_with(config).await;
        rig.ctx.handle_notification(PeerNotification::TimeToTransit(0.5));
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        rig.ctx.allow_abort_by_mount(true).await;

        let ctx = rig.ctx.clone();
        let task = tokio::spawn(async move { run_batch(&ctx).await });
        assert!(wait_for(|| rig.ctx.control.is_paused(), Duration::from_secs(2)).await);
        assert_eq!(rig.ctx.control.pause_mode(), Some(PauseMode::AfterTransit));
        assert!(wait_for(|| !rig.mount.imager_abort_allowed(), Duration::from_secs(1)).await);
        assert!(rig.messages.contains("Batch paused, transit in 0:30:00"));

        rig.ctx.control.request_pause(PauseMode::WithWait);
        task.await.unwrap().unwrap();
        assert!(rig.mount.imager_abort_allowed());
        assert_eq!(rig.camera.exposures().len(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_batch_abort_finishes() {
        let rig = rig_with(batch_config(-1, -1)).await;
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        let ctx = rig.ctx.clone();
        let task = tokio::spawn(async move { exposure_process(&ctx).await });
        assert!(wait_for(|| rig.camera.exposures().len() >= 3, Duration::from_secs(2)).await);
        rig.ctx.control.request_abort();
        assert_eq!(task.await.unwrap(), PropertyState::Ok);
        assert!(rig.messages.contains("Batch finished"));
    }

    #[tokio::test]
    async fn test_bounded_batch_abort_and_failure() {
        let rig = rig_with(batch_config(1000, -1)).await;
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        let ctx = rig.ctx.clone();
        let task = tokio::spawn(async move { exposure_process(&ctx).await });
        assert!(wait_for(|| rig.camera.exposures().len() >= 2, Duration::from_secs(2)).await);
        rig.ctx.control.request_abort();
        assert_eq!(task.await.unwrap(), PropertyState::Alert);
        assert!(rig.messages.contains("Batch aborted"));
        rig.ctx.control.finish(PropertyState::Alert);

        rig.ctx.update_config(|c| c.batch.count = 1);
        rig.camera.fail_exposures(3);
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        assert_eq!(exposure_process(&rig.ctx).await, PropertyState::Alert);
        assert!(rig.messages.contains("Batch failed"));
    }

    #[tokio::test]
    async fn test_streaming() {
        let rig = rig_with(batch_config(3, -1)).await;
        rig.ctx.control.begin(StartAction::Streaming).unwrap();
        assert_eq!(streaming_process(&rig.ctx).await, PropertyState::Ok);
        assert!(rig.messages.contains("Streaming started"));
        assert!(rig.messages.contains("Streaming finished"));
    }
}
