//! Capture step
//!
//! One exposure on the camera (or its auxiliary shutter) with bounded retries,
//! followed by optional analysis of the raw frame for selection and focus
//! statistics.

use std::time::Duration;

use nightshade_indi::{
    poll_until, sleep_or_cancel, FrameRect, PropertyState, SharedCamera, WaitOutcome,
};

use crate::analysis::{RawFrame, MAX_DETECTED_STARS};
use crate::config::StarPosition;
use crate::context::{ImagerContext, SavedFrame};
use crate::control::PauseMode;
use crate::error::{ImagerError, ImagerResult};
use crate::event::ImagerEvent;
use crate::stats::Phase;

/// Attempts per capture before giving up
pub const MAX_ATTEMPTS: u32 = 3;

/// Sub-frame grid in binned pixels
const GRID: f64 = 32.0;

/// What a capture does with the delivered frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest {
    /// Exposure time in seconds
    pub exposure: f64,
    /// Parse the raw frame and update the statistics
    pub analyze: bool,
    /// No stars is not an error
    pub preview: bool,
    /// Full frame taken after a sub-frame, leaves contrast statistics alone
    pub restore_frame: bool,
}

impl CaptureRequest {
    /// Exposure only, the image is left to the camera's own storage
    pub fn plain(exposure: f64) -> Self {
        Self {
            exposure,
            analyze: false,
            preview: false,
            restore_frame: false,
        }
    }

    pub fn analyzed(exposure: f64) -> Self {
        Self {
            analyze: true,
            ..Self::plain(exposure)
        }
    }

    pub fn preview(exposure: f64) -> Self {
        Self {
            preview: true,
            ..Self::analyzed(exposure)
        }
    }

    fn restore(exposure: f64) -> Self {
        Self {
            restore_frame: true,
            preview: true,
            ..Self::analyzed(exposure)
        }
    }
}

/// Expose once and, if requested, analyze the frame
pub async fn capture(ctx: &ImagerContext, request: CaptureRequest) -> ImagerResult<()> {
    let camera = ctx.camera()?;
    if request.analyze {
        camera.select_raw_format().await?;
    }
    expose(ctx, &camera, request.exposure).await?;
    if request.analyze {
        analyze(ctx, &camera, &request).await?;
    }
    Ok(())
}

// ============================================================================
// Exposure
// ============================================================================

async fn expose(ctx: &ImagerContext, camera: &SharedCamera, exposure: f64) -> ImagerResult<()> {
    let cancel = ctx.control.cancel_token();
    let timeouts = ctx.timeouts().clone();
    let aux = ctx.peers().aux_shutter;
    ctx.update_watch(|watch| watch.property_removed = false);

    let mut attempt = 0;
    let mut went_busy = false;
    while attempt < MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(ImagerError::Aborted);
        }
        ctx.control.wait_while_paused().await?;

        // With an auxiliary shutter the camera only digitizes
        let shutter = match &aux {
            Some(aux) => {
                camera.start_exposure(0.0).await?;
                aux.clone()
            }
            None => camera.clone(),
        };
        shutter.start_exposure(exposure).await?;
        ctx.stats.update(|stats| {
            stats.exposure = exposure;
            stats.phase = Phase::Capturing;
        });

        let shutter_probe = shutter.clone();
        let busy = poll_until(&cancel, Some(timeouts.busy_timeout()), timeouts.fine_tick(), || {
            let shutter = shutter_probe.clone();
            let paused = ctx.control.is_paused();
            async move { Ok(paused || shutter.exposure_status().await?.state == PropertyState::Busy) }
        })
        .await?;

        let state = match busy {
            WaitOutcome::Cancelled => return Err(ImagerError::Aborted),
            // Paused before the exposure started, start it again after resume
            WaitOutcome::Ready
                if ctx.control.is_paused()
                    && shutter.exposure_status().await?.state != PropertyState::Busy =>
            {
                tracing::debug!("[{}] Paused before {} started exposing", ctx.name(), shutter.name());
                if let Err(err) = shutter.abort_exposure().await {
                    tracing::warn!("[{}] Failed to abort {}: {}", ctx.name(), shutter.name(), err);
                }
                ctx.control.wait_while_paused().await?;
                continue;
            }
            WaitOutcome::TimedOut => {
                tracing::warn!(
                    "[{}] {} did not start exposing within {:?}",
                    ctx.name(),
                    shutter.name(),
                    timeouts.busy_timeout()
                );
                went_busy = false;
                PropertyState::Alert
            }
            WaitOutcome::Ready => {
                went_busy = true;
                let state = wait_for_exposure(ctx, &shutter).await?;
                if state == PropertyState::Ok && aux.is_some() {
                    wait_for_exposure(ctx, camera).await?
                } else {
                    state
                }
            }
        };

        if ctx.watch().property_removed {
            return Err(ImagerError::PeerLost {
                device: camera.name().to_string(),
            });
        }
        if state == PropertyState::Ok {
            ctx.stats.update(|stats| stats.exposure = 0.0);
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(ImagerError::Aborted);
        }
        // An abort-coupled pause killed the exposure, redo it after resume
        if ctx.control.is_paused()
            && ctx.control.wait_while_paused().await? == Some(PauseMode::WithAbort)
        {
            continue;
        }
        attempt += 1;
        tracing::warn!(
            "[{}] Exposure attempt {}/{} failed",
            ctx.name(),
            attempt,
            MAX_ATTEMPTS
        );
        if attempt < MAX_ATTEMPTS && !sleep_or_cancel(&cancel, timeouts.retry_backoff()).await {
            return Err(ImagerError::Aborted);
        }
    }

    if went_busy {
        Err(ImagerError::ExposureFailed {
            attempts: MAX_ATTEMPTS,
        })
    } else {
        Err(ImagerError::PeerTimeout {
            device: camera.name().to_string(),
            operation: "exposure".to_string(),
            duration: timeouts.busy_timeout(),
        })
    }
}

/// Follow a busy exposure to its terminal state, publishing the remaining time
async fn wait_for_exposure(ctx: &ImagerContext, shutter: &SharedCamera) -> ImagerResult<PropertyState> {
    let cancel = ctx.control.cancel_token();
    let timeouts = ctx.timeouts();
    loop {
        let status = shutter.exposure_status().await?;
        if status.state != PropertyState::Busy {
            return Ok(status.state);
        }
        ctx.stats.update(|stats| stats.exposure = status.remaining);
        let tick = if status.remaining > 1.0 {
            timeouts.poll_tick()
        } else {
            timeouts.fine_tick()
        };
        if !sleep_or_cancel(&cancel, tick).await {
            let _ = shutter.abort_exposure().await;
            return Err(ImagerError::Aborted);
        }
        if ctx.watch().property_removed {
            return Ok(PropertyState::Alert);
        }
    }
}

// ============================================================================
// Analysis
// ============================================================================

async fn analyze(ctx: &ImagerContext, camera: &SharedCamera, request: &CaptureRequest) -> ImagerResult<()> {
    let bytes = camera.last_image().await?.unwrap_or_default();
    let mut frame = match RawFrame::parse(&bytes) {
        Ok(frame) => frame,
        Err(err) => {
            ctx.send_alert("No RAW image received");
            return Err(err);
        }
    };
    let analyzer = ctx.analyzer();
    if analyzer.is_bayered(&frame) {
        analyzer.equalize_bayer(&mut frame);
    }

    let config = ctx.config();
    let estimator = config.focus.estimator;
    let mut saturated = false;

    if estimator.uses_rms() && !request.restore_frame {
        let contrast = {
            let mut session = ctx.session();
            let first = analyzer.contrast(&frame, session.saturation_mask.as_ref());
            saturated = first.saturated;
            session.frame_saturated = first.saturated;
            if first.saturated {
                analyzer.update_saturation_mask(&frame, &mut session.saturation_mask);
                analyzer.contrast(&frame, session.saturation_mask.as_ref())
            } else {
                first
            }
        };
        if saturated {
            ctx.send_message(
                "Warning: Frame saturation detected, masking out saturated areas and resetting statistics",
            );
        }
        ctx.stats.update(|stats| {
            stats.rms_contrast = contrast.contrast;
            if saturated {
                stats.frame = 0;
            }
        });
    } else if estimator.uses_hfd() {
        let selection = ctx.selection();
        let (allow_subframing, find_stars, known_stars) = {
            let session = ctx.session();
            (session.allow_subframing, session.find_stars, session.stars.len())
        };
        let discovery = find_stars || (selection.primary().is_unset() && known_stars == 0);
        if selection.primary().is_pinned() || allow_subframing || discovery {
            if discovery {
                let stars = analyzer.find_stars(&frame, selection.radius, MAX_DETECTED_STARS);
                tracing::debug!("[{}] {} stars detected", ctx.name(), stars.len());
                {
                    let mut session = ctx.session();
                    session.stars = stars.clone();
                    session.find_stars = false;
                }
                ctx.emit(ImagerEvent::StarsDetected {
                    stars: stars.iter().map(|s| StarPosition::new(s.x, s.y)).collect(),
                    state: PropertyState::Ok,
                });
                if stars.is_empty() {
                    if request.preview {
                        return Ok(());
                    }
                    ctx.send_alert("No stars detected");
                    return Err(ImagerError::NoStarsDetected);
                }
            }
            if ctx.selection().primary().is_unset() {
                select_stars(ctx);
            }
            let selection = ctx.selection();
            if !selection.primary().is_pinned() {
                if request.preview {
                    return Ok(());
                }
                ctx.send_alert("No stars detected");
                return Err(ImagerError::NoStarsDetected);
            }

            if allow_subframing {
                ctx.session().allow_subframing = false;
                if selection.subframe > 0 {
                    // The current frame no longer matches the window, measure on the next one
                    select_subframe(ctx).await?;
                    return Ok(());
                }
            }

            measure_stars(ctx, &frame);
        }
    }

    if !saturated {
        ctx.stats.update(|stats| stats.frame += 1);
    }
    Ok(())
}

/// Pin the brightest suitable detected stars
fn select_stars(ctx: &ImagerContext) {
    let suitable: Vec<StarPosition> = ctx
        .session()
        .stars
        .iter()
        .filter(|star| star.is_suitable())
        .map(|star| StarPosition::new(star.x, star.y))
        .collect();
    let requested = ctx.selection().star_count;
    if suitable.len() < requested {
        ctx.send_message(format!(
            "Warning: Only {} suitable stars found ({} requested).",
            suitable.len(),
            requested
        ));
    }
    ctx.update_selection(|selection| {
        for (slot, star) in selection.stars.iter_mut().enumerate() {
            *star = suitable.get(slot).copied().unwrap_or_default();
        }
    });
}

/// Drift and point spread statistics at the pinned stars
fn measure_stars(ctx: &ImagerContext, frame: &RawFrame) {
    let analyzer = ctx.analyzer();
    let mut selection = ctx.selection();
    let radius = selection.radius;
    let pinned = selection
        .stars
        .iter()
        .take_while(|star| star.is_pinned())
        .count();

    let Some(digest) = analyzer.digest(frame, &mut selection.stars[..pinned], radius) else {
        ctx.stats.update(|stats| stats.clear_measurements());
        return;
    };
    let stars = selection.stars[..pinned].to_vec();
    ctx.update_selection(|current| {
        for (slot, star) in stars.iter().enumerate() {
            if let Some(target) = current.stars.get_mut(slot) {
                *target = *star;
            }
        }
    });

    let frame_index = ctx.stats.snapshot().frame;
    let drift = {
        let mut session = ctx.session();
        match session.reference {
            Some(reference) if frame_index > 0 => Some(analyzer.drift(&reference, &digest)),
            _ => {
                session.reference = Some(digest);
                None
            }
        }
    };
    let psf = analyzer.psf(frame, &stars, radius);
    ctx.stats.update(|stats| {
        let (dx, dy) = drift.unwrap_or((0.0, 0.0));
        stats.drift_x = (dx * 1000.0).round() / 1000.0;
        stats.drift_y = (dy * 1000.0).round() / 1000.0;
        match psf {
            Some(psf) => {
                stats.fwhm = psf.fwhm;
                stats.hfd = psf.hfd;
                stats.peak = psf.peak;
            }
            None => {
                stats.fwhm = 0.0;
                stats.hfd = 0.0;
                stats.peak = 0.0;
            }
        }
    });
}

// ============================================================================
// Sub-frame
// ============================================================================

/// Left (or top) edge of a grid-aligned window around `center`
fn grid_origin(center: f64, window: f64, radius: f64) -> f64 {
    let mut origin = ((center - window) / GRID).round() * GRID;
    if center - origin < radius {
        origin -= GRID;
    }
    origin.max(0.0)
}

/// Width (or height) of a grid-aligned window whose origin is `offset` before the center
fn grid_extent(window: f64, offset: f64, radius: f64) -> f64 {
    let mut extent = (((2.0 * window) as i64 / GRID as i64) + 1) as f64 * GRID;
    if extent - offset < radius {
        extent += GRID;
    }
    extent
}

/// Reduce the camera frame to a window around the primary star
pub async fn select_subframe(ctx: &ImagerContext) -> ImagerResult<()> {
    let selection = ctx.selection();
    let primary = selection.primary();
    if selection.subframe == 0 || !primary.is_pinned() || ctx.session().saved_frame.is_some() {
        return Ok(());
    }
    let camera = ctx.camera()?;
    let Some(frame) = camera.frame().await? else {
        return Ok(());
    };
    let (bin_x, bin_y) = camera.binning().await?;
    let bin_x = bin_x.max(1) as f64;
    let bin_y = bin_y.max(1) as f64;

    let x = primary.x + frame.left / bin_x;
    let y = primary.y + frame.top / bin_y;
    let window = (selection.subframe as f64 * selection.radius).max(GRID);
    let left = grid_origin(x, window, selection.radius);
    let top = grid_origin(y, window, selection.radius);
    let width = grid_extent(window, x - left, selection.radius);
    let height = grid_extent(window, y - top, selection.radius);

    let shift_x = frame.left / bin_x - left;
    let shift_y = frame.top / bin_y - top;
    tracing::debug!(
        "[{}] Sub-frame {}x{} at ({}, {}) binned",
        ctx.name(),
        width,
        height,
        left,
        top
    );
    camera
        .set_frame(FrameRect {
            left: left * bin_x,
            top: top * bin_y,
            width: width * bin_x,
            height: height * bin_y,
        })
        .await?;
    {
        let mut session = ctx.session();
        session.saved_frame = Some(SavedFrame {
            rect: frame,
            shift_x,
            shift_y,
        });
        session.reference = None;
    }
    ctx.update_selection(|selection| selection.shift(shift_x, shift_y));
    Ok(())
}

/// Put back the frame replaced by [`select_subframe`] and take one full frame
pub async fn restore_subframe(ctx: &ImagerContext, exposure: f64) {
    let saved = ctx.session().saved_frame.take();
    let Some(saved) = saved else {
        return;
    };
    let Ok(camera) = ctx.camera() else {
        return;
    };
    if let Err(err) = camera.set_frame(saved.rect).await {
        tracing::warn!("[{}] Failed to restore frame: {}", ctx.name(), err);
        return;
    }
    ctx.session().reference = None;
    ctx.update_selection(|selection| selection.shift(-saved.shift_x, -saved.shift_y));
    tokio::time::sleep(ctx.timeouts().subframe_settle()).await;
    if ctx.control.is_aborting() {
        return;
    }
    if let Err(err) = capture(ctx, CaptureRequest::restore(exposure)).await {
        tracing::debug!("[{}] Restore frame failed: {}", ctx.name(), err);
    }
}

/// Seconds as a Duration, negative values clamp to zero
pub(crate) fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}
