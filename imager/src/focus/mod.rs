//! Autofocus engine
//!
//! Three interchangeable strategies share the same sampling, judging and
//! restore logic:
//!
//! - [`ucurve`]: samples HFD across a window centered on best focus and fits
//!   a polynomial through it
//! - [`hill_climb`]: walks toward better quality with shrinking steps, using
//!   either reversal backlash or overshoot compensation
//!
//! All focuser moves go through [`motion::FocusDrive`].

pub mod hill_climb;
pub mod motion;
pub mod polyfit;
pub mod ucurve;

use nightshade_indi::{sleep_or_cancel, PropertyState};

use crate::capture::{capture, restore_subframe, seconds, select_subframe, CaptureRequest};
use crate::config::{FocusConfig, FocusEstimator};
use crate::context::ImagerContext;
use crate::error::{ImagerError, ImagerResult};
use crate::stats::Phase;

pub use motion::{Compensation, FocusDrive};

/// Frames tried for one quality sample
const MAX_SAMPLE_ATTEMPTS: usize = 20;

/// HFD beyond this multiple of the selection radius means the star is lost
const DEGENERATE_HFD: f64 = 1.2;

/// Autofocus strategy, picked from the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    UCurve,
    Overshoot,
    Backlash,
}

impl Strategy {
    pub fn for_config(focus: &FocusConfig) -> Self {
        if focus.estimator == FocusEstimator::UCurve {
            Strategy::UCurve
        } else if focus.backlash_overshoot > 1.0 {
            Strategy::Overshoot
        } else {
            Strategy::Backlash
        }
    }
}

/// Quality at one focuser position
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Sample {
    /// Best quality over the stacked frames, larger is better
    pub quality: f64,
    /// HFD of the last frame
    pub hfd: f64,
    pub saturated: bool,
}

/// Statistics at the start of a focus run
pub(crate) fn reset_stats(ctx: &ImagerContext) {
    ctx.stats.update(|stats| {
        stats.exposure = 0.0;
        stats.delay = 0.0;
        stats.frames = 0;
        stats.frame = 0;
        stats.clear_measurements();
        stats.focus_deviation = 100.0;
        stats.focus_offset = 0.0;
        stats.phase = Phase::Focusing;
    });
}

pub(crate) fn publish_offset(ctx: &ImagerContext, offset: f64) {
    ctx.stats.update(|stats| stats.focus_offset = offset);
}

/// Whether the star is too defocused to measure
pub(crate) fn is_degenerate(ctx: &ImagerContext, hfd: f64) -> bool {
    hfd > DEGENERATE_HFD * ctx.selection().radius
}

/// Send `reason` to the operator and turn it into a convergence failure
pub(crate) fn convergence_failure(ctx: &ImagerContext, reason: &str) -> ImagerError {
    ctx.send_message(reason);
    ImagerError::ConvergenceFailure(reason.to_string())
}

/// HFD distance from the best observed, in percent
pub(crate) fn hfd_deviation(best: f64, hfd: f64) -> f64 {
    if best > 0.0 && best < f64::MAX {
        (100.0 * (hfd - best) / best).max(0.0)
    } else {
        100.0
    }
}

/// Contrast distance from the best observed, in percent of the observed range
pub(crate) fn rms_deviation(min: f64, max: f64, contrast: f64) -> f64 {
    if max > min {
        100.0 * (max - contrast) / (max - min)
    } else {
        100.0
    }
}

/// Take up to `stack` valid frames and keep the best quality.
///
/// Returns None when no frame could be evaluated. Capture failures end the
/// run for the HFD/peak estimator and are skipped by the others.
pub(crate) async fn sample_quality(
    ctx: &ImagerContext,
    estimator: FocusEstimator,
    stack: u32,
) -> ImagerResult<Option<Sample>> {
    let exposure = ctx.config().batch.exposure;
    let mut best: f64 = 0.0;
    let mut frames = 0;
    for _ in 0..MAX_SAMPLE_ATTEMPTS {
        if frames >= stack {
            break;
        }
        if let Err(err) = capture(ctx, CaptureRequest::analyzed(exposure)).await {
            let fatal = matches!(
                err,
                ImagerError::Aborted | ImagerError::PeerLost { .. } | ImagerError::PeerMissing { .. }
            );
            if fatal || estimator == FocusEstimator::HfdPeak {
                return Err(err);
            }
            tracing::debug!("[{}] Focus frame failed: {}", ctx.name(), err);
            continue;
        }
        let stats = ctx.stats.snapshot();
        let quality = match estimator {
            FocusEstimator::RmsContrast => stats.rms_contrast,
            _ if stats.hfd == 0.0 || stats.fwhm == 0.0 => 0.0,
            FocusEstimator::HfdPeak => stats.peak / stats.hfd,
            FocusEstimator::UCurve => 1.0 / stats.hfd,
        };
        tracing::debug!(
            "[{}] Peak = {}, HFD = {}, FWHM = {}, contrast = {}, quality = {}",
            ctx.name(),
            stats.peak,
            stats.hfd,
            stats.fwhm,
            stats.rms_contrast,
            quality
        );
        if quality <= 0.0 {
            continue;
        }
        best = best.max(quality);
        frames += 1;
    }
    if frames == 0 {
        ctx.send_message("Failed to evaluate quality");
        return Ok(None);
    }
    Ok(Some(Sample {
        quality: best,
        hfd: ctx.stats.snapshot().hfd,
        saturated: ctx.session().frame_saturated,
    }))
}

/// Run the configured strategy once.
///
/// With `restore_initial_position` a failed run moves the focuser back to
/// where it started. The driver's backlash is restored on every exit.
pub async fn autofocus(ctx: &ImagerContext, restore_initial_position: bool) -> ImagerResult<()> {
    let focus = ctx.config().focus;
    reset_stats(ctx);
    let mut drive = FocusDrive::engage(ctx, &focus).await?;
    let strategy = Strategy::for_config(&focus);
    tracing::debug!("[{}] Autofocus using {:?}", ctx.name(), strategy);

    let result = match strategy {
        Strategy::UCurve => ucurve::run(ctx, &mut drive, &focus).await,
        Strategy::Overshoot | Strategy::Backlash => hill_climb::run(ctx, &mut drive, &focus).await,
    };
    let result = match result {
        Err(err)
            if restore_initial_position
                && !err.is_aborted()
                && !matches!(err, ImagerError::PeerLost { .. }) =>
        {
            ctx.send_message("Focus failed, restoring initial position");
            tracing::debug!(
                "[{}] Moving {} steps back to the initial position",
                ctx.name(),
                -drive.offset()
            );
            if let Err(restore_err) = drive.return_to_start().await {
                tracing::warn!("[{}] Failed to restore focuser position: {}", ctx.name(), restore_err);
            }
            publish_offset(ctx, drive.offset());
            Err(err)
        }
        other => other,
    };
    drive.release().await;
    result
}

/// Autofocus with the configured number of retries, doubling the delay each time
pub async fn autofocus_repeat(ctx: &ImagerContext, restore_initial_position: bool) -> ImagerResult<()> {
    let focus = ctx.config().focus;
    let cancel = ctx.control.cancel_token();
    let mut delay = focus.repeat_delay;
    let mut remaining = focus.repeat;
    loop {
        match autofocus(ctx, restore_initial_position).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_aborted() || remaining == 0 => return Err(err),
            Err(err) => {
                tracing::debug!("[{}] Autofocus attempt failed: {}", ctx.name(), err);
                ctx.send_message(format!(
                    "Repeating in {} seconds, {} attempts left",
                    delay, remaining
                ));
                if !sleep_or_cancel(&cancel, seconds(delay)).await {
                    return Err(ImagerError::Aborted);
                }
                delay *= 2.0;
                remaining -= 1;
            }
        }
    }
}

/// Focus process body
pub async fn focus_process(ctx: &ImagerContext) -> PropertyState {
    let primary_unset = ctx.selection().primary().is_unset();
    {
        let mut session = ctx.session();
        session.allow_subframing = true;
        session.find_stars = primary_unset;
    }
    ctx.allow_abort_by_mount(true).await;
    ctx.disable_solver().await;
    ctx.send_message("Focusing started");
    if let Err(err) = select_subframe(ctx).await {
        tracing::warn!("[{}] Failed to select sub-frame: {}", ctx.name(), err);
    }

    let config = ctx.config();
    // Contrast has no absolute scale, so a failed run keeps the best position found
    let restore = !config.focus.estimator.uses_rms() && config.focus.restore_on_failure;
    let state = match autofocus_repeat(ctx, restore).await {
        Ok(()) => {
            ctx.send_message("Focusing finished");
            PropertyState::Ok
        }
        Err(err) if err.is_aborted() => {
            ctx.send_alert("Focusing aborted");
            PropertyState::Alert
        }
        Err(err) => {
            tracing::warn!("[{}] Focusing failed: {}", ctx.name(), err);
            ctx.send_alert("Focusing failed");
            PropertyState::Alert
        }
    };
    ctx.allow_abort_by_mount(false).await;
    restore_subframe(ctx, config.batch.exposure).await;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImagerConfig;
    use crate::control::StartAction;
    use crate::testing::rig_with_curve;
    use std::time::{Duration, Instant};

    #[test]
    fn test_strategy_selection() {
        let mut focus = FocusConfig::default();
        assert_eq!(Strategy::for_config(&focus), Strategy::UCurve);
        focus.estimator = FocusEstimator::HfdPeak;
        assert_eq!(Strategy::for_config(&focus), Strategy::Backlash);
        focus.backlash_overshoot = 2.0;
        assert_eq!(Strategy::for_config(&focus), Strategy::Overshoot);
        focus.estimator = FocusEstimator::UCurve;
        assert_eq!(Strategy::for_config(&focus), Strategy::UCurve);
    }

    #[test]
    fn test_deviation() {
        assert_eq!(hfd_deviation(2.0, 2.0), 0.0);
        assert_eq!(hfd_deviation(2.0, 2.5), 25.0);
        assert_eq!(hfd_deviation(2.0, 1.9), 0.0);
        assert_eq!(hfd_deviation(0.0, 2.0), 100.0);
        assert_eq!(rms_deviation(1.0, 3.0, 2.5), 25.0);
        assert_eq!(rms_deviation(2.0, 2.0, 2.0), 100.0);
    }

    fn hopeless_config(repeat: u32, delay: f64) -> ImagerConfig {
        let mut config = ImagerConfig::default();
        config.focus.estimator = FocusEstimator::HfdPeak;
        config.focus.stack = 1;
        config.focus.repeat = repeat;
        config.focus.repeat_delay = delay;
        config
    }

    #[tokio::test]
    async fn test_repeat_until_out_of_attempts() {
        // Flat and far too wide: the search never converges
        let rig = rig_with_curve(hopeless_config(2, 0.01), |_| 30.0).await;
        rig.ctx.control.begin(StartAction::Focus).unwrap();
        let result = autofocus_repeat(&rig.ctx, true).await;
        assert!(matches!(result, Err(ImagerError::ConvergenceFailure(_))));
        assert!(rig.messages.contains("Repeating in 0.01 seconds, 2 attempts left"));
        assert!(rig.messages.contains("Repeating in 0.02 seconds, 1 attempts left"));
        assert!(rig.messages.contains("Focus failed, restoring initial position"));
        assert_eq!(rig.focuser.current_position(), 10000.0);
    }

    #[tokio::test]
    async fn test_abort_between_attempts() {
        let rig = rig_with_curve(hopeless_config(3, 10.0), |_| 30.0).await;
        rig.ctx.control.begin(StartAction::Focus).unwrap();
        let ctx = rig.ctx.clone();
        let task = tokio::spawn(async move { autofocus_repeat(&ctx, false).await });
        assert!(
            crate::testing::wait_for(
                || rig.messages.contains("Repeating in 10 seconds, 3 attempts left"),
                Duration::from_secs(5)
            )
            .await
        );
        let started = Instant::now();
        rig.ctx.control.request_abort();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ImagerError::Aborted)));
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_focus_process_reports() {
        let mut config = ImagerConfig::default();
        config.focus.estimator = FocusEstimator::HfdPeak;
        config.focus.stack = 1;
        config.focus.initial_step = 20.0;
        config.focus.final_step = 5.0;
        let rig = rig_with_curve(config, |position| 2.0 + (position - 10030.0).abs() / 200.0).await;
        rig.ctx.control.begin(StartAction::Focus).unwrap();
        assert_eq!(focus_process(&rig.ctx).await, PropertyState::Ok);
        assert!(rig.messages.contains("Focusing started"));
        assert!(rig.messages.contains("Focusing finished"));
        assert!((rig.focuser.current_position() - 10030.0).abs() <= 5.0);
    }
}
