//! Hill-climbing autofocus
//!
//! Moves outward while quality improves. Each time quality drops the search
//! reverses and, after the first reversal, halves its step. Once the search
//! has reversed and the step is down to the final step, a drop in quality
//! steps back one and stops.

use nightshade_indi::FocusDirection;

use crate::config::FocusConfig;
use crate::context::ImagerContext;
use crate::error::{ImagerError, ImagerResult};

use super::motion::FocusDrive;
use super::{
    convergence_failure, hfd_deviation, is_degenerate, publish_offset, rms_deviation,
    sample_quality,
};

/// Travel limit in initial steps for the HFD/peak estimator
const HFD_TRAVEL_LIMIT: f64 = 20.0;
/// Travel limit in initial steps for the contrast estimator
const RMS_TRAVEL_LIMIT: f64 = 40.0;

const HFD_ACCEPTED_DEVIATION: f64 = 15.0;
const RMS_ACCEPTED_DEVIATION: f64 = 25.0;

/// Best and worst estimator values seen during the search
#[derive(Debug, Clone, Copy)]
struct Extremes {
    min: f64,
    max: f64,
}

pub(crate) async fn run(ctx: &ImagerContext, drive: &mut FocusDrive<'_>, focus: &FocusConfig) -> ImagerResult<()> {
    let estimator = focus.estimator;
    let limit = if estimator.uses_rms() {
        RMS_TRAVEL_LIMIT
    } else {
        HFD_TRAVEL_LIMIT
    } * focus.initial_step;
    let cancel = ctx.control.cancel_token();

    let mut steps = focus.initial_step;
    let mut direction = FocusDirection::Outward;
    let mut reversals = 0;
    let mut last_quality = 0.0;
    let mut extremes = Extremes {
        min: f64::MAX,
        max: 0.0,
    };

    loop {
        ctx.control.wait_while_paused().await?;
        if cancel.is_cancelled() {
            return Err(ImagerError::Aborted);
        }
        let Some(sample) = sample_quality(ctx, estimator, focus.stack).await? else {
            continue;
        };
        let value = if estimator.uses_rms() {
            sample.quality
        } else {
            sample.hfd
        };
        extremes.min = extremes.min.min(value);
        // Masking saturated areas changes the contrast scale
        extremes.max = if estimator.uses_rms() && sample.saturated {
            value
        } else {
            extremes.max.max(value)
        };
        tracing::debug!(
            "[{}] Focus quality = {} (previous {}){}",
            ctx.name(),
            sample.quality,
            last_quality,
            if sample.saturated { " saturated" } else { "" }
        );

        let exhausted = drive.offset().abs() >= limit;
        if sample.quality >= last_quality && !exhausted {
            drive.step(direction, steps).await?;
        } else if (steps <= focus.final_step && reversals > 0) || exhausted {
            tracing::debug!("[{}] Search ended at offset {}", ctx.name(), drive.offset());
            let lost = (estimator.uses_hfd() && is_degenerate(ctx, sample.hfd))
                || (estimator.uses_rms() && exhausted);
            if !lost {
                direction = direction.opposite();
                tracing::debug!("[{}] Moving {:?} {} steps to final position", ctx.name(), direction, steps);
                drive.step(direction, steps).await?;
            }
            publish_offset(ctx, drive.offset());
            break;
        } else {
            direction = direction.opposite();
            if reversals > 0 {
                steps = (steps / 2.0).round().max(1.0);
            }
            reversals += 1;
            tracing::debug!("[{}] Switching {:?} {} steps", ctx.name(), direction, steps);
            drive.step(direction, steps).await?;
        }
        publish_offset(ctx, drive.offset());
        last_quality = sample.quality;
    }

    // Confirm at the final position
    let final_sample = sample_quality(ctx, estimator, 1).await?;
    let stats = ctx.stats.snapshot();
    let deviation = if estimator.uses_rms() {
        rms_deviation(extremes.min, extremes.max, stats.rms_contrast)
    } else {
        hfd_deviation(extremes.min, stats.hfd)
    };
    ctx.stats.update(|stats| stats.focus_deviation = deviation);
    tracing::debug!(
        "[{}] Final sample {:?}, deviation {:.1}%",
        ctx.name(),
        final_sample,
        deviation
    );

    if drive.offset().abs() >= limit {
        return Err(convergence_failure(
            ctx,
            "No focus reached within maximum travel limit per AF run",
        ));
    }
    if estimator.uses_hfd() && is_degenerate(ctx, stats.hfd) {
        return Err(convergence_failure(ctx, "No focus reached, did not converge"));
    }
    let accepted = if estimator.uses_rms() {
        RMS_ACCEPTED_DEVIATION
    } else {
        HFD_ACCEPTED_DEVIATION
    };
    if final_sample.is_none() || deviation > accepted {
        return Err(convergence_failure(ctx, "Focus does not meet the quality criteria"));
    }
    Ok(())
}
