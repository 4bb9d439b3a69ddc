//! U-curve autofocus
//!
//! Collects (position, HFD) samples at fixed steps until the window is
//! centered on the smallest HFD, then fits a polynomial through the window
//! and moves to its minimum.

use nightshade_indi::FocusDirection;

use crate::config::{FocusConfig, FocusEstimator};
use crate::context::ImagerContext;
use crate::error::{ImagerError, ImagerResult};
use crate::event::ImagerEvent;

use super::motion::FocusDrive;
use super::polyfit::{polynomial_fit, polynomial_min_x};
use super::{convergence_failure, hfd_deviation, is_degenerate, publish_offset, sample_quality};

pub const UCURVE_ORDER: usize = 4;

/// Travel budget in initial steps per sample
const TRAVEL_LIMIT: f64 = 40.0;

const ACCEPTED_DEVIATION: f64 = 15.0;

/// Focuser position and the HFD measured there
pub type FocusPoint = (f64, f64);

/// Index of the first smallest HFD
fn index_of_min(points: &[FocusPoint]) -> usize {
    points
        .iter()
        .enumerate()
        .fold((0, f64::MAX), |(best, value), (index, point)| {
            if point.1 < value {
                (index, point.1)
            } else {
                (best, value)
            }
        })
        .0
}

/// Fit the sampled window and locate best focus.
///
/// The minimum must fall between the second and the second to last sample,
/// otherwise the window did not bracket it.
pub fn fit_best_focus(points: &[FocusPoint]) -> ImagerResult<f64> {
    let n = points.len();
    if n < UCURVE_ORDER + 1 {
        return Err(ImagerError::ConvergenceFailure(
            "U-Curve failed to fit data points with polynomial".to_string(),
        ));
    }
    let xs: Vec<f64> = points.iter().map(|p| p.0).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.1).collect();
    let Some(polynomial) = polynomial_fit(&xs, &ys, UCURVE_ORDER) else {
        return Err(ImagerError::ConvergenceFailure(
            "U-Curve failed to fit data points with polynomial".to_string(),
        ));
    };
    tracing::debug!("U-Curve polynomial fit: {}", polynomial);

    let best = polynomial_min_x(&polynomial, xs[0], xs[n - 1], 0.00001);
    let (low, high) = if xs[1] <= xs[n - 2] {
        (xs[1], xs[n - 2])
    } else {
        (xs[n - 2], xs[1])
    };
    if best < low || best > high {
        return Err(ImagerError::ConvergenceFailure(
            "U-Curve failed to find best focus position in the acceptable range".to_string(),
        ));
    }
    Ok(best)
}

/// Past the middle of the window and not getting worse, so best focus is further on
fn slides_window(sample: usize, midpoint: usize, last_quality: f64, quality: f64) -> bool {
    sample > midpoint && last_quality <= quality
}

pub(crate) async fn run(ctx: &ImagerContext, drive: &mut FocusDrive<'_>, focus: &FocusConfig) -> ImagerResult<()> {
    let samples = focus.ucurve_samples;
    let midpoint = (samples as f64 / 2.0).round() as usize;
    let limit = TRAVEL_LIMIT * focus.initial_step * samples as f64;
    let steps = focus.initial_step;
    let cancel = ctx.control.cancel_token();

    let mut points: Vec<FocusPoint> = vec![(0.0, 0.0); samples];
    let mut sample = 0;
    let mut direction = FocusDirection::Outward;
    let mut last_quality = 0.0;
    let mut best_hfd = f64::MAX;
    let mut far_enough = false;

    loop {
        ctx.control.wait_while_paused().await?;
        if cancel.is_cancelled() {
            return Err(ImagerError::Aborted);
        }
        if drive.travel() >= limit {
            return Err(convergence_failure(
                ctx,
                "No focus reached within maximum travel limit per AF run",
            ));
        }
        let Some(measured) = sample_quality(ctx, FocusEstimator::UCurve, focus.stack).await? else {
            continue;
        };
        best_hfd = best_hfd.min(measured.hfd);
        tracing::debug!(
            "[{}] UC: quality = {} (previous {})",
            ctx.name(),
            measured.quality,
            last_quality
        );

        let mut complete = false;
        if sample == 0 {
            drive.step(direction, steps).await?;
        } else if sample == 1 {
            points[0] = (drive.position().await?, measured.hfd);
            direction = if last_quality >= measured.quality {
                FocusDirection::Inward
            } else {
                FocusDirection::Outward
            };
            drive.step(direction, steps).await?;
        } else {
            if slides_window(sample, midpoint, last_quality, measured.quality) {
                points.copy_within(1..sample, 0);
                sample = midpoint;
                tracing::debug!("[{}] UC: did not reach best focus, shifting samples", ctx.name());
            }
            points[sample - 1] = (drive.position().await?, measured.hfd);
            ctx.emit(ImagerEvent::FocusSample {
                position: points[sample - 1].0,
                hfd: measured.hfd,
            });
            tracing::debug!(
                "[{}] UC: point[{}] = ({}, {})",
                ctx.name(),
                sample - 1,
                points[sample - 1].0,
                points[sample - 1].1
            );

            if sample > midpoint + 2 && !far_enough {
                let window = &points[sample - midpoint - 2..sample];
                if index_of_min(window) == 0 {
                    tracing::debug!(
                        "[{}] UC: best focus is behind the window, starting approach",
                        ctx.name()
                    );
                    sample = 0;
                    direction = FocusDirection::Outward;
                    far_enough = true;
                    publish_offset(ctx, drive.offset());
                    continue;
                }
            }

            if sample == samples {
                let best = index_of_min(&points);
                if best.abs_diff(midpoint) > 1 {
                    tracing::debug!(
                        "[{}] UC: best index {} is far from the midpoint {}, rerunning",
                        ctx.name(),
                        best,
                        midpoint
                    );
                    sample = 0;
                    direction = FocusDirection::Outward;
                    publish_offset(ctx, drive.offset());
                    continue;
                }
                complete = true;
            } else {
                drive.step(direction, steps).await?;
            }
        }
        sample += 1;
        publish_offset(ctx, drive.offset());
        last_quality = measured.quality;
        if complete {
            break;
        }
    }

    if cancel.is_cancelled() {
        return Err(ImagerError::Aborted);
    }
    let best = match fit_best_focus(&points) {
        Ok(best) => best,
        Err(err) => {
            ctx.send_message(err.to_string());
            return Err(err);
        }
    };
    ctx.send_message(format!("U-Curve found best focus at position {:.3}", best));

    let position = drive.position().await?;
    let distance = (best - position).round();
    let direction = if distance > 0.0 {
        FocusDirection::Outward
    } else {
        FocusDirection::Inward
    };
    tracing::debug!("[{}] UC: {} steps to focus", ctx.name(), distance);
    drive.step(direction, distance.abs()).await?;
    publish_offset(ctx, drive.offset());

    let confirmed = sample_quality(ctx, FocusEstimator::UCurve, 1).await?;
    let hfd = ctx.stats.snapshot().hfd;
    let deviation = hfd_deviation(best_hfd, hfd);
    ctx.stats.update(|stats| stats.focus_deviation = deviation);

    if is_degenerate(ctx, hfd) {
        return Err(convergence_failure(ctx, "No focus reached, did not converge"));
    }
    if confirmed.is_none() || deviation > ACCEPTED_DEVIATION {
        return Err(convergence_failure(ctx, "Focus does not meet the quality criteria"));
    }
    Ok(())
}
