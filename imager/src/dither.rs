//! Dithering handshake with the guider agent

use nightshade_indi::{poll_until, WaitOutcome};

use crate::context::ImagerContext;
use crate::stats::Phase;

/// Request a dither and wait for it to settle.
///
/// Dithering is best effort: a missing guider, a dither that never starts or
/// never settles all continue the batch. Returns false only when aborted.
pub async fn dither(ctx: &ImagerContext) -> bool {
    let Some(guider) = ctx.guider() else {
        ctx.send_alert("Dithering failed, no guider agent selected");
        return true;
    };
    let cancel = ctx.control.cancel_token();
    let timeouts = ctx.timeouts();

    ctx.update_watch(|watch| {
        watch.dither_started = false;
        watch.dither_finished = false;
    });
    if let Err(err) = guider.trigger_dither().await {
        ctx.send_alert(format!("Dithering failed: {}", err));
        return true;
    }

    let started = poll_until(&cancel, Some(timeouts.dither_start_timeout()), timeouts.fine_tick(), || {
        let watch = ctx.watch();
        async move { Ok(watch.dither_started || watch.dither_finished) }
    })
    .await;
    match started {
        Ok(WaitOutcome::Cancelled) => return false,
        Ok(WaitOutcome::TimedOut) => {
            tracing::debug!("[{}] Dithering did not start", ctx.name());
            return true;
        }
        Ok(WaitOutcome::Ready) => {}
        Err(err) => {
            tracing::warn!("[{}] Dithering wait failed: {}", ctx.name(), err);
            return true;
        }
    }

    if !ctx.watch().dither_finished {
        ctx.stats.set_phase(Phase::Dithering);
        let finished = poll_until(&cancel, Some(timeouts.dither_settle_timeout()), timeouts.poll_tick(), || {
            let finished = ctx.watch().dither_finished;
            async move { Ok(finished) }
        })
        .await;
        match finished {
            Ok(WaitOutcome::Cancelled) => return false,
            Ok(WaitOutcome::TimedOut) => ctx.send_alert("Dithering failed to settle down"),
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::StartAction;
    use crate::testing::rig;
    use nightshade_indi::sim::DitherBehavior;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_no_guider_returns_immediately() {
        let rig = rig().await;
        rig.ctx.update_peers(|peers| peers.guider = None);
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        let started = Instant::now();
        assert!(dither(&rig.ctx).await);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_settled_dither() {
        let rig = rig().await;
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        assert!(dither(&rig.ctx).await);
        assert_eq!(rig.guider.dither_count(), 1);
        assert_eq!(rig.ctx.stats.snapshot().phase, Phase::Dithering);
    }

    #[tokio::test]
    async fn test_finish_without_start() {
        let rig = rig().await;
        rig.guider.set_dither_behavior(DitherBehavior::FinishOnly);
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        assert!(dither(&rig.ctx).await);
    }

    #[tokio::test]
    async fn test_failed_or_ignored_dither_continues() {
        let rig = rig().await;
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        rig.guider.set_dither_behavior(DitherBehavior::Fail);
        assert!(dither(&rig.ctx).await);
        rig.guider.set_dither_behavior(DitherBehavior::Ignore);
        assert!(dither(&rig.ctx).await);
    }

    #[tokio::test]
    async fn test_unsettled_dither_continues() {
        let rig = rig().await;
        rig.guider.set_dither_behavior(DitherBehavior::NeverSettle);
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        assert!(dither(&rig.ctx).await);
    }

    #[tokio::test]
    async fn test_abort_while_settling() {
        let rig = rig().await;
        rig.guider.set_dither_behavior(DitherBehavior::NeverSettle);
        rig.ctx.control.begin(StartAction::Exposure).unwrap();
        let ctx = rig.ctx.clone();
        let task = tokio::spawn(async move { dither(&ctx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        rig.ctx.control.request_abort();
        assert!(!task.await.unwrap());
    }
}
