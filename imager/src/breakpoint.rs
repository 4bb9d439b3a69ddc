//! Breakpoints and barrier synchronisation
//!
//! An armed checkpoint pauses the batch until an operator resumes it or, in
//! barrier mode, until every related imager is paused as well. The instance
//! that sees the barrier complete releases all of them at once.

use futures::future::join_all;

use nightshade_indi::sleep_or_cancel;

use crate::config::{Checkpoint, ResumeMode};
use crate::context::ImagerContext;
use crate::error::{ImagerError, ImagerResult};

/// Block at `checkpoint` if its breakpoint is armed
pub async fn check(ctx: &ImagerContext, checkpoint: Checkpoint) -> ImagerResult<()> {
    let config = ctx.config();
    if !config.breakpoints.is_armed(checkpoint) {
        return Ok(());
    }
    let cancel = ctx.control.cancel_token();
    if cancel.is_cancelled() {
        return Err(ImagerError::Aborted);
    }

    ctx.control.pause_at_breakpoint();
    ctx.send_message(format!("{} paused on {} breakpoint", ctx.name(), checkpoint));
    let tick = ctx.timeouts().breakpoint_tick();
    loop {
        if cancel.is_cancelled() {
            ctx.send_alert(format!("{} aborted on {} breakpoint", ctx.name(), checkpoint));
            return Err(ImagerError::Aborted);
        }
        if ctx.config().resume_mode == ResumeMode::Barrier && ctx.watch().barrier_resume {
            release_barrier(ctx).await;
            ctx.control.release_pause();
        }
        if !ctx.control.is_paused() {
            break;
        }
        if !sleep_or_cancel(&cancel, tick).await {
            ctx.send_alert(format!("{} aborted on {} breakpoint", ctx.name(), checkpoint));
            return Err(ImagerError::Aborted);
        }
    }
    ctx.send_message(format!("{} resumed on {} breakpoint", ctx.name(), checkpoint));
    Ok(())
}

/// Clear the pause of every related imager concurrently
async fn release_barrier(ctx: &ImagerContext) {
    let related = ctx.related_imagers();
    tracing::debug!("[{}] Barrier complete, releasing {} imagers", ctx.name(), related.len());
    let results = join_all(related.iter().map(|imager| imager.release_pause())).await;
    for (imager, result) in related.iter().zip(results) {
        if let Err(err) = result {
            tracing::warn!("[{}] Failed to release {}: {}", ctx.name(), imager.name(), err);
        }
    }
}
