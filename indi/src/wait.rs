//! Cancellable deadline polling
//!
//! Every wait on a peer is a bounded poll: check a condition, sleep one tick,
//! repeat until the condition holds, the deadline passes or the run is cancelled.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::IndiResult;

/// How a poll ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

impl WaitOutcome {
    pub fn is_ready(&self) -> bool {
        *self == WaitOutcome::Ready
    }
}

/// Poll `probe` every `tick` until it returns true.
///
/// `timeout` of None waits until cancelled. Cancellation is checked before
/// each probe and interrupts the sleep between probes.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    tick: Duration,
    mut probe: F,
) -> IndiResult<WaitOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IndiResult<bool>>,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if cancel.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }
        if probe().await? {
            return Ok(WaitOutcome::Ready);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
            _ = tokio::time::sleep(tick) => {}
        }
    }
}

/// Sleep unless cancelled first. Returns false when cancelled.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ready_after_some_ticks() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = poll_until(&cancel, Some(Duration::from_secs(1)), Duration::from_millis(1), || {
            let calls = calls.clone();
            async move { Ok(calls.fetch_add(1, Ordering::SeqCst) >= 3) }
        })
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_times_out() {
        let cancel = CancellationToken::new();
        let outcome = poll_until(&cancel, Some(Duration::from_millis(20)), Duration::from_millis(5), || async {
            Ok(false)
        })
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_tick() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let outcome = poll_until(&cancel, None, Duration::from_secs(10), || async { Ok(false) })
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(&cancel, Duration::from_millis(1)).await);
        cancel.cancel();
        assert!(!sleep_or_cancel(&cancel, Duration::from_secs(10)).await);
    }
}
