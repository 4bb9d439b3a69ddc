//! Start, pause and abort flags of an imager instance
//!
//! Only one top level action runs at a time. Abort cancels the action's
//! [`CancellationToken`]; pause is a flag the worker polls at every wait.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nightshade_indi::PropertyState;

use crate::error::{ImagerError, ImagerResult};
use crate::event::ImagerEvent;

/// Top level actions, mutually exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartAction {
    Preview,
    Exposure,
    Streaming,
    Focus,
    Sequence,
    FindStars,
}

impl fmt::Display for StartAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StartAction::Preview => "Preview",
            StartAction::Exposure => "Batch",
            StartAction::Streaming => "Streaming",
            StartAction::Focus => "Focusing",
            StartAction::Sequence => "Sequence",
            StartAction::FindStars => "Star detection",
        };
        f.write_str(s)
    }
}

/// Sub-mode of a pause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseMode {
    /// Abort the running exposure and redo it after resume
    WithAbort,
    /// Let the running exposure finish, then wait
    WithWait,
    /// Raised by the batch loop around transit
    AfterTransit,
    /// Raised by an armed breakpoint
    Breakpoint,
}

/// What a pause toggle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseToggle {
    Paused(PauseMode),
    Resumed,
    /// A transit pause request was dropped, only the batch loop raises it
    TransitCleared,
    /// Nothing is running
    Rejected,
}

#[derive(Debug)]
struct ControlState {
    action: Option<StartAction>,
    start_state: PropertyState,
    run_id: Uuid,
    pause_state: PropertyState,
    pause_mode: Option<PauseMode>,
    abort_state: PropertyState,
    cancel: CancellationToken,
}

/// Process flags shared by the worker and every request handler
pub struct ProcessControl {
    state: Mutex<ControlState>,
    resumed: Notify,
    events: broadcast::Sender<ImagerEvent>,
}

impl ProcessControl {
    pub fn new(events: broadcast::Sender<ImagerEvent>) -> Self {
        Self {
            state: Mutex::new(ControlState {
                action: None,
                start_state: PropertyState::Idle,
                run_id: Uuid::nil(),
                pause_state: PropertyState::Idle,
                pause_mode: None,
                abort_state: PropertyState::Idle,
                cancel: CancellationToken::new(),
            }),
            resumed: Notify::new(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ImagerEvent) {
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Claim the worker for `action`, rejecting it while another one runs
    pub fn begin(&self, action: StartAction) -> ImagerResult<(Uuid, CancellationToken)> {
        let (run_id, cancel) = {
            let mut state = self.lock();
            if let Some(running) = state.action {
                return Err(ImagerError::Busy(running.to_string()));
            }
            state.action = Some(action);
            state.start_state = PropertyState::Busy;
            state.run_id = Uuid::new_v4();
            state.pause_state = PropertyState::Ok;
            state.pause_mode = None;
            state.abort_state = PropertyState::Ok;
            state.cancel = CancellationToken::new();
            (state.run_id, state.cancel.clone())
        };
        tracing::debug!("{} started, run {}", action, run_id);
        self.emit(ImagerEvent::ProcessStateChanged {
            action,
            state: PropertyState::Busy,
            run_id,
        });
        self.emit(ImagerEvent::PauseChanged {
            state: PropertyState::Ok,
        });
        self.emit(ImagerEvent::AbortChanged {
            state: PropertyState::Ok,
        });
        Ok((run_id, cancel))
    }

    /// Release the worker, settling every busy flag
    pub fn finish(&self, outcome: PropertyState) {
        let (action, run_id, pause_settled, abort_settled) = {
            let mut state = self.lock();
            let action = state.action.take();
            state.start_state = outcome;
            let pause_settled = state.pause_state == PropertyState::Busy;
            if pause_settled {
                state.pause_state = PropertyState::Ok;
                state.pause_mode = None;
            }
            let abort_settled = state.abort_state == PropertyState::Busy;
            if abort_settled {
                state.abort_state = PropertyState::Ok;
            }
            (action, state.run_id, pause_settled, abort_settled)
        };
        self.resumed.notify_waiters();
        if pause_settled {
            self.emit(ImagerEvent::PauseChanged {
                state: PropertyState::Ok,
            });
        }
        if abort_settled {
            self.emit(ImagerEvent::AbortChanged {
                state: PropertyState::Ok,
            });
        }
        if let Some(action) = action {
            tracing::debug!("{} ended in {}", action, outcome);
            self.emit(ImagerEvent::ProcessStateChanged {
                action,
                state: outcome,
                run_id,
            });
        }
    }

    pub fn running(&self) -> Option<StartAction> {
        self.lock().action
    }

    pub fn start_state(&self) -> PropertyState {
        self.lock().start_state
    }

    pub fn run_id(&self) -> Uuid {
        self.lock().run_id
    }

    /// Token of the current (or last) run
    pub fn cancel_token(&self) -> CancellationToken {
        self.lock().cancel.clone()
    }

    /// Mark the running action failed without releasing the worker
    pub fn mark_failed(&self) {
        self.lock().start_state = PropertyState::Alert;
    }

    // ========================================================================
    // Pause
    // ========================================================================

    /// Operator pause toggle
    pub fn request_pause(&self, mode: PauseMode) -> PauseToggle {
        let (toggle, state) = {
            let mut state = self.lock();
            let toggle = if state.action.is_none() {
                state.pause_state = PropertyState::Alert;
                PauseToggle::Rejected
            } else if state.pause_state == PropertyState::Busy {
                state.pause_state = PropertyState::Ok;
                state.pause_mode = None;
                PauseToggle::Resumed
            } else if mode == PauseMode::AfterTransit {
                state.pause_mode = None;
                PauseToggle::TransitCleared
            } else {
                state.pause_state = PropertyState::Busy;
                state.pause_mode = Some(mode);
                PauseToggle::Paused(mode)
            };
            (toggle, state.pause_state)
        };
        if toggle == PauseToggle::Resumed {
            self.resumed.notify_waiters();
        }
        self.emit(ImagerEvent::PauseChanged { state });
        toggle
    }

    /// Pause raised by an armed breakpoint
    pub fn pause_at_breakpoint(&self) {
        self.raise_pause(PauseMode::Breakpoint);
    }

    /// Pause raised by the batch loop before transit
    pub fn pause_for_transit(&self) {
        self.raise_pause(PauseMode::AfterTransit);
    }

    fn raise_pause(&self, mode: PauseMode) {
        {
            let mut state = self.lock();
            state.pause_state = PropertyState::Busy;
            state.pause_mode = Some(mode);
        }
        self.emit(ImagerEvent::PauseChanged {
            state: PropertyState::Busy,
        });
    }

    /// Clear a pause, e.g. on a barrier release from another instance
    pub fn release_pause(&self) {
        let released = {
            let mut state = self.lock();
            let released = state.pause_state == PropertyState::Busy;
            if released {
                state.pause_state = PropertyState::Ok;
                state.pause_mode = None;
            }
            released
        };
        if released {
            self.resumed.notify_waiters();
            self.emit(ImagerEvent::PauseChanged {
                state: PropertyState::Ok,
            });
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().pause_state == PropertyState::Busy
    }

    pub fn pause_state(&self) -> PropertyState {
        self.lock().pause_state
    }

    pub fn pause_mode(&self) -> Option<PauseMode> {
        self.lock().pause_mode
    }

    /// Block while paused.
    ///
    /// Returns the mode that was active when the wait began, None when not
    /// paused at all.
    pub async fn wait_while_paused(&self) -> ImagerResult<Option<PauseMode>> {
        let (mode, cancel) = {
            let state = self.lock();
            if state.pause_state != PropertyState::Busy {
                return Ok(None);
            }
            (state.pause_mode, state.cancel.clone())
        };
        tracing::info!("Paused, waiting for resume...");
        loop {
            tokio::select! {
                _ = self.resumed.notified() => {}
                _ = cancel.cancelled() => return Err(ImagerError::Aborted),
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
            if cancel.is_cancelled() {
                return Err(ImagerError::Aborted);
            }
            if !self.is_paused() {
                tracing::info!("Resumed");
                return Ok(mode);
            }
        }
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// Cancel the running action. Returns false when nothing was running.
    pub fn request_abort(&self) -> bool {
        let (pause_alerted, cancel) = {
            let mut state = self.lock();
            if state.action.is_none() {
                return false;
            }
            let pause_alerted = state.pause_state == PropertyState::Busy;
            if pause_alerted {
                state.pause_state = PropertyState::Alert;
                state.pause_mode = None;
            }
            state.abort_state = PropertyState::Busy;
            (pause_alerted, state.cancel.clone())
        };
        cancel.cancel();
        self.resumed.notify_waiters();
        if pause_alerted {
            self.emit(ImagerEvent::PauseChanged {
                state: PropertyState::Alert,
            });
        }
        self.emit(ImagerEvent::AbortChanged {
            state: PropertyState::Busy,
        });
        true
    }

    pub fn is_aborting(&self) -> bool {
        let state = self.lock();
        state.abort_state == PropertyState::Busy || state.cancel.is_cancelled()
    }

    pub fn abort_state(&self) -> PropertyState {
        self.lock().abort_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> ProcessControl {
        let (tx, _) = broadcast::channel(64);
        ProcessControl::new(tx)
    }

    #[test]
    fn test_second_start_is_rejected() {
        let control = control();
        control.begin(StartAction::Exposure).unwrap();
        let err = control.begin(StartAction::Preview).unwrap_err();
        assert!(matches!(err, ImagerError::Busy(_)));
        control.finish(PropertyState::Ok);
        assert!(control.begin(StartAction::Preview).is_ok());
    }

    #[test]
    fn test_pause_toggles() {
        let control = control();
        assert_eq!(control.request_pause(PauseMode::WithWait), PauseToggle::Rejected);
        assert_eq!(control.pause_state(), PropertyState::Alert);

        control.begin(StartAction::Exposure).unwrap();
        assert_eq!(control.pause_state(), PropertyState::Ok);
        assert_eq!(
            control.request_pause(PauseMode::WithWait),
            PauseToggle::Paused(PauseMode::WithWait)
        );
        assert!(control.is_paused());
        assert_eq!(control.request_pause(PauseMode::WithWait), PauseToggle::Resumed);
        assert!(!control.is_paused());
        assert_eq!(
            control.request_pause(PauseMode::AfterTransit),
            PauseToggle::TransitCleared
        );
        assert!(!control.is_paused());
    }

    #[test]
    fn test_abort_settles_flags() {
        let control = control();
        let (_, cancel) = control.begin(StartAction::Sequence).unwrap();
        control.pause_at_breakpoint();
        assert!(control.request_abort());
        assert!(cancel.is_cancelled());
        assert_eq!(control.pause_state(), PropertyState::Alert);
        assert_eq!(control.abort_state(), PropertyState::Busy);

        control.finish(PropertyState::Alert);
        assert_eq!(control.abort_state(), PropertyState::Ok);
        assert_ne!(control.pause_state(), PropertyState::Busy);
        assert_eq!(control.running(), None);
        assert!(!control.request_abort());
    }

    #[tokio::test]
    async fn test_wait_while_paused_resumes() {
        let control = std::sync::Arc::new(control());
        control.begin(StartAction::Exposure).unwrap();
        assert_eq!(control.wait_while_paused().await.unwrap(), None);

        control.request_pause(PauseMode::WithAbort);
        let resumer = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resumer.request_pause(PauseMode::WithAbort);
        });
        let mode = control.wait_while_paused().await.unwrap();
        assert_eq!(mode, Some(PauseMode::WithAbort));
    }

    #[tokio::test]
    async fn test_abort_interrupts_pause() {
        let control = std::sync::Arc::new(control());
        control.begin(StartAction::Exposure).unwrap();
        control.pause_for_transit();
        let aborter = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            aborter.request_abort();
        });
        let started = std::time::Instant::now();
        let err = control.wait_while_paused().await.unwrap_err();
        assert!(err.is_aborted());
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
