//! Directional focuser moves with backlash compensation
//!
//! Every focus strategy moves the focuser through a [`FocusDrive`], which
//! tracks the nominal offset from the starting position and pads the physical
//! move according to the active [`Compensation`] policy.

use nightshade_indi::{
    poll_until, sleep_or_cancel, FocusDirection, IndiError, PropertyState, SharedFocuser,
    WaitOutcome,
};

use crate::config::FocusConfig;
use crate::context::ImagerContext;
use crate::error::{ImagerError, ImagerResult};

/// How mechanical play is taken up on a move
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compensation {
    /// The focuser driver compensates on its own
    Driver,
    /// Pad every direction change with the combined and directional backlash
    Reversal {
        backlash: f64,
        inward: f64,
        outward: f64,
    },
    /// Over-travel every outward move, then step back in by the same amount
    Overshoot { amount: f64 },
}

impl Compensation {
    pub fn for_config(focus: &FocusConfig, driver_backlash: bool) -> Self {
        if focus.backlash_overshoot > 1.0 {
            Compensation::Overshoot {
                amount: focus.backlash * focus.backlash_overshoot,
            }
        } else if driver_backlash {
            Compensation::Driver
        } else {
            Compensation::Reversal {
                backlash: focus.backlash,
                inward: focus.backlash_in,
                outward: focus.backlash_out,
            }
        }
    }

    /// Extra steps added to a move in `direction`
    pub fn padding(&self, direction: FocusDirection, reversing: bool) -> f64 {
        match *self {
            Compensation::Driver => 0.0,
            Compensation::Reversal {
                backlash,
                inward,
                outward,
            } => {
                if !reversing {
                    0.0
                } else if direction.is_outward() {
                    backlash + outward
                } else {
                    backlash + inward
                }
            }
            Compensation::Overshoot { amount } => {
                if direction.is_outward() {
                    amount
                } else {
                    0.0
                }
            }
        }
    }
}

/// The focuser as seen by one autofocus run
pub struct FocusDrive<'a> {
    ctx: &'a ImagerContext,
    focuser: SharedFocuser,
    compensation: Compensation,
    /// Driver backlash to put back on release
    saved_backlash: Option<f64>,
    direction: Option<FocusDirection>,
    offset: f64,
    travel: f64,
}

impl<'a> FocusDrive<'a> {
    /// Take over the focuser.
    ///
    /// With an overshoot policy the driver's own backlash compensation is
    /// switched off until [`FocusDrive::release`].
    pub async fn engage(ctx: &'a ImagerContext, focus: &FocusConfig) -> ImagerResult<FocusDrive<'a>> {
        let focuser = ctx.focuser()?;
        let driver_backlash = focuser.backlash().await?;
        let compensation = Compensation::for_config(focus, driver_backlash.is_some());
        tracing::debug!(
            "[{}] Focuser {} driver backlash {:?}, compensation {:?}",
            ctx.name(),
            focuser.name(),
            driver_backlash,
            compensation
        );

        let mut saved_backlash = None;
        if let (Compensation::Overshoot { .. }, Some(native)) = (compensation, driver_backlash) {
            focuser.set_backlash(0.0).await?;
            saved_backlash = Some(native);
        }
        Ok(FocusDrive {
            ctx,
            focuser,
            compensation,
            saved_backlash,
            direction: None,
            offset: 0.0,
            travel: 0.0,
        })
    }

    /// Nominal steps away from the starting position, positive outward
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Nominal steps moved in total
    pub fn travel(&self) -> f64 {
        self.travel
    }

    pub fn compensation(&self) -> Compensation {
        self.compensation
    }

    pub async fn position(&self) -> ImagerResult<f64> {
        Ok(self.focuser.position().await?)
    }

    /// Move `steps` in `direction`, compensating per policy
    pub async fn step(&mut self, direction: FocusDirection, steps: f64) -> ImagerResult<()> {
        if steps <= 0.0 {
            return Ok(());
        }
        let reversing = self.direction != Some(direction);
        let padding = self.compensation.padding(direction, reversing);
        self.direction = Some(direction);
        self.offset += direction.sign() * steps;
        self.travel += steps;
        if padding > 0.0 {
            tracing::debug!(
                "[{}] Moving {:?} {} + {} steps",
                self.ctx.name(),
                direction,
                steps,
                padding
            );
        }
        move_focuser(self.ctx, &self.focuser, direction, steps + padding).await?;

        if let Compensation::Overshoot { amount } = self.compensation {
            if direction.is_outward() && amount > 0.0 {
                tracing::debug!("[{}] Overshot by {} steps, compensating", self.ctx.name(), amount);
                move_focuser(self.ctx, &self.focuser, FocusDirection::Inward, amount).await?;
            }
        }
        Ok(())
    }

    /// Move back to where the run started
    pub async fn return_to_start(&mut self) -> ImagerResult<()> {
        let offset = self.offset;
        if offset > 0.0 {
            self.step(FocusDirection::Inward, offset).await
        } else if offset < 0.0 {
            self.step(FocusDirection::Outward, -offset).await
        } else {
            Ok(())
        }
    }

    /// Hand the focuser back, restoring the driver's backlash if it was disabled
    pub async fn release(self) {
        if let Some(native) = self.saved_backlash {
            if let Err(err) = self.focuser.set_backlash(native).await {
                tracing::warn!(
                    "[{}] Failed to restore {} backlash: {}",
                    self.ctx.name(),
                    self.focuser.name(),
                    err
                );
            }
        }
    }
}

/// Start a move and follow it to its terminal state
pub async fn move_focuser(
    ctx: &ImagerContext,
    focuser: &SharedFocuser,
    direction: FocusDirection,
    steps: f64,
) -> ImagerResult<()> {
    let cancel = ctx.control.cancel_token();
    if cancel.is_cancelled() {
        return Err(ImagerError::Aborted);
    }
    let timeouts = ctx.timeouts();
    tracing::debug!("[{}] Moving {:?} {} steps", ctx.name(), direction, steps);
    focuser.start_move(direction, steps).await?;

    let probe = focuser.clone();
    let busy = poll_until(&cancel, Some(timeouts.busy_timeout()), timeouts.fine_tick(), || {
        let focuser = probe.clone();
        async move { Ok(focuser.motion_state().await? == PropertyState::Busy) }
    })
    .await?;
    match busy {
        WaitOutcome::Cancelled => {
            let _ = focuser.abort_motion().await;
            return Err(ImagerError::Aborted);
        }
        WaitOutcome::TimedOut => {
            return Err(ImagerError::PeerTimeout {
                device: focuser.name().to_string(),
                operation: "focuser move".to_string(),
                duration: timeouts.busy_timeout(),
            })
        }
        WaitOutcome::Ready => {}
    }

    let state = loop {
        let state = focuser.motion_state().await?;
        if state != PropertyState::Busy {
            break state;
        }
        if ctx.watch().property_removed {
            return Err(ImagerError::PeerLost {
                device: focuser.name().to_string(),
            });
        }
        if !sleep_or_cancel(&cancel, timeouts.poll_tick()).await {
            let _ = focuser.abort_motion().await;
            return Err(ImagerError::Aborted);
        }
    };
    if cancel.is_cancelled() {
        return Err(ImagerError::Aborted);
    }
    if state != PropertyState::Ok {
        return Err(IndiError::DeviceAlert(format!("{} did not finish the move", focuser.name())).into());
    }
    Ok(())
}
