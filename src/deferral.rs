//! # Deferral & Resumption
//!
//! A handler that cannot produce its result yet calls [`Step::defer`](crate::Step::defer)
//! and receives a [`Resumer`]. Once the step returns, the run is parked: the run value itself
//! (iterator position, scope, response, completion callback) is moved into a shared slot and
//! no executor thread is held. [`Resumer::resume`] takes the run back out of the slot, merges
//! the supplied contributions and submits the next step to the executor.
//!
//! The slot tolerates every ordering of the two sides:
//!
//! - resume after the run parked: the usual path;
//! - resume before the step even returned: the contributions wait in the slot and the run
//!   continues as soon as it parks;
//! - the `Resumer` is dropped without resuming: the run ends with
//!   [`ChainError::DeferralAbandoned`];
//! - the deferral timeout elapses first: the run ends with [`ChainError::DeferralTimedOut`]
//!   and a later resume is ignored.
//!
//! A `Resumer` is consumed by `resume`, so a run can be resumed at most once per deferral.
//! Holding on to a `Resumer` forever keeps the run parked forever unless a
//! `deferral_timeout` is configured.

use crate::error::{BoxError, ChainError};
use crate::response::Response;
use crate::scope::Contributions;
use crate::state::HandlerState;
use crate::step::Step;
use crate::treadmill::{Run, RunId};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub(crate) type Continuation<R> =
    Box<dyn FnOnce(&mut Step<'_, R>) -> Result<HandlerState, BoxError> + Send>;

pub(crate) enum Slot<R: Response> {
    /// `defer` was called, the step has not returned yet.
    Armed,
    /// Dropping the sender stops the expiry timer, if one runs.
    Parked(Run<R>, Option<oneshot::Sender<()>>),
    /// Resumed before the run parked.
    Resumed(Contributions),
    /// Resumer dropped before the run parked.
    Abandoned,
    Closed,
}

pub(crate) type SharedSlot<R> = Arc<Mutex<Slot<R>>>;

/// A deferral requested by the current step.
pub(crate) struct DeferRequest<R: Response> {
    pub(crate) slot: SharedSlot<R>,
    pub(crate) continuation: Option<Continuation<R>>,
}

impl<R: Response> DeferRequest<R> {
    pub(crate) fn arm(run_id: RunId, continuation: Option<Continuation<R>>) -> (Self, Resumer<R>) {
        let slot = Arc::new(Mutex::new(Slot::Armed));
        let resumer = Resumer {
            run_id,
            slot: slot.clone(),
            settled: false,
        };
        (Self { slot, continuation }, resumer)
    }

    /// The step ended the run anyway; later resumes become no-ops.
    pub(crate) fn close(self) {
        *self.slot.lock() = Slot::Closed;
    }
}

/// Token that continues a deferred run.
#[must_use = "dropping a Resumer abandons the deferred run"]
pub struct Resumer<R: Response> {
    run_id: RunId,
    slot: SharedSlot<R>,
    settled: bool,
}

impl<R: Response> Resumer<R> {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Continues the run as if the deferring step had returned
    /// `HandlerState::Continue(contributions)`.
    pub fn resume(mut self, contributions: Contributions) {
        self.settled = true;
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Parked(run, _timer) => {
                drop(slot);
                run.resume(contributions);
            }
            Slot::Armed => {
                debug!(run_id = %self.run_id, "Resumed before park");
                *slot = Slot::Resumed(contributions);
            }
            other => {
                *slot = other;
                warn!(run_id = %self.run_id, "Resume ignored, run is no longer deferred");
            }
        }
    }

    /// Resumes with a single contributed value.
    pub fn resume_with<T: Any + Send + Sync>(self, value: T) {
        self.resume(Contributions::new().with(value));
    }
}

impl<R: Response> Drop for Resumer<R> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Parked(run, _timer) => {
                drop(slot);
                warn!(run_id = %self.run_id, "Resumer dropped, abandoning run");
                // The dropping thread may be anyone's; completion belongs on the executor.
                let executor = run.executor();
                executor.submit(Box::pin(async move {
                    run.fail(ChainError::DeferralAbandoned);
                }));
            }
            Slot::Armed => *slot = Slot::Abandoned,
            other => *slot = other,
        }
    }
}

/// Parks `run` in `slot`, or continues it right away if the slot was already settled.
pub(crate) fn park<R: Response>(run: Run<R>, slot: SharedSlot<R>, timeout: Option<Duration>) {
    let mut guard = slot.lock();
    match std::mem::replace(&mut *guard, Slot::Closed) {
        Slot::Armed => {
            let run_id = run.id();
            let executor = run.executor();
            let (settled_tx, settled_rx) = match timeout {
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    (Some(tx), Some(rx))
                }
                None => (None, None),
            };
            *guard = Slot::Parked(run, settled_tx);
            drop(guard);
            debug!(%run_id, "Parked");
            if let (Some(timeout), Some(settled)) = (timeout, settled_rx) {
                executor.submit(Box::pin(expire(slot, run_id, timeout, settled)));
            }
        }
        Slot::Resumed(contributions) => {
            drop(guard);
            run.resume(contributions);
        }
        Slot::Abandoned => {
            drop(guard);
            warn!(run_id = %run.id(), "Resumer dropped before park, abandoning run");
            run.fail(ChainError::DeferralAbandoned);
        }
        stale => {
            *guard = stale;
            drop(guard);
            run.fail(ChainError::AlreadyDeferred);
        }
    }
}

/// Fails the parked run after `timeout`, unless the slot settles first.
async fn expire<R: Response>(
    slot: SharedSlot<R>,
    run_id: RunId,
    timeout: Duration,
    settled: oneshot::Receiver<()>,
) {
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {}
        _ = settled => return,
    }
    let expired = {
        let mut guard = slot.lock();
        match std::mem::replace(&mut *guard, Slot::Closed) {
            Slot::Parked(run, _timer) => Some(run),
            other => {
                *guard = other;
                None
            }
        }
    };
    if let Some(run) = expired {
        warn!(%run_id, ?timeout, "Deferral timed out");
        run.fail(ChainError::DeferralTimedOut(timeout));
    }
}
