//! # Step Context
//!
//! The [`Step`] is what a handler sees while it runs: the run's current [`Scope`], the
//! response accumulator, and the ability to [`defer`](Step::defer) the run.

use crate::deferral::{Continuation, DeferRequest, Resumer};
use crate::error::{BoxError, ChainError, ResolveError};
use crate::response::Response;
use crate::scope::Scope;
use crate::state::HandlerState;
use crate::treadmill::RunId;
use std::any::Any;

/// Per-step view of a run, handed to [`Handler::handle`](crate::Handler::handle).
pub struct Step<'a, R: Response> {
    run_id: RunId,
    index: usize,
    scope: &'a Scope,
    response: &'a mut R,
    deferral: &'a mut Option<DeferRequest<R>>,
}

impl<'a, R: Response> Step<'a, R> {
    pub(crate) fn new(
        run_id: RunId,
        index: usize,
        scope: &'a Scope,
        response: &'a mut R,
        deferral: &'a mut Option<DeferRequest<R>>,
    ) -> Self {
        Self {
            run_id,
            index,
            scope,
            response,
            deferral,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Zero-based position of this step within the run.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn scope(&self) -> &Scope {
        self.scope
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.scope.get::<T>()
    }

    pub fn require<T: Any>(&self) -> Result<&T, ResolveError> {
        self.scope.require::<T>()
    }

    pub fn response(&self) -> &R {
        self.response
    }

    pub fn response_mut(&mut self) -> &mut R {
        self.response
    }

    /// Suspends the run once this step returns.
    ///
    /// The state the handler returns is still processed: its contributions are merged, and a
    /// `Reject`, a `Finish` or a finished response still end the run. Otherwise the run parks
    /// until the returned [`Resumer`] is resumed, which continues with the next step.
    pub fn defer(&mut self) -> Result<Resumer<R>, ChainError> {
        self.arm(None)
    }

    /// Like [`Step::defer`], but on resume `continuation` runs first, inside the resumed
    /// scope, and its state is processed as if it were this step's.
    pub fn defer_then<F>(&mut self, continuation: F) -> Result<Resumer<R>, ChainError>
    where
        F: FnOnce(&mut Step<'_, R>) -> Result<HandlerState, BoxError> + Send + 'static,
    {
        self.arm(Some(Box::new(continuation)))
    }

    pub fn is_deferred(&self) -> bool {
        self.deferral.is_some()
    }

    fn arm(&mut self, continuation: Option<Continuation<R>>) -> Result<Resumer<R>, ChainError> {
        if self.deferral.is_some() {
            return Err(ChainError::AlreadyDeferred);
        }
        let (request, resumer) = DeferRequest::arm(self.run_id, continuation);
        *self.deferral = Some(request);
        Ok(resumer)
    }
}
