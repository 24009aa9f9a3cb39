//! # Mock Handlers & Testing Guide
//!
//! [`MockHandler<R>`] is a scripted chain step. Each call pops the next expectation and acts
//! on it: continue, finish, reject, fail, panic, or defer with some resumption strategy. The
//! mock records how often it was called and which scope types it saw on each call, so tests
//! can assert on ordering and context visibility without writing a handler per case.
//!
//! [`RecordingUncaught`] collects everything a treadmill reports to its uncaught handler.
//!
//! ## When to use Mocks vs Real Handlers
//!
//! | Feature | MockHandler | Real handler |
//! |---------|-------------|--------------|
//! | **Setup** | One line per call | A type + `Handler` impl |
//! | **Determinism** | Scripted | Depends on handler logic |
//! | **Deferral** | Built-in strategies | Hand-written |
//! | **Use Case** | Testing the runner or chain wiring | Testing the handler itself |
//!
//! ## Example
//!
//! ```rust
//! use treadmill::mock::MockHandler;
//! use treadmill::{Chain, Contributions, Reply, Treadmill};
//!
//! #[tokio::main]
//! async fn main() {
//!     let auth = MockHandler::<Reply>::new("auth");
//!     let render = MockHandler::<Reply>::new("render");
//!     auth.expect_call().return_continue(Contributions::new().with(7u32));
//!     render.expect_call().return_reject();
//!
//!     let mut chain = Chain::<Reply>::new();
//!     chain.add(auth.handler()).add(render.handler());
//!
//!     let treadmill = Treadmill::new(Reply::default).unwrap();
//!     let outcome = treadmill.run_async(&chain, Contributions::new()).await;
//!
//!     assert!(outcome.is_rejected());
//!     assert!(render.saw_type_in_call(0, "u32"));
//!     auth.verify();
//!     render.verify();
//! }
//! ```

use crate::deferral::Resumer;
use crate::error::{BoxError, ChainError};
use crate::executor::UncaughtHandler;
use crate::handler::Handler;
use crate::response::Response;
use crate::scope::Contributions;
use crate::state::HandlerState;
use crate::step::Step;
use crate::treadmill::RunId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

// =============================================================================
// EXPECTATION BUILDER API
// =============================================================================

/// What the mock does on one call.
enum Expectation<R: Response> {
    Return(HandlerState),
    Fail(String),
    Panic(String),
    Defer {
        resume: ResumeStrategy<R>,
        then: Option<HandlerState>,
    },
}

enum ResumeStrategy<R: Response> {
    /// Resume before the step returns.
    Immediately(Contributions),
    After(Duration, Contributions),
    /// Send the resumer to the test.
    HandOver(oneshot::Sender<Resumer<R>>),
    /// Drop the resumer without resuming.
    Abandon,
    /// Keep the resumer alive forever.
    Hold,
}

struct MockState<R: Response> {
    name: &'static str,
    expectations: Mutex<VecDeque<Expectation<R>>>,
    calls: AtomicUsize,
    scopes: Mutex<Vec<Vec<&'static str>>>,
    held: Mutex<Vec<Resumer<R>>>,
}

/// A scripted handler with expectation tracking.
pub struct MockHandler<R: Response> {
    state: Arc<MockState<R>>,
}

impl<R: Response> MockHandler<R> {
    pub fn new(name: &'static str) -> Self {
        Self {
            state: Arc::new(MockState {
                name,
                expectations: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                scopes: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The handler to place in a chain. All copies share this mock's script and records.
    pub fn handler(&self) -> MockStep<R> {
        MockStep {
            state: self.state.clone(),
        }
    }

    /// Scripts the next call.
    pub fn expect_call(&self) -> CallExpectationBuilder<R> {
        CallExpectationBuilder {
            state: self.state.clone(),
        }
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Scope type names seen by each call, in call order.
    pub fn scopes(&self) -> Vec<Vec<&'static str>> {
        self.state.scopes.lock().clone()
    }

    /// Whether call `call` saw a scope value whose type name ends with `type_suffix`.
    pub fn saw_type_in_call(&self, call: usize, type_suffix: &str) -> bool {
        self.state
            .scopes
            .lock()
            .get(call)
            .is_some_and(|names| names.iter().any(|name| name.ends_with(type_suffix)))
    }

    /// Panics if scripted calls are left over.
    pub fn verify(&self) {
        let remaining = self.state.expectations.lock().len();
        if remaining != 0 {
            panic!(
                "Not all expectations of {} were met. {} remaining",
                self.state.name, remaining
            );
        }
    }
}

/// Builder for one scripted call.
pub struct CallExpectationBuilder<R: Response> {
    state: Arc<MockState<R>>,
}

impl<R: Response> CallExpectationBuilder<R> {
    pub fn return_continue(self, contributions: Contributions) {
        self.push(Expectation::Return(HandlerState::Continue(contributions)));
    }

    pub fn return_finish(self, contributions: Contributions) {
        self.push(Expectation::Return(HandlerState::Finish(contributions)));
    }

    pub fn return_reject(self) {
        self.push(Expectation::Return(HandlerState::Reject));
    }

    pub fn return_err(self, message: impl Into<String>) {
        self.push(Expectation::Fail(message.into()));
    }

    pub fn panic(self, message: impl Into<String>) {
        self.push(Expectation::Panic(message.into()));
    }

    /// Defers and resumes from a spawned task after `delay`.
    pub fn defer_and_resume_after(self, delay: Duration, contributions: Contributions) {
        self.defer(ResumeStrategy::After(delay, contributions), None);
    }

    /// Defers and resumes before the step returns.
    pub fn defer_and_resume_immediately(self, contributions: Contributions) {
        self.defer(ResumeStrategy::Immediately(contributions), None);
    }

    /// Defers and hands the resumer to the caller.
    pub fn defer_and_hand_over(self) -> oneshot::Receiver<Resumer<R>> {
        let (tx, rx) = oneshot::channel();
        self.defer(ResumeStrategy::HandOver(tx), None);
        rx
    }

    pub fn defer_and_abandon(self) {
        self.defer(ResumeStrategy::Abandon, None);
    }

    /// Defers and never resumes; the resumer stays alive inside the mock.
    pub fn defer_and_hold(self) {
        self.defer(ResumeStrategy::Hold, None);
    }

    /// Defers with a continuation returning `then`, resumed after `delay`.
    pub fn defer_then_after(self, delay: Duration, contributions: Contributions, then: HandlerState) {
        self.defer(ResumeStrategy::After(delay, contributions), Some(then));
    }

    fn defer(self, resume: ResumeStrategy<R>, then: Option<HandlerState>) {
        self.push(Expectation::Defer { resume, then });
    }

    fn push(self, expectation: Expectation<R>) {
        self.state.expectations.lock().push_back(expectation);
    }
}

/// Chain-side half of a [`MockHandler`].
pub struct MockStep<R: Response> {
    state: Arc<MockState<R>>,
}

#[async_trait]
impl<R: Response> Handler<R> for MockStep<R> {
    async fn handle(&self, step: &mut Step<'_, R>) -> Result<HandlerState, BoxError> {
        let state = &self.state;
        state.calls.fetch_add(1, Ordering::SeqCst);
        state.scopes.lock().push(step.scope().type_names());

        let expectation = state.expectations.lock().pop_front();
        match expectation {
            None => Err(format!("Unexpected call to {}", state.name).into()),
            Some(Expectation::Return(result)) => Ok(result),
            Some(Expectation::Fail(message)) => Err(message.into()),
            Some(Expectation::Panic(message)) => panic!("{message}"),
            Some(Expectation::Defer { resume, then }) => {
                let resumer = match then {
                    Some(then) => step.defer_then(move |_| Ok(then))?,
                    None => step.defer()?,
                };
                match resume {
                    ResumeStrategy::Immediately(contributions) => resumer.resume(contributions),
                    ResumeStrategy::After(delay, contributions) => {
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            resumer.resume(contributions);
                        });
                    }
                    ResumeStrategy::HandOver(tx) => {
                        if tx.send(resumer).is_err() {
                            return Err("Resumer receiver dropped".into());
                        }
                    }
                    ResumeStrategy::Abandon => drop(resumer),
                    ResumeStrategy::Hold => state.held.lock().push(resumer),
                }
                Ok(HandlerState::proceed())
            }
        }
    }

    fn name(&self) -> &'static str {
        self.state.name
    }
}

// =============================================================================
// UNCAUGHT FAILURE RECORDING
// =============================================================================

/// Uncaught handler that keeps every reported failure.
#[derive(Clone, Default)]
pub struct RecordingUncaught {
    failures: Arc<Mutex<Vec<(RunId, String)>>>,
}

impl RecordingUncaught {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reported failures as `(run, error message)`.
    pub fn failures(&self) -> Vec<(RunId, String)> {
        self.failures.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.lock().is_empty()
    }
}

impl UncaughtHandler for RecordingUncaught {
    fn uncaught(&self, run_id: RunId, error: &ChainError) {
        self.failures.lock().push((run_id, error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::response::Reply;
    use crate::treadmill::{Outcome, Treadmill};

    #[tokio::test]
    async fn test_mock_handler_with_expectations() {
        let first = MockHandler::<Reply>::new("first");
        let second = MockHandler::<Reply>::new("second");
        first
            .expect_call()
            .return_continue(Contributions::new().with(1u16));
        second.expect_call().return_finish(Contributions::new());

        let mut chain = Chain::<Reply>::new();
        chain.add(first.handler()).add(second.handler());
        let treadmill = Treadmill::new(Reply::default).unwrap();
        let outcome = treadmill.run_async(&chain, Contributions::new()).await;

        assert!(outcome.is_done());
        assert_eq!(first.calls(), 1);
        assert_eq!(second.scopes(), vec![vec!["u16"]]);
        first.verify();
        second.verify();
    }

    #[tokio::test]
    async fn test_unscripted_call_fails_run() {
        let mock = MockHandler::<Reply>::new("lonely");
        let uncaught = RecordingUncaught::new();
        let mut chain = Chain::<Reply>::new();
        chain.add(mock.handler());

        let treadmill = Treadmill::builder(Reply::default)
            .uncaught_handler(uncaught.clone())
            .build()
            .unwrap();
        let outcome = treadmill.run_async(&chain, Contributions::new()).await;

        assert!(matches!(
            outcome,
            Outcome::Failed(ChainError::Handler { handler: "lonely", .. })
        ));
        assert_eq!(uncaught.len(), 1);
        assert!(uncaught.failures()[0].1.contains("Unexpected call to lonely"));
    }

    #[test]
    #[should_panic(expected = "1 remaining")]
    fn test_verify_panics_on_leftovers() {
        let mock = MockHandler::<Reply>::new("idle");
        mock.expect_call().return_reject();
        mock.verify();
    }
}
