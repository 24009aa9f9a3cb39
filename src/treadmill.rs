//! # The Treadmill
//!
//! The [`Treadmill`] drives runs of a [`Chain`] to a terminal [`Outcome`], one step at a
//! time, on an [`Executor`].
//!
//! ## Run State Machine
//!
//! ```text
//!            +----------------------------------------------+
//!            v                                              |
//! Start -> Running --Reject--------------------> Rejected  |
//!            |  \----Finish / finished reply----> Done      |
//!            |   \---iterator exhausted---------> Fallthrough
//!            |    \--error / panic / resolve----> Failed    |
//!            \--defer--> Deferred --resume------------------+
//!                           \--abandoned / timed out--> Failed
//! ```
//!
//! After a step returns, the runner applies, in order:
//!
//! 1. an `Err` or a panic ends the run as `Failed`;
//! 2. `Reject` ends the run as `Rejected`;
//! 3. the step's contributions are merged into the scope;
//! 4. `Finish`, or a response reporting [`Response::is_finished`], ends the run as `Done`;
//! 5. a deferral parks the run until its [`Resumer`](crate::Resumer) fires;
//! 6. otherwise the next step is scheduled.
//!
//! Steps of one run never overlap: the run value (iterator, scope, response) moves from one
//! task to the next, so the scope and the response need no locking. Different runs interleave
//! freely on the executor.
//!
//! ## Completion
//!
//! The `on_done` callback passed to [`Treadmill::run`] is owned by the run and consumed when
//! the run reaches a terminal state, so it fires exactly once. If the run value is dropped
//! without finishing (for instance because the runtime shut down while it was queued), the
//! callback still fires, with [`ChainError::Dropped`]. Every `Failed` outcome is also reported
//! to the [`UncaughtHandler`].

use crate::chain::{Chain, ChainIter};
use crate::config::TreadmillConfig;
use crate::deferral::{self, Continuation, DeferRequest, SharedSlot};
use crate::error::{panic_message, ChainError, ConfigError};
use crate::executor::{Executor, LogUncaught, TokioExecutor, UncaughtHandler};
use crate::handler::Handler;
use crate::response::{Response, ResponseFactory};
use crate::scope::{Contributions, Scope};
use crate::step::Step;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Identifier of one run, unique per treadmill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(u64);

impl RunId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Terminal result of a run.
#[derive(Debug)]
pub enum Outcome<R> {
    /// A step finished the run; carries the accumulated response.
    Done(R),
    /// A step declined the request.
    Rejected,
    /// Every step continued and none finished the response.
    Fallthrough(R),
    Failed(ChainError),
}

impl<R> Outcome<R> {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected)
    }

    pub fn is_fallthrough(&self) -> bool {
        matches!(self, Outcome::Fallthrough(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn response(&self) -> Option<&R> {
        match self {
            Outcome::Done(response) | Outcome::Fallthrough(response) => Some(response),
            Outcome::Rejected | Outcome::Failed(_) => None,
        }
    }

    pub fn into_response(self) -> Option<R> {
        match self {
            Outcome::Done(response) | Outcome::Fallthrough(response) => Some(response),
            Outcome::Rejected | Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ChainError> {
        match self {
            Outcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Outcome::Done(_) => RunStatus::Done,
            Outcome::Rejected => RunStatus::Rejected,
            Outcome::Fallthrough(_) => RunStatus::Fallthrough,
            Outcome::Failed(_) => RunStatus::Failed,
        }
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunStatus {
    Running = 0,
    Deferred = 1,
    Done = 2,
    Rejected = 3,
    Fallthrough = 4,
    Failed = 5,
}

impl RunStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunStatus::Deferred,
            2 => RunStatus::Done,
            3 => RunStatus::Rejected,
            4 => RunStatus::Fallthrough,
            5 => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running | RunStatus::Deferred)
    }
}

/// Lock-free view of a run, safe to read from any thread while the run progresses.
#[derive(Debug, Default)]
struct RunProbe {
    status: AtomicU8,
    steps: AtomicUsize,
    finished: AtomicBool,
    modified: AtomicBool,
}

impl RunProbe {
    fn set_status(&self, status: RunStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn record_step<R: Response>(&self, response: &R) {
        self.finished.store(response.is_finished(), Ordering::Release);
        self.modified.store(response.is_modified(), Ordering::Release);
        self.steps.fetch_add(1, Ordering::AcqRel);
    }
}

/// Returned by [`Treadmill::run`] for observing a run from outside.
#[derive(Debug, Clone)]
pub struct RunHandle {
    id: RunId,
    probe: Arc<RunProbe>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_u8(self.probe.status.load(Ordering::Acquire))
    }

    /// Number of steps (handlers and continuations) invoked so far.
    pub fn steps_invoked(&self) -> usize {
        self.probe.steps.load(Ordering::Acquire)
    }

    /// `Response::is_finished` as of the last completed step.
    pub fn response_finished(&self) -> bool {
        self.probe.finished.load(Ordering::Acquire)
    }

    /// `Response::is_modified` as of the last completed step.
    pub fn response_modified(&self) -> bool {
        self.probe.modified.load(Ordering::Acquire)
    }
}

pub(crate) struct Core<R: Response> {
    executor: Arc<dyn Executor>,
    uncaught: Arc<dyn UncaughtHandler>,
    responses: Arc<dyn ResponseFactory<R>>,
    config: TreadmillConfig,
}

/// Drives chains to completion on an executor.
///
/// ```rust
/// use treadmill::{Chain, Contributions, HandlerState, Reply, Treadmill};
///
/// #[tokio::main]
/// async fn main() {
///     let treadmill = Treadmill::new(Reply::default).unwrap();
///
///     let mut chain = Chain::<Reply>::new();
///     chain
///         .add_fn(|_step| Ok(HandlerState::proceed().with(7u32)))
///         .add_fn(|step| {
///             let n = *step.require::<u32>()?;
///             step.response_mut().respond(200, n.to_string());
///             Ok(HandlerState::finish())
///         });
///
///     let outcome = treadmill.run_async(&chain, Contributions::new()).await;
///     assert_eq!(outcome.response().and_then(|r| r.body()), Some("7"));
/// }
/// ```
pub struct Treadmill<R: Response> {
    core: Arc<Core<R>>,
    next_id: Arc<AtomicU64>,
}

impl<R: Response> Clone for Treadmill<R> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<R: Response> Treadmill<R> {
    /// A treadmill on the current tokio runtime with default configuration and the logging
    /// uncaught handler.
    pub fn new<F: ResponseFactory<R> + 'static>(responses: F) -> Result<Self, ConfigError> {
        Self::builder(responses).build()
    }

    pub fn builder<F: ResponseFactory<R> + 'static>(responses: F) -> TreadmillBuilder<R> {
        TreadmillBuilder {
            responses: Arc::new(responses),
            executor: None,
            uncaught: None,
            config: TreadmillConfig::default(),
        }
    }

    pub fn config(&self) -> &TreadmillConfig {
        &self.core.config
    }

    /// Starts a run of `chain` and returns immediately. `on_done` is invoked exactly once, on
    /// an executor thread, with the run's outcome.
    pub fn run<F>(&self, chain: &Chain<R>, initial: Contributions, on_done: F) -> RunHandle
    where
        F: FnOnce(Outcome<R>) + Send + 'static,
    {
        let id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let probe = Arc::new(RunProbe::default());
        let scope = Scope::from(initial);
        info!(run_id = %id, steps = chain.len(), initial = scope.len(), "Run started");

        let run = Run {
            id,
            core: self.core.clone(),
            steps: chain.iter(),
            scope,
            response: self.core.responses.create(),
            index: 0,
            continuation: None,
            probe: probe.clone(),
            completion: Completion {
                run_id: id,
                uncaught: self.core.uncaught.clone(),
                probe: probe.clone(),
                on_done: Some(Box::new(on_done)),
            },
        };
        run.schedule();

        RunHandle { id, probe }
    }

    /// Starts a run and waits for its outcome.
    ///
    /// Deferred runs wait as long as they stay parked; wrap the future in
    /// `tokio::time::timeout` or configure `deferral_timeout_ms` to bound the wait.
    pub fn run_async(
        &self,
        chain: &Chain<R>,
        initial: Contributions,
    ) -> impl Future<Output = Outcome<R>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.run(chain, initial, move |outcome| {
            let _ = tx.send(outcome);
        });
        async move { rx.await.unwrap_or(Outcome::Failed(ChainError::Dropped)) }
    }
}

/// Configures a [`Treadmill`].
pub struct TreadmillBuilder<R: Response> {
    responses: Arc<dyn ResponseFactory<R>>,
    executor: Option<Arc<dyn Executor>>,
    uncaught: Option<Arc<dyn UncaughtHandler>>,
    config: TreadmillConfig,
}

impl<R: Response> TreadmillBuilder<R> {
    pub fn executor<E: Executor + 'static>(mut self, executor: E) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn uncaught_handler<U: UncaughtHandler + 'static>(mut self, uncaught: U) -> Self {
        self.uncaught = Some(Arc::new(uncaught));
        self
    }

    pub fn config(mut self, config: TreadmillConfig) -> Self {
        self.config = config;
        self
    }

    /// Fails with [`ConfigError::NoRuntime`] when no executor was given and the caller is
    /// not inside a tokio runtime.
    pub fn build(self) -> Result<Treadmill<R>, ConfigError> {
        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(TokioExecutor::current()?),
        };
        let uncaught = self.uncaught.unwrap_or_else(|| Arc::new(LogUncaught));
        Ok(Treadmill {
            core: Arc::new(Core {
                executor,
                uncaught,
                responses: self.responses,
                config: self.config,
            }),
            next_id: Arc::new(AtomicU64::new(0)),
        })
    }
}

type OnDone<R> = Box<dyn FnOnce(Outcome<R>) + Send>;

/// Owns a run's `on_done` callback and guarantees it fires once.
struct Completion<R> {
    run_id: RunId,
    uncaught: Arc<dyn UncaughtHandler>,
    probe: Arc<RunProbe>,
    on_done: Option<OnDone<R>>,
}

impl<R> Completion<R> {
    fn complete(mut self, outcome: Outcome<R>) {
        if let Some(on_done) = self.on_done.take() {
            self.deliver(on_done, outcome);
        }
    }

    fn deliver(&self, on_done: OnDone<R>, outcome: Outcome<R>) {
        let run_id = self.run_id;
        let steps = self.probe.steps.load(Ordering::Acquire);
        self.probe.set_status(outcome.status());
        match &outcome {
            Outcome::Done(_) => info!(%run_id, steps, "Run done"),
            Outcome::Rejected => info!(%run_id, steps, "Run rejected"),
            Outcome::Fallthrough(_) => info!(%run_id, steps, "Run fell through"),
            Outcome::Failed(error) => {
                warn!(%run_id, steps, %error, "Run failed");
                let report = AssertUnwindSafe(|| self.uncaught.uncaught(run_id, error));
                if let Err(payload) = std::panic::catch_unwind(report) {
                    error!(
                        %run_id,
                        panic = %panic_message(&*payload),
                        "Uncaught handler panicked"
                    );
                }
            }
        }
        on_done(outcome);
    }
}

impl<R> Drop for Completion<R> {
    fn drop(&mut self) {
        if let Some(on_done) = self.on_done.take() {
            self.deliver(on_done, Outcome::Failed(ChainError::Dropped));
        }
    }
}

enum Invocation<R: Response> {
    Handler(Arc<dyn Handler<R>>),
    Continuation(Continuation<R>),
}

enum Verdict<R: Response> {
    Next,
    Reject,
    Done,
    Park(SharedSlot<R>),
    Fail(ChainError),
}

impl<R: Response> Verdict<R> {
    fn label(&self) -> &'static str {
        match self {
            Verdict::Next => "continue",
            Verdict::Reject => "reject",
            Verdict::Done => "done",
            Verdict::Park(_) => "defer",
            Verdict::Fail(_) => "fail",
        }
    }
}

/// One in-flight run. Moved from task to task; never shared.
pub(crate) struct Run<R: Response> {
    id: RunId,
    core: Arc<Core<R>>,
    steps: ChainIter<R>,
    scope: Scope,
    response: R,
    index: usize,
    continuation: Option<Continuation<R>>,
    probe: Arc<RunProbe>,
    completion: Completion<R>,
}

impl<R: Response> Run<R> {
    pub(crate) fn id(&self) -> RunId {
        self.id
    }

    pub(crate) fn executor(&self) -> Arc<dyn Executor> {
        self.core.executor.clone()
    }

    /// Re-enters the state machine after a deferral.
    pub(crate) fn resume(mut self, contributions: Contributions) {
        debug!(run_id = %self.id, contributed = contributions.len(), "Resuming");
        self.scope = self.scope.merge(contributions);
        self.probe.set_status(RunStatus::Running);
        self.schedule();
    }

    pub(crate) fn fail(self, error: ChainError) {
        self.completion.complete(Outcome::Failed(error));
    }

    fn schedule(self) {
        let span = info_span!("run", run_id = %self.id);
        let executor = self.core.executor.clone();
        executor.submit(Box::pin(self.advance().instrument(span)));
    }

    async fn advance(mut self) {
        loop {
            let invocation = match self.continuation.take() {
                Some(continuation) => Invocation::Continuation(continuation),
                None => match self.steps.next(&self.scope) {
                    Some(Ok(handler)) => Invocation::Handler(handler),
                    Some(Err(error)) => return self.fail(error),
                    None => {
                        let Run {
                            response,
                            completion,
                            ..
                        } = self;
                        return completion.complete(Outcome::Fallthrough(response));
                    }
                },
            };

            match self.invoke(invocation).await {
                Verdict::Next if self.core.config.yield_between_steps => return self.schedule(),
                Verdict::Next => continue,
                Verdict::Reject => return self.completion.complete(Outcome::Rejected),
                Verdict::Done => {
                    let Run {
                        response,
                        completion,
                        ..
                    } = self;
                    return completion.complete(Outcome::Done(response));
                }
                Verdict::Park(slot) => {
                    let timeout = self.core.config.deferral_timeout();
                    self.probe.set_status(RunStatus::Deferred);
                    return deferral::park(self, slot, timeout);
                }
                Verdict::Fail(error) => return self.fail(error),
            }
        }
    }

    async fn invoke(&mut self, invocation: Invocation<R>) -> Verdict<R> {
        let index = self.index;
        let mut deferral: Option<DeferRequest<R>> = None;

        let (name, result) = {
            let mut step = Step::new(
                self.id,
                index,
                &self.scope,
                &mut self.response,
                &mut deferral,
            );
            match invocation {
                Invocation::Handler(handler) => {
                    let name = handler.name();
                    debug!(step = index, handler = name, "Invoking");
                    let result = AssertUnwindSafe(handler.handle(&mut step))
                        .catch_unwind()
                        .await;
                    (name, result)
                }
                Invocation::Continuation(continuation) => {
                    debug!(step = index, "Invoking continuation");
                    let result =
                        std::panic::catch_unwind(AssertUnwindSafe(|| continuation(&mut step)));
                    ("continuation", result)
                }
            }
        };

        self.index += 1;
        self.probe.record_step(&self.response);

        let verdict = match result {
            Err(payload) => Verdict::Fail(ChainError::Panicked {
                handler: name,
                message: panic_message(&*payload),
            }),
            Ok(Err(source)) => Verdict::Fail(ChainError::Handler {
                handler: name,
                source,
            }),
            Ok(Ok(state)) => match state.into_parts() {
                None => Verdict::Reject,
                Some((contributions, finish)) => {
                    self.scope = self.scope.merge(contributions);
                    if finish || self.response.is_finished() {
                        Verdict::Done
                    } else if let Some(request) = deferral.take() {
                        self.continuation = request.continuation;
                        Verdict::Park(request.slot)
                    } else {
                        Verdict::Next
                    }
                }
            },
        };

        if let Some(request) = deferral {
            request.close();
        }
        debug!(step = index, handler = name, verdict = verdict.label(), "Step complete");
        verdict
    }
}
