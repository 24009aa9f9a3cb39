use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use treadmill::mock::{MockHandler, RecordingUncaught};
use treadmill::{
    Chain, ChainError, Contributions, Executor, HandlerState, Outcome, Reply, Resumer, RunStatus,
    Step, Task, Treadmill, TreadmillConfig,
};

/// Spawns onto a tokio runtime and counts submitted tasks that have not finished.
#[derive(Clone)]
struct CountingExecutor {
    handle: Handle,
    alive: Arc<AtomicUsize>,
}

impl CountingExecutor {
    fn current() -> Self {
        Self {
            handle: Handle::current(),
            alive: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Executor for CountingExecutor {
    fn submit(&self, task: Task) {
        let alive = self.alive.clone();
        alive.fetch_add(1, Ordering::SeqCst);
        drop(self.handle.spawn(async move {
            task.await;
            alive.fetch_sub(1, Ordering::SeqCst);
        }));
    }
}

fn treadmill_with(uncaught: &RecordingUncaught, config: TreadmillConfig) -> Treadmill<Reply> {
    Treadmill::builder(Reply::default)
        .config(config)
        .uncaught_handler(uncaught.clone())
        .build()
        .expect("Failed to build treadmill")
}

/// Renders the `u32` in scope and finishes.
fn render_u32(step: &mut Step<'_, Reply>) -> Result<HandlerState, treadmill::BoxError> {
    let n = *step.require::<u32>()?;
    step.response_mut().respond(200, n.to_string());
    Ok(HandlerState::finish())
}

#[tokio::test]
async fn test_deferred_run_completes_only_after_resume() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    let resumer_rx = loader.expect_call().defer_and_hand_over();

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler()).add_fn(render_u32);

    let treadmill = treadmill_with(&uncaught, TreadmillConfig::default());
    let (tx, mut done_rx) = oneshot::channel();
    let handle = treadmill.run(&chain, Contributions::new(), move |outcome| {
        let _ = tx.send(outcome);
    });

    let resumer = resumer_rx.await.expect("Handler never deferred");
    assert_eq!(resumer.run_id(), handle.id());

    // Parked: no outcome yet.
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut done_rx)
        .await
        .is_err());
    assert_eq!(handle.status(), RunStatus::Deferred);
    assert_eq!(handle.steps_invoked(), 1);

    resumer.resume_with(42u32);
    let outcome = done_rx.await.expect("on_done never fired");

    assert_eq!(outcome.response().and_then(Reply::body), Some("42"));
    assert_eq!(handle.status(), RunStatus::Done);
    assert_eq!(handle.steps_invoked(), 2);
    loader.verify();
    assert!(uncaught.is_empty());
}

#[tokio::test]
async fn test_defer_and_resume_from_background_task() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    loader.expect_call().defer_and_resume_after(
        Duration::from_millis(20),
        Contributions::new().with(7u32),
    );

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler()).add_fn(render_u32);

    let outcome = treadmill_with(&uncaught, TreadmillConfig::default())
        .run_async(&chain, Contributions::new())
        .await;

    assert_eq!(outcome.response().and_then(Reply::body), Some("7"));
}

#[tokio::test]
async fn test_resume_before_step_returns() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    loader
        .expect_call()
        .defer_and_resume_immediately(Contributions::new().with(3u32));

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler()).add_fn(render_u32);

    let outcome = treadmill_with(&uncaught, TreadmillConfig::default())
        .run_async(&chain, Contributions::new())
        .await;

    assert_eq!(outcome.response().and_then(Reply::body), Some("3"));
    assert!(uncaught.is_empty());
}

#[tokio::test]
async fn test_step_contributions_merge_before_resumed_ones() {
    let uncaught = RecordingUncaught::new();
    let mut chain = Chain::<Reply>::new();
    chain
        .add_fn(|step| {
            let resumer = step.defer()?;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                resumer.resume_with(2u32);
            });
            Ok(HandlerState::proceed().with(1u32))
        })
        .add_fn(render_u32);

    let outcome = treadmill_with(&uncaught, TreadmillConfig::default())
        .run_async(&chain, Contributions::new())
        .await;

    assert_eq!(outcome.response().and_then(Reply::body), Some("2"));
}

#[tokio::test]
async fn test_abandoned_resumer_fails_run() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    let after = MockHandler::<Reply>::new("after");
    loader.expect_call().defer_and_abandon();

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler()).add(after.handler());

    let outcome = treadmill_with(&uncaught, TreadmillConfig::default())
        .run_async(&chain, Contributions::new())
        .await;

    assert!(matches!(
        outcome,
        Outcome::Failed(ChainError::DeferralAbandoned)
    ));
    assert_eq!(after.calls(), 0);
    assert_eq!(uncaught.len(), 1);
}

#[tokio::test]
async fn test_resumer_dropped_after_park_fails_run() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    let resumer_rx = loader.expect_call().defer_and_hand_over();

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler());

    let run = treadmill_with(&uncaught, TreadmillConfig::default())
        .run_async(&chain, Contributions::new());
    let resumer = resumer_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(resumer);

    assert!(matches!(
        run.await,
        Outcome::Failed(ChainError::DeferralAbandoned)
    ));
}

#[tokio::test]
async fn test_deferral_timeout_fails_run_and_ignores_late_resume() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    let resumer_rx = loader.expect_call().defer_and_hand_over();

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler()).add_fn(render_u32);

    let timeout = Duration::from_millis(50);
    let config = TreadmillConfig::default().with_deferral_timeout(timeout);
    let treadmill = treadmill_with(&uncaught, config);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    let (tx, done_rx) = oneshot::channel();
    treadmill.run(&chain, Contributions::new(), move |outcome| {
        seen.lock().unwrap().push(outcome.status());
        let _ = tx.send(outcome);
    });

    let resumer = resumer_rx.await.unwrap();
    let outcome = done_rx.await.unwrap();
    match outcome {
        Outcome::Failed(ChainError::DeferralTimedOut(after)) => assert_eq!(after, timeout),
        other => panic!("Expected timeout, got {other:?}"),
    }

    resumer.resume_with(1u32);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(*calls.lock().unwrap(), vec![RunStatus::Failed]);
    assert_eq!(uncaught.len(), 1);
}

#[tokio::test]
async fn test_held_resumer_times_out() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    loader.expect_call().defer_and_hold();

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler());

    let config = TreadmillConfig::default().with_deferral_timeout(Duration::from_millis(20));
    let outcome = treadmill_with(&uncaught, config)
        .run_async(&chain, Contributions::new())
        .await;

    assert!(matches!(
        outcome,
        Outcome::Failed(ChainError::DeferralTimedOut(_))
    ));
}

#[tokio::test]
async fn test_continuation_runs_after_resume_and_finishes() {
    let uncaught = RecordingUncaught::new();
    let after = MockHandler::<Reply>::new("after");
    let mut chain = Chain::<Reply>::new();
    chain
        .add_fn(|step| {
            let resumer = step.defer_then(render_u32)?;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                resumer.resume_with(9u32);
            });
            Ok(HandlerState::proceed())
        })
        .add(after.handler());

    let treadmill = treadmill_with(&uncaught, TreadmillConfig::default());
    let (tx, rx) = oneshot::channel();
    let handle = treadmill.run(&chain, Contributions::new(), move |outcome| {
        let _ = tx.send(outcome);
    });
    let outcome = rx.await.unwrap();

    assert_eq!(outcome.response().and_then(Reply::body), Some("9"));
    assert_eq!(after.calls(), 0);
    // The deferring handler and its continuation.
    assert_eq!(handle.steps_invoked(), 2);
}

#[tokio::test]
async fn test_continuation_may_continue_to_next_handler() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    loader.expect_call().defer_then_after(
        Duration::from_millis(5),
        Contributions::new().with(11u32),
        HandlerState::proceed(),
    );

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler()).add_fn(render_u32);

    let outcome = treadmill_with(&uncaught, TreadmillConfig::default())
        .run_async(&chain, Contributions::new())
        .await;

    assert_eq!(outcome.response().and_then(Reply::body), Some("11"));
}

#[tokio::test]
async fn test_deferring_step_that_finishes_ignores_resume() {
    let uncaught = RecordingUncaught::new();
    let stash: Arc<Mutex<Option<Resumer<Reply>>>> = Arc::new(Mutex::new(None));
    let slot = stash.clone();

    let mut chain = Chain::<Reply>::new();
    chain.add_fn(move |step| {
        let resumer = step.defer()?;
        *slot.lock().unwrap() = Some(resumer);
        Ok(HandlerState::finish())
    });

    let outcome = treadmill_with(&uncaught, TreadmillConfig::default())
        .run_async(&chain, Contributions::new())
        .await;
    assert!(outcome.is_done());

    let resumer = stash.lock().unwrap().take().expect("Resumer stashed");
    resumer.resume(Contributions::new());
    assert!(uncaught.is_empty());
}

#[tokio::test]
async fn test_deferring_step_that_rejects_is_rejected() {
    let uncaught = RecordingUncaught::new();
    let mut chain = Chain::<Reply>::new();
    chain.add_fn(|step| {
        let _resumer = step.defer()?;
        Ok(HandlerState::reject())
    });

    let outcome = treadmill_with(&uncaught, TreadmillConfig::default())
        .run_async(&chain, Contributions::new())
        .await;

    assert!(outcome.is_rejected());
    assert!(uncaught.is_empty());
}

#[tokio::test]
async fn test_second_defer_in_one_step_is_an_error() {
    let uncaught = RecordingUncaught::new();
    let mut chain = Chain::<Reply>::new();
    chain.add_fn(|step| {
        let _first = step.defer()?;
        assert!(step.is_deferred());
        let _second = step.defer()?;
        Ok(HandlerState::proceed())
    });

    let outcome = treadmill_with(&uncaught, TreadmillConfig::default())
        .run_async(&chain, Contributions::new())
        .await;

    match outcome {
        Outcome::Failed(ChainError::Handler { source, .. }) => assert!(matches!(
            source.downcast_ref::<ChainError>(),
            Some(ChainError::AlreadyDeferred)
        )),
        other => panic!("Expected AlreadyDeferred, got {other:?}"),
    }
}

#[tokio::test]
async fn test_deferral_without_yielding_between_steps() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    loader.expect_call().defer_and_resume_after(
        Duration::from_millis(5),
        Contributions::new().with(5u32),
    );

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler()).add_fn(render_u32);

    let config = TreadmillConfig::default().with_yield_between_steps(false);
    let outcome = treadmill_with(&uncaught, config)
        .run_async(&chain, Contributions::new())
        .await;

    assert_eq!(outcome.response().and_then(Reply::body), Some("5"));
}

#[tokio::test]
async fn test_resumed_runs_leave_no_expiry_tasks_behind() {
    let uncaught = RecordingUncaught::new();
    let executor = CountingExecutor::current();
    let treadmill = Treadmill::builder(Reply::default)
        .executor(executor.clone())
        .config(TreadmillConfig::default().with_deferral_timeout(Duration::from_secs(3600)))
        .uncaught_handler(uncaught.clone())
        .build()
        .unwrap();

    let mut chain = Chain::<Reply>::new();
    chain
        .add_fn(|step| {
            let resumer = step.defer()?;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                resumer.resume_with(1u32);
            });
            Ok(HandlerState::proceed())
        })
        .add_fn(render_u32);

    let runs = (0..200).map(|_| treadmill.run_async(&chain, Contributions::new()));
    let outcomes = join_all(runs).await;
    assert!(outcomes.iter().all(Outcome::is_done));

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while executor.alive() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        drained.is_ok(),
        "{} executor tasks still alive after every run finished",
        executor.alive()
    );
    assert!(uncaught.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_run_completes_on_executor_thread() {
    let uncaught = RecordingUncaught::new();
    let loader = MockHandler::<Reply>::new("loader");
    let resumer_rx = loader.expect_call().defer_and_hand_over();

    let mut chain = Chain::<Reply>::new();
    chain.add(loader.handler());

    let treadmill = treadmill_with(&uncaught, TreadmillConfig::default());
    let (tx, done_rx) = oneshot::channel();
    let handle = treadmill.run(&chain, Contributions::new(), move |outcome| {
        let thread = std::thread::current().name().map(String::from);
        let _ = tx.send((thread, outcome));
    });

    let resumer = resumer_rx.await.unwrap();
    while handle.status() != RunStatus::Deferred {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    std::thread::Builder::new()
        .name("user-thread".into())
        .spawn(move || drop(resumer))
        .unwrap()
        .join()
        .unwrap();

    let (thread, outcome) = done_rx.await.unwrap();
    assert_eq!(thread.as_deref(), Some("tokio-runtime-worker"));
    assert!(matches!(
        outcome,
        Outcome::Failed(ChainError::DeferralAbandoned)
    ));
    assert_eq!(uncaught.len(), 1);
}
