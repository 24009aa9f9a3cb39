//! # Observability & Logging
//!
//! Every run is wrapped in a `run` span carrying its `run_id`, so all events a handler emits
//! while its step executes are attributed to the right run even when many runs interleave on
//! the same worker threads.
//!
//! ## What Gets Logged
//!
//! | Level | Event |
//! |-------|-------|
//! | `INFO` | Run started, run done / rejected / fell through |
//! | `WARN` | Run failed, deferral abandoned or timed out, late resume ignored |
//! | `ERROR` | Uncaught failure (default sink), uncaught handler panicked |
//! | `DEBUG` | Each step invoked and its verdict, park and resume |
//!
//! ## Usage
//!
//! ```bash
//! # Run lifecycle only
//! RUST_LOG=info cargo run
//!
//! # Every step and every deferral
//! RUST_LOG=treadmill=debug cargo run
//! ```
//!
//! With `RUST_LOG=debug` a deferred run reads like:
//!
//! ```text
//! INFO Run started run_id=run-1 steps=3 initial=1
//! DEBUG run: Invoking step=0 handler="Authenticate" run_id=run-1
//! DEBUG run: Step complete step=0 handler="Authenticate" verdict="continue" run_id=run-1
//! DEBUG run: Invoking step=1 handler="load" run_id=run-1
//! DEBUG run: Step complete step=1 handler="load" verdict="defer" run_id=run-1
//! DEBUG run: Parked run_id=run-1
//! DEBUG Resuming run_id=run-1 contributed=1
//! INFO run: Run done run_id=run-1 steps=3
//! ```

/// Installs a compact `fmt` subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}
