#![doc(html_logo_url = "https://www.rust-lang.org/logos/rust-logo-128x128.png")]
#![doc(html_favicon_url = "https://www.rust-lang.org/favicon.ico")]
//! # Treadmill
//!
//! > **A chained, short-circuiting request pipeline with deferral and accumulating context.**
//!
//! A request is pushed through an ordered [`Chain`] of [`Handler`]s. Each handler inspects
//! the request, may write to a shared response, contributes typed objects to a growing
//! [`Scope`], and then decides how the run proceeds by returning a [`HandlerState`]:
//!
//! - `Continue(contributions)`: merge the contributions, move on to the next handler;
//! - `Finish(contributions)`: merge them and stop, the response is complete;
//! - `Reject`: stop, this chain declines the request.
//!
//! A handler may also [`defer`](Step::defer) the run. The run is then parked without holding
//! any thread and picks up where it left off once the [`Resumer`] is used, which makes
//! asynchronous lookups (databases, remote calls, timers) first-class steps of a chain.
//!
//! ## Core Concepts
//!
//! ### Scope: the accumulating context
//! The [`Scope`] is a persistent, type-keyed list. Contributions are prepended, so a lookup
//! always returns the newest value of a type, and earlier snapshots stay valid and unchanged.
//! A deferred run can keep its scope without copying it.
//!
//! ### Lazy handler resolution
//! A chain entry is either a shared handler instance or a handler *type* implementing
//! [`FromScope`]. Types are constructed only when their step comes up, from the scope as it
//! is at that moment, so a handler's constructor can depend on what earlier handlers
//! contributed.
//!
//! ### Exactly-once completion
//! Every run ends in exactly one [`Outcome`]: `Done`, `Rejected`, `Fallthrough` or `Failed`.
//! The completion callback is owned by the run and consumed when it ends, so it cannot fire
//! twice, and a run that is dropped on the floor still reports [`ChainError::Dropped`].
//!
//! ## Module Tour
//!
//! ### 1. The Vocabulary ([`scope`], [`state`], [`response`])
//! Contributions, the scope they accumulate in, the handler verdicts and the response
//! accumulator contract with its sample [`Reply`].
//!
//! ### 2. The Building Blocks ([`handler`], [`step`], [`chain`])
//! The [`Handler`] trait, the per-step context handlers receive, chains of handler
//! descriptors and the named [`HandlerRegistry`].
//!
//! ### 3. The Engine ([`treadmill`], [`deferral`], [`executor`])
//! The run state machine, parking and resumption, and the executor and failure sink seams.
//!
//! ### 4. The Surroundings ([`config`], [`logging`], [`mock`])
//! Configuration from code, JSON or environment, tracing setup, and scripted handlers for
//! tests.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the demo with run lifecycle logs
//! RUST_LOG=info cargo run
//!
//! # Run the tests
//! cargo test
//! ```

pub mod chain;
pub mod config;
pub mod deferral;
pub mod error;
pub mod executor;
pub mod handler;
pub mod logging;
pub mod mock;
pub mod response;
pub mod scope;
pub mod state;
pub mod step;
pub mod treadmill;

pub use async_trait::async_trait;
pub use chain::{Chain, ChainIter, Descriptor, HandlerRegistry};
pub use config::TreadmillConfig;
pub use deferral::Resumer;
pub use error::{BoxError, ChainError, ConfigError, ResolveError};
pub use executor::{Executor, LogUncaught, Task, TokioExecutor, UncaughtHandler};
pub use handler::{handler_fn, FnHandler, FromScope, Handler, Resolver, TypeResolver};
pub use response::{DefaultResponses, Reply, Response, ResponseFactory};
pub use scope::{Contribution, Contributions, Scope};
pub use state::HandlerState;
pub use step::Step;
pub use treadmill::{Outcome, RunHandle, RunId, RunStatus, Treadmill, TreadmillBuilder};
