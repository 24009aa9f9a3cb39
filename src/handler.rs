//! # Handlers & Resolution
//!
//! A [`Handler`] is one composable unit of request-processing logic. Handlers are placed in a
//! [`Chain`](crate::Chain) either as ready-made instances or as types that are constructed
//! from the run's [`Scope`] at the moment their step comes up, through [`FromScope`].
//!
//! Type descriptors are what make the accumulating scope useful: a later handler's
//! constructor can read the objects an earlier handler contributed, because it is built only
//! after those contributions were merged.
//!
//! ```rust
//! use treadmill::{async_trait, BoxError, FromScope, Handler, HandlerState, Reply, ResolveError, Scope, Step};
//!
//! #[derive(Clone)]
//! struct UserName(String);
//!
//! struct Greet {
//!     name: UserName,
//! }
//!
//! impl FromScope for Greet {
//!     fn from_scope(scope: &Scope) -> Result<Self, ResolveError> {
//!         Ok(Self { name: scope.require::<UserName>()?.clone() })
//!     }
//! }
//!
//! #[async_trait]
//! impl Handler<Reply> for Greet {
//!     async fn handle(&self, step: &mut Step<'_, Reply>) -> Result<HandlerState, BoxError> {
//!         step.response_mut().respond(200, format!("hello {}", self.name.0));
//!         Ok(HandlerState::finish())
//!     }
//! }
//! ```

use crate::error::{BoxError, ResolveError};
use crate::response::Response;
use crate::scope::Scope;
use crate::state::HandlerState;
use crate::step::Step;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

/// One step of a chain.
#[async_trait]
pub trait Handler<R: Response>: Send + Sync + 'static {
    /// Processes the step and says how the run proceeds.
    async fn handle(&self, step: &mut Step<'_, R>) -> Result<HandlerState, BoxError>;

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Constructor injection from the current scope.
pub trait FromScope: Sized {
    fn from_scope(scope: &Scope) -> Result<Self, ResolveError>;
}

/// The instantiation service: produces a handler for the current scope.
pub trait Resolver<R: Response>: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, scope: &Scope) -> Result<Arc<dyn Handler<R>>, ResolveError>;
}

/// Resolves `H` by calling [`FromScope::from_scope`].
pub struct TypeResolver<H> {
    _handler: PhantomData<fn() -> H>,
}

impl<H> TypeResolver<H> {
    pub fn new() -> Self {
        Self {
            _handler: PhantomData,
        }
    }
}

impl<H> Default for TypeResolver<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, H> Resolver<R> for TypeResolver<H>
where
    R: Response,
    H: Handler<R> + FromScope,
{
    fn name(&self) -> &'static str {
        short_type_name(std::any::type_name::<H>())
    }

    fn resolve(&self, scope: &Scope) -> Result<Arc<dyn Handler<R>>, ResolveError> {
        Ok(Arc::new(H::from_scope(scope)?))
    }
}

/// A handler backed by a synchronous closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
    name: &'static str,
}

impl<F> FnHandler<F> {
    /// Overrides the name shown in logs.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

/// Wraps a closure as a [`Handler`].
///
/// ```rust
/// use treadmill::{handler_fn, HandlerState, Reply, Step};
///
/// let auth = handler_fn(|step: &mut Step<'_, Reply>| {
///     if step.get::<String>().is_some() {
///         Ok(HandlerState::proceed())
///     } else {
///         Ok(HandlerState::reject())
///     }
/// })
/// .named("auth");
/// ```
pub fn handler_fn<R, F>(f: F) -> FnHandler<F>
where
    R: Response,
    F: Fn(&mut Step<'_, R>) -> Result<HandlerState, BoxError> + Send + Sync + 'static,
{
    FnHandler { f, name: "fn" }
}

#[async_trait]
impl<R, F> Handler<R> for FnHandler<F>
where
    R: Response,
    F: Fn(&mut Step<'_, R>) -> Result<HandlerState, BoxError> + Send + Sync + 'static,
{
    async fn handle(&self, step: &mut Step<'_, R>) -> Result<HandlerState, BoxError> {
        (self.f)(step)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Last path segment of a type name, without generic arguments
/// (`my_app::handlers::Auth<Reply>` becomes `Auth`).
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
