//! # Chains & Registry
//!
//! A [`Chain`] is an ordered list of handler descriptors for one response type. Descriptors
//! are either shared handler instances or resolvers that construct a handler from the run's
//! scope when its step comes up. The descriptor list is immutable once a run iterates it, so
//! any number of concurrent runs can share one chain; each gets its own [`ChainIter`].
//!
//! A [`HandlerRegistry`] maps names to descriptors so chains can be declared as lists of
//! names, for example in [`TreadmillConfig::chains`](crate::TreadmillConfig::chains).
//! Unknown names fail while the chain is built, never during a run.

use crate::config::TreadmillConfig;
use crate::error::{BoxError, ChainError};
use crate::handler::{handler_fn, short_type_name, FromScope, Handler, Resolver, TypeResolver};
use crate::response::Response;
use crate::scope::Scope;
use crate::state::HandlerState;
use crate::step::Step;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One entry of a chain.
pub enum Descriptor<R: Response> {
    Instance(Arc<dyn Handler<R>>),
    Type(Arc<dyn Resolver<R>>),
}

impl<R: Response> Descriptor<R> {
    pub fn name(&self) -> &'static str {
        match self {
            Descriptor::Instance(handler) => handler.name(),
            Descriptor::Type(resolver) => resolver.name(),
        }
    }

    /// Produces the handler for this step, constructing it from `scope` if needed.
    pub fn resolve(&self, scope: &Scope) -> Result<Arc<dyn Handler<R>>, ChainError> {
        match self {
            Descriptor::Instance(handler) => Ok(handler.clone()),
            Descriptor::Type(resolver) => {
                resolver
                    .resolve(scope)
                    .map_err(|source| ChainError::Resolve {
                        handler: resolver.name(),
                        source,
                    })
            }
        }
    }
}

impl<R: Response> Clone for Descriptor<R> {
    fn clone(&self) -> Self {
        match self {
            Descriptor::Instance(handler) => Descriptor::Instance(handler.clone()),
            Descriptor::Type(resolver) => Descriptor::Type(resolver.clone()),
        }
    }
}

impl<R: Response> fmt::Debug for Descriptor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Instance(_) => write!(f, "Instance({})", self.name()),
            Descriptor::Type(_) => write!(f, "Type({})", self.name()),
        }
    }
}

/// Ordered handler descriptors for responses of type `R`.
///
/// ```rust
/// use treadmill::{Chain, HandlerState, Reply};
///
/// let mut chain = Chain::<Reply>::new();
/// chain
///     .add_fn(|_step| Ok(HandlerState::proceed()))
///     .add_fn(|step| {
///         step.response_mut().respond(204, "");
///         Ok(HandlerState::finish())
///     });
/// assert_eq!(chain.len(), 2);
/// ```
pub struct Chain<R: Response> {
    descriptors: Arc<Vec<Descriptor<R>>>,
}

impl<R: Response> Chain<R> {
    pub fn new() -> Self {
        Self {
            descriptors: Arc::new(Vec::new()),
        }
    }

    /// Adds a handler instance shared by every run.
    pub fn add<H: Handler<R>>(&mut self, handler: H) -> &mut Self {
        self.add_arc(Arc::new(handler))
    }

    pub fn add_arc(&mut self, handler: Arc<dyn Handler<R>>) -> &mut Self {
        self.push(Descriptor::Instance(handler))
    }

    /// Adds a handler type, constructed from the scope each time its step runs.
    pub fn add_type<H: Handler<R> + FromScope>(&mut self) -> &mut Self {
        self.add_resolver(Arc::new(TypeResolver::<H>::new()))
    }

    pub fn add_resolver(&mut self, resolver: Arc<dyn Resolver<R>>) -> &mut Self {
        self.push(Descriptor::Type(resolver))
    }

    /// Adds a closure handler.
    pub fn add_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Step<'_, R>) -> Result<HandlerState, BoxError> + Send + Sync + 'static,
    {
        self.add(handler_fn(f))
    }

    /// Adds the descriptor registered under `name`.
    pub fn add_named(
        &mut self,
        registry: &HandlerRegistry<R>,
        name: &str,
    ) -> Result<&mut Self, ChainError> {
        let descriptor = registry
            .get(name)
            .ok_or_else(|| ChainError::UnknownHandler(name.to_string()))?
            .clone();
        Ok(self.push(descriptor))
    }

    /// Adds a type-erased handler. The value must be an `Arc<dyn Handler<R>>` for this
    /// chain's response type.
    pub fn add_any(&mut self, value: Box<dyn Any + Send + Sync>) -> Result<&mut Self, ChainError> {
        match value.downcast::<Arc<dyn Handler<R>>>() {
            Ok(handler) => Ok(self.add_arc(*handler)),
            Err(_) => Err(ChainError::WrongHandlerType {
                expected: short_type_name(std::any::type_name::<R>()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.iter().map(Descriptor::name).collect()
    }

    /// A fresh iterator over this chain's steps.
    pub fn iter(&self) -> ChainIter<R> {
        ChainIter {
            descriptors: self.descriptors.clone(),
            position: 0,
        }
    }

    fn push(&mut self, descriptor: Descriptor<R>) -> &mut Self {
        Arc::make_mut(&mut self.descriptors).push(descriptor);
        self
    }
}

impl<R: Response> Default for Chain<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Response> Clone for Chain<R> {
    fn clone(&self) -> Self {
        Self {
            descriptors: self.descriptors.clone(),
        }
    }
}

impl<R: Response> fmt::Debug for Chain<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.descriptors.iter()).finish()
    }
}

/// Walks one run through a chain. Handlers are resolved only when pulled.
pub struct ChainIter<R: Response> {
    descriptors: Arc<Vec<Descriptor<R>>>,
    position: usize,
}

impl<R: Response> ChainIter<R> {
    /// Resolves the next handler against `scope`, or `None` once the chain is exhausted.
    pub fn next(&mut self, scope: &Scope) -> Option<Result<Arc<dyn Handler<R>>, ChainError>> {
        let descriptor = self.descriptors.get(self.position)?;
        self.position += 1;
        Some(descriptor.resolve(scope))
    }

    pub fn remaining(&self) -> usize {
        self.descriptors.len().saturating_sub(self.position)
    }
}

/// Named handler descriptors, the explicit replacement for annotation scanning.
pub struct HandlerRegistry<R: Response> {
    entries: HashMap<String, Descriptor<R>>,
}

impl<R: Response> HandlerRegistry<R> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers a handler type under `name`.
    pub fn register_type<H: Handler<R> + FromScope>(
        &mut self,
        name: &str,
    ) -> Result<&mut Self, ChainError> {
        self.insert(name, Descriptor::Type(Arc::new(TypeResolver::<H>::new())))
    }

    /// Registers a shared handler instance under `name`.
    pub fn register<H: Handler<R>>(
        &mut self,
        name: &str,
        handler: H,
    ) -> Result<&mut Self, ChainError> {
        self.insert(name, Descriptor::Instance(Arc::new(handler)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Descriptor<R>> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds a chain from registered names, in order.
    pub fn chain<S: AsRef<str>>(&self, names: &[S]) -> Result<Chain<R>, ChainError> {
        let mut chain = Chain::new();
        for name in names {
            chain.add_named(self, name.as_ref())?;
        }
        Ok(chain)
    }

    /// Builds the chain declared under `name` in `config`.
    pub fn configured_chain(
        &self,
        config: &TreadmillConfig,
        name: &str,
    ) -> Result<Chain<R>, ChainError> {
        let names = config
            .chains
            .get(name)
            .ok_or_else(|| ChainError::UnknownChain(name.to_string()))?;
        self.chain(names.as_slice())
    }

    fn insert(&mut self, name: &str, descriptor: Descriptor<R>) -> Result<&mut Self, ChainError> {
        if self.entries.contains_key(name) {
            return Err(ChainError::DuplicateHandler(name.to_string()));
        }
        self.entries.insert(name.to_string(), descriptor);
        Ok(self)
    }
}

impl<R: Response> Default for HandlerRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}
