//! # Scope & Contributions
//!
//! A [`Scope`] is the accumulating, type-keyed context of one run. It is seeded with the
//! run's initial contributions and grows as each step contributes objects through its
//! [`HandlerState`](crate::HandlerState). Lookups return the most recently contributed value
//! of the requested type.
//!
//! The scope is a persistent list: [`Scope::with`] and [`Scope::merge`] return a new scope
//! that shares every older entry with the scope it was derived from. Nothing is ever
//! mutated in place, so a handler holding an older scope never observes later contributions,
//! and two runs can never alias each other's context.

use crate::error::ResolveError;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// One type-erased object contributed to a scope.
#[derive(Clone)]
pub struct Contribution {
    type_id: TypeId,
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Contribution {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wraps an already shared value without cloning it. The value is keyed by `T`,
    /// not by `Arc<T>`.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            value,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for Contribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contribution({})", self.type_name)
    }
}

/// Ordered list of objects a step (or a resumption) adds to the scope.
///
/// ```rust
/// use treadmill::Contributions;
///
/// let objs = Contributions::new().with(42u32).with("user-7".to_string());
/// assert_eq!(objs.len(), 2);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Contributions(Vec<Contribution>);

impl Contributions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a value, builder style.
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.push(value);
        self
    }

    pub fn push<T: Any + Send + Sync>(&mut self, value: T) {
        self.0.push(Contribution::new(value));
    }

    pub fn push_contribution(&mut self, contribution: Contribution) {
        self.0.push(contribution);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Contribution> {
        self.0.iter()
    }
}

impl IntoIterator for Contributions {
    type Item = Contribution;
    type IntoIter = std::vec::IntoIter<Contribution>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Contribution> for Contributions {
    fn from_iter<I: IntoIterator<Item = Contribution>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

struct Node {
    entry: Contribution,
    parent: Option<Arc<Node>>,
}

/// The accumulating context of one run.
#[derive(Clone, Default)]
pub struct Scope {
    head: Option<Arc<Node>>,
    len: usize,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new scope with `value` added on top.
    pub fn with<T: Any + Send + Sync>(&self, value: T) -> Scope {
        self.with_contribution(Contribution::new(value))
    }

    pub fn with_contribution(&self, entry: Contribution) -> Scope {
        Scope {
            head: Some(Arc::new(Node {
                entry,
                parent: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// Returns a new scope with all `contributions` added in order.
    pub fn merge(&self, contributions: Contributions) -> Scope {
        contributions
            .into_iter()
            .fold(self.clone(), |scope, entry| scope.with_contribution(entry))
    }

    /// Most recently contributed value of type `T`, if any.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.iter()
            .find(|entry| entry.is::<T>())
            .and_then(|entry| entry.downcast_ref::<T>())
    }

    /// Like [`Scope::get`] but fails with [`ResolveError::Missing`], for use in
    /// [`FromScope`](crate::FromScope) implementations.
    pub fn require<T: Any>(&self) -> Result<&T, ResolveError> {
        self.get::<T>()
            .ok_or(ResolveError::Missing(std::any::type_name::<T>()))
    }

    pub fn contains<T: Any>(&self) -> bool {
        self.iter().any(|entry| entry.is::<T>())
    }

    /// Number of contributions, counting values that were later shadowed.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates contributions newest first.
    pub fn iter(&self) -> ScopeIter<'_> {
        ScopeIter {
            cursor: self.head.as_deref(),
        }
    }

    /// Type names of all contributions in the order they were added.
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.iter().map(Contribution::type_name).collect();
        names.reverse();
        names
    }
}

// Unlinks uniquely owned nodes iteratively; the default drop recurses once per node.
impl Drop for Scope {
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.parent.take(),
                Err(_) => break,
            }
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.type_names()).finish()
    }
}

impl From<Contributions> for Scope {
    fn from(contributions: Contributions) -> Self {
        Scope::new().merge(contributions)
    }
}

/// Newest-first iterator over a [`Scope`].
pub struct ScopeIter<'a> {
    cursor: Option<&'a Node>,
}

impl<'a> Iterator for ScopeIter<'a> {
    type Item = &'a Contribution;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor?;
        self.cursor = node.parent.as_deref();
        Some(&node.entry)
    }
}
