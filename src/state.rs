//! # Handler State
//!
//! Every step of a chain produces exactly one [`HandlerState`]. The state tells the
//! [`Treadmill`](crate::Treadmill) whether to stop the run with a rejection, stop it with the
//! accumulated response, or move on to the next step, and carries the objects the step wants
//! to add to the run's [`Scope`](crate::Scope).

use crate::scope::Contributions;
use std::any::Any;

/// Result of one step.
#[derive(Debug, Clone)]
pub enum HandlerState {
    /// The handler declines the request. The run ends as
    /// [`Outcome::Rejected`](crate::Outcome::Rejected) and no later step is invoked.
    Reject,
    /// Proceed to the next step, after merging the contributions into the scope.
    Continue(Contributions),
    /// Merge the contributions and end the run as [`Outcome::Done`](crate::Outcome::Done).
    Finish(Contributions),
}

impl HandlerState {
    /// `Continue` with no contributions.
    pub fn proceed() -> Self {
        HandlerState::Continue(Contributions::new())
    }

    /// `Finish` with no contributions.
    pub fn finish() -> Self {
        HandlerState::Finish(Contributions::new())
    }

    pub fn reject() -> Self {
        HandlerState::Reject
    }

    /// Adds a contribution. Has no effect on `Reject`, which carries no context.
    ///
    /// ```rust
    /// use treadmill::HandlerState;
    ///
    /// let state = HandlerState::proceed().with(7u32).with("page");
    /// assert_eq!(state.contributions().map(|c| c.len()), Some(2));
    /// ```
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        match &mut self {
            HandlerState::Continue(objs) | HandlerState::Finish(objs) => objs.push(value),
            HandlerState::Reject => {}
        }
        self
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, HandlerState::Reject)
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, HandlerState::Finish(_))
    }

    pub fn contributions(&self) -> Option<&Contributions> {
        match self {
            HandlerState::Continue(objs) | HandlerState::Finish(objs) => Some(objs),
            HandlerState::Reject => None,
        }
    }

    /// Splits the state into its contributions and whether it ends the run successfully.
    /// Returns `None` for `Reject`.
    pub(crate) fn into_parts(self) -> Option<(Contributions, bool)> {
        match self {
            HandlerState::Continue(objs) => Some((objs, false)),
            HandlerState::Finish(objs) => Some((objs, true)),
            HandlerState::Reject => None,
        }
    }
}
