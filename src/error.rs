//! # Treadmill Errors
//!
//! This module defines the error types shared by chain construction, handler resolution,
//! run execution and configuration loading. Build-time failures (unknown handler names,
//! wrong handler payloads) surface from the `Chain` builders; everything that goes wrong
//! during a run ends the run in [`Outcome::Failed`](crate::Outcome::Failed) and is
//! forwarded to the [`UncaughtHandler`](crate::UncaughtHandler).

/// Boxed error type handlers may return from their step.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while building or running a chain.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("No handler registered under name: {0}")]
    UnknownHandler(String),
    #[error("Handler name registered twice: {0}")]
    DuplicateHandler(String),
    #[error("Value added to chain is not a handler for responses of type {expected}")]
    WrongHandlerType { expected: &'static str },
    #[error("No chain configured under name: {0}")]
    UnknownChain(String),
    #[error("Run dropped before reaching a terminal state")]
    Dropped,
    #[error("Could not instantiate handler {handler}: {source}")]
    Resolve {
        handler: &'static str,
        #[source]
        source: ResolveError,
    },
    #[error("Handler {handler} failed: {source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("Handler {handler} panicked: {message}")]
    Panicked {
        handler: &'static str,
        message: String,
    },
    #[error("Step already deferred")]
    AlreadyDeferred,
    #[error("Deferred run was abandoned without being resumed")]
    DeferralAbandoned,
    #[error("Deferred run was not resumed within {0:?}")]
    DeferralTimedOut(std::time::Duration),
}

/// Errors raised when a handler cannot be constructed from the current scope.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Missing scope value of type {0}")]
    Missing(&'static str),
    #[error("Construction failed: {0}")]
    Failed(String),
}

/// Errors raised while loading [`TreadmillConfig`](crate::TreadmillConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("No tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Extracts a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
