//! # Response Accumulator
//!
//! One accumulator is created per run by a [`ResponseFactory`] and handed, by mutable
//! reference, to every step. The [`Treadmill`](crate::Treadmill) consults
//! [`Response::is_finished`] after each step and stops the run as soon as it reports true.
//! What "finished" means is up to the implementation; the bundled [`Reply`] considers itself
//! finished once a status code has been set.

use std::fmt;

/// The contract an accumulator type must satisfy to be driven by a treadmill.
pub trait Response: Send + 'static {
    /// The response is complete; no further step may run.
    fn is_finished(&self) -> bool;

    /// Something was written to the response, even if it is not finished.
    fn is_modified(&self) -> bool;
}

/// Creates the accumulator for each new run.
pub trait ResponseFactory<R>: Send + Sync {
    fn create(&self) -> R;
}

impl<R, F> ResponseFactory<R> for F
where
    F: Fn() -> R + Send + Sync,
{
    fn create(&self) -> R {
        self()
    }
}

/// Factory for accumulators that start from `Default`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResponses;

impl<R: Default> ResponseFactory<R> for DefaultResponses {
    fn create(&self) -> R {
        R::default()
    }
}

/// An HTTP-style response accumulator.
///
/// ```rust
/// use treadmill::{Reply, Response};
///
/// let mut reply = Reply::default();
/// reply.add_header("cache-control", "no-cache");
/// assert!(reply.is_modified() && !reply.is_finished());
///
/// reply.respond(200, "hello");
/// assert!(reply.is_finished());
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Reply {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl Reply {
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header value with the given (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Sets the status code, which finishes the reply.
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn respond(&mut self, status: u16, body: impl Into<String>) {
        self.set_body(body);
        self.set_status(status);
    }
}

impl Response for Reply {
    fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    fn is_modified(&self) -> bool {
        self.status.is_some() || self.body.is_some() || !self.headers.is_empty()
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("body_len", &self.body.as_ref().map(String::len))
            .finish()
    }
}
