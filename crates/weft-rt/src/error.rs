// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.
//!
//! Errors are plain values. They travel through op, task and deferred
//! result slots and are only returned to user code at an await point, so
//! they are cheap to clone and carry an optional cause chain.

use std::fmt;
use std::io;
use std::rc::Rc;

use weft_fiber::FiberError;

/// Broad classification of a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A context's cancellation handler fired.
    Cancelled,
    /// The owner of a pending operation went away before completing it.
    Disposed,
    /// A channel was closed while the operation was pending.
    ChannelClosed,
    /// A watcher or other resource was closed.
    Closed,
    /// A top-level await was attempted while the loop is being driven.
    SchedulerRunning,
    /// The loop went idle before the awaited operation completed.
    NotResolved,
    /// The API was used in a way its contract forbids.
    Contract,
    /// Failure reported by the fiber layer.
    Fiber,
    /// A task body panicked.
    Panicked,
    Io,
    /// Application-level failure.
    Failed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Disposed => "disposed",
            ErrorKind::ChannelClosed => "channel closed",
            ErrorKind::Closed => "closed",
            ErrorKind::SchedulerRunning => "scheduler running",
            ErrorKind::NotResolved => "not resolved",
            ErrorKind::Contract => "contract violation",
            ErrorKind::Fiber => "fiber",
            ErrorKind::Panicked => "panicked",
            ErrorKind::Io => "io",
            ErrorKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Error value carried by ops, tasks and awaitables.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: Rc<str>,
    #[source]
    cause: Option<Box<Error>>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into().into(),
            cause: None,
        }
    }

    /// Attach `cause` as the previous error in the chain.
    pub fn with_cause(mut self, cause: Option<Error>) -> Self {
        self.cause = cause.map(Box::new);
        self
    }

    /// Application failure, the usual way for task bodies to fail.
    pub fn failed(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Failed, message)
    }

    pub fn cancelled(cause: Option<Error>) -> Self {
        Error::new(ErrorKind::Cancelled, "Context has been cancelled").with_cause(cause)
    }

    pub fn timed_out() -> Self {
        Error::new(ErrorKind::Cancelled, "Context has been cancelled due to timeout")
    }

    pub fn scheduler_disposed() -> Self {
        Error::new(ErrorKind::Disposed, "Scheduler has been disposed")
    }

    pub fn awaitable_disposed() -> Self {
        Error::new(
            ErrorKind::Disposed,
            "Awaitable has been disposed before it was resolved",
        )
    }

    pub fn channel_closed(cause: Option<Error>) -> Self {
        Error::new(ErrorKind::ChannelClosed, "Channel has been closed").with_cause(cause)
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Contract, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }

    /// This error followed by each of its causes.
    pub fn chain(&self) -> Chain<'_> {
        Chain { next: Some(self) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

/// Iterator over an error and its causes.
pub struct Chain<'a> {
    next: Option<&'a Error>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Error;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.cause();
        Some(current)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::new(ErrorKind::Io, err.to_string())
    }
}

impl From<FiberError> for Error {
    fn from(err: FiberError) -> Self {
        match err {
            FiberError::Panicked(msg) => Error::new(ErrorKind::Panicked, msg),
            other if other.is_contract_violation() => Error::contract(other.to_string()),
            FiberError::Destroyed => Error::new(ErrorKind::Disposed, "Fiber has been destroyed"),
            other => Error::new(ErrorKind::Fiber, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn cancellation_chains_cause() {
        let cause = Error::failed("boom");
        let err = Error::cancelled(Some(cause));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.to_string(), "Context has been cancelled");
        assert_eq!(err.cause().map(Error::message), Some("boom"));
        assert_eq!(err.source().map(|e| e.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn chain_walks_every_cause() {
        let err = Error::channel_closed(Some(Error::cancelled(Some(Error::failed("root")))));
        let kinds: Vec<_> = err.chain().map(Error::kind).collect();
        assert_eq!(
            kinds,
            vec![ErrorKind::ChannelClosed, ErrorKind::Cancelled, ErrorKind::Failed]
        );
    }

    #[test]
    fn timeout_has_no_cause() {
        let err = Error::timed_out();
        assert!(err.is_cancelled());
        assert!(err.cause().is_none());
    }

    #[test]
    fn fiber_errors_map_to_kinds() {
        assert_eq!(Error::from(FiberError::NotSuspended).kind(), ErrorKind::Contract);
        assert_eq!(Error::from(FiberError::Destroyed).kind(), ErrorKind::Disposed);
        assert_eq!(
            Error::from(FiberError::Panicked("x".into())).kind(),
            ErrorKind::Panicked
        );
    }

    #[test]
    fn io_errors_convert() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone"));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.message(), "pipe gone");
    }
}
