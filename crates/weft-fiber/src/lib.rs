// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful fibers for the weft runtime.
//!
//! A fiber is a coroutine with its own native stack. Control moves between
//! fibers only at explicit switch points; nothing here is preemptive and
//! nothing here is `Send`.
//!
//! Layers, bottom up:
//! - stack: guarded mmap'd stacks (unix)
//! - context: the `FiberContext` switch primitive and its backends
//! - raw: untyped fibers with status tracking and panic capture
//! - fiber: typed `Fiber<In, Out>` with value passing in both directions

pub mod context;
pub mod error;
pub mod fiber;
pub mod raw;
#[cfg(unix)]
pub mod stack;

pub use context::{ContextError, DefaultContext, Entry, FiberContext};
pub use error::FiberError;
pub use fiber::{Fiber, Step, Suspender};
pub use raw::{Exit, FiberId, FiberStatus, RawFiber};

/// Default native stack size for new fibers.
pub const DEFAULT_STACK_SIZE: usize = if cfg!(target_pointer_width = "64") {
    4096 * 128
} else {
    4096 * 64
};

/// Name of the stack-switching backend compiled into this build.
pub fn backend() -> &'static str {
    DefaultContext::BACKEND
}
