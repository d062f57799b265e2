// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Untyped fibers.
//!
//! A `RawFiber` owns a context, runs a boxed body on it and tracks where it
//! is in its lifecycle:
//!
//! ```text
//! Init --start--> Running --suspend--> Suspended --resume--> Running
//! Running --body returns--> Finished | Failed
//! Suspended --drop--> Dead (resumed once so the stack unwinds)
//! ```
//!
//! Every resumer switches from a private anchor context, so fibers can be
//! resumed from the thread's own stack or from inside other fibers alike.
//! The thread-local "current fiber" is swapped in before each switch and
//! put back after it, always as a pair.

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::{DefaultContext, FiberContext};
use crate::error::FiberError;

/// Fiber lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberStatus {
    /// Created, not started. No stack yet.
    Init,
    Running,
    Suspended,
    /// Body returned normally.
    Finished,
    /// Body reported failure or panicked.
    Failed,
    /// Dropped while suspended.
    Dead,
}

impl FiberStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FiberStatus::Finished | FiberStatus::Failed | FiberStatus::Dead
        )
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberStatus::Init => "INIT",
            FiberStatus::Running => "RUNNING",
            FiberStatus::Suspended => "SUSPENDED",
            FiberStatus::Finished => "FINISHED",
            FiberStatus::Failed => "FAILED",
            FiberStatus::Dead => "DEAD",
        };
        f.write_str(name)
    }
}

/// How a body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FiberId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

type Body = Box<dyn FnOnce() -> Exit>;

struct Inner {
    id: FiberId,
    status: Cell<FiberStatus>,
    /// Set before the last resume of a fiber that is being dropped.
    disposed: Cell<bool>,
    stack_size: usize,
    location: &'static Location<'static>,
    body: Cell<Option<Body>>,
    panic: Cell<Option<Box<dyn Any + Send>>>,
    ctx: UnsafeCell<DefaultContext>,
    anchor: UnsafeCell<DefaultContext>,
}

thread_local! {
    static CURRENT: Cell<*const Inner> = const { Cell::new(ptr::null()) };
}

/// Stackful coroutine running a `FnOnce() -> Exit` body.
pub struct RawFiber {
    inner: NonNull<Inner>,
}

impl RawFiber {
    /// Create a fiber. Nothing is allocated for the stack until `start`.
    #[track_caller]
    pub fn new<F>(stack_size: usize, body: F) -> Self
    where
        F: FnOnce() -> Exit + 'static,
    {
        let inner = Box::new(Inner {
            id: FiberId::next(),
            status: Cell::new(FiberStatus::Init),
            disposed: Cell::new(false),
            stack_size,
            location: Location::caller(),
            body: Cell::new(Some(Box::new(body))),
            panic: Cell::new(None),
            ctx: UnsafeCell::new(DefaultContext::create()),
            anchor: UnsafeCell::new(DefaultContext::create_root()),
        });
        tracing::trace!(fiber = %inner.id, file = inner.location.file(), line = inner.location.line(), "fiber created");
        RawFiber {
            inner: NonNull::from(Box::leak(inner)),
        }
    }

    fn inner(&self) -> &Inner {
        unsafe { self.inner.as_ref() }
    }

    pub fn id(&self) -> FiberId {
        self.inner().id
    }

    pub fn status(&self) -> FiberStatus {
        self.inner().status.get()
    }

    pub fn stack_size(&self) -> usize {
        self.inner().stack_size
    }

    /// Where the fiber was created.
    pub fn location(&self) -> &'static Location<'static> {
        self.inner().location
    }

    /// Allocate the stack and run the body until it first suspends or ends.
    pub fn start(&self) -> Result<(), FiberError> {
        let inner = self.inner.as_ptr();
        unsafe {
            if (*inner).status.get() != FiberStatus::Init {
                return Err(FiberError::AlreadyStarted);
            }
            (*(*inner).ctx.get()).init(fiber_entry, inner as *mut c_void, (*inner).stack_size)?;
        }
        self.switch_in()
    }

    /// Continue a suspended fiber until it suspends again or ends.
    pub fn resume(&self) -> Result<(), FiberError> {
        if self.status() != FiberStatus::Suspended {
            return Err(FiberError::NotSuspended);
        }
        self.switch_in()
    }

    fn switch_in(&self) -> Result<(), FiberError> {
        let inner = self.inner.as_ptr();
        unsafe {
            (*inner).status.set(FiberStatus::Running);
            let prev = CURRENT.with(|c| c.replace(inner));
            DefaultContext::switch((*inner).anchor.get(), (*inner).ctx.get());
            CURRENT.with(|c| c.set(prev));

            if let Some(payload) = (*inner).panic.take() {
                return Err(FiberError::Panicked(panic_message(&*payload)));
            }
        }
        Ok(())
    }

    /// Suspend the fiber that is running right now and hand control back to
    /// whoever resumed it.
    ///
    /// Returns `Err(Destroyed)` if the fiber is being dropped; the body is
    /// expected to unwind and return at that point.
    pub fn suspend() -> Result<(), FiberError> {
        let inner = CURRENT.with(Cell::get);
        if inner.is_null() {
            return Err(FiberError::NotInFiber);
        }
        unsafe {
            if (*inner).disposed.get() {
                return Err(FiberError::Destroyed);
            }
            (*inner).status.set(FiberStatus::Suspended);
            DefaultContext::yield_to_caller((*inner).ctx.get());
            if (*inner).disposed.get() {
                return Err(FiberError::Destroyed);
            }
        }
        Ok(())
    }

    /// Id of the fiber running on this thread, if any.
    pub fn current_id() -> Option<FiberId> {
        let inner = CURRENT.with(Cell::get);
        if inner.is_null() {
            None
        } else {
            Some(unsafe { (*inner).id })
        }
    }

    pub fn in_fiber() -> bool {
        !CURRENT.with(Cell::get).is_null()
    }

    /// True while the running fiber is unwinding because it is being
    /// dropped. Any further `suspend` returns `Err(Destroyed)`.
    pub fn current_is_destroyed() -> bool {
        let inner = CURRENT.with(Cell::get);
        !inner.is_null() && unsafe { (*inner).disposed.get() }
    }
}

unsafe extern "C" fn fiber_entry(arg: *mut c_void) -> ! {
    let inner = arg as *const Inner;

    let outcome = match (*inner).body.take() {
        Some(body) => panic::catch_unwind(AssertUnwindSafe(body)),
        None => Ok(Exit::Failed),
    };
    let status = match outcome {
        Ok(Exit::Finished) => FiberStatus::Finished,
        Ok(Exit::Failed) => FiberStatus::Failed,
        Err(payload) => {
            (*inner).panic.set(Some(payload));
            FiberStatus::Failed
        }
    };
    (*inner).status.set(status);
    tracing::trace!(fiber = %(*inner).id, %status, "fiber returned");

    DefaultContext::yield_to_caller((*inner).ctx.get());

    // Nothing switches into a fiber after its body has returned.
    std::process::abort()
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for RawFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFiber")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("file", &self.location().file())
            .field("line", &self.location().line())
            .finish()
    }
}

impl Drop for RawFiber {
    fn drop(&mut self) {
        let inner = self.inner();
        match inner.status.get() {
            FiberStatus::Suspended => {
                inner.disposed.set(true);
                if let Err(err) = self.switch_in() {
                    tracing::debug!(fiber = %inner.id, error = %err, "fiber failed while unwinding");
                }
                if !inner.status.get().is_terminal() {
                    tracing::warn!(
                        fiber = %inner.id,
                        file = inner.location.file(),
                        line = inner.location.line(),
                        "fiber did not return after being destroyed; its stack is released anyway"
                    );
                }
                inner.status.set(FiberStatus::Dead);
            }
            FiberStatus::Running => {
                // Releasing the stack we are standing on cannot end well.
                tracing::error!(fiber = %inner.id, "running fiber dropped");
                std::process::abort();
            }
            _ => {}
        }
        unsafe { drop(Box::from_raw(self.inner.as_ptr())) };
    }
}
