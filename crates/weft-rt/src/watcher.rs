// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness watcher for a non-blocking descriptor.
//!
//! The watcher does not own the descriptor. Epoll interest follows the
//! waiters: it covers reads while someone awaits readability, writes while
//! someone awaits writability, and the descriptor is unwatched once nobody
//! waits at all.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::error::{Error, ErrorKind, Result};
use crate::event_loop::{set_nonblocking, EventLoop, Interest, Readiness};
use crate::op::{await_op, Op, OpQueue};
use crate::scheduler::{HookId, Scheduler, WeakScheduler};

struct Inner {
    fd: RawFd,
    event_loop: Rc<EventLoop>,
    readers: OpQueue<()>,
    writers: OpQueue<()>,
    closed: RefCell<Option<Error>>,
    scheduler: WeakScheduler,
    hook: Cell<Option<HookId>>,
}

impl Inner {
    fn on_ready(self: &Rc<Self>, readiness: Readiness) {
        if readiness.readable || readiness.hangup {
            self.readers.finish_all(());
        }
        if readiness.writable || readiness.hangup {
            self.writers.finish_all(());
        }
        if let Err(err) = self.update_interest() {
            tracing::debug!(fd = self.fd, error = %err, "failed to update watch interest");
        }
    }

    fn update_interest(self: &Rc<Self>) -> std::io::Result<()> {
        let wanted = Interest::from_flags(!self.readers.is_empty(), !self.writers.is_empty());
        if wanted == self.event_loop.watched_interest(self.fd) {
            return Ok(());
        }
        let Some(interest) = wanted else {
            return self.event_loop.unwatch(self.fd);
        };
        let weak: Weak<Inner> = Rc::downgrade(self);
        self.event_loop.watch(
            self.fd,
            interest,
            Rc::new(move |readiness| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_ready(readiness);
                }
            }),
        )
    }

    fn close(&self, cause: Option<Error>) -> bool {
        if self.closed.borrow().is_some() {
            return false;
        }
        let error = Error::new(ErrorKind::Closed, "Stream watcher has been closed").with_cause(cause);
        *self.closed.borrow_mut() = Some(error.clone());
        if let (Some(hook), Some(scheduler)) = (self.hook.take(), self.scheduler.upgrade()) {
            scheduler.detach_shutdown_hook(hook);
        }
        self.readers.fail_all(&error);
        self.writers.fail_all(&error);
        if let Err(err) = self.event_loop.unwatch(self.fd) {
            tracing::debug!(fd = self.fd, error = %err, "failed to unwatch closed stream");
        }
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(err) = self.event_loop.unwatch(self.fd) {
            tracing::debug!(fd = self.fd, error = %err, "failed to unwatch dropped stream");
        }
        if let (Some(hook), Some(scheduler)) = (self.hook.take(), self.scheduler.upgrade()) {
            scheduler.detach_shutdown_hook(hook);
        }
    }
}

/// Awaits readability and writability of a descriptor.
pub struct StreamWatcher {
    inner: Rc<Inner>,
}

impl StreamWatcher {
    /// Watch `fd`, switching it to non-blocking mode.
    pub fn new(fd: RawFd) -> Result<StreamWatcher> {
        set_nonblocking(fd)?;
        let scheduler = Scheduler::current();
        let inner = Rc::new(Inner {
            fd,
            event_loop: scheduler.event_loop_rc(),
            readers: OpQueue::new(),
            writers: OpQueue::new(),
            closed: RefCell::new(None),
            scheduler: scheduler.downgrade(),
            hook: Cell::new(None),
        });
        let weak = Rc::downgrade(&inner);
        let hook = scheduler.register_shutdown_hook(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.hook.set(None);
                inner.close(Some(err.clone()));
            }
        });
        if inner.closed.borrow().is_none() {
            inner.hook.set(Some(hook));
        }
        Ok(StreamWatcher { inner })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn await_readable(&self) -> Result<()> {
        self.await_ready(true)
    }

    pub fn await_writable(&self) -> Result<()> {
        self.await_ready(false)
    }

    fn await_ready(&self, read: bool) -> Result<()> {
        if let Some(err) = self.inner.closed.borrow().clone() {
            return Err(err);
        }
        let queue = if read {
            &self.inner.readers
        } else {
            &self.inner.writers
        };
        let op = Op::new();
        op.keep_alive();
        queue.enqueue(op.clone());
        if let Err(err) = self.inner.update_interest() {
            queue.detach(&op);
            return Err(err.into());
        }

        let result = await_op(&op);
        if result.is_err() {
            queue.detach(&op);
            if let Err(err) = self.inner.update_interest() {
                tracing::debug!(fd = self.inner.fd, error = %err, "failed to update watch interest");
            }
        }
        result
    }

    /// Fail every waiter and stop watching. The descriptor stays open.
    pub fn close(&self, cause: Option<Error>) -> bool {
        self.inner.close(cause)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }
}

impl fmt::Debug for StreamWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWatcher")
            .field("fd", &self.inner.fd)
            .field("readers", &self.inner.readers.len())
            .field("writers", &self.inner.writers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
