// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Signal watcher on top of signalfd.
//!
//! The signal is blocked for the calling thread when the watcher is
//! created and stays blocked after it is dropped, so a signal arriving
//! later is not handled by its default action.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::error::{Error, ErrorKind, Result};
use crate::event_loop::{EventLoop, Interest, Readiness};
use crate::op::{await_op, Op, OpQueue};
use crate::scheduler::{HookId, Scheduler, WeakScheduler};

/// Highest signal number accepted, covering the real-time range.
const MAX_SIGNAL: i32 = 64;

struct Inner {
    signum: i32,
    fd: RawFd,
    event_loop: Rc<EventLoop>,
    waiters: OpQueue<i32>,
    closed: RefCell<Option<Error>>,
    scheduler: WeakScheduler,
    hook: Cell<Option<HookId>>,
}

impl Inner {
    /// Drain queued deliveries. Returns how many were read.
    fn drain(&self) -> io::Result<usize> {
        let mut count = 0;
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let size = mem::size_of::<libc::signalfd_siginfo>();
            let n = unsafe { libc::read(self.fd, (&mut info as *mut libc::signalfd_siginfo).cast(), size) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(count);
                }
                return Err(err);
            }
            if n as usize != size {
                return Ok(count);
            }
            count += 1;
        }
    }

    fn on_readable(self: &Rc<Self>) {
        match self.drain() {
            Ok(0) => {}
            Ok(count) => {
                tracing::debug!(signal = self.signum, count, "signal received");
                self.waiters.finish_all(self.signum);
            }
            Err(err) => {
                self.waiters.fail_all(&Error::from(err));
            }
        }
        if self.waiters.is_empty() {
            if let Err(err) = self.event_loop.unwatch(self.fd) {
                tracing::debug!(fd = self.fd, error = %err, "failed to unwatch signalfd");
            }
        }
    }

    fn watch(self: &Rc<Self>) -> io::Result<()> {
        if self.event_loop.watched_interest(self.fd).is_some() {
            return Ok(());
        }
        let weak: Weak<Inner> = Rc::downgrade(self);
        self.event_loop.watch(
            self.fd,
            Interest::Readable,
            Rc::new(move |_: Readiness| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_readable();
                }
            }),
        )
    }

    fn close(&self, cause: Option<Error>) -> bool {
        if self.closed.borrow().is_some() {
            return false;
        }
        let error = Error::new(ErrorKind::Closed, "Signal watcher has been closed").with_cause(cause);
        *self.closed.borrow_mut() = Some(error.clone());
        if let (Some(hook), Some(scheduler)) = (self.hook.take(), self.scheduler.upgrade()) {
            scheduler.detach_shutdown_hook(hook);
        }
        self.waiters.fail_all(&error);
        if let Err(err) = self.event_loop.unwatch(self.fd) {
            tracing::debug!(fd = self.fd, error = %err, "failed to unwatch signalfd");
        }
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(err) = self.event_loop.unwatch(self.fd) {
            tracing::debug!(fd = self.fd, error = %err, "failed to unwatch signalfd");
        }
        if let (Some(hook), Some(scheduler)) = (self.hook.take(), self.scheduler.upgrade()) {
            scheduler.detach_shutdown_hook(hook);
        }
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Awaits deliveries of one signal.
///
/// Only one watcher per signal should exist per process: every signalfd
/// for a signal sees the same pending delivery and whichever is read first
/// consumes it.
pub struct SignalWatcher {
    inner: Rc<Inner>,
}

impl SignalWatcher {
    /// True if `signum` can be watched. `SIGKILL` and `SIGSTOP` cannot.
    pub fn is_supported(signum: i32) -> bool {
        (1..=MAX_SIGNAL).contains(&signum) && signum != libc::SIGKILL && signum != libc::SIGSTOP
    }

    pub fn new(signum: i32) -> Result<SignalWatcher> {
        if !Self::is_supported(signum) {
            return Err(Error::contract(format!("Signal {signum} is not supported")));
        }
        let fd = unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, signum);
            let ret = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret).into());
            }
            libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let scheduler = Scheduler::current();
        let inner = Rc::new(Inner {
            signum,
            fd,
            event_loop: scheduler.event_loop_rc(),
            waiters: OpQueue::new(),
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
        tracing::debug!(signal = signum, fd, "signal watcher created");
        Ok(SignalWatcher { inner })
    }

    pub fn signum(&self) -> i32 {
        self.inner.signum
    }

    /// Suspend until the signal is delivered. Returns the signal number.
    pub fn await_signal(&self) -> Result<i32> {
        if let Some(err) = self.inner.closed.borrow().clone() {
            return Err(err);
        }
        let op = Op::new();
        op.keep_alive();
        self.inner.waiters.enqueue(op.clone());
        if let Err(err) = self.inner.watch() {
            self.inner.waiters.detach(&op);
            return Err(err.into());
        }
        let result = await_op(&op);
        if result.is_err() {
            self.inner.waiters.detach(&op);
        }
        result
    }

    pub fn close(&self, cause: Option<Error>) -> bool {
        self.inner.close(cause)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }
}

impl fmt::Debug for SignalWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalWatcher")
            .field("signum", &self.inner.signum)
            .field("waiters", &self.inner.waiters.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_signals() {
        assert!(SignalWatcher::is_supported(libc::SIGUSR1));
        assert!(SignalWatcher::is_supported(libc::SIGINT));
        assert!(!SignalWatcher::is_supported(libc::SIGKILL));
        assert!(!SignalWatcher::is_supported(libc::SIGSTOP));
        assert!(!SignalWatcher::is_supported(0));
        assert!(!SignalWatcher::is_supported(65));
    }

    #[test]
    fn unsupported_signal_is_rejected() {
        let err = SignalWatcher::new(libc::SIGKILL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Contract);
    }
}
