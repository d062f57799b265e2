// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timers and `sleep`.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event_loop::TimerId;
use crate::op::{await_op, Op};
use crate::scheduler::{HookId, Scheduler, WeakScheduler};

struct TimerInner {
    scheduler: WeakScheduler,
    callback: Rc<dyn Fn()>,
    armed: Cell<Option<TimerId>>,
    repeat: Cell<bool>,
    hook: Cell<Option<HookId>>,
}

impl TimerInner {
    fn stop(&self) -> bool {
        let Some(id) = self.armed.take() else {
            return false;
        };
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.event_loop().cancel_timer(id),
            None => false,
        }
    }

    fn fire(&self) {
        if !self.repeat.get() {
            self.armed.set(None);
        }
        (self.callback)();
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        self.stop();
        if let (Some(hook), Some(scheduler)) = (self.hook.take(), self.scheduler.upgrade()) {
            scheduler.detach_shutdown_hook(hook);
        }
    }
}

/// Callback run by the event loop after a delay, once or repeatedly.
///
/// An active timer keeps the loop alive. Dropping the timer stops it.
pub struct Timer {
    inner: Rc<TimerInner>,
}

impl Timer {
    pub fn new(callback: impl Fn() + 'static) -> Timer {
        let scheduler = Scheduler::current();
        let inner = Rc::new(TimerInner {
            scheduler: scheduler.downgrade(),
            callback: Rc::new(callback),
            armed: Cell::new(None),
            repeat: Cell::new(false),
            hook: Cell::new(None),
        });
        let weak = Rc::downgrade(&inner);
        let hook = scheduler.register_shutdown_hook(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.hook.set(None);
                inner.stop();
            }
        });
        if !scheduler.is_disposed() {
            inner.hook.set(Some(hook));
        }
        Timer { inner }
    }

    /// Zero-delay one-shot timer, already started.
    pub fn tick(callback: impl Fn() + 'static) -> Result<Timer> {
        let timer = Timer::new(callback);
        timer.start(Duration::ZERO, false)?;
        Ok(timer)
    }

    /// Arm the timer, replacing any previous schedule. With `repeat` it
    /// fires every `delay` until stopped.
    pub fn start(&self, delay: Duration, repeat: bool) -> Result<()> {
        let scheduler = self
            .inner
            .scheduler
            .upgrade()
            .filter(|s| !s.is_disposed())
            .ok_or_else(Error::scheduler_disposed)?;
        self.inner.stop();
        self.inner.repeat.set(repeat);

        let weak: Weak<TimerInner> = Rc::downgrade(&self.inner);
        let id = scheduler.event_loop().add_timer(
            delay,
            repeat.then_some(delay),
            Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire();
                }
            }),
        );
        self.inner.armed.set(Some(id));
        Ok(())
    }

    /// Disarm the timer. Returns false if it was not armed.
    pub fn stop(&self) -> bool {
        self.inner.stop()
    }

    pub fn is_active(&self) -> bool {
        match (self.inner.armed.get(), self.inner.scheduler.upgrade()) {
            (Some(id), Some(scheduler)) => scheduler.event_loop().is_timer_armed(id),
            _ => false,
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("active", &self.is_active())
            .field("repeat", &self.inner.repeat.get())
            .finish()
    }
}

/// Suspend for `duration`.
///
/// In a foreground context the sleep keeps the event loop alive; in a
/// background context it only completes if something else does.
pub fn sleep(duration: Duration) -> Result<()> {
    let scheduler = Scheduler::current();
    let op = Op::new();
    op.keep_alive();

    let event_loop = scheduler.event_loop_rc();
    let target = op.downgrade();
    let id = event_loop.add_timer(
        duration,
        None,
        Rc::new(move || {
            if let Some(op) = target.upgrade() {
                op.finish(());
            }
        }),
    );
    event_loop.set_timer_ref(id, false);

    let result = await_op(&op);
    event_loop.cancel_timer(id);
    result
}
