// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Async operations.
//!
//! An `Op` connects a suspended awaiter to whoever eventually completes
//! the operation: an event loop callback, a channel, a cancellation
//! handler or scheduler disposal. Whichever path gets there first wins;
//! every later `finish`/`fail` is a no-op.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use weft_fiber::RawFiber;

use crate::cancel::{CancelHandler, CancelKey};
use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::scheduler::Scheduler;
use crate::task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    Running,
    Resolved,
    Failed,
}

impl OpStatus {
    pub fn is_done(self) -> bool {
        matches!(self, OpStatus::Resolved | OpStatus::Failed)
    }
}

type Callback<T> = Box<dyn FnOnce(&Op<T>)>;

struct OpInner<T> {
    status: Cell<OpStatus>,
    result: RefCell<Option<Result<T>>>,
    atomic: Cell<bool>,
    keep_alive: Cell<bool>,
    cancel: RefCell<Option<(Weak<CancelHandler>, CancelKey)>>,
    callback: RefCell<Option<Callback<T>>>,
}

/// A single pending operation producing a `T`.
pub struct Op<T> {
    inner: Rc<OpInner<T>>,
}

impl<T> Clone for Op<T> {
    fn clone(&self) -> Self {
        Op {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Op<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Op<T> {
    pub fn new() -> Self {
        Op {
            inner: Rc::new(OpInner {
                status: Cell::new(OpStatus::Pending),
                result: RefCell::new(None),
                atomic: Cell::new(false),
                keep_alive: Cell::new(false),
                cancel: RefCell::new(None),
                callback: RefCell::new(None),
            }),
        }
    }

    pub fn status(&self) -> OpStatus {
        self.inner.status.get()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_done()
    }

    /// Mark the operation as started. Purely informational.
    pub fn set_running(&self) {
        if self.status() == OpStatus::Pending {
            self.inner.status.set(OpStatus::Running);
        }
    }

    /// Opt out of cancellation: awaiting this op never registers with the
    /// context's cancellation handler.
    pub fn set_atomic(&self) -> &Self {
        self.inner.atomic.set(true);
        self
    }

    pub fn is_atomic(&self) -> bool {
        self.inner.atomic.get()
    }

    /// Let a foreground await of this op keep the event loop running.
    pub fn keep_alive(&self) -> &Self {
        self.inner.keep_alive.set(true);
        self
    }

    pub fn is_keep_alive(&self) -> bool {
        self.inner.keep_alive.get()
    }

    /// Set the completion callback, replacing any previous one. If the op
    /// is already done the callback runs immediately.
    pub fn on_complete(&self, callback: impl FnOnce(&Op<T>) + 'static) {
        if self.is_done() {
            callback(self);
        } else {
            *self.inner.callback.borrow_mut() = Some(Box::new(callback));
        }
    }

    pub fn finish(&self, value: T) -> bool {
        self.settle(OpStatus::Resolved, Ok(value))
    }

    pub fn fail(&self, error: Error) -> bool {
        self.settle(OpStatus::Failed, Err(error))
    }

    fn settle(&self, status: OpStatus, result: Result<T>) -> bool {
        if self.is_done() {
            return false;
        }
        self.inner.status.set(status);
        *self.inner.result.borrow_mut() = Some(result);
        self.detach_cancel();
        let callback = self.inner.callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback(self);
        }
        true
    }

    /// Move the result out. `None` while pending or once taken.
    pub fn take_result(&self) -> Option<Result<T>> {
        self.inner.result.borrow_mut().take()
    }

    pub(crate) fn attach_cancel(&self, handler: &Rc<CancelHandler>, key: CancelKey) {
        *self.inner.cancel.borrow_mut() = Some((Rc::downgrade(handler), key));
    }

    fn detach_cancel(&self) {
        let registration = self.inner.cancel.borrow_mut().take();
        if let Some((handler, key)) = registration {
            if let Some(handler) = handler.upgrade() {
                handler.detach(key);
            }
        }
    }

    pub fn downgrade(&self) -> WeakOp<T> {
        WeakOp {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Op<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> fmt::Debug for Op<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("status", &self.status())
            .field("atomic", &self.is_atomic())
            .field("keep_alive", &self.is_keep_alive())
            .finish()
    }
}

pub struct WeakOp<T> {
    inner: Weak<OpInner<T>>,
}

impl<T> WeakOp<T> {
    pub fn upgrade(&self) -> Option<Op<T>> {
        self.inner.upgrade().map(|inner| Op { inner })
    }
}

impl<T> Clone for WeakOp<T> {
    fn clone(&self) -> Self {
        WeakOp {
            inner: Weak::clone(&self.inner),
        }
    }
}

/// Type-erased view of an op, for code that only needs to fail it.
pub(crate) trait PendingOp {
    fn fail_op(&self, error: Error) -> bool;
}

impl<T> PendingOp for Op<T> {
    fn fail_op(&self, error: Error) -> bool {
        self.fail(error)
    }
}

/// FIFO of ops waiting on the same thing.
pub struct OpQueue<T> {
    ops: RefCell<VecDeque<Op<T>>>,
}

impl<T> Default for OpQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OpQueue<T> {
    pub fn new() -> Self {
        OpQueue {
            ops: RefCell::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, op: Op<T>) {
        debug_assert!(
            !self.ops.borrow().iter().any(|o| o.ptr_eq(&op)),
            "op queued twice"
        );
        self.ops.borrow_mut().push_back(op);
    }

    /// Next op that is still pending. Ops completed elsewhere, for example
    /// by cancellation, are dropped on the way.
    pub fn dequeue(&self) -> Option<Op<T>> {
        let mut ops = self.ops.borrow_mut();
        while let Some(op) = ops.pop_front() {
            if !op.is_done() {
                return Some(op);
            }
        }
        None
    }

    pub fn detach(&self, op: &Op<T>) -> bool {
        let mut ops = self.ops.borrow_mut();
        match ops.iter().position(|o| o.ptr_eq(op)) {
            Some(index) => {
                ops.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of ops still pending.
    pub fn len(&self) -> usize {
        self.purge();
        self.ops.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&self) {
        self.ops.borrow_mut().retain(|op| !op.is_done());
    }

    fn drain(&self) -> VecDeque<Op<T>> {
        std::mem::take(&mut *self.ops.borrow_mut())
    }

    /// Fail every queued op, in queue order.
    pub fn fail_all(&self, error: &Error) -> usize {
        self.drain()
            .into_iter()
            .filter(|op| op.fail(error.clone()))
            .count()
    }
}

impl<T: Clone> OpQueue<T> {
    /// Finish every queued op with `value`, in queue order.
    pub fn finish_all(&self, value: T) -> usize {
        self.drain()
            .into_iter()
            .filter(|op| op.finish(value.clone()))
            .count()
    }
}

impl<T> fmt::Debug for OpQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpQueue")
            .field("len", &self.ops.borrow().len())
            .finish()
    }
}

/// Suspend until `op` completes and return its result.
///
/// Inside a task this suspends the task's fiber and lets the scheduler run
/// other work. At the top level it drives the scheduler loop until the op
/// completes, or fails with `NotResolved` if the loop runs out of work
/// first.
///
/// # Panics
/// When called from the scheduler's runner fiber, i.e. from inside an
/// event loop or op callback.
pub fn await_op<T: 'static>(op: &Op<T>) -> Result<T> {
    if let Some(result) = settled(op) {
        return result;
    }

    let scheduler = Scheduler::current();
    if scheduler.is_disposed() || RawFiber::current_is_destroyed() {
        op.fail(Error::scheduler_disposed());
        return expect_result(op);
    }
    if scheduler.is_runner_fiber() {
        panic!("Cannot await in the scheduler's runner fiber");
    }

    let saved_ctx = Context::ambient();
    let ctx = Context::current();
    let current_task = task::current();
    if let Some(task) = &current_task {
        if RawFiber::current_id() != task.fiber_id() {
            return Err(Error::contract(
                "Cannot await from a fiber nested inside a task",
            ));
        }
    } else if scheduler.is_running() {
        return Err(Error::new(
            ErrorKind::SchedulerRunning,
            "Cannot dispatch tasks because the scheduler is already running",
        ));
    }

    if !op.is_atomic() {
        if let Some(handler) = ctx.cancel_handler() {
            if let Some(err) = handler.error() {
                op.fail(err);
                return expect_result(op);
            }
            let weak = op.downgrade();
            let key = handler.register(Box::new(move |err| {
                if let Some(op) = weak.upgrade() {
                    op.fail(err.clone());
                }
            }));
            op.attach_cancel(handler, key);
        }
    }

    // An armed timeout will settle the op on its own, so it keeps the
    // loop alive like a keep-alive op does.
    let timed = !op.is_atomic() && ctx.cancel_handler().is_some_and(|h| h.has_pending_timer());
    let _busy = ((op.is_keep_alive() || timed) && !ctx.is_background()).then(|| scheduler.busy_guard());

    match current_task {
        Some(task) => scheduler.suspend_task(task, op),
        None => scheduler.drive_until(op),
    }

    // Restored on our side of the switch.
    Context::swap_current(saved_ctx);
    if !op.is_done() {
        op.fail(Error::scheduler_disposed());
    }
    expect_result(op)
}

fn settled<T>(op: &Op<T>) -> Option<Result<T>> {
    op.is_done().then(|| expect_result(op))
}

fn expect_result<T>(op: &Op<T>) -> Result<T> {
    op.take_result().unwrap_or_else(|| {
        Err(Error::contract(
            "Operation result has already been consumed",
        ))
    })
}
