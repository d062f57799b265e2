// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks.
//!
//! A task is a callable plus the fiber it runs on. The fiber is created the
//! first time the scheduler dispatches the task, never before. While the
//! task is suspended the scheduler's suspended map owns it; the fiber body
//! itself only holds a weak reference so a task that is never resumed
//! again can still be dropped.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use weft_fiber::{Exit, FiberError, FiberId, RawFiber};

use crate::awaitable::{Awaitable, Delegate};
use crate::context::Context;
use crate::deferred::DeferredAwaitable;
use crate::error::{Error, ErrorKind, Result};
use crate::op::{await_op, Op, OpQueue, PendingOp};
use crate::scheduler::{Scheduler, WeakScheduler};

thread_local! {
    static CURRENT_TASK: RefCell<Option<Rc<dyn Schedulable>>> = const { RefCell::new(None) };
}

/// The task whose fiber is running right now.
pub(crate) fn current() -> Option<Rc<dyn Schedulable>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

pub(crate) fn swap_current(task: Option<Rc<dyn Schedulable>>) -> Option<Rc<dyn Schedulable>> {
    CURRENT_TASK.with(|c| c.replace(task))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Spawned and queued, body not started.
    Init,
    Running,
    /// Waiting for an op.
    Suspended,
    Resolved,
    Failed,
}

impl TaskStatus {
    pub fn is_done(self) -> bool {
        matches!(self, TaskStatus::Resolved | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Init => "INIT",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Suspended => "SUSPENDED",
            TaskStatus::Resolved => "RESOLVED",
            TaskStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Diagnostic snapshot of a task that has not finished yet.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub status: TaskStatus,
    pub location: &'static Location<'static>,
}

/// What the scheduler needs from a task, independent of its result type.
pub(crate) trait Schedulable {
    fn id(&self) -> TaskId;
    fn status(&self) -> TaskStatus;
    fn set_status(&self, status: TaskStatus);
    fn fiber_id(&self) -> Option<FiberId>;
    fn stack_size(&self) -> usize;
    fn location(&self) -> &'static Location<'static>;
    /// Start or resume the task's fiber until it suspends or ends.
    fn run_slice(self: Rc<Self>);
    /// Op the task is suspended on, if any.
    fn current_op(&self) -> Option<Rc<dyn PendingOp>>;
    fn set_current_op(&self, op: Option<Rc<dyn PendingOp>>);
    /// Fail a task that never started, dropping its body unrun.
    fn fail_unstarted(&self, error: Error);
}

impl TaskInfo {
    pub(crate) fn of(task: &dyn Schedulable) -> Self {
        TaskInfo {
            id: task.id(),
            status: task.status(),
            location: task.location(),
        }
    }
}

/// Values a task body may return.
///
/// A body returning another awaitable has that awaitable awaited inside
/// the task, so the task settles with the inner outcome.
pub trait IntoTaskResult<T> {
    fn into_task_result(self) -> Result<T>;
}

impl<T> IntoTaskResult<T> for Result<T> {
    fn into_task_result(self) -> Result<T> {
        self
    }
}

impl<T: Clone + 'static> IntoTaskResult<T> for Task<T> {
    fn into_task_result(self) -> Result<T> {
        self.wait()
    }
}

impl<T: Clone + 'static> IntoTaskResult<T> for DeferredAwaitable<T> {
    fn into_task_result(self) -> Result<T> {
        self.wait()
    }
}

type Body<T> = Box<dyn FnOnce() -> Result<T>>;

pub(crate) struct TaskCore<T: Clone + 'static> {
    id: TaskId,
    status: Cell<TaskStatus>,
    fiber: RefCell<Option<RawFiber>>,
    body: RefCell<Option<Body<T>>>,
    context: Context,
    continuations: OpQueue<T>,
    result: RefCell<Option<Result<T>>>,
    scheduler: WeakScheduler,
    /// Set once anything looked at the outcome.
    observed: Cell<bool>,
    current_op: RefCell<Option<Rc<dyn PendingOp>>>,
    stack_size: usize,
    location: &'static Location<'static>,
}

impl<T: Clone + 'static> TaskCore<T> {
    fn run_body(body: Body<T>) -> Result<T> {
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => result,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(Error::new(ErrorKind::Panicked, message))
            }
        }
    }

    fn take_body(&self) -> Option<Body<T>> {
        self.body.borrow_mut().take()
    }

    fn complete(&self, result: Result<T>) {
        if self.status.get().is_done() {
            return;
        }
        let status = if result.is_ok() {
            TaskStatus::Resolved
        } else {
            TaskStatus::Failed
        };
        self.status.set(status);
        *self.result.borrow_mut() = Some(result.clone());
        tracing::debug!(task = %self.id, %status, "task completed");

        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.forget_task(self.id);
        }
        self.context.run(|| match result {
            Ok(value) => self.continuations.finish_all(value),
            Err(err) => self.continuations.fail_all(&err),
        });
    }

    fn create_fiber(self: &Rc<Self>) -> RawFiber {
        let weak: Weak<Self> = Rc::downgrade(self);
        RawFiber::new(self.stack_size, move || {
            let body = match weak.upgrade() {
                Some(core) => core.take_body(),
                None => return Exit::Failed,
            };
            let result = match body {
                Some(body) => Self::run_body(body),
                None => Err(Error::contract("Task body has already been taken")),
            };
            let exit = if result.is_ok() {
                Exit::Finished
            } else {
                Exit::Failed
            };
            // Gone if the task was dropped while suspended.
            if let Some(core) = weak.upgrade() {
                core.complete(result);
            }
            exit
        })
    }

    /// Run the body on the calling fiber. Only valid from inside another
    /// task whose stack is at least as large as ours.
    fn run_inline(&self) -> Result<T> {
        tracing::trace!(task = %self.id, "running task inline");
        self.status.set(TaskStatus::Running);
        let result = match self.take_body() {
            Some(body) => self.context.run(|| Self::run_body(body)),
            None => Err(Error::contract("Task body has already been taken")),
        };
        self.complete(result.clone());
        result
    }

    fn try_inline(&self) -> Option<Result<T>> {
        if self.status.get() != TaskStatus::Init {
            return None;
        }
        let scheduler = self.scheduler.upgrade()?;
        if !scheduler.config().inline_tasks {
            return None;
        }
        let outer = current()?;
        if outer.stack_size() < self.stack_size || RawFiber::current_id() != outer.fiber_id() {
            return None;
        }
        if !scheduler.take_ready(self.id) {
            return None;
        }
        Some(self.run_inline())
    }
}

impl<T: Clone + 'static> Schedulable for TaskCore<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn status(&self) -> TaskStatus {
        self.status.get()
    }

    fn set_status(&self, status: TaskStatus) {
        self.status.set(status);
    }

    fn fiber_id(&self) -> Option<FiberId> {
        self.fiber.borrow().as_ref().map(RawFiber::id)
    }

    fn stack_size(&self) -> usize {
        self.stack_size
    }

    fn location(&self) -> &'static Location<'static> {
        self.location
    }

    fn run_slice(self: Rc<Self>) {
        let starting = match self.status.get() {
            TaskStatus::Init => true,
            TaskStatus::Suspended => false,
            status => {
                tracing::debug!(task = %self.id, %status, "skipping dispatch of task that is not runnable");
                return;
            }
        };
        if starting {
            let fiber = self.create_fiber();
            *self.fiber.borrow_mut() = Some(fiber);
            tracing::trace!(task = %self.id, "task started");
        }
        self.status.set(TaskStatus::Running);
        self.current_op.borrow_mut().take();

        let prev_task = swap_current(Some(Rc::clone(&self) as Rc<dyn Schedulable>));
        let prev_ctx = Context::swap_current(Some(self.context.clone()));
        let outcome = match self.fiber.borrow().as_ref() {
            Some(fiber) if starting => fiber.start(),
            Some(fiber) => fiber.resume(),
            None => Err(FiberError::Destroyed),
        };
        Context::swap_current(prev_ctx);
        swap_current(prev_task);

        match outcome {
            Ok(()) => {}
            Err(FiberError::Context(err)) => panic!("failed to allocate task stack: {err}"),
            Err(err) => self.complete(Err(Error::from(err))),
        }

        let finished = self
            .fiber
            .borrow()
            .as_ref()
            .map_or(true, |f| f.status().is_terminal());
        if finished {
            // Release the stack as soon as the body is done.
            self.fiber.borrow_mut().take();
            if !self.status.get().is_done() {
                self.complete(Err(Error::from(FiberError::Destroyed)));
            }
        }
    }

    fn current_op(&self) -> Option<Rc<dyn PendingOp>> {
        self.current_op.borrow().clone()
    }

    fn set_current_op(&self, op: Option<Rc<dyn PendingOp>>) {
        *self.current_op.borrow_mut() = op;
    }

    fn fail_unstarted(&self, error: Error) {
        if self.status.get() != TaskStatus::Init {
            return;
        }
        drop(self.take_body());
        self.complete(Err(error));
    }
}

impl<T: Clone + 'static> Drop for TaskCore<T> {
    fn drop(&mut self) {
        if self.status.get() != TaskStatus::Failed || self.observed.get() {
            return;
        }
        let Some(Err(err)) = self.result.get_mut().take() else {
            return;
        };
        if self.context.handle_error(&err) {
            return;
        }
        let debug = self
            .scheduler
            .upgrade()
            .is_some_and(|s| s.config().debug);
        if debug {
            tracing::warn!(
                task = %self.id,
                file = self.location.file(),
                line = self.location.line(),
                error = %err,
                "task failed and nobody awaited it"
            );
        }
    }
}

/// Handle to a spawned task.
pub struct Task<T: Clone + 'static> {
    core: Rc<TaskCore<T>>,
}

impl<T: Clone + 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: Clone + 'static> Task<T> {
    pub(crate) fn new(
        scheduler: &Scheduler,
        context: Context,
        body: Body<T>,
        location: &'static Location<'static>,
    ) -> Self {
        let core = Rc::new(TaskCore {
            id: TaskId::next(),
            status: Cell::new(TaskStatus::Init),
            fiber: RefCell::new(None),
            body: RefCell::new(Some(body)),
            context,
            continuations: OpQueue::new(),
            result: RefCell::new(None),
            scheduler: scheduler.downgrade(),
            observed: Cell::new(false),
            current_op: RefCell::new(None),
            stack_size: scheduler.config().stack_size,
            location,
        });
        tracing::debug!(task = %core.id, file = location.file(), line = location.line(), "task spawned");
        Task { core }
    }

    pub(crate) fn schedulable(&self) -> Rc<dyn Schedulable> {
        Rc::clone(&self.core) as Rc<dyn Schedulable>
    }

    pub(crate) fn fail_unstarted(&self, error: Error) {
        self.core.fail_unstarted(error);
    }

    /// Spawn `f` on the current scheduler in the current context.
    #[track_caller]
    pub fn spawn<R, F>(f: F) -> Task<T>
    where
        R: IntoTaskResult<T>,
        F: FnOnce() -> R + 'static,
    {
        Scheduler::current().spawn(f)
    }

    /// Spawn `f` on the current scheduler, running inside `context`.
    #[track_caller]
    pub fn spawn_with_context<R, F>(context: Context, f: F) -> Task<T>
    where
        R: IntoTaskResult<T>,
        F: FnOnce() -> R + 'static,
    {
        Scheduler::current().spawn_with_context(context, f)
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn status(&self) -> TaskStatus {
        self.core.status.get()
    }

    /// True until the task has resolved or failed.
    pub fn is_running(&self) -> bool {
        !self.status().is_done()
    }

    pub fn context(&self) -> &Context {
        &self.core.context
    }

    /// Where the task was spawned.
    pub fn location(&self) -> &'static Location<'static> {
        self.core.location
    }
}

impl<T: Clone + 'static> Awaitable for Task<T> {
    type Output = T;

    fn delegate(&self) -> Delegate<T> {
        self.core.observed.set(true);
        match &*self.core.result.borrow() {
            None => Delegate::Pending,
            Some(result) => result.clone().into(),
        }
    }

    fn schedule(&self, op: &Op<T>) {
        self.core.observed.set(true);
        let result = self.core.result.borrow().clone();
        match result {
            Some(Ok(value)) => {
                op.finish(value);
            }
            Some(Err(err)) => {
                op.fail(err);
            }
            None => self.core.continuations.enqueue(op.clone()),
        }
    }

    fn wait(&self) -> Result<T> {
        match self.delegate() {
            Delegate::Resolved(value) => return Ok(value),
            Delegate::Failed(err) => return Err(err),
            Delegate::Pending => {}
        }
        if let Some(result) = self.core.try_inline() {
            return result;
        }
        let op = Op::new();
        self.schedule(&op);
        await_op(&op)
    }
}

impl<T: Clone + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("status", &self.status())
            .field("file", &self.core.location.file())
            .field("line", &self.core.location.line())
            .finish()
    }
}
