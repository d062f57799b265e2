// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded task scheduler.
//!
//! The scheduler owns the ready queue, the event loop and a dedicated
//! runner fiber. Driving the scheduler switches into the runner, which
//! alternates between dispatching every ready task and running one event
//! loop iteration until nothing foreground is left to wait for. Awaits in
//! tasks suspend the task's fiber back into the runner; awaits at the top
//! level drive the runner until their op settles.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::Location;
use std::rc::{Rc, Weak};

use weft_fiber::{Exit, FiberStatus, RawFiber};

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::event_loop::EventLoop;
use crate::op::{Op, PendingOp};
use crate::task::{self, IntoTaskResult, Schedulable, Task, TaskId, TaskInfo, TaskStatus};

/// Scheduler slot that is leaked rather than dropped at thread exit.
/// Disposing runs fibers, and other thread locals may already be gone by
/// then.
struct Slot(RefCell<Option<Scheduler>>);

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(scheduler) = self.0.get_mut().take() {
            std::mem::forget(scheduler);
        }
    }
}

/// Schedulers made ambient by `register`, each with the ambient scheduler
/// it replaced. Leaked at thread exit like `Slot`.
struct Registry(RefCell<Vec<(Scheduler, Option<Scheduler>)>>);

impl Drop for Registry {
    fn drop(&mut self) {
        std::mem::forget(std::mem::take(self.0.get_mut()));
    }
}

thread_local! {
    static AMBIENT: Slot = const { Slot(RefCell::new(None)) };
    static DEFAULT: Slot = const { Slot(RefCell::new(None)) };
    static REGISTERED: Registry = const { Registry(RefCell::new(Vec::new())) };
}

/// Key of a registered shutdown hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

type Hook = Box<dyn FnOnce(&Error)>;

struct Inner {
    config: Config,
    event_loop: Rc<EventLoop>,
    ready: RefCell<VecDeque<Rc<dyn Schedulable>>>,
    /// Tasks parked on an op. This map owns them until they are woken.
    suspended: RefCell<BTreeMap<TaskId, Rc<dyn Schedulable>>>,
    tasks: RefCell<BTreeMap<TaskId, Weak<dyn Schedulable>>>,
    running: Cell<bool>,
    dispatching: Cell<bool>,
    disposed: Cell<bool>,
    /// Set when the op a top-level await is driving for settles.
    stop: Cell<bool>,
    hooks: RefCell<BTreeMap<HookId, Hook>>,
    next_hook: Cell<u64>,
    /// Ops awaited from the top level.
    pending_ops: RefCell<Vec<Rc<dyn PendingOp>>>,
    /// Foreground awaits that keep the loop alive.
    busy: Cell<usize>,
    runner: RefCell<Option<Rc<RawFiber>>>,
}

impl Inner {
    fn wake(&self, id: TaskId) {
        let task = self.suspended.borrow_mut().remove(&id);
        if let Some(task) = task {
            tracing::trace!(task = %id, "task woken");
            self.ready.borrow_mut().push_back(task);
        }
    }

    fn busy_exit(&self) {
        self.busy.set(self.busy.get().saturating_sub(1));
    }

    fn loop_alive(&self) -> bool {
        self.event_loop.has_handles() && (self.busy.get() > 0 || self.event_loop.has_refs())
    }

    /// Dispatch every task that is ready right now, in queue order. Tasks
    /// woken during the round wait for the next one.
    fn dispatch_ready(&self) -> usize {
        let batch: Vec<_> = self.ready.borrow_mut().drain(..).collect();
        self.dispatch(batch)
    }

    fn dispatch(&self, batch: Vec<Rc<dyn Schedulable>>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();
        tracing::trace!(tasks = count, "dispatch round");
        let was_dispatching = self.dispatching.replace(true);
        for task in batch {
            task.run_slice();
        }
        self.dispatching.set(was_dispatching);
        count
    }

    /// Body of the runner: dispatch and poll until idle or stopped.
    fn run_rounds(&self) {
        loop {
            self.dispatch_ready();
            if self.stop.replace(false) {
                break;
            }
            let idle = self.ready.borrow().is_empty();
            if idle && !self.loop_alive() {
                break;
            }
            if let Err(err) = self.event_loop.run_once(idle) {
                tracing::error!(error = %err, "event loop poll failed");
                break;
            }
        }
    }
}

fn runner_body(weak: Weak<Inner>) -> Exit {
    loop {
        match weak.upgrade() {
            Some(inner) => inner.run_rounds(),
            None => return Exit::Finished,
        }
        if RawFiber::suspend().is_err() {
            return Exit::Finished;
        }
    }
}

/// Handle to a scheduler. Clones share the same scheduler; dropping the
/// last handle disposes it.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakScheduler {
    inner: Weak<Inner>,
}

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.inner.upgrade().map(|inner| Scheduler { inner })
    }
}

/// Restores the previous ambient scheduler when dropped.
#[must_use = "the scheduler is only ambient while the guard is alive"]
pub struct EnterGuard {
    prev: Option<Scheduler>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        AMBIENT.with(|slot| *slot.0.borrow_mut() = prev);
    }
}

/// Holds the loop alive while it exists.
pub struct BusyGuard {
    inner: Weak<Inner>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.busy_exit();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Scheduler configured from the environment. Invalid settings are
    /// logged and replaced by the defaults.
    pub fn new() -> Self {
        let config = Config::from_env().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring invalid runtime configuration");
            Config::default()
        });
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Self {
        let event_loop = EventLoop::new().expect("failed to create epoll reactor");
        tracing::debug!(?config, "scheduler created");
        Scheduler {
            inner: Rc::new(Inner {
                config,
                event_loop: Rc::new(event_loop),
                ready: RefCell::new(VecDeque::new()),
                suspended: RefCell::new(BTreeMap::new()),
                tasks: RefCell::new(BTreeMap::new()),
                running: Cell::new(false),
                dispatching: Cell::new(false),
                disposed: Cell::new(false),
                stop: Cell::new(false),
                hooks: RefCell::new(BTreeMap::new()),
                next_hook: Cell::new(1),
                pending_ops: RefCell::new(Vec::new()),
                busy: Cell::new(0),
                runner: RefCell::new(None),
            }),
        }
    }

    /// The ambient scheduler, or this thread's default one, created on
    /// first use.
    pub fn current() -> Scheduler {
        if let Some(scheduler) = AMBIENT.with(|slot| slot.0.borrow().clone()) {
            return scheduler;
        }
        DEFAULT.with(|slot| {
            slot.0
                .borrow_mut()
                .get_or_insert_with(Scheduler::new)
                .clone()
        })
    }

    /// Make this the ambient scheduler until the guard is dropped.
    pub fn enter(&self) -> EnterGuard {
        let prev = AMBIENT.with(|slot| slot.0.replace(Some(self.clone())));
        EnterGuard { prev }
    }

    /// Make this the ambient scheduler until it is unregistered.
    /// Registrations nest: each one remembers the scheduler it replaced.
    pub fn register(&self) {
        let prev = AMBIENT.with(|slot| slot.0.replace(Some(self.clone())));
        let depth = REGISTERED.with(|stack| {
            let mut stack = stack.0.borrow_mut();
            stack.push((self.clone(), prev));
            stack.len()
        });
        tracing::debug!(depth, "scheduler registered");
    }

    /// Undo the latest `register`, restoring the scheduler it replaced,
    /// and dispose this one.
    ///
    /// Fails unless this is the most recently registered scheduler.
    pub fn unregister(&self) -> crate::Result<()> {
        let popped = REGISTERED.with(|stack| {
            let mut stack = stack.0.borrow_mut();
            match stack.last() {
                Some((top, _)) if Rc::ptr_eq(&top.inner, &self.inner) => stack.pop(),
                _ => None,
            }
        });
        let Some((_, prev)) = popped else {
            return Err(Error::contract(
                "Cannot unregister task scheduler because it is not the active scheduler",
            ));
        };
        AMBIENT.with(|slot| *slot.0.borrow_mut() = prev);
        self.dispose();
        Ok(())
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub(crate) fn event_loop_rc(&self) -> Rc<EventLoop> {
        Rc::clone(&self.inner.event_loop)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// True while the loop is being driven.
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub(crate) fn is_runner_fiber(&self) -> bool {
        let Some(current) = RawFiber::current_id() else {
            return false;
        };
        self.inner
            .runner
            .borrow()
            .as_ref()
            .is_some_and(|runner| runner.id() == current)
    }

    /// Spawn `f` in the current context.
    #[track_caller]
    pub fn spawn<T, R, F>(&self, f: F) -> Task<T>
    where
        T: Clone + 'static,
        R: IntoTaskResult<T>,
        F: FnOnce() -> R + 'static,
    {
        self.spawn_with_context(Context::current(), f)
    }

    #[track_caller]
    pub fn spawn_with_context<T, R, F>(&self, context: Context, f: F) -> Task<T>
    where
        T: Clone + 'static,
        R: IntoTaskResult<T>,
        F: FnOnce() -> R + 'static,
    {
        let task = Task::new(
            self,
            context,
            Box::new(move || f().into_task_result()),
            Location::caller(),
        );
        if self.is_disposed() {
            task.fail_unstarted(Error::scheduler_disposed());
            return task;
        }
        let schedulable = task.schedulable();
        self.inner
            .tasks
            .borrow_mut()
            .insert(schedulable.id(), Rc::downgrade(&schedulable));
        self.inner.ready.borrow_mut().push_back(schedulable);
        task
    }

    /// Spawn `f` as the root task, wait for it, then dispose.
    #[track_caller]
    pub fn run<T, R, F>(&self, f: F) -> crate::Result<T>
    where
        T: Clone + 'static,
        R: IntoTaskResult<T>,
        F: FnOnce() -> R + 'static,
    {
        use crate::awaitable::Awaitable;

        let _enter = self.enter();
        let task = self.spawn(f);
        let result = task.wait();
        self.dispose();
        result
    }

    /// Like `run`, with the root task running in `context`.
    #[track_caller]
    pub fn run_with_context<T, R, F>(&self, context: Context, f: F) -> crate::Result<T>
    where
        T: Clone + 'static,
        R: IntoTaskResult<T>,
        F: FnOnce() -> R + 'static,
    {
        use crate::awaitable::Awaitable;

        let _enter = self.enter();
        let task = self.spawn_with_context(context, f);
        let result = task.wait();
        self.dispose();
        result
    }

    /// Drive the loop until no ready task and nothing keeping the event
    /// loop alive is left.
    ///
    /// # Panics
    /// If the loop is already being driven, or when called from a task.
    pub fn run_loop(&self) {
        self.inner.stop.set(false);
        self.drive();
    }

    fn runner_fiber(&self) -> Rc<RawFiber> {
        let mut slot = self.inner.runner.borrow_mut();
        if let Some(runner) = slot.as_ref() {
            if !runner.status().is_terminal() {
                return Rc::clone(runner);
            }
        }
        let weak = Rc::downgrade(&self.inner);
        let runner = Rc::new(RawFiber::new(self.inner.config.stack_size, move || {
            runner_body(weak)
        }));
        tracing::debug!(fiber = %runner.id(), "runner fiber created");
        *slot = Some(Rc::clone(&runner));
        runner
    }

    fn drive(&self) {
        if self.inner.dispatching.get() {
            panic!("Cannot run loop while dispatching");
        }
        if self.inner.running.replace(true) {
            panic!("Duplicate scheduler loop run detected");
        }
        let runner = self.runner_fiber();
        let outcome = match runner.status() {
            FiberStatus::Init => runner.start(),
            _ => runner.resume(),
        };
        self.inner.running.set(false);
        if let Err(err) = outcome {
            panic!("scheduler runner failed: {err}");
        }
    }

    /// Remove a task that has not started from the ready queue. Returns
    /// false if it is not queued.
    pub(crate) fn take_ready(&self, id: TaskId) -> bool {
        let mut ready = self.inner.ready.borrow_mut();
        match ready.iter().position(|t| t.id() == id) {
            Some(index) => {
                ready.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget_task(&self, id: TaskId) {
        self.inner.tasks.borrow_mut().remove(&id);
    }

    /// Park `task` until `op` settles. Called on the task's own fiber.
    pub(crate) fn suspend_task<T: 'static>(&self, task: Rc<dyn Schedulable>, op: &Op<T>) {
        let id = task.id();
        let weak = Rc::downgrade(&self.inner);
        op.on_complete(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.wake(id);
            }
        });
        if op.is_done() {
            return;
        }
        task.set_current_op(Some(Rc::new(op.clone())));
        task.set_status(TaskStatus::Suspended);
        self.inner
            .suspended
            .borrow_mut()
            .insert(id, Rc::clone(&task));
        drop(task);

        tracing::trace!(task = %id, "task suspended");
        if let Err(err) = RawFiber::suspend() {
            tracing::debug!(task = %id, error = %err, "task fiber destroyed while suspended");
        }
        if let Some(task) = task::current() {
            task.set_current_op(None);
        }
    }

    /// Drive the loop from the top level until `op` settles. Fails the op
    /// with `NotResolved` if the loop runs dry first.
    pub(crate) fn drive_until<T: 'static>(&self, op: &Op<T>) {
        self.inner.stop.set(false);
        let weak = Rc::downgrade(&self.inner);
        op.on_complete(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.stop.set(true);
            }
        });
        if op.is_done() {
            return;
        }
        let pending: Rc<dyn PendingOp> = Rc::new(op.clone());
        self.inner
            .pending_ops
            .borrow_mut()
            .push(Rc::clone(&pending));
        self.drive();
        self.inner
            .pending_ops
            .borrow_mut()
            .retain(|p| !Rc::ptr_eq(p, &pending));
        if !op.is_done() {
            op.fail(Error::new(
                ErrorKind::NotResolved,
                "Awaitable has not been resolved",
            ));
        }
    }

    /// Register `hook` to run with the disposal error when the scheduler
    /// is disposed. Runs right away if it already is.
    pub fn register_shutdown_hook(&self, hook: impl FnOnce(&Error) + 'static) -> HookId {
        let id = HookId(self.inner.next_hook.get());
        self.inner.next_hook.set(id.0 + 1);
        if self.is_disposed() {
            hook(&Error::scheduler_disposed());
        } else {
            self.inner.hooks.borrow_mut().insert(id, Box::new(hook));
        }
        id
    }

    pub fn detach_shutdown_hook(&self, id: HookId) -> bool {
        self.inner.hooks.borrow_mut().remove(&id).is_some()
    }

    pub fn busy_enter(&self) {
        self.inner.busy.set(self.inner.busy.get() + 1);
    }

    pub fn busy_exit(&self) {
        self.inner.busy_exit();
    }

    /// `busy_enter` now, `busy_exit` when the guard drops.
    pub fn busy_guard(&self) -> BusyGuard {
        self.busy_enter();
        BusyGuard {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Tasks that have not finished yet, in spawn order.
    pub fn pending_tasks(&self) -> Vec<TaskInfo> {
        self.inner
            .tasks
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|t| !t.status().is_done())
            .map(|t| TaskInfo::of(&*t))
            .collect()
    }

    /// Number of live tasks that have not finished.
    pub fn count(&self) -> usize {
        self.pending_tasks().len()
    }

    /// Tear the scheduler down.
    ///
    /// Fails every top-level await and every op a task is suspended on
    /// with the disposal error, fires the shutdown hooks, fails tasks that
    /// never started, and keeps resuming tasks until none can make
    /// progress. Safe to call more than once.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        let error = Error::scheduler_disposed();
        tracing::debug!(
            ready = self.inner.ready.borrow().len(),
            suspended = self.inner.suspended.borrow().len(),
            hooks = self.inner.hooks.borrow().len(),
            "disposing scheduler"
        );

        if std::thread::panicking() {
            self.dispose_without_fibers(&error);
            return;
        }

        loop {
            let mut progressed = false;

            let pending = std::mem::take(&mut *self.inner.pending_ops.borrow_mut());
            for op in pending {
                progressed |= op.fail_op(error.clone());
            }

            let hooks = std::mem::take(&mut *self.inner.hooks.borrow_mut());
            for (_, hook) in hooks {
                hook(&error);
                progressed = true;
            }

            let suspended: Vec<_> = self.inner.suspended.borrow().values().cloned().collect();
            for task in suspended {
                if let Some(op) = task.current_op() {
                    progressed |= op.fail_op(error.clone());
                }
            }

            let ready: Vec<_> = self.inner.ready.borrow_mut().drain(..).collect();
            let mut resumable = Vec::with_capacity(ready.len());
            for task in ready {
                if task.status() == TaskStatus::Init {
                    task.fail_unstarted(error.clone());
                    progressed = true;
                } else {
                    resumable.push(task);
                }
            }

            if self.inner.dispatch(resumable) == 0 && !progressed {
                break;
            }
        }

        let stuck = std::mem::take(&mut *self.inner.suspended.borrow_mut());
        if !stuck.is_empty() {
            tracing::warn!(tasks = stuck.len(), "tasks still suspended after disposal");
        }
        drop(stuck);
        self.inner.event_loop.close_all();
        tracing::debug!("scheduler disposed");
    }

    /// Disposal while unwinding: settle what can be settled, run no fiber.
    fn dispose_without_fibers(&self, error: &Error) {
        let pending = std::mem::take(&mut *self.inner.pending_ops.borrow_mut());
        for op in pending {
            op.fail_op(error.clone());
        }
        let hooks = std::mem::take(&mut *self.inner.hooks.borrow_mut());
        for (_, hook) in hooks {
            hook(error);
        }
        // Dropping these would resume their fibers.
        std::mem::forget(std::mem::take(&mut *self.inner.suspended.borrow_mut()));
        std::mem::forget(std::mem::take(&mut *self.inner.ready.borrow_mut()));
        self.inner.event_loop.close_all();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            self.dispose();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("ready", &self.inner.ready.borrow().len())
            .field("suspended", &self.inner.suspended.borrow().len())
            .field("running", &self.inner.running.get())
            .field("disposed", &self.inner.disposed.get())
            .field("busy", &self.inner.busy.get())
            .finish()
    }
}
