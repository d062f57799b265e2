// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end behaviour of tasks, cancellation and scheduler lifecycle.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use weft_fiber::{Exit, RawFiber};
use weft_rt::{sleep, Awaitable, Context, Deferred, Error, ErrorKind, Task, TaskStatus, Timer};

#[test]
fn top_level_wait_drives_a_sleeping_task() {
    let s = common::scheduler();
    let _enter = s.enter();
    let task = Task::spawn(|| {
        sleep(Duration::from_millis(10))?;
        Ok(42)
    });
    assert_eq!(task.status(), TaskStatus::Init);
    assert_eq!(task.wait().unwrap(), 42);
    assert_eq!(task.status(), TaskStatus::Resolved);
}

#[test]
fn zero_timeout_cancels_before_anything_runs() {
    let s = common::scheduler();
    let _enter = s.enter();
    let ctx = Context::current().with_timeout(Duration::ZERO);
    assert!(ctx.is_cancelled());
    assert!(!s.event_loop().has_handles());

    let task: Task<()> = Task::spawn_with_context(ctx, || {
        let pending = Deferred::<()>::new();
        pending.awaitable().wait()
    });
    let err = task.wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.message(), "Context has been cancelled due to timeout");
    assert!(err.cause().is_none());
}

fn assert_timed_out(err: &Error) {
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.message(), "Context has been cancelled due to timeout");
    assert!(err.cause().is_none());
}

#[test]
fn timeout_expiry_cancels_a_pending_await() {
    let s = common::scheduler();
    let _enter = s.enter();
    let started = Instant::now();
    let ctx = Context::current().with_timeout(Duration::from_millis(10));
    let task: Task<()> = Task::spawn_with_context(ctx, || {
        let pending = Deferred::<()>::new();
        pending.awaitable().wait()
    });
    assert_timed_out(&task.wait().unwrap_err());
    assert!(started.elapsed() >= Duration::from_millis(10));
    assert_eq!(task.status(), TaskStatus::Failed);
    assert!(!s.event_loop().has_handles());
}

#[test]
fn timeout_expiry_cancels_a_top_level_await() {
    let s = common::scheduler();
    let _enter = s.enter();
    let started = Instant::now();
    let ctx = Context::current().with_timeout(Duration::from_millis(10));
    let pending = Deferred::<()>::new();
    let err = ctx.run(|| pending.awaitable().wait()).unwrap_err();
    assert_timed_out(&err);
    assert!(started.elapsed() >= Duration::from_millis(10));
}

#[test]
fn ancestor_timeout_reaches_an_await_in_a_child_context() {
    let s = common::scheduler();
    let _enter = s.enter();
    let timed = Context::current().with_timeout(Duration::from_millis(5));
    let (child, _handle) = timed.with_cancel();
    let task: Task<()> = Task::spawn_with_context(child, || {
        let pending = Deferred::<()>::new();
        pending.awaitable().wait()
    });
    assert_timed_out(&task.wait().unwrap_err());
}

#[test]
fn cancellation_only_lands_at_the_next_await() {
    let s = common::scheduler();
    let _enter = s.enter();
    let (ctx, handle) = Context::current().with_cancel();
    let task = Task::spawn_with_context(ctx, move || {
        handle.cancel(Some(Error::failed("stop")));
        let sum: u64 = (1..=100).sum();
        let next = sleep(Duration::from_millis(1)).unwrap_err();
        Ok((sum, next.kind(), next.cause().map(|c| c.message().to_string())))
    });
    let (sum, kind, cause) = task.wait().unwrap();
    assert_eq!(sum, 5050);
    assert_eq!(kind, ErrorKind::Cancelled);
    assert_eq!(cause.as_deref(), Some("stop"));
}

#[test]
fn child_of_cancelled_parent_is_cancelled_immediately() {
    let s = common::scheduler();
    let _enter = s.enter();
    let (parent, handle) = Context::current().with_cancel();
    handle.cancel(Some(Error::failed("boom")));

    let child = parent.with_timeout(Duration::from_secs(60));
    assert!(child.is_cancelled());
    let err = child.cancel_error().unwrap();
    assert_eq!(err.message(), "Context has been cancelled");
    assert_eq!(err.cause().unwrap().message(), "boom");
    assert!(!s.event_loop().has_handles());

    let (grandchild, _) = child.with_cancel();
    assert!(grandchild.throw_if_cancelled().is_err());
    assert!(!grandchild.shield().is_cancelled());
}

#[test]
fn dispose_fails_every_stuck_task() {
    let s = common::scheduler();
    let _enter = s.enter();
    let gate = Deferred::<u32>::new();
    let tasks: Vec<Task<u32>> = (0..3)
        .map(|_| {
            let waiting = gate.awaitable();
            Task::spawn(move || waiting.wait())
        })
        .collect();

    s.run_loop();
    assert!(tasks.iter().all(|t| t.status() == TaskStatus::Suspended));
    assert_eq!(s.pending_tasks().len(), 3);

    s.dispose();
    for task in &tasks {
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.wait().unwrap_err().kind(), ErrorKind::Disposed);
    }
    assert!(s.pending_tasks().is_empty());
    assert!(!s.event_loop().has_handles());
    drop(gate);
}

#[test]
fn top_level_await_while_loop_runs_is_rejected() {
    let s = common::scheduler();
    let _enter = s.enter();
    let seen: Rc<RefCell<Option<Result<(), ErrorKind>>>> = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&seen);
    let timer = Timer::new(move || {
        let slot = Rc::clone(&slot);
        let fiber = RawFiber::new(64 * 1024, move || {
            *slot.borrow_mut() = Some(sleep(Duration::from_millis(1)).map_err(|e| e.kind()));
            Exit::Finished
        });
        fiber.start().unwrap();
    });
    timer.start(Duration::from_millis(1), false).unwrap();
    s.run_loop();
    assert_eq!(*seen.borrow(), Some(Err(ErrorKind::SchedulerRunning)));
}

#[test]
#[should_panic(expected = "Cannot await in the scheduler's runner fiber")]
fn awaiting_on_the_runner_fiber_is_fatal() {
    let s = common::scheduler();
    let _enter = s.enter();
    let _timer = Timer::tick(|| {
        let _ = sleep(Duration::from_millis(1));
    })
    .unwrap();
    s.run_loop();
}

#[test]
fn run_returns_root_result_and_disposes() {
    let s = common::scheduler();
    let result = s.run(|| {
        let child = Task::spawn(|| {
            sleep(Duration::from_millis(2))?;
            Ok("child")
        });
        let value = child.wait()?;
        Ok(format!("{value} done"))
    });
    assert_eq!(result.unwrap(), "child done");
    assert!(s.is_disposed());
}

#[test]
fn returned_awaitables_are_flattened() {
    let s = common::scheduler();
    let _enter = s.enter();
    let inner = Task::spawn(|| {
        sleep(Duration::from_millis(1))?;
        Ok(7)
    });
    let outer: Task<i32> = Task::spawn(move || inner);
    assert_eq!(outer.wait().unwrap(), 7);
}

#[test]
fn unobserved_failure_reaches_the_error_handler() {
    let s = common::scheduler();
    let _enter = s.enter();
    let reported: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&reported);
    let ctx = Context::current().with_error_handler(move |err: &Error| {
        sink.borrow_mut().push(err.message().to_string());
        true
    });
    let task: Task<()> = Task::spawn_with_context(ctx, || Err(Error::failed("lost")));
    s.run_loop();
    assert_eq!(task.status(), TaskStatus::Failed);
    drop(task);
    assert_eq!(*reported.borrow(), vec!["lost".to_string()]);
}
