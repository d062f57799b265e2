// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Signal delivery through signalfd.
//!
//! `raise` targets the calling thread, and the watcher blocks the signal
//! only on that thread, so tests running in parallel do not see each
//! other's signals. Each test uses its own signal number.

mod common;

use std::rc::Rc;
use std::time::Duration;

use weft_rt::{sleep, Awaitable, Error, ErrorKind, SignalWatcher, Task};

#[test]
fn signal_raised_later_wakes_the_waiter() {
    let s = common::scheduler();
    let _enter = s.enter();
    let watcher = SignalWatcher::new(libc::SIGUSR1).unwrap();
    let waiter = Task::spawn(move || watcher.await_signal());
    let _raiser: Task<()> = Task::spawn(|| {
        sleep(Duration::from_millis(2))?;
        unsafe { libc::raise(libc::SIGUSR1) };
        Ok(())
    });
    assert_eq!(waiter.wait().unwrap(), libc::SIGUSR1);
}

#[test]
fn pending_signal_is_delivered_on_first_await() {
    let s = common::scheduler();
    let _enter = s.enter();
    let watcher = SignalWatcher::new(libc::SIGUSR2).unwrap();
    unsafe { libc::raise(libc::SIGUSR2) };
    let waiter = Task::spawn(move || watcher.await_signal());
    assert_eq!(waiter.wait().unwrap(), libc::SIGUSR2);
}

#[test]
fn close_fails_pending_waiters() {
    let s = common::scheduler();
    let _enter = s.enter();
    let watcher = Rc::new(SignalWatcher::new(libc::SIGWINCH).unwrap());
    let w = Rc::clone(&watcher);
    let waiter = Task::spawn(move || w.await_signal());
    let c = Rc::clone(&watcher);
    let _closer: Task<()> = Task::spawn(move || {
        sleep(Duration::from_millis(1))?;
        c.close(Some(Error::failed("shutdown")));
        Ok(())
    });

    let err = waiter.wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert_eq!(err.message(), "Signal watcher has been closed");
    assert_eq!(err.cause().unwrap().message(), "shutdown");
    assert!(watcher.is_closed());
    assert!(!watcher.close(None));
}

#[test]
fn dispose_closes_the_watcher() {
    let s = common::scheduler();
    let _enter = s.enter();
    let watcher = SignalWatcher::new(libc::SIGHUP).unwrap();
    s.dispose();
    let err = watcher.await_signal().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    assert_eq!(err.cause().unwrap().kind(), ErrorKind::Disposed);
}
