// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event loop: epoll readiness plus a timer heap.
//!
//! Single-threaded and level-triggered. The scheduler's runner fiber calls
//! `run_once` between dispatch rounds. Callbacks are collected while the
//! internal tables are borrowed and invoked after the borrows end, so a
//! callback may freely add or remove timers and watches.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// I/O interest for a watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
            Interest::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        }
    }

    /// Interest covering the requested directions, if any.
    pub fn from_flags(read: bool, write: bool) -> Option<Interest> {
        match (read, write) {
            (true, true) => Some(Interest::ReadWrite),
            (true, false) => Some(Interest::Readable),
            (false, true) => Some(Interest::Writable),
            (false, false) => None,
        }
    }
}

/// What epoll reported for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up. Both directions should retry and observe it.
    pub hangup: bool,
}

impl Readiness {
    fn from_epoll(events: u32) -> Self {
        Readiness {
            readable: events & libc::EPOLLIN as u32 != 0,
            writable: events & libc::EPOLLOUT as u32 != 0,
            hangup: events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

pub type TimerCallback = Rc<dyn Fn()>;
pub type WatchCallback = Rc<dyn Fn(Readiness)>;

struct TimerEntry {
    repeat: Option<Duration>,
    callback: TimerCallback,
    referenced: bool,
}

struct Watch {
    interest: Interest,
    callback: WatchCallback,
}

pub struct EventLoop {
    epoll_fd: RawFd,
    /// Deadline-ordered timers. The id breaks ties in insertion order.
    timers: RefCell<BTreeMap<(Instant, TimerId), TimerEntry>>,
    deadlines: RefCell<HashMap<TimerId, Instant>>,
    /// One-shot timers popped for the current batch, not yet invoked.
    in_flight: RefCell<HashSet<TimerId>>,
    watches: RefCell<HashMap<RawFd, Watch>>,
    next_timer: Cell<u64>,
    refs: Cell<usize>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            timers: RefCell::new(BTreeMap::new()),
            deadlines: RefCell::new(HashMap::new()),
            in_flight: RefCell::new(HashSet::new()),
            watches: RefCell::new(HashMap::new()),
            next_timer: Cell::new(1),
            refs: Cell::new(0),
        })
    }

    /// Arm a timer firing after `delay`, then every `repeat` if given.
    ///
    /// New timers are referenced: they keep the loop alive on their own.
    pub fn add_timer(
        &self,
        delay: Duration,
        repeat: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let id = TimerId(self.next_timer.get());
        self.next_timer.set(id.0 + 1);
        let deadline = Instant::now() + delay;
        self.timers.borrow_mut().insert(
            (deadline, id),
            TimerEntry {
                repeat,
                callback,
                referenced: true,
            },
        );
        self.deadlines.borrow_mut().insert(id, deadline);
        self.refs.set(self.refs.get() + 1);
        tracing::trace!(timer = %id, ?delay, ?repeat, "timer armed");
        id
    }

    /// Change whether a timer keeps the loop alive.
    pub fn set_timer_ref(&self, id: TimerId, referenced: bool) {
        let Some(deadline) = self.deadlines.borrow().get(&id).copied() else {
            return;
        };
        if let Some(entry) = self.timers.borrow_mut().get_mut(&(deadline, id)) {
            if entry.referenced != referenced {
                entry.referenced = referenced;
                if referenced {
                    self.refs.set(self.refs.get() + 1);
                } else {
                    self.refs.set(self.refs.get() - 1);
                }
            }
        }
    }

    /// Disarm a timer. Returns false if it already fired or was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let in_flight = self.in_flight.borrow_mut().remove(&id);
        let Some(deadline) = self.deadlines.borrow_mut().remove(&id) else {
            return in_flight;
        };
        if let Some(entry) = self.timers.borrow_mut().remove(&(deadline, id)) {
            if entry.referenced {
                self.refs.set(self.refs.get() - 1);
            }
        }
        true
    }

    pub fn is_timer_armed(&self, id: TimerId) -> bool {
        self.deadlines.borrow().contains_key(&id) || self.in_flight.borrow().contains(&id)
    }

    /// Watch `fd` for `interest`, replacing any previous watch on it.
    pub fn watch(&self, fd: RawFd, interest: Interest, callback: WatchCallback) -> io::Result<()> {
        let mut watches = self.watches.borrow_mut();

        let mut ev = libc::epoll_event {
            events: interest.to_epoll_events(),
            u64: fd as u64,
        };
        let op = if watches.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        watches.insert(fd, Watch { interest, callback });
        tracing::trace!(fd, ?interest, "fd watched");
        Ok(())
    }

    pub fn unwatch(&self, fd: RawFd) -> io::Result<()> {
        if self.watches.borrow_mut().remove(&fd).is_none() {
            return Ok(());
        }
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected if the fd was already closed.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        tracing::trace!(fd, "fd unwatched");
        Ok(())
    }

    pub fn watched_interest(&self, fd: RawFd) -> Option<Interest> {
        self.watches.borrow().get(&fd).map(|w| w.interest)
    }

    /// True if any timer or watch is registered.
    pub fn has_handles(&self) -> bool {
        !self.timers.borrow().is_empty() || !self.watches.borrow().is_empty()
    }

    /// True if any referenced timer is armed.
    pub fn has_refs(&self) -> bool {
        self.refs.get() > 0
    }

    fn poll_timeout_ms(&self, block: bool) -> i32 {
        if !block {
            return 0;
        }
        match self.timers.borrow().keys().next() {
            None => -1,
            Some((deadline, _)) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                // Round up so a timer is never polled a hair too early.
                let ms = wait.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as i32
            }
        }
    }

    /// Run one iteration: poll readiness (blocking until the next timer when
    /// `block` is set), then run expired timers and ready watch callbacks.
    /// Returns the number of callbacks invoked.
    pub fn run_once(&self, block: bool) -> io::Result<usize> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let timeout_ms = self.poll_timeout_ms(block);
        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        let n = if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            0
        } else {
            n as usize
        };

        let now = Instant::now();
        let mut expired: Vec<(TimerId, TimerCallback)> = Vec::new();
        {
            let mut timers = self.timers.borrow_mut();
            let mut deadlines = self.deadlines.borrow_mut();
            let mut in_flight = self.in_flight.borrow_mut();
            let mut rearm = Vec::new();
            while let Some(entry) = timers.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let ((_, id), timer) = entry.remove_entry();
                expired.push((id, Rc::clone(&timer.callback)));
                in_flight.insert(id);
                match timer.repeat {
                    Some(interval) => rearm.push((now + interval, id, timer)),
                    None => {
                        deadlines.remove(&id);
                        if timer.referenced {
                            self.refs.set(self.refs.get() - 1);
                        }
                    }
                }
            }
            // Re-armed after the scan so a zero interval fires once per
            // iteration.
            for (next, id, timer) in rearm {
                deadlines.insert(id, next);
                timers.insert((next, id), timer);
            }
        }

        let mut ready: Vec<(WatchCallback, Readiness)> = Vec::new();
        {
            let watches = self.watches.borrow();
            for ev in events.iter().take(n) {
                let fd = ev.u64 as RawFd;
                if let Some(watch) = watches.get(&fd) {
                    ready.push((Rc::clone(&watch.callback), Readiness::from_epoll(ev.events)));
                }
            }
        }

        let mut invoked = 0;
        for (id, callback) in expired {
            // An earlier callback in this batch may have cancelled it.
            let live = self.in_flight.borrow_mut().remove(&id);
            if live {
                callback();
                invoked += 1;
            }
        }
        for (callback, readiness) in ready {
            callback(readiness);
            invoked += 1;
        }

        tracing::trace!(events = n, invoked, "event loop iteration");
        Ok(invoked)
    }

    /// Drop every timer and watch.
    pub fn close_all(&self) {
        let fds: Vec<RawFd> = self.watches.borrow().keys().copied().collect();
        for fd in fds {
            if let Err(err) = self.unwatch(fd) {
                tracing::debug!(fd, error = %err, "failed to unwatch fd during close");
            }
        }
        self.timers.borrow_mut().clear();
        self.deadlines.borrow_mut().clear();
        self.in_flight.borrow_mut().clear();
        self.refs.set(0);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let watches = self.watches.get_mut();
        for &fd in watches.keys() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        watches.clear();
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("epoll_fd", &self.epoll_fd)
            .field("timers", &self.timers.borrow().len())
            .field("watches", &self.watches.borrow().len())
            .field("refs", &self.refs.get())
            .finish()
    }
}

/// Put a file descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(ret, 0, "pipe2 failed: {}", io::Error::last_os_error());
    (fds[0], fds[1])
}
