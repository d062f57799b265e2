// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Buffered channels and select.
//!
//! A channel with capacity zero hands each value straight from a sender to
//! a receiver. Senders that find the buffer full park together with their
//! value; receivers that find it empty park on an op queue. Closing
//! without a cause lets receivers drain the buffer and then observe end of
//! stream; closing with a cause fails everything still waiting.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::op::{await_op, Op, OpQueue, WeakOp};
use crate::scheduler::{HookId, Scheduler, WeakScheduler};

struct Inner<T> {
    capacity: usize,
    buffer: RefCell<VecDeque<T>>,
    /// Parked senders with the value each is trying to deliver.
    senders: RefCell<VecDeque<(Op<()>, T)>>,
    receivers: OpQueue<Option<T>>,
    /// `Some(cause)` once closed.
    closed: RefCell<Option<Option<Error>>>,
    scheduler: WeakScheduler,
    hook: Cell<Option<HookId>>,
}

impl<T: 'static> Inner<T> {
    fn closed_error(&self) -> Option<Error> {
        self.closed
            .borrow()
            .as_ref()
            .map(|cause| Error::channel_closed(cause.clone()))
    }

    fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    fn pop_sender(&self) -> Option<(Op<()>, T)> {
        let mut senders = self.senders.borrow_mut();
        while let Some((op, value)) = senders.pop_front() {
            if !op.is_done() {
                return Some((op, value));
            }
        }
        None
    }

    fn has_sender(&self) -> bool {
        self.senders.borrow().iter().any(|(op, _)| !op.is_done())
    }

    /// Next value that can be received without waiting.
    fn take_available(&self) -> Option<T> {
        let buffered = self.buffer.borrow_mut().pop_front();
        match buffered {
            Some(value) => {
                // A slot opened up: move one parked sender into the buffer.
                if let Some((op, next)) = self.pop_sender() {
                    self.buffer.borrow_mut().push_back(next);
                    op.finish(());
                }
                Some(value)
            }
            None => self.pop_sender().map(|(op, value)| {
                op.finish(());
                value
            }),
        }
    }

    /// Deliver `value` without waiting, or give it back.
    fn offer(&self, value: T) -> std::result::Result<(), T> {
        if let Some(op) = self.receivers.dequeue() {
            op.finish(Some(value));
            return Ok(());
        }
        let mut buffer = self.buffer.borrow_mut();
        if buffer.len() < self.capacity {
            buffer.push_back(value);
            return Ok(());
        }
        Err(value)
    }

    /// Return a value handed to a receiver that no longer wants it. It goes
    /// to the next receiver, else to the head of the buffer if there is
    /// room, else it waits as a parked sender nobody awaits.
    fn put_back(&self, value: T) {
        if let Some(op) = self.receivers.dequeue() {
            op.finish(Some(value));
            return;
        }
        let mut buffer = self.buffer.borrow_mut();
        if buffer.len() < self.capacity {
            buffer.push_front(value);
        } else {
            self.senders.borrow_mut().push_front((Op::new(), value));
        }
    }

    fn close(&self, cause: Option<Error>) -> bool {
        if self.is_closed() {
            return false;
        }
        *self.closed.borrow_mut() = Some(cause.clone());
        if let (Some(hook), Some(scheduler)) = (self.hook.take(), self.scheduler.upgrade()) {
            scheduler.detach_shutdown_hook(hook);
        }
        let error = Error::channel_closed(cause.clone());
        tracing::debug!(error = %error, "channel closed");

        let senders = std::mem::take(&mut *self.senders.borrow_mut());
        for (op, _) in senders {
            op.fail(error.clone());
        }
        if cause.is_some() {
            self.receivers.fail_all(&error);
        } else {
            while let Some(op) = self.receivers.dequeue() {
                op.finish(None);
            }
        }
        true
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let (Some(hook), Some(scheduler)) = (self.hook.take(), self.scheduler.upgrade()) {
            scheduler.detach_shutdown_hook(hook);
        }
    }
}

/// Multi-producer, multi-consumer channel. Clones share the channel.
pub struct Channel<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Channel<T> {
    /// Channel buffering up to `capacity` values. It is closed with the
    /// disposal error when the current scheduler is disposed.
    pub fn new(capacity: usize) -> Channel<T> {
        let scheduler = Scheduler::current();
        let inner = Rc::new(Inner {
            capacity,
            buffer: RefCell::new(VecDeque::with_capacity(capacity)),
            senders: RefCell::new(VecDeque::new()),
            receivers: OpQueue::new(),
            closed: RefCell::new(None),
            scheduler: scheduler.downgrade(),
            hook: Cell::new(None),
        });
        let weak: Weak<Inner<T>> = Rc::downgrade(&inner);
        let hook = scheduler.register_shutdown_hook(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.hook.set(None);
                inner.close(Some(err.clone()));
            }
        });
        if !inner.is_closed() {
            inner.hook.set(Some(hook));
        }
        Channel { inner }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Send `value`, waiting for buffer space or a receiver if needed.
    pub fn send(&self, value: T) -> Result<()> {
        if let Some(err) = self.inner.closed_error() {
            return Err(err);
        }
        let value = match self.inner.offer(value) {
            Ok(()) => return Ok(()),
            Err(value) => value,
        };

        let op = Op::new();
        op.keep_alive();
        self.inner.senders.borrow_mut().push_back((op.clone(), value));
        let result = await_op(&op);
        if result.is_err() {
            self.inner
                .senders
                .borrow_mut()
                .retain(|(queued, _)| !queued.ptr_eq(&op));
        }
        result
    }

    /// Receive the next value. `Ok(None)` once the channel is closed
    /// without a cause and drained.
    pub fn recv(&self) -> Result<Option<T>> {
        if let Some(value) = self.inner.take_available() {
            return Ok(Some(value));
        }
        if let Some(closed) = self.closed_outcome() {
            return closed;
        }

        let op = Op::new();
        op.keep_alive();
        self.inner.receivers.enqueue(op.clone());
        let result = await_op(&op);
        if result.is_err() {
            self.inner.receivers.detach(&op);
        }
        result
    }

    /// Receive without waiting. `Ok(None)` if nothing is available yet;
    /// a closed and drained channel reports the close error.
    pub fn try_recv(&self) -> Result<Option<T>> {
        if let Some(value) = self.inner.take_available() {
            return Ok(Some(value));
        }
        match self.inner.closed_error() {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    fn closed_outcome(&self) -> Option<Result<Option<T>>> {
        let closed = self.inner.closed.borrow();
        match closed.as_ref()? {
            None => Some(Ok(None)),
            Some(cause) => Some(Err(Error::channel_closed(Some(cause.clone())))),
        }
    }

    /// Close the channel. Returns false if it was already closed.
    pub fn close(&self, cause: Option<Error>) -> bool {
        self.inner.close(cause)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// True if a value can be received without waiting.
    pub fn is_ready_for_receive(&self) -> bool {
        !self.inner.buffer.borrow().is_empty() || self.inner.has_sender()
    }

    /// True if a value can be sent without waiting.
    pub fn is_ready_for_send(&self) -> bool {
        !self.is_closed()
            && (self.inner.buffer.borrow().len() < self.inner.capacity
                || !self.inner.receivers.is_empty())
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over received values until the channel is closed. A close
    /// with a cause yields that error once and ends the iteration.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            channel: self,
            done: false,
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.inner.capacity)
            .field("buffered", &self.inner.buffer.borrow().len())
            .field("closed", &self.inner.closed.borrow().is_some())
            .finish()
    }
}

pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
    done: bool,
}

impl<T: 'static> Iterator for Iter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        match self.channel.recv() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

enum SelectEvent<T> {
    Recv(usize, T),
    Closed(usize),
    Failed(usize, Error),
    Timeout,
}

/// A select's receiver op together with the channel it is queued on.
type Queued<T> = (Weak<Inner<T>>, WeakOp<Option<T>>);

fn detach_queued<T: 'static>(queued: &RefCell<Vec<Queued<T>>>) {
    for (channel, op) in queued.borrow().iter() {
        if let (Some(channel), Some(op)) = (channel.upgrade(), op.upgrade()) {
            channel.receivers.detach(&op);
        }
    }
}

/// Receive from whichever of several channels has a value first.
pub struct ChannelGroup<T> {
    /// Channels with their index in the list the group was built from.
    channels: RefCell<Vec<(usize, Channel<T>)>>,
    timeout: Option<Duration>,
}

impl<T: 'static> ChannelGroup<T> {
    /// Group over `channels`. A zero `timeout` makes `select` non-blocking.
    pub fn new(channels: Vec<Channel<T>>, timeout: Option<Duration>) -> Self {
        ChannelGroup {
            channels: RefCell::new(channels.into_iter().enumerate().collect()),
            timeout,
        }
    }

    /// Channels still in the group.
    pub fn count(&self) -> usize {
        self.channels.borrow().len()
    }

    fn remove(&self, index: usize) {
        self.channels.borrow_mut().retain(|(i, _)| *i != index);
    }

    /// Receive the next value from any channel, returning the channel's
    /// original index alongside it.
    ///
    /// Channels are polled in order. A channel closed without a cause
    /// leaves the group; one closed with a cause leaves it and its error
    /// is returned. `Ok(None)` when the group is empty or the timeout
    /// expired.
    ///
    /// A select takes at most one value. Once it has settled it stops
    /// receiving on every channel, so later sends on an unbuffered channel
    /// still wait for a real receiver. A value that reaches a select after
    /// it was cancelled stays in its channel without exceeding capacity.
    pub fn select(&self) -> Result<Option<(usize, T)>> {
        loop {
            if let Some(ready) = self.poll()? {
                return Ok(Some(ready));
            }
            if self.count() == 0 || self.timeout.is_some_and(|t| t.is_zero()) {
                return Ok(None);
            }
            match self.wait()? {
                SelectEvent::Recv(index, value) => return Ok(Some((index, value))),
                SelectEvent::Closed(index) => self.remove(index),
                SelectEvent::Failed(index, err) => {
                    self.remove(index);
                    return Err(err);
                }
                SelectEvent::Timeout => return Ok(None),
            }
        }
    }

    fn poll(&self) -> Result<Option<(usize, T)>> {
        let channels = self.channels.borrow().clone();
        for (index, channel) in channels {
            if let Some(value) = channel.inner.take_available() {
                return Ok(Some((index, value)));
            }
            match channel.closed_outcome() {
                None => {}
                Some(Ok(_)) => self.remove(index),
                Some(Err(err)) => {
                    self.remove(index);
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    fn wait(&self) -> Result<SelectEvent<T>> {
        let shared: Op<SelectEvent<T>> = Op::new();
        shared.keep_alive();

        // Receiver ops leave their queues as soon as the select settles, so
        // a later send goes to another receiver or into the buffer.
        let queued: Rc<RefCell<Vec<Queued<T>>>> = Rc::new(RefCell::new(Vec::new()));

        let channels = self.channels.borrow().clone();
        let mut waiting = Vec::with_capacity(channels.len());
        for (index, channel) in channels {
            let op: Op<Option<T>> = Op::new();
            let target = shared.downgrade();
            let source = Rc::downgrade(&channel.inner);
            let siblings = Rc::clone(&queued);
            op.on_complete(move |op| {
                let Some(outcome) = op.take_result() else {
                    return;
                };
                let shared = target.upgrade().filter(|s| !s.is_done());
                match (shared, outcome) {
                    (Some(shared), Ok(Some(value))) => {
                        shared.finish(SelectEvent::Recv(index, value));
                    }
                    (Some(shared), Ok(None)) => {
                        shared.finish(SelectEvent::Closed(index));
                    }
                    (Some(shared), Err(err)) => {
                        shared.finish(SelectEvent::Failed(index, err));
                    }
                    (None, Ok(Some(value))) => {
                        // Settled elsewhere first, e.g. cancelled.
                        if let Some(inner) = source.upgrade() {
                            inner.put_back(value);
                        }
                    }
                    (None, _) => {}
                }
                detach_queued(&siblings);
            });
            channel.inner.receivers.enqueue(op.clone());
            queued
                .borrow_mut()
                .push((Rc::downgrade(&channel.inner), op.downgrade()));
            waiting.push((channel, op));
        }

        let timer = self.timeout.map(|timeout| {
            let event_loop = Scheduler::current().event_loop_rc();
            let target = shared.downgrade();
            let siblings = Rc::clone(&queued);
            let id = event_loop.add_timer(
                timeout,
                None,
                Rc::new(move || {
                    if let Some(shared) = target.upgrade() {
                        shared.finish(SelectEvent::Timeout);
                    }
                    detach_queued(&siblings);
                }),
            );
            event_loop.set_timer_ref(id, false);
            (event_loop, id)
        });

        let result = await_op(&shared);

        if let Some((event_loop, id)) = timer {
            event_loop.cancel_timer(id);
        }
        for (channel, op) in waiting {
            channel.inner.receivers.detach(&op);
            op.fail(Error::contract("select finished"));
        }
        result
    }
}

impl<T> fmt::Debug for ChannelGroup<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("channels", &self.channels.borrow().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaitable::Awaitable;
    use crate::config::Config;
    use crate::context::Context;
    use crate::error::ErrorKind;
    use crate::task::{Task, TaskStatus};
    use crate::test_utils::init_test_logging;
    use crate::timer::sleep;

    fn scheduler() -> Scheduler {
        init_test_logging();
        Scheduler::with_config(Config::default().stack_size(64 * 1024))
    }

    #[test]
    fn buffered_values_arrive_in_order() {
        let s = scheduler();
        let _enter = s.enter();
        let ch = Channel::new(3);
        for i in 0..3 {
            ch.send(i).unwrap();
        }
        assert!(!ch.is_ready_for_send());
        assert!(ch.is_ready_for_receive());
        assert_eq!(ch.len(), 3);
        for i in 0..3 {
            assert_eq!(ch.try_recv().unwrap(), Some(i));
        }
        assert_eq!(ch.try_recv().unwrap(), None);
    }

    #[test]
    fn unbuffered_send_waits_for_receiver() {
        let s = scheduler();
        let _enter = s.enter();
        let ch = Channel::new(0);
        let log = Rc::new(RefCell::new(Vec::new()));

        let (tx, l) = (ch.clone(), Rc::clone(&log));
        let producer = Task::spawn(move || {
            for i in 0..3 {
                tx.send(i)?;
                l.borrow_mut().push(format!("sent {i}"));
            }
            tx.close(None);
            Ok(())
        });
        let (rx, l) = (ch.clone(), Rc::clone(&log));
        let consumer = Task::spawn(move || {
            let mut got = Vec::new();
            for value in rx.iter() {
                let value = value?;
                l.borrow_mut().push(format!("got {value}"));
                got.push(value);
            }
            Ok(got)
        });

        producer.wait().unwrap();
        assert_eq!(consumer.wait().unwrap(), vec![0, 1, 2]);
        assert!(log.borrow().iter().any(|l| l == "got 2"));
    }

    #[test]
    fn close_without_cause_drains_then_ends() {
        let s = scheduler();
        let _enter = s.enter();
        let ch = Channel::new(2);
        ch.send("a").unwrap();
        assert!(ch.close(None));
        assert!(!ch.close(None));
        assert_eq!(ch.recv().unwrap(), Some("a"));
        assert_eq!(ch.recv().unwrap(), None);
        let err = ch.send("b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
        assert!(err.cause().is_none());
    }

    #[test]
    fn close_with_cause_fails_waiting_receivers() {
        let s = scheduler();
        let _enter = s.enter();
        let ch: Channel<u8> = Channel::new(0);
        let rx = ch.clone();
        let waiter = Task::spawn(move || rx.recv());
        let tx = ch.clone();
        Task::spawn(move || {
            sleep(Duration::from_millis(1))?;
            tx.close(Some(Error::failed("upstream gone")));
            Ok(())
        });
        let err = waiter.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
        assert_eq!(err.message(), "Channel has been closed");
        assert_eq!(err.cause().unwrap().message(), "upstream gone");
    }

    #[test]
    fn full_buffer_parks_sender_until_receive() {
        let s = scheduler();
        let _enter = s.enter();
        let ch = Channel::new(1);
        let tx = ch.clone();
        let producer = Task::spawn(move || {
            tx.send(1)?;
            tx.send(2)?;
            Ok(())
        });
        s.run_loop();
        assert_eq!(producer.status(), TaskStatus::Suspended);
        assert_eq!(ch.try_recv().unwrap(), Some(1));
        // The parked value moved into the buffer.
        assert_eq!(ch.len(), 1);
        producer.wait().unwrap();
        assert_eq!(ch.try_recv().unwrap(), Some(2));
    }

    #[test]
    fn dispose_closes_channel_with_cause() {
        let s = scheduler();
        let _enter = s.enter();
        let ch: Channel<u8> = Channel::new(0);
        let rx = ch.clone();
        let waiter = Task::spawn(move || rx.recv());
        s.run_loop();
        s.dispose();
        assert!(ch.is_closed());
        let err = waiter.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
        assert_eq!(err.cause().unwrap().kind(), ErrorKind::Disposed);
    }

    #[test]
    fn select_prefers_ready_channel_in_order() {
        let s = scheduler();
        let _enter = s.enter();
        let a = Channel::new(1);
        let b = Channel::new(1);
        b.send("b").unwrap();
        a.send("a").unwrap();
        let group = ChannelGroup::new(vec![a, b], None);
        assert_eq!(group.select().unwrap(), Some((0, "a")));
        assert_eq!(group.select().unwrap(), Some((1, "b")));
    }

    #[test]
    fn select_with_zero_timeout_does_not_block() {
        let s = scheduler();
        let _enter = s.enter();
        let group: ChannelGroup<u8> =
            ChannelGroup::new(vec![Channel::new(0)], Some(Duration::ZERO));
        assert_eq!(group.select().unwrap(), None);
        assert_eq!(group.count(), 1);
    }

    #[test]
    fn select_waits_for_first_sender() {
        let s = scheduler();
        let _enter = s.enter();
        let a: Channel<u32> = Channel::new(0);
        let b: Channel<u32> = Channel::new(0);
        let group = ChannelGroup::new(vec![a.clone(), b.clone()], None);
        let selector = Task::spawn(move || group.select());
        Task::spawn(move || {
            sleep(Duration::from_millis(1))?;
            b.send(7)
        });
        assert_eq!(selector.wait().unwrap(), Some((1, 7)));
        assert!(a.inner.receivers.is_empty());
    }

    #[test]
    fn select_times_out() {
        let s = scheduler();
        let _enter = s.enter();
        let ch: Channel<u8> = Channel::new(0);
        let group = ChannelGroup::new(vec![ch.clone()], Some(Duration::from_millis(2)));
        let selector = Task::spawn(move || group.select());
        assert_eq!(selector.wait().unwrap(), None);
        assert!(ch.inner.receivers.is_empty());
    }

    #[test]
    fn select_drops_closed_channels() {
        let s = scheduler();
        let _enter = s.enter();
        let a: Channel<u8> = Channel::new(0);
        let b: Channel<u8> = Channel::new(0);
        a.close(None);
        b.close(Some(Error::failed("broken")));
        let group = ChannelGroup::new(vec![a, b], None);
        let err = group.select().unwrap_err();
        assert_eq!(err.cause().unwrap().message(), "broken");
        assert_eq!(group.count(), 0);
        assert_eq!(group.select().unwrap(), None);
    }

    #[test]
    fn select_leaves_no_receiver_behind_on_unbuffered_channels() {
        let s = scheduler();
        let _enter = s.enter();
        let a: Channel<u32> = Channel::new(0);
        let b: Channel<u32> = Channel::new(0);
        let group = ChannelGroup::new(vec![a.clone(), b.clone()], None);
        let selector = Task::spawn(move || group.select());
        let tx = a.clone();
        let _first: Task<()> = Task::spawn(move || tx.send(1));
        let tx = b.clone();
        let second: Task<()> = Task::spawn(move || tx.send(2));

        assert_eq!(selector.wait().unwrap(), Some((0, 1)));
        // Nobody received the second value, so its sender is still parked.
        assert_eq!(second.status(), TaskStatus::Suspended);
        assert!(b.is_empty());
        assert!(b.inner.receivers.is_empty());
        assert_eq!(b.recv().unwrap(), Some(2));
        second.wait().unwrap();
    }

    #[test]
    fn value_reaching_a_cancelled_select_stays_in_the_channel() {
        let s = scheduler();
        let _enter = s.enter();
        let ch: Channel<u32> = Channel::new(0);
        let (ctx, handle) = Context::current().with_cancel();
        let group = ChannelGroup::new(vec![ch.clone()], None);
        let selector = Task::spawn_with_context(ctx, move || group.select());
        let tx = ch.clone();
        let sender: Task<()> = Task::spawn(move || {
            handle.cancel(None);
            tx.send(9)
        });

        assert_eq!(selector.wait().unwrap_err().kind(), ErrorKind::Cancelled);
        sender.wait().unwrap();
        assert!(ch.is_empty());
        assert_eq!(ch.try_recv().unwrap(), Some(9));
        assert_eq!(ch.try_recv().unwrap(), None);
    }
}
