// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels, select and stream watchers driven by real tasks.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use weft_rt::{
    sleep, Awaitable, Channel, ChannelGroup, Error, ErrorKind, StreamWatcher, Task, Timer,
};

#[test]
fn producer_and_consumer_share_a_small_buffer() {
    let s = common::scheduler();
    let _enter = s.enter();
    let ch = Channel::new(2);

    let tx = ch.clone();
    let producer = Task::spawn(move || {
        for i in 0..10 {
            tx.send(i)?;
        }
        tx.close(None);
        Ok(())
    });
    let rx = ch.clone();
    let consumer = Task::spawn(move || rx.iter().collect::<Result<Vec<i32>, Error>>());

    assert_eq!(consumer.wait().unwrap(), (0..10).collect::<Vec<_>>());
    producer.wait().unwrap();
    assert!(ch.is_closed());
    assert!(ch.send(11).is_err());
}

#[test]
fn closing_with_cause_fails_parked_receivers() {
    let s = common::scheduler();
    let _enter = s.enter();
    let ch: Channel<u8> = Channel::new(0);
    let rx = ch.clone();
    let receiver = Task::spawn(move || rx.recv());
    let tx = ch.clone();
    let closer = Task::spawn(move || {
        sleep(Duration::from_millis(1))?;
        tx.close(Some(Error::failed("peer reset")));
        Ok(())
    });

    let err = receiver.wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    assert_eq!(err.cause().unwrap().message(), "peer reset");
    closer.wait().unwrap();
}

#[test]
fn select_takes_values_as_they_arrive() {
    let s = common::scheduler();
    let _enter = s.enter();
    let fast: Channel<&'static str> = Channel::new(1);
    let slow: Channel<&'static str> = Channel::new(1);

    let (f, sl) = (fast.clone(), slow.clone());
    let _fast_timer = {
        let timer = Timer::new(move || {
            let _ = f.send("fast");
        });
        timer.start(Duration::from_millis(2), false).unwrap();
        timer
    };
    let _slow_timer = {
        let timer = Timer::new(move || {
            let _ = sl.send("slow");
        });
        timer.start(Duration::from_millis(10), false).unwrap();
        timer
    };

    let group = ChannelGroup::new(vec![slow.clone(), fast.clone()], None);
    let task = Task::spawn(move || {
        let first = group.select()?;
        let second = group.select()?;
        Ok((first, second))
    });
    let (first, second) = task.wait().unwrap();
    assert_eq!(first, Some((1, "fast")));
    assert_eq!(second, Some((0, "slow")));
}

#[test]
fn select_times_out_and_leaves_channels_untouched() {
    let s = common::scheduler();
    let _enter = s.enter();
    let ch: Channel<u32> = Channel::new(1);
    let group = ChannelGroup::new(vec![ch.clone()], Some(Duration::from_millis(3)));
    let task = Task::spawn(move || group.select());
    assert_eq!(task.wait().unwrap(), None);

    ch.send(9).unwrap();
    assert_eq!(ch.try_recv().unwrap(), Some(9));
}

#[test]
fn select_reports_cause_of_a_failed_channel() {
    let s = common::scheduler();
    let _enter = s.enter();
    let a: Channel<u32> = Channel::new(0);
    let b: Channel<u32> = Channel::new(0);
    b.close(Some(Error::failed("broken")));
    let group = ChannelGroup::new(vec![a.clone(), b], None);
    let err = group.select().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    assert_eq!(group.count(), 1);
    a.close(None);
    assert_eq!(group.select().unwrap(), None);
    assert_eq!(group.count(), 0);
}

#[test]
fn watcher_reads_a_pipe_in_chunks() {
    let s = common::scheduler();
    let _enter = s.enter();
    let (r, w) = common::pipe();
    let watcher = StreamWatcher::new(r).unwrap();

    let reader = Task::spawn(move || {
        let mut collected = Vec::new();
        while collected.len() < 6 {
            watcher.await_readable()?;
            let mut buf = [0u8; 16];
            let n = unsafe { libc::read(r, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                collected.extend_from_slice(&buf[..n as usize]);
            }
        }
        Ok(collected)
    });
    let writes = Rc::new(Cell::new(0));
    let counter = Rc::clone(&writes);
    let writer = Task::spawn(move || {
        for chunk in [b"ab", b"cd", b"ef"] {
            sleep(Duration::from_millis(1))?;
            unsafe { libc::write(w, chunk.as_ptr().cast(), chunk.len()) };
            counter.set(counter.get() + 1);
        }
        Ok(())
    });

    assert_eq!(reader.wait().unwrap(), b"abcdef".to_vec());
    writer.wait().unwrap();
    assert_eq!(writes.get(), 3);
    assert!(!s.event_loop().has_handles());
    common::close_fds(&[r, w]);
}

#[test]
fn dispose_closes_primitives() {
    let s = common::scheduler();
    let _enter = s.enter();
    let ch: Channel<u8> = Channel::new(4);
    let (r, w) = common::pipe();
    let watcher = StreamWatcher::new(r).unwrap();

    s.dispose();

    let err = ch.send(1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    assert_eq!(err.cause().unwrap().kind(), ErrorKind::Disposed);
    assert!(watcher.is_closed());
    assert_eq!(watcher.await_readable().unwrap_err().kind(), ErrorKind::Closed);
    common::close_fds(&[r, w]);
}
