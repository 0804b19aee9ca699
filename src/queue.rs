// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Thread-safe bounded FIFO of [`Frame`]s, the hand-off used between
//! application threads and the reactor thread everywhere in this crate.
//!
//! Grounded in `nitro_queue_t` (`original_source/src/queue.h`): a ring
//! buffer behind one mutex and one condition variable, with a user callback
//! fired synchronously whenever `count` crosses the empty or full boundary.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// The three observable occupancy bands of a `BoundedQueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Empty,
    Contents,
    Full,
}

fn band(count: usize, capacity: usize) -> QueueState {
    if count == 0 {
        QueueState::Empty
    } else if count >= capacity {
        QueueState::Full
    } else {
        QueueState::Contents
    }
}

pub type StateCallback = Box<dyn Fn(QueueState) + Send + Sync>;

struct Inner {
    ring: VecDeque<Frame>,
    capacity: usize,
    closed: bool,
}

/// A bounded, thread-safe FIFO of `Frame`s with blocking and non-blocking
/// push/pull, atomic cross-queue moves, and a state-change callback.
pub struct BoundedQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    callback: Option<StateCallback>,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> BoundedQueue {
        assert!(capacity > 0, "BoundedQueue capacity must be positive");
        BoundedQueue {
            inner: Mutex::new(Inner { ring: VecDeque::with_capacity(capacity), capacity, closed: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            callback: None,
        }
    }

    pub fn with_state_callback(capacity: usize, callback: StateCallback) -> BoundedQueue {
        let mut queue = BoundedQueue::new(capacity);
        queue.callback = Some(callback);
        queue
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Unsynchronized read of `count`, for statistics only.
    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn fire(&self, state: QueueState) {
        if let Some(callback) = &self.callback {
            callback(state);
        }
    }

    /// Blocks while the queue is full, optionally until `deadline`.
    pub fn push(&self, frame: Frame) -> Result<()> {
        self.push_timeout(frame, None)
    }

    pub fn push_timeout(&self, frame: Frame, deadline: Option<Instant>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.closed {
                return Err(Error::QueueClosed);
            }
            if guard.ring.len() < guard.capacity {
                break;
            }
            guard = match deadline {
                None => self.not_full.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let (next, timeout) = self.not_full.wait_timeout(guard, deadline - now).unwrap();
                    if timeout.timed_out() && next.ring.len() >= next.capacity && !next.closed {
                        return Err(Error::Timeout);
                    }
                    next
                }
            };
        }
        self.do_push(guard, frame)
    }

    /// Never blocks: fails with `QueueFull` instead of waiting for space.
    pub fn try_push(&self, frame: Frame) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        if guard.closed {
            return Err(Error::QueueClosed);
        }
        if guard.ring.len() >= guard.capacity {
            return Err(Error::QueueFull);
        }
        self.do_push(guard, frame)
    }

    fn do_push(&self, mut guard: MutexGuard<'_, Inner>, frame: Frame) -> Result<()> {
        let capacity = guard.capacity;
        let pre = band(guard.ring.len(), capacity);
        guard.ring.push_back(frame);
        let post = band(guard.ring.len(), capacity);
        drop(guard);

        self.not_empty.notify_one();
        if post != pre {
            self.fire(post);
        }
        Ok(())
    }

    /// Blocks while the queue is empty, optionally until `deadline`.
    pub fn pull(&self) -> Result<Frame> {
        self.pull_timeout(None)
    }

    pub fn pull_timeout(&self, deadline: Option<Instant>) -> Result<Frame> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if !guard.ring.is_empty() {
                break;
            }
            if guard.closed {
                return Err(Error::QueueClosed);
            }
            guard = match deadline {
                None => self.not_empty.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let (next, timeout) = self.not_empty.wait_timeout(guard, deadline - now).unwrap();
                    if timeout.timed_out() && next.ring.is_empty() && !next.closed {
                        return Err(Error::Timeout);
                    }
                    next
                }
            };
        }
        self.do_pull(guard)
    }

    /// Never blocks: fails with `WouldBlock` instead of waiting for a frame.
    pub fn try_pull(&self) -> Result<Frame> {
        let guard = self.inner.lock().unwrap();
        if guard.ring.is_empty() {
            return Err(if guard.closed { Error::QueueClosed } else { Error::WouldBlock });
        }
        self.do_pull(guard)
    }

    fn do_pull(&self, mut guard: MutexGuard<'_, Inner>) -> Result<Frame> {
        let capacity = guard.capacity;
        let pre = band(guard.ring.len(), capacity);
        let frame = guard.ring.pop_front().expect("checked non-empty");
        let post = band(guard.ring.len(), capacity);
        drop(guard);

        self.not_full.notify_one();
        if post != pre {
            self.fire(post);
        }
        Ok(frame)
    }

    /// Repeatedly pulls from `generator` and pushes until the queue is full
    /// or the generator yields `None`, all under this queue's own lock so
    /// `generator` observes a consistent free-slots count.
    pub fn consume<F>(&self, mut generator: F) -> Result<usize>
    where
        F: FnMut() -> Option<Frame>,
    {
        let mut guard = self.inner.lock().unwrap();
        if guard.closed {
            return Err(Error::QueueClosed);
        }
        let capacity = guard.capacity;
        let pre = band(guard.ring.len(), capacity);
        let mut pushed = 0;
        while guard.ring.len() < capacity {
            match generator() {
                Some(frame) => {
                    guard.ring.push_back(frame);
                    pushed += 1;
                }
                None => break,
            }
        }
        let post = band(guard.ring.len(), capacity);
        drop(guard);

        if pushed > 0 {
            self.not_empty.notify_one();
        }
        if post != pre {
            self.fire(post);
        }
        Ok(pushed)
    }

    /// Marks the queue closed and wakes every blocked pusher/puller. Does
    /// not invoke the state callback.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        drop(guard);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

fn locked_transfer(mut src: MutexGuard<'_, Inner>, mut dst: MutexGuard<'_, Inner>, max: usize) -> (bool, usize, QueueState, QueueState, QueueState, QueueState) {
    let src_closed = src.closed;
    let src_pre = band(src.ring.len(), src.capacity);
    let dst_pre = band(dst.ring.len(), dst.capacity);

    let mut moved = 0;
    while moved < max && dst.ring.len() < dst.capacity {
        match src.ring.pop_front() {
            Some(frame) => {
                dst.ring.push_back(frame);
                moved += 1;
            }
            None => break,
        }
    }

    let src_post = band(src.ring.len(), src.capacity);
    let dst_post = band(dst.ring.len(), dst.capacity);
    (src_closed, moved, src_pre, src_post, dst_pre, dst_post)
}

/// Atomically transfers up to `max` frames from `src` to `dst`, locking both
/// queues in a fixed global order (by address) to avoid deadlock against a
/// concurrent move in the opposite direction.
pub fn move_frames(src: &BoundedQueue, dst: &BoundedQueue, max: usize) -> Result<usize> {
    if std::ptr::eq(src, dst) || max == 0 {
        return Ok(0);
    }

    let src_addr = src as *const BoundedQueue as usize;
    let dst_addr = dst as *const BoundedQueue as usize;

    let (src_closed, moved, src_pre, src_post, dst_pre, dst_post) = if src_addr < dst_addr {
        let s = src.inner.lock().unwrap();
        let d = dst.inner.lock().unwrap();
        locked_transfer(s, d, max)
    } else {
        let d = dst.inner.lock().unwrap();
        let s = src.inner.lock().unwrap();
        locked_transfer(s, d, max)
    };

    if src_closed {
        return Err(Error::QueueClosed);
    }
    if moved > 0 {
        dst.not_empty.notify_one();
        src.not_full.notify_one();
    }
    if src_post != src_pre {
        src.fire(src_post);
    }
    if dst_post != dst_pre {
        dst.fire(dst_post);
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn frame(n: u8) -> Frame {
        Frame::new(vec![n])
    }

    #[test]
    fn try_push_fails_when_full() {
        let q = BoundedQueue::new(2);
        q.try_push(frame(1)).unwrap();
        q.try_push(frame(2)).unwrap();
        assert!(matches!(q.try_push(frame(3)), Err(Error::QueueFull)));
    }

    #[test]
    fn try_pull_fails_when_empty() {
        let q = BoundedQueue::new(2);
        assert!(matches!(q.try_pull(), Err(Error::WouldBlock)));
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = BoundedQueue::new(4);
        q.try_push(frame(1)).unwrap();
        q.try_push(frame(2)).unwrap();
        assert_eq!(q.try_pull().unwrap().payload(), &[1]);
        assert_eq!(q.try_pull().unwrap().payload(), &[2]);
    }

    #[test]
    fn callback_fires_exactly_once_per_boundary_crossing() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let q = BoundedQueue::with_state_callback(
            2,
            Box::new(move |state| recorded.lock().unwrap().push(state)),
        );

        q.try_push(frame(1)).unwrap(); // empty -> contents
        q.try_push(frame(2)).unwrap(); // contents -> full
        q.try_pull().unwrap(); // full -> contents
        q.try_pull().unwrap(); // contents -> empty

        let seen = events.lock().unwrap();
        assert_eq!(
            *seen,
            vec![QueueState::Contents, QueueState::Full, QueueState::Contents, QueueState::Empty]
        );
    }

    #[test]
    fn capacity_one_degenerates_to_handoff_and_fires_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let q = BoundedQueue::with_state_callback(
            1,
            Box::new(move |state| recorded.lock().unwrap().push(state)),
        );

        q.try_push(frame(1)).unwrap();
        assert_eq!(*events.lock().unwrap(), vec![QueueState::Full]);
    }

    #[test]
    fn closed_queue_push_does_not_invoke_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let q = BoundedQueue::with_state_callback(2, Box::new(move |_| { counted.fetch_add(1, Ordering::SeqCst); }));
        q.close();
        assert!(matches!(q.try_push(frame(1)), Err(Error::QueueClosed)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn blocked_pull_is_woken_by_push() {
        let q = Arc::new(BoundedQueue::new(1));
        let reader = q.clone();
        let handle = thread::spawn(move || reader.pull().unwrap());
        thread::sleep(std::time::Duration::from_millis(20));
        q.try_push(frame(42)).unwrap();
        let frame = handle.join().unwrap();
        assert_eq!(frame.payload(), &[42]);
    }

    #[test]
    fn move_frames_transfers_up_to_max_and_respects_dst_capacity() {
        let src = BoundedQueue::new(4);
        let dst = BoundedQueue::new(2);
        for n in 1..=3u8 {
            src.try_push(frame(n)).unwrap();
        }
        let moved = move_frames(&src, &dst, 10).unwrap();
        assert_eq!(moved, 2); // dst capacity bound, not max
        assert_eq!(src.count(), 1);
        assert_eq!(dst.count(), 2);
    }

    #[test]
    fn move_frames_from_closed_queue_fails() {
        let src = BoundedQueue::new(2);
        let dst = BoundedQueue::new(2);
        src.close();
        assert!(matches!(move_frames(&src, &dst, 1), Err(Error::QueueClosed)));
    }

    #[test]
    fn consume_stops_at_capacity_or_when_generator_is_dry() {
        let q = BoundedQueue::new(3);
        let mut remaining = 2u8;
        let pushed = q
            .consume(|| {
                if remaining == 0 {
                    None
                } else {
                    remaining -= 1;
                    Some(frame(remaining))
                }
            })
            .unwrap();
        assert_eq!(pushed, 2);
        assert_eq!(q.count(), 2);
    }
}
