//! Bounded single-producer/single-consumer frame ring with drop-oldest
//! overflow, grounded on `drd_frame_queue.c`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::frame::SharedFrame;

/// Default ring capacity. Kept small deliberately: this queue exists only to
/// absorb a capture/encode scheduling jitter, not to buffer a backlog.
pub const DEFAULT_CAPACITY: usize = 3;

struct Inner {
    slots: VecDeque<SharedFrame>,
    capacity: usize,
    running: bool,
    dropped_frames: u64,
}

/// A frame handoff point between the capture thread and the encoding thread.
pub struct FrameQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl FrameQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: VecDeque::with_capacity(capacity),
                capacity,
                running: true,
                dropped_frames: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Push a captured frame. A no-op while stopped; drops the oldest slot
    /// and counts it when at capacity.
    pub fn push(&self, frame: SharedFrame) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running {
            return;
        }
        if inner.slots.len() == inner.capacity {
            inner.slots.pop_front();
            inner.dropped_frames += 1;
        }
        inner.slots.push_back(frame);
        self.cond.notify_all();
    }

    /// Wait up to `timeout_us` for a frame. `timeout_us < 0` blocks
    /// indefinitely, `0` polls without blocking, `>0` is a deadline.
    pub fn wait(&self, timeout_us: i64) -> Option<SharedFrame> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running {
            return None;
        }

        if timeout_us == 0 {
            return Self::try_take(&mut inner);
        }

        if timeout_us < 0 {
            while inner.running && inner.slots.is_empty() {
                inner = self.cond.wait(inner).unwrap();
            }
        } else {
            let deadline = Instant::now() + Duration::from_micros(timeout_us as u64);
            while inner.running && inner.slots.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, timeout_result) =
                    self.cond.wait_timeout(inner, deadline - now).unwrap();
                inner = guard;
                if timeout_result.timed_out() && inner.slots.is_empty() {
                    break;
                }
            }
        }

        if inner.running {
            Self::try_take(&mut inner)
        } else {
            None
        }
    }

    fn try_take(inner: &mut Inner) -> Option<SharedFrame> {
        inner.slots.pop_front()
    }

    /// Restore `running = true`, clear all slots, zero counters, wake waiters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = true;
        inner.slots.clear();
        inner.dropped_frames = 0;
        self.cond.notify_all();
    }

    /// Mark stopped and wake every waiter; subsequent `wait` calls return
    /// `None` immediately.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = false;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.inner.lock().unwrap().dropped_frames
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::sync::Arc;
    use std::thread;

    fn dummy_frame() -> SharedFrame {
        Arc::new(Frame::new())
    }

    #[test]
    fn push_past_capacity_drops_oldest_and_counts() {
        let queue = FrameQueue::new(2);
        for _ in 0..5 {
            queue.push(dummy_frame());
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_frames(), 3);
    }

    #[test]
    fn poll_on_empty_queue_returns_none() {
        let queue = FrameQueue::new(3);
        assert!(queue.wait(0).is_none());
    }

    #[test]
    fn stop_wakes_waiters_with_none() {
        let queue = Arc::new(FrameQueue::new(3));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait(-1))
        };
        thread::sleep(Duration::from_millis(20));
        queue.stop();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn reset_is_idempotent_and_clears_state() {
        let queue = FrameQueue::new(2);
        queue.push(dummy_frame());
        queue.push(dummy_frame());
        queue.push(dummy_frame());
        queue.stop();
        queue.reset();
        queue.reset();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.dropped_frames(), 0);
        assert!(queue.wait(0).is_none());
    }
}
