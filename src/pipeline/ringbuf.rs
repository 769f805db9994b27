//! Bounded drop-oldest frame queue, one per attached sink

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender};
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::SharedFrame;

/// How long a waiting consumer sleeps before re-checking for close
const WAKE_INTERVAL: Duration = Duration::from_millis(100);

/// Frame queue between the fanout (producer) and one sink's dispatcher (consumer)
pub struct FrameQueue {
    /// Frame references only; the bytes are shared with every other sink
    ring: Mutex<HeapRb<SharedFrame>>,

    /// Doorbell rung on every push; capacity 1 so it never grows
    bell_tx: Sender<()>,
    bell_rx: Receiver<()>,
    closed: AtomicBool,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let (bell_tx, bell_rx) = flume::bounded(1);
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            bell_tx,
            bell_rx,
            closed: AtomicBool::new(false),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn ring(&self) -> MutexGuard<'_, HeapRb<SharedFrame>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: enqueue, evicting the oldest frame when full.
    ///
    /// Never blocks on the consumer. Returns true if a frame was evicted.
    pub fn push(&self, frame: SharedFrame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let evicted = self.ring().push_overwrite(frame);
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        let dropped = evicted.is_some();
        if dropped {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        // Evicted frame is released here, outside the lock
        drop(evicted);

        let _ = self.bell_tx.try_send(());
        dropped
    }

    /// Consumer: take the oldest frame without waiting
    pub fn pop(&self) -> Option<SharedFrame> {
        let frame = self.ring().try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Consumer: wait for the oldest frame. `None` once the queue is closed.
    pub fn pop_blocking(&self) -> Option<SharedFrame> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(frame) = self.pop() {
                return Some(frame);
            }
            let _ = self.bell_rx.recv_timeout(WAKE_INTERVAL);
        }
    }

    /// Wake the consumer, refuse further pushes and release queued frames
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.bell_tx.try_send(());
        let mut ring = self.ring();
        while ring.try_pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.ring().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring().capacity().get()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FormatSpec, Frame, FrameMetadata, PixelFormat};
    use bytes::Bytes;
    use std::sync::Arc;

    fn frame(sequence: u64) -> SharedFrame {
        Arc::new(Frame::new(
            Bytes::from_static(b"frame"),
            FrameMetadata {
                sequence,
                format: FormatSpec::new(PixelFormat::Yuyv, 2, 1, 30),
                stride: 4,
                missed_before: 0,
                device_timestamp: None,
            },
        ))
    }

    #[test]
    fn evicts_oldest_when_full() {
        let queue = FrameQueue::new(3);
        for seq in 1..=5 {
            queue.push(frame(seq));
        }

        let kept: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|f| f.sequence()).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(
            queue.stats(),
            QueueStats {
                written: 5,
                read: 3,
                dropped: 2
            }
        );
    }

    #[test]
    fn keeping_up_never_drops() {
        let queue = FrameQueue::new(2);
        for seq in 1..=100 {
            assert!(!queue.push(frame(seq)));
            assert_eq!(queue.pop().map(|f| f.sequence()), Some(seq));
        }
        assert_eq!(queue.stats().dropped, 0);
    }

    #[test]
    fn evicted_frames_are_released() {
        let queue = FrameQueue::new(1);
        let first = frame(1);
        queue.push(first.clone());
        assert_eq!(Arc::strong_count(&first), 2);
        queue.push(frame(2));
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn close_wakes_waiting_consumer() {
        let queue = Arc::new(FrameQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop_blocking())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(consumer.join().unwrap().is_none());
        assert!(!queue.push(frame(1)));
        assert!(queue.is_empty());
    }
}
