//! Distribution Fanout: one producer, independently paced sinks.
//!
//! Each attached sink gets a bounded [`FrameQueue`] and a dispatcher thread.
//! `publish` only pushes frame references into those queues, so a stalled sink
//! loses its own oldest frames and never slows the producer or its peers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use flume::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::{Frame, SharedFrame};
use crate::error::{PipelineError, Result};
use crate::pipeline::ringbuf::FrameQueue;
use crate::pipeline::PipelineEvent;
use crate::sink::{FrameSink, SinkHandle};

/// Per-sink counters as reported by `status()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkStatus {
    pub handle: SinkHandle,
    pub name: String,
    /// Frames `accept` returned Ok for
    pub delivered: u64,
    /// Frames evicted from this sink's queue
    pub dropped: u64,
    pub queued: usize,
    /// Queue depth; older frames are evicted beyond it
    pub capacity: usize,
    pub interrupted: bool,
}

struct SinkSlot {
    handle: SinkHandle,
    sink: Arc<dyn FrameSink>,
    queue: FrameQueue,
    delivered: AtomicU64,
    interrupted: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Disconnects when the dispatcher returns
    done: Receiver<()>,
}

impl SinkSlot {
    fn status(&self) -> SinkStatus {
        SinkStatus {
            handle: self.handle,
            name: self.sink.name().to_string(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.queue.stats().dropped,
            queued: self.queue.len(),
            capacity: self.queue.capacity(),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

pub struct Fanout {
    /// Attached sinks; `publish` reads a snapshot without locking
    slots: ArcSwap<Vec<Arc<SinkSlot>>>,
    /// Serializes attach/detach
    membership: Mutex<()>,
    next_handle: AtomicU64,
    queue_depth: usize,
    /// Bound on waiting for a dispatcher during detach
    detach_timeout: Duration,
    events: Sender<PipelineEvent>,
}

impl Fanout {
    pub fn new(queue_depth: usize, detach_timeout: Duration, events: Sender<PipelineEvent>) -> Self {
        Self {
            slots: ArcSwap::from_pointee(Vec::new()),
            membership: Mutex::new(()),
            next_handle: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            detach_timeout,
            events,
        }
    }

    /// Attach `sink` and start its dispatcher. Safe while frames are flowing.
    pub fn attach(&self, sink: Arc<dyn FrameSink>) -> Result<SinkHandle> {
        let _guard = self.membership.lock().unwrap_or_else(PoisonError::into_inner);

        if self.slots.load().iter().any(|slot| same_sink(&slot.sink, &sink)) {
            return Err(PipelineError::SinkAttachConflict {
                sink: sink.name().to_string(),
            });
        }

        let handle = SinkHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (done_tx, done) = flume::bounded(1);
        let slot = Arc::new(SinkSlot {
            handle,
            sink,
            queue: FrameQueue::new(self.queue_depth),
            delivered: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
            worker: Mutex::new(None),
            done,
        });

        let name = slot.sink.name().to_string();
        let worker = {
            let slot = slot.clone();
            let events = self.events.clone();
            std::thread::Builder::new()
                .name(format!("sink-{name}"))
                .spawn(move || dispatch(slot, events, done_tx))
                .map_err(|e| PipelineError::StreamInterrupted {
                    sink: name.clone(),
                    reason: format!("failed to spawn dispatcher: {e}"),
                })?
        };
        *slot.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);

        let mut slots = Vec::clone(&self.slots.load());
        slots.push(slot.clone());
        self.slots.store(Arc::new(slots));

        info!(sink = %name, %handle, depth = self.queue_depth, "Sink attached");
        Ok(handle)
    }

    /// Detach a sink, stop its dispatcher and wait for it to finish.
    ///
    /// A dispatcher still inside `accept` after the detach timeout is
    /// abandoned: its thread is left to finish on its own and the sink is
    /// told it was detached. Returns false if the handle is not attached.
    pub fn detach(&self, handle: SinkHandle) -> bool {
        let slot = {
            let _guard = self.membership.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.slots.load();
            let Some(slot) = current.iter().find(|s| s.handle == handle).cloned() else {
                return false;
            };
            let remaining: Vec<_> = current
                .iter()
                .filter(|s| s.handle != handle)
                .cloned()
                .collect();
            self.slots.store(Arc::new(remaining));
            slot
        };

        slot.queue.close();
        let worker = slot
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            match slot.done.recv_timeout(self.detach_timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        sink = %slot.sink.name(),
                        %handle,
                        waited_ms = self.detach_timeout.as_millis() as u64,
                        "Sink dispatcher did not finish, abandoning it"
                    );
                    metrics::counter!("vidrelay_sinks_abandoned_total", "sink" => slot.sink.name().to_string())
                        .increment(1);
                    drop(worker);
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.join().is_err() {
                        warn!(sink = %slot.sink.name(), "Sink dispatcher panicked");
                    }
                }
            }
        }
        slot.sink.detached();

        info!(
            sink = %slot.sink.name(),
            %handle,
            delivered = slot.delivered.load(Ordering::Relaxed),
            dropped = slot.queue.stats().dropped,
            "Sink detached"
        );
        true
    }

    pub fn detach_all(&self) {
        let handles: Vec<SinkHandle> = self.slots.load().iter().map(|s| s.handle).collect();
        for handle in handles {
            self.detach(handle);
        }
    }

    /// Hand `frame` to every attached sink. Never blocks on a sink.
    pub fn publish(&self, frame: Frame) -> SharedFrame {
        let frame: SharedFrame = Arc::new(frame);
        for slot in self.slots.load().iter() {
            if slot.queue.push(frame.clone()) {
                metrics::counter!("vidrelay_frames_dropped_total", "sink" => slot.sink.name().to_string())
                    .increment(1);
                debug!(sink = %slot.sink.name(), sequence = frame.sequence(), "Sink queue full, dropped oldest");
            }
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.slots.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<SinkHandle> {
        self.slots.load().iter().map(|s| s.handle).collect()
    }

    pub fn sink_status(&self) -> Vec<SinkStatus> {
        self.slots.load().iter().map(|s| s.status()).collect()
    }
}

impl Drop for Fanout {
    fn drop(&mut self) {
        self.detach_all();
    }
}

fn same_sink(a: &Arc<dyn FrameSink>, b: &Arc<dyn FrameSink>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Sink execution context: drain the queue in order, report health transitions
fn dispatch(slot: Arc<SinkSlot>, events: Sender<PipelineEvent>, done: Sender<()>) {
    debug!(sink = %slot.sink.name(), "Dispatcher started");
    let mut last_sequence = 0u64;

    while let Some(frame) = slot.queue.pop_blocking() {
        debug_assert!(frame.sequence() > last_sequence);
        last_sequence = frame.sequence();

        match slot.sink.accept(frame) {
            Ok(()) => {
                slot.delivered.fetch_add(1, Ordering::Relaxed);
                if slot.interrupted.swap(false, Ordering::AcqRel) {
                    info!(sink = %slot.sink.name(), "Sink recovered");
                    let _ = events.send(PipelineEvent::SinkRecovered {
                        handle: slot.handle,
                        sink: slot.sink.name().to_string(),
                    });
                }
            }
            Err(error) => {
                if !slot.interrupted.swap(true, Ordering::AcqRel) {
                    warn!(sink = %slot.sink.name(), %error, "Sink interrupted");
                    metrics::counter!("vidrelay_sink_interruptions_total", "sink" => slot.sink.name().to_string())
                        .increment(1);
                    let _ = events.send(PipelineEvent::SinkInterrupted {
                        handle: slot.handle,
                        error,
                    });
                }
            }
        }
    }
    debug!(sink = %slot.sink.name(), "Dispatcher stopped");
    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FormatSpec, FrameMetadata, PixelFormat};
    use bytes::Bytes;
    use std::time::Instant;

    const DETACH: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    impl FrameSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn accept(&self, frame: SharedFrame) -> Result<()> {
            self.seen.lock().unwrap().push(frame.sequence());
            Ok(())
        }
    }

    /// Holds every frame until released
    #[derive(Default)]
    struct Stuck {
        released: AtomicBool,
    }

    impl FrameSink for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn accept(&self, _frame: SharedFrame) -> Result<()> {
            while !self.released.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            Bytes::from_static(&[0; 4]),
            FrameMetadata {
                sequence,
                format: FormatSpec::new(PixelFormat::Yuyv, 2, 1, 30),
                stride: 4,
                missed_before: 0,
                device_timestamp: None,
            },
        )
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn duplicate_attach_conflicts_and_leaves_set_unchanged() {
        let (tx, _rx) = flume::unbounded();
        let fanout = Fanout::new(4, DETACH, tx);
        let sink: Arc<dyn FrameSink> = Arc::new(Recorder::default());

        let handle = fanout.attach(sink.clone()).unwrap();
        let err = fanout.attach(sink.clone()).unwrap_err();
        assert!(matches!(err, PipelineError::SinkAttachConflict { .. }));
        assert_eq!(fanout.handles(), vec![handle]);
    }

    #[test]
    fn per_sink_order_is_strictly_increasing() {
        let (tx, _rx) = flume::unbounded();
        let fanout = Fanout::new(2, DETACH, tx);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        fanout.attach(a.clone()).unwrap();
        fanout.attach(b.clone()).unwrap();

        for seq in 1..=500 {
            fanout.publish(frame(seq));
        }
        wait_until(|| fanout.sink_status().iter().all(|s| s.queued == 0));
        fanout.detach_all();

        for recorder in [a, b] {
            let seen = recorder.seen.lock().unwrap();
            assert!(!seen.is_empty());
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
            assert_eq!(seen.last(), Some(&500));
        }
    }

    #[test]
    fn stalled_sink_drops_only_its_own_frames() {
        let (tx, _rx) = flume::unbounded();
        let fanout = Fanout::new(4, DETACH, tx);
        let stuck = Arc::new(Stuck::default());
        let healthy = Arc::new(Recorder::default());
        let stuck_handle = fanout.attach(stuck.clone()).unwrap();
        let healthy_handle = fanout.attach(healthy.clone()).unwrap();

        let started = Instant::now();
        for seq in 1..=50 {
            fanout.publish(frame(seq));
            std::thread::sleep(Duration::from_millis(1));
        }
        // The producer never waited on the stuck sink
        assert!(started.elapsed() < Duration::from_secs(2));
        wait_until(|| healthy.seen.lock().unwrap().len() == 50);

        let status = fanout.sink_status();
        let of = |h: SinkHandle| status.iter().find(|s| s.handle == h).unwrap().clone();
        assert!(of(stuck_handle).dropped >= 40);
        assert_eq!(of(healthy_handle).dropped, 0);
        assert_eq!(of(healthy_handle).delivered, 50);

        stuck.released.store(true, Ordering::SeqCst);
        fanout.detach_all();
    }

    /// Never returns from `accept` until released
    #[derive(Default)]
    struct Wedged {
        released: AtomicBool,
        detached: AtomicBool,
    }

    impl FrameSink for Wedged {
        fn name(&self) -> &str {
            "wedged"
        }

        fn accept(&self, _frame: SharedFrame) -> Result<()> {
            while !self.released.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        }

        fn detached(&self) {
            self.detached.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn wedged_sink_is_abandoned_after_detach_timeout() {
        let (tx, _rx) = flume::unbounded();
        let fanout = Fanout::new(4, Duration::from_millis(100), tx);
        let wedged = Arc::new(Wedged::default());
        let healthy = Arc::new(Recorder::default());
        let handle = fanout.attach(wedged.clone()).unwrap();
        fanout.attach(healthy.clone()).unwrap();

        fanout.publish(frame(1));
        wait_until(|| healthy.seen.lock().unwrap().len() == 1);

        let started = Instant::now();
        assert!(fanout.detach(handle));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_secs(2), "detach blocked for {waited:?}");
        assert!(wedged.detached.load(Ordering::SeqCst));
        assert_eq!(fanout.len(), 1);

        // The rest of the fanout is unaffected
        fanout.publish(frame(2));
        wait_until(|| healthy.seen.lock().unwrap().len() == 2);

        wedged.released.store(true, Ordering::SeqCst);
        fanout.detach_all();
    }

    #[test]
    fn status_reports_queue_capacity() {
        let (tx, _rx) = flume::unbounded();
        let fanout = Fanout::new(3, DETACH, tx);
        fanout.attach(Arc::new(Recorder::default())).unwrap();
        assert_eq!(fanout.sink_status()[0].capacity, 3);
    }

    #[test]
    fn detach_while_publishing() {
        let (tx, _rx) = flume::unbounded();
        let fanout = Arc::new(Fanout::new(4, DETACH, tx));
        let recorder = Arc::new(Recorder::default());
        let handle = fanout.attach(recorder.clone()).unwrap();

        let producer = {
            let fanout = fanout.clone();
            std::thread::spawn(move || {
                for seq in 1..=200 {
                    fanout.publish(frame(seq));
                    std::thread::sleep(Duration::from_micros(200));
                }
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(fanout.detach(handle));
        assert!(!fanout.detach(handle));
        producer.join().unwrap();

        assert!(fanout.is_empty());
        let seen = recorder.seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn frames_are_released_after_delivery() {
        let (tx, _rx) = flume::unbounded();
        let fanout = Fanout::new(4, DETACH, tx);
        fanout.attach(Arc::new(Recorder::default())).unwrap();
        fanout.attach(Arc::new(Recorder::default())).unwrap();

        let shared = fanout.publish(frame(1));
        wait_until(|| Arc::strong_count(&shared) == 1);
    }

    struct Flaky {
        failing: AtomicBool,
    }

    impl FrameSink for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn accept(&self, _frame: SharedFrame) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PipelineError::StreamInterrupted {
                    sink: "flaky".into(),
                    reason: "link down".into(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn health_transitions_are_reported_once() {
        let (tx, rx) = flume::unbounded();
        let fanout = Fanout::new(4, DETACH, tx);
        let flaky = Arc::new(Flaky {
            failing: AtomicBool::new(true),
        });
        let handle = fanout.attach(flaky.clone()).unwrap();

        for seq in 1..=3 {
            fanout.publish(frame(seq));
        }
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, PipelineEvent::SinkInterrupted { handle: h, .. } if h == handle));
        wait_until(|| fanout.sink_status()[0].queued == 0);
        assert!(rx.try_recv().is_err());

        flaky.failing.store(false, Ordering::SeqCst);
        fanout.publish(frame(4));
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, PipelineEvent::SinkRecovered { handle: h, .. } if h == handle));
        fanout.detach_all();
    }
}
