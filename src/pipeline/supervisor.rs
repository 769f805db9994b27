//! Pipeline Supervisor: owns the capture session and fanout, decides recovery.
//!
//! ```text
//! Idle -> Negotiating -> Running <-> Degraded
//!              |            |           |
//!              +--------> Faulted <-----+   (backoff, then Negotiating again)
//! any -> Stopping -> Idle
//! ```
//!
//! Each `start` spawns one control task that negotiates, supervises and tears
//! down. Capture runs on a dedicated thread; every sink has its own dispatcher.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use flume::Sender;
use serde::{Serialize, Serializer};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureSession, DeviceRegistry, FormatSpec, SessionConfig};
use crate::error::{PipelineError, Result};
use crate::pipeline::fanout::{Fanout, SinkStatus};
use crate::pipeline::PipelineEvent;
use crate::sink::FrameSink;
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineState {
    Idle,
    Negotiating,
    Running,
    Degraded,
    Stopping,
    Faulted,
}

impl PipelineState {
    /// A capture session exists only in these states
    pub fn is_capturing(self) -> bool {
        matches!(self, PipelineState::Running | PipelineState::Degraded)
    }
}

/// Automatic recovery after a capture fault
#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    pub auto_retry: bool,
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
}

impl RecoveryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.backoff_initial.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.backoff_max.as_secs_f64()))
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            auto_retry: true,
            max_retries: 5,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_millis(8000),
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub session: SessionConfig,
    /// Per-sink queue depth
    pub queue_depth: usize,
    pub recovery: RecoveryPolicy,
    /// Consecutive `Timeout`s before the device is considered hung
    pub max_consecutive_timeouts: u32,
    /// Pin the capture thread to this core
    pub cpu_core: Option<usize>,
    /// How long a detach waits for a sink's dispatcher before abandoning it
    pub detach_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            queue_depth: 4,
            recovery: RecoveryPolicy::default(),
            max_consecutive_timeouts: 3,
            cpu_core: None,
            detach_timeout: Duration::from_millis(1000),
        }
    }
}

impl SupervisorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session: SessionConfig {
                frame_timeout: Duration::from_millis(config.capture.frame_timeout_ms),
                poll_interval: Duration::from_millis(config.pipeline.poll_interval_ms.max(1)),
            },
            queue_depth: config.pipeline.sink_queue_depth,
            recovery: RecoveryPolicy {
                auto_retry: config.recovery.auto_retry,
                max_retries: config.recovery.max_retries,
                backoff_initial: Duration::from_millis(config.recovery.backoff_initial_ms),
                backoff_max: Duration::from_millis(config.recovery.backoff_max_ms),
                backoff_multiplier: config.recovery.backoff_multiplier,
            },
            max_consecutive_timeouts: config.capture.max_consecutive_timeouts.max(1),
            cpu_core: config.capture.cpu_core,
            detach_timeout: Duration::from_millis(config.pipeline.detach_timeout_ms),
        }
    }
}

/// Snapshot returned by [`Supervisor::status`]
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub device: Option<String>,
    pub format: Option<FormatSpec>,
    /// Attached sinks; empty outside Running/Degraded
    pub sinks: Vec<SinkStatus>,
    pub frames_captured: u64,
    pub device_frame_drops: u64,
    /// Recovery attempts since the pipeline last reached Running
    pub retries: u32,
    /// Fault that ended the last session, or the first negotiation failure
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<PipelineError>,
    /// Most recent failed recovery attempt
    #[serde(serialize_with = "serialize_error")]
    pub last_retry_error: Option<PipelineError>,
}

fn serialize_error<S: Serializer>(error: &Option<PipelineError>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

#[derive(Default)]
struct Record {
    device: Option<String>,
    format: Option<FormatSpec>,
    retries: u32,
    last_error: Option<PipelineError>,
    last_retry_error: Option<PipelineError>,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    device_frame_drops: AtomicU64,
}

struct Run {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    registry: DeviceRegistry,
    sinks: Vec<Arc<dyn FrameSink>>,
    config: SupervisorConfig,
    state: watch::Sender<PipelineState>,
    record: Mutex<Record>,
    counters: Arc<Counters>,
    fanout: ArcSwapOption<Fanout>,
    /// Serializes start/stop
    control: tokio::sync::Mutex<Option<Run>>,
}

/// Owns one pipeline. Independent instances do not share state.
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(registry: DeviceRegistry, sinks: Vec<Arc<dyn FrameSink>>, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            inner: Arc::new(Inner {
                registry,
                sinks,
                config,
                state,
                record: Mutex::new(Record::default()),
                counters: Arc::new(Counters::default()),
                fanout: ArcSwapOption::empty(),
                control: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> PipelineState {
        *self.inner.state.borrow()
    }

    /// Start capturing `device_id` in `format` and deliver to every sink.
    ///
    /// Resolves once the first negotiation settles: `Ok` in Running, the
    /// negotiation error in Faulted. Accepted only from Idle or Faulted.
    pub async fn start(&self, device_id: &str, format: FormatSpec) -> Result<()> {
        let mut control = self.inner.control.lock().await;

        let state = self.state();
        if !matches!(state, PipelineState::Idle | PipelineState::Faulted) {
            return Err(PipelineError::InvalidState { action: "start", state });
        }

        // A faulted run may still be backing off
        if let Some(previous) = control.take() {
            previous.cancel.cancel();
            if let Err(e) = previous.task.await {
                error!("Previous pipeline task failed: {}", e);
            }
        }

        {
            let mut record = self.inner.record();
            *record = Record {
                device: Some(device_id.to_string()),
                format: Some(format),
                ..Record::default()
            };
        }
        self.inner.counters.frames_captured.store(0, Ordering::Relaxed);
        self.inner.counters.device_frame_drops.store(0, Ordering::Relaxed);

        info!(device = %device_id, %format, "Starting pipeline");
        self.inner.force_state(PipelineState::Negotiating);

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_pipeline(
            self.inner.clone(),
            device_id.to_string(),
            format,
            cancel.clone(),
            ready_tx,
        ));
        *control = Some(Run { cancel, task });
        drop(control);

        ready_rx.await.unwrap_or(Err(PipelineError::Cancelled))
    }

    /// Stop capture and release every resource. Resolves in Idle.
    pub async fn stop(&self) {
        let mut control = self.inner.control.lock().await;
        let Some(run) = control.take() else {
            self.inner.force_state(PipelineState::Idle);
            return;
        };

        self.inner.force_state(PipelineState::Stopping);
        run.cancel.cancel();
        if let Err(e) = run.task.await {
            error!("Pipeline task failed: {}", e);
        }
        self.inner.fanout.store(None);
        self.inner.force_state(PipelineState::Idle);
        info!("Pipeline stopped");
    }

    pub fn status(&self) -> PipelineStatus {
        let sinks = self
            .inner
            .fanout
            .load()
            .as_ref()
            .map(|fanout| fanout.sink_status())
            .unwrap_or_default();
        let record = self.inner.record();
        PipelineStatus {
            state: self.state(),
            device: record.device.clone(),
            format: record.format,
            sinks,
            frames_captured: self.inner.counters.frames_captured.load(Ordering::Relaxed),
            device_frame_drops: self.inner.counters.device_frame_drops.load(Ordering::Relaxed),
            retries: record.retries,
            last_error: record.last_error.clone(),
            last_retry_error: record.last_retry_error.clone(),
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.inner.state.subscribe()
    }

    /// Wait until the pipeline is in `state`. False on timeout.
    pub async fn wait_for(&self, state: PipelineState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        // Bound to a local so the wait future drops before `rx`
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|current| *current == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Start/stop toggle for interactive front ends.
    ///
    /// Stops a capturing pipeline, otherwise starts one. Returns the state the
    /// pipeline settled in.
    pub async fn toggle(&self, device_id: &str, format: FormatSpec) -> Result<PipelineState> {
        if self.state().is_capturing() {
            self.stop().await;
        } else {
            self.start(device_id, format).await?;
        }
        Ok(self.state())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Ok(mut control) = self.inner.control.try_lock() {
            if let Some(run) = control.take() {
                run.cancel.cancel();
            }
        }
    }
}

impl Inner {
    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition requested by the control task. Never leaves Stopping;
    /// returns false if a stop is in progress.
    fn transition(&self, to: PipelineState) -> bool {
        let mut from = None;
        let mut stopping = false;
        self.state.send_if_modified(|state| {
            if *state == PipelineState::Stopping {
                stopping = true;
                return false;
            }
            if *state == to {
                return false;
            }
            from = Some(std::mem::replace(state, to));
            true
        });
        if let Some(from) = from {
            log_transition(from, to);
        }
        !stopping
    }

    fn force_state(&self, to: PipelineState) {
        let from = self.state.send_replace(to);
        if from != to {
            log_transition(from, to);
        }
    }

    /// Record `error` and publish Faulted.
    ///
    /// A failed recovery attempt keeps the fault that started recovery in
    /// `last_error` and lands in `last_retry_error`.
    fn fault(&self, error: &PipelineError) {
        {
            let mut record = self.record();
            if record.retries > 0 {
                record.last_retry_error = Some(error.clone());
            } else {
                record.last_error = Some(error.clone());
            }
        }
        self.transition(PipelineState::Faulted);
    }

    /// One capture session from negotiation to teardown.
    ///
    /// `Ok` when ended by cancellation, otherwise the error that ended it.
    async fn run_session(
        &self,
        device_id: &str,
        format: FormatSpec,
        cancel: &CancellationToken,
        ready: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        self.transition(PipelineState::Negotiating);

        if self.sinks.is_empty() {
            return Err(PipelineError::NoSinks);
        }

        let capture_cancel = cancel.child_token();
        let mut session = {
            let registry = self.registry.clone();
            let id = device_id.to_string();
            let config = self.config.session;
            let token = capture_cancel.clone();
            tokio::task::spawn_blocking(move || {
                CaptureSession::open(registry.provider(), &id, format, config, token)
            })
            .await
            .map_err(|e| PipelineError::DeviceUnavailable {
                device: device_id.to_string(),
                reason: format!("negotiation task failed: {e}"),
            })??
        };

        if cancel.is_cancelled() {
            session.close();
            return Ok(());
        }

        let (events_tx, events_rx) = flume::unbounded();
        let fanout = Arc::new(Fanout::new(
            self.config.queue_depth,
            self.config.detach_timeout,
            events_tx.clone(),
        ));
        for sink in &self.sinks {
            if let Err(e) = fanout.attach(sink.clone()) {
                session.close();
                release(None, fanout).await;
                return Err(e);
            }
        }

        let device = session.device().id.clone();
        self.fanout.store(Some(fanout.clone()));
        {
            let mut record = self.record();
            record.retries = 0;
            record.last_retry_error = None;
        }
        if !self.transition(PipelineState::Running) {
            session.close();
            self.fanout.store(None);
            release(None, fanout).await;
            return Ok(());
        }
        if let Some(tx) = ready.take() {
            let _ = tx.send(Ok(()));
        }

        let producer = {
            let capture = Capture {
                fanout: fanout.clone(),
                events: events_tx,
                counters: self.counters.clone(),
                max_consecutive_timeouts: self.config.max_consecutive_timeouts,
                cpu_core: self.config.cpu_core,
            };
            std::thread::Builder::new()
                .name("capture".into())
                .spawn(move || capture.run(session))
                .map_err(|e| PipelineError::DeviceUnavailable {
                    device: device.clone(),
                    reason: format!("failed to spawn capture thread: {e}"),
                })
        };
        let producer = match producer {
            Ok(handle) => handle,
            Err(e) => {
                self.fanout.store(None);
                release(None, fanout).await;
                return Err(e);
            }
        };

        let mut impaired = BTreeSet::new();
        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                event = events_rx.recv_async() => match event {
                    Ok(PipelineEvent::SinkInterrupted { handle, error }) => {
                        warn!(%handle, %error, "Sink impaired, capture continues");
                        impaired.insert(handle);
                        self.transition(PipelineState::Degraded);
                    }
                    Ok(PipelineEvent::SinkRecovered { handle, sink }) => {
                        info!(%handle, %sink, "Sink healthy again");
                        impaired.remove(&handle);
                        if impaired.is_empty() {
                            self.transition(PipelineState::Running);
                        }
                    }
                    Ok(PipelineEvent::FrameDrop(error)) => {
                        debug!(%error, "Frame drop");
                    }
                    Ok(PipelineEvent::CaptureFault(error)) => break Err(error),
                    Err(_) => {
                        break Err(PipelineError::DeviceDisconnected {
                            device: device.clone(),
                            reason: "capture thread exited".into(),
                        })
                    }
                }
            }
        };

        capture_cancel.cancel();
        self.fanout.store(None);
        release(Some(producer), fanout).await;
        outcome
    }
}

fn log_transition(from: PipelineState, to: PipelineState) {
    info!(from = ?from, to = ?to, "Pipeline state changed");
    metrics::gauge!("vidrelay_pipeline_state").set(to as u8 as f64);
}

/// Join the capture thread, then detach every sink, off the async runtime
async fn release(producer: Option<ThreadHandle<()>>, fanout: Arc<Fanout>) {
    let teardown = tokio::task::spawn_blocking(move || {
        if let Some(producer) = producer {
            if producer.join().is_err() {
                error!("Capture thread panicked");
            }
        }
        fanout.detach_all();
    });
    if let Err(e) = teardown.await {
        error!("Teardown failed: {}", e);
    }
}

/// Control task for one `start`: negotiation, supervision and recovery
async fn run_pipeline(
    inner: Arc<Inner>,
    device_id: String,
    format: FormatSpec,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let policy = inner.config.recovery;
    let mut ready = Some(ready);

    loop {
        let error = match inner.run_session(&device_id, format, &cancel, &mut ready).await {
            Ok(()) => return,
            Err(_) if cancel.is_cancelled() => return,
            Err(e) => e,
        };

        let first_negotiation = ready.is_some();
        error!(device = %device_id, %error, "Pipeline fault");
        inner.fault(&error);
        if let Some(tx) = ready.take() {
            let _ = tx.send(Err(error.clone()));
        }

        // Configuration-class errors need a manual restart; an absent device
        // during recovery may still be replugged.
        let retryable = !first_negotiation
            && (error.is_recoverable() || matches!(error, PipelineError::DeviceUnavailable { .. }));
        let retries = inner.record().retries;
        if !policy.auto_retry || !retryable || retries >= policy.max_retries {
            if retryable && policy.auto_retry {
                error!(retries, "Recovery attempts exhausted, manual restart required");
            }
            return;
        }

        let attempt = retries + 1;
        inner.record().retries = attempt;
        metrics::counter!("vidrelay_recovery_attempts_total").increment(1);
        let delay = policy.backoff(attempt);
        warn!(
            attempt,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Retrying after backoff"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Producer side of a running session
struct Capture {
    fanout: Arc<Fanout>,
    events: Sender<PipelineEvent>,
    counters: Arc<Counters>,
    max_consecutive_timeouts: u32,
    cpu_core: Option<usize>,
}

impl Capture {
    fn run(self, mut session: CaptureSession) {
        if let Some(core) = self.cpu_core {
            pin_to_core(core);
        }

        let device = session.device().id.clone();
        let mut timeouts = 0u32;
        loop {
            match session.next_frame() {
                Ok(frame) => {
                    timeouts = 0;
                    let missed = frame.meta.missed_before;
                    if missed > 0 {
                        self.counters.device_frame_drops.fetch_add(missed, Ordering::Relaxed);
                        metrics::counter!("vidrelay_device_frame_drops_total").increment(missed);
                        let _ = self.events.send(PipelineEvent::FrameDrop(PipelineError::FrameDrop {
                            device: device.clone(),
                            missed,
                            sequence: frame.sequence(),
                        }));
                    }
                    self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("vidrelay_frames_captured_total").increment(1);
                    self.fanout.publish(frame);
                }
                Err(PipelineError::Cancelled) => break,
                Err(error @ PipelineError::Timeout { .. }) => {
                    timeouts += 1;
                    warn!(%device, timeouts, "No frame within deadline");
                    if timeouts >= self.max_consecutive_timeouts {
                        let _ = self.events.send(PipelineEvent::CaptureFault(error));
                        break;
                    }
                }
                Err(error) => {
                    let _ = self.events.send(PipelineEvent::CaptureFault(error));
                    break;
                }
            }
        }
        session.close();
    }
}

fn pin_to_core(core: usize) {
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!(core, "Cannot query CPU cores, capture thread not pinned");
        return;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            debug!(core, "Capture thread pinned");
        }
        _ => warn!(core, "Failed to pin capture thread"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{PixelFormat, SyntheticProvider};
    use crate::sink::DisplaySink;

    fn yuyv() -> FormatSpec {
        FormatSpec::new(PixelFormat::Yuyv, 640, 480, 30)
    }

    fn supervisor(provider: &SyntheticProvider, sinks: Vec<Arc<dyn FrameSink>>) -> Supervisor {
        let registry = DeviceRegistry::new(Arc::new(provider.clone()));
        let config = SupervisorConfig {
            session: SessionConfig {
                frame_timeout: Duration::from_millis(300),
                poll_interval: Duration::from_millis(10),
            },
            ..SupervisorConfig::default()
        };
        Supervisor::new(registry, sinks, config)
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4000));
        assert_eq!(policy.backoff(5), Duration::from_millis(8000));
        assert_eq!(policy.backoff(40), Duration::from_millis(8000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn starts_and_stops() {
        let provider = SyntheticProvider::camera();
        let display = DisplaySink::new("display");
        let surface = display.surface();
        let sup = supervisor(&provider, vec![Arc::new(display)]);

        sup.start(crate::capture::synthetic::SYNTHETIC_DEVICE, yuyv()).await.unwrap();
        assert_eq!(sup.state(), PipelineState::Running);
        assert_eq!(sup.status().sinks.len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(surface.frames_accepted() > 0);

        sup.stop().await;
        assert_eq!(sup.state(), PipelineState::Idle);
        assert!(sup.status().sinks.is_empty());
        assert_eq!(provider.open_sources(crate::capture::synthetic::SYNTHETIC_DEVICE), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_sinks_faults() {
        let provider = SyntheticProvider::camera();
        let sup = supervisor(&provider, Vec::new());

        let err = sup
            .start(crate::capture::synthetic::SYNTHETIC_DEVICE, yuyv())
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::NoSinks);
        assert_eq!(sup.state(), PipelineState::Faulted);
        assert_eq!(sup.status().last_error, Some(PipelineError::NoSinks));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_format_faults_without_retry() {
        let provider = SyntheticProvider::camera();
        let sup = supervisor(&provider, vec![Arc::new(DisplaySink::new("display"))]);
        let format = FormatSpec::new(PixelFormat::Mjpeg, 1920, 1080, 60);

        let err = sup
            .start(crate::capture::synthetic::SYNTHETIC_DEVICE, format)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FormatRejected { .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.state(), PipelineState::Faulted);
        assert_eq!(sup.status().retries, 0);
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let provider = SyntheticProvider::camera();
        let sup = supervisor(&provider, Vec::new());
        assert!(sup.wait_for(PipelineState::Idle, Duration::from_millis(10)).await);
        assert!(!sup.wait_for(PipelineState::Running, Duration::from_millis(20)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn toggle_starts_then_stops() {
        let provider = SyntheticProvider::camera();
        let sup = supervisor(&provider, vec![Arc::new(DisplaySink::new("display"))]);
        let device = crate::capture::synthetic::SYNTHETIC_DEVICE;

        assert_eq!(sup.toggle(device, yuyv()).await.unwrap(), PipelineState::Running);
        assert_eq!(provider.open_sources(device), 1);

        assert_eq!(sup.toggle(device, yuyv()).await.unwrap(), PipelineState::Idle);
        assert_eq!(provider.open_sources(device), 0);

        assert_eq!(sup.toggle(device, yuyv()).await.unwrap(), PipelineState::Running);
        sup.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn toggle_from_faulted_reports_the_start_error() {
        let provider = SyntheticProvider::camera();
        let sup = supervisor(&provider, Vec::new());
        let device = crate::capture::synthetic::SYNTHETIC_DEVICE;

        assert_eq!(sup.toggle(device, yuyv()).await, Err(PipelineError::NoSinks));
        assert_eq!(sup.state(), PipelineState::Faulted);
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_no_op() {
        let provider = SyntheticProvider::camera();
        let sup = supervisor(&provider, Vec::new());
        sup.stop().await;
        assert_eq!(sup.state(), PipelineState::Idle);
    }
}
