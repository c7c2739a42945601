//! Acquisition engine: capture state machine, FIFO frame queue and the worker
//! thread that hands queued buffers to the transport.
//!
//! One engine exists per open handle and owns that handle's [`BufferPool`].
//! Collections are guarded by one mutex; the worker and waiters coordinate
//! through a condvar signaled on every queue or completion change.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::buffer::{BufferId, BufferPool, BufferState, FrameBuffer, FrameInfo};
use crate::error::{CameraError, Result};
use crate::feature::FeatureRegistry;
use crate::traits::{CaptureState, DeviceHandle, DeviceLink, FrameCallback};

#[derive(Default)]
struct EngineState {
    capture: CaptureState,
    pool: BufferPool,
    queue: VecDeque<BufferId>,
    worker: Option<JoinHandle<()>>,
    worker_thread: Option<ThreadId>,
    retired: bool,
}

impl EngineState {
    /// Return queued, undelivered buffers to the announced state.
    fn flush(&mut self) -> usize {
        let Self { pool, queue, .. } = self;
        let count = queue.len();
        for id in queue.drain(..) {
            pool.cancel(id);
        }
        count
    }

    fn on_worker(&self) -> bool {
        self.worker_thread == Some(thread::current().id())
    }
}

/// Capture pipeline of one device handle.
pub struct AcquisitionEngine {
    handle: DeviceHandle,
    link: Arc<dyn DeviceLink>,
    /// Serializes start and end, including the worker join.
    control: Mutex<()>,
    state: Mutex<EngineState>,
    signal: Condvar,
}

impl AcquisitionEngine {
    /// Engine over an open link.
    pub fn new(handle: DeviceHandle, link: Arc<dyn DeviceLink>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            link,
            control: Mutex::new(()),
            state: Mutex::new(EngineState::default()),
            signal: Condvar::new(),
        })
    }

    /// Current capture state.
    pub fn capture_state(&self) -> CaptureState {
        self.state.lock().capture
    }

    /// Number of announced buffers.
    pub fn buffer_count(&self) -> usize {
        self.state.lock().pool.len()
    }

    /// Lifecycle state of an announced buffer.
    pub fn buffer_state(&self, buffer: &FrameBuffer) -> Result<BufferState> {
        self.state.lock().pool.state(buffer.id())
    }

    /// Refuse further buffers and capture once the engine is idle.
    ///
    /// Fails with `StillCapturing` while capture runs or any buffer is
    /// announced. Checked and marked under one lock, so an `announce` racing
    /// with a close either lands first and blocks the close or fails after it.
    pub fn retire(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.capture == CaptureState::Started || !state.pool.is_empty() {
            return Err(CameraError::StillCapturing);
        }
        state.retired = true;
        Ok(())
    }

    /// Register a buffer with the pool.
    pub fn announce(&self, buffer: &FrameBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(CameraError::InvalidHandle);
        }
        state.pool.announce(buffer)?;
        debug!(handle = %self.handle, size = buffer.size(), "frame announced");
        Ok(())
    }

    /// Release a buffer that is neither queued nor being filled.
    pub fn revoke(&self, buffer: &FrameBuffer) -> Result<()> {
        self.state.lock().pool.revoke(buffer.id())?;
        debug!(handle = %self.handle, "frame revoked");
        Ok(())
    }

    /// Flush, wait out the in-flight capture, then release every buffer.
    pub fn revoke_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.on_worker() {
            return Err(CameraError::InvalidCall(
                "revoke_all from a frame callback".to_owned(),
            ));
        }
        state.flush();
        self.signal.notify_all();
        while state.pool.has_in_flight() {
            self.signal.wait(&mut state);
        }
        let released = state.pool.clear();
        debug!(handle = %self.handle, released, "all frames revoked");
        Ok(())
    }

    /// Idle or Stopped to Started.
    ///
    /// Holds the feature lock while the transport is prepared so no
    /// streaming-locked feature can change under it.
    pub fn start(self: &Arc<Self>, features: &Mutex<FeatureRegistry>) -> Result<()> {
        if self.state.lock().capture == CaptureState::Started {
            return Err(CameraError::AlreadyStarted);
        }
        let _control = self.control.lock();
        let features = features.lock();

        let mut state = self.state.lock();
        if state.retired {
            return Err(CameraError::InvalidHandle);
        }
        if state.capture == CaptureState::Started {
            return Err(CameraError::AlreadyStarted);
        }
        self.link.start_streaming(&features.snapshot())?;

        let engine = Arc::clone(self);
        let worker = thread::Builder::new()
            .name(format!("cam-capture-{}", self.handle.raw()))
            .spawn(move || engine.run());
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                if let Err(stop_err) = self.link.stop_streaming() {
                    warn!(handle = %self.handle, error = %stop_err, "stop after failed start");
                }
                return Err(err.into());
            }
        };
        state.worker_thread = Some(worker.thread().id());
        state.worker = Some(worker);
        state.capture = CaptureState::Started;
        debug!(handle = %self.handle, "capture started");
        Ok(())
    }

    /// Started to Stopped. Flushes the queue and waits for the in-flight
    /// capture to finish.
    ///
    /// The engine is Stopped once this returns, even when the transport
    /// reports an error stopping the stream; that error is still returned.
    pub fn end(&self) -> Result<()> {
        if self.state.lock().on_worker() {
            return Err(CameraError::InvalidCall(
                "capture_end from a frame callback".to_owned(),
            ));
        }
        let _control = self.control.lock();

        let worker = {
            let mut state = self.state.lock();
            if state.capture != CaptureState::Started {
                return Err(CameraError::NotStarted);
            }
            let flushed = state.flush();
            state.capture = CaptureState::Stopped;
            self.signal.notify_all();
            debug!(handle = %self.handle, flushed, "capture ending");
            state.worker.take()
        };

        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(handle = %self.handle, "capture worker panicked");
            }
        }
        self.state.lock().worker_thread = None;
        self.link.stop_streaming()?;
        debug!(handle = %self.handle, "capture ended");
        Ok(())
    }

    /// Queue an announced buffer for the next capture.
    pub fn queue(&self, buffer: &FrameBuffer, callback: Option<FrameCallback>) -> Result<()> {
        let mut state = self.state.lock();
        if state.capture != CaptureState::Started {
            return Err(CameraError::NotStarted);
        }
        state.pool.mark_queued(buffer.id(), callback)?;
        state.queue.push_back(buffer.id());
        self.signal.notify_all();
        trace!(handle = %self.handle, depth = state.queue.len(), "frame queued");
        Ok(())
    }

    /// Block until `buffer` leaves the queue or `timeout` elapses.
    ///
    /// Expiry does not cancel the capture; the buffer stays queued. A
    /// timeout too large to represent as a deadline waits without one.
    pub fn wait(&self, buffer: &FrameBuffer, timeout: Duration) -> Result<FrameInfo> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        if state.capture != CaptureState::Started {
            return Err(CameraError::NotStarted);
        }
        if !state.pool.was_queued(buffer.id())? {
            return Err(CameraError::InvalidCall(
                "wait on a buffer that was never queued".to_owned(),
            ));
        }
        loop {
            if state.pool.state(buffer.id())? == BufferState::Announced {
                return Ok(buffer.info());
            }
            let timed_out = match deadline {
                Some(deadline) => self.signal.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.signal.wait(&mut state);
                    false
                }
            };
            if timed_out && state.pool.state(buffer.id())? != BufferState::Announced {
                return Err(CameraError::Timeout);
            }
        }
    }

    /// Cancel all queued, undelivered frames.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        let flushed = state.flush();
        self.signal.notify_all();
        debug!(handle = %self.handle, flushed, "queue flushed");
    }

    /// End capture if running and release every buffer. Used on teardown.
    pub fn force_stop(&self) {
        if self.capture_state() == CaptureState::Started {
            if let Err(err) = self.end() {
                warn!(handle = %self.handle, error = %err, "forced capture end failed");
            }
        }
        if let Err(err) = self.revoke_all() {
            warn!(handle = %self.handle, error = %err, "forced revoke failed");
        }
    }

    fn next_buffer(&self) -> Option<FrameBuffer> {
        let mut state = self.state.lock();
        loop {
            if state.capture != CaptureState::Started {
                return None;
            }
            if let Some(id) = state.queue.pop_front() {
                if let Some(buffer) = state.pool.mark_in_flight(id) {
                    return Some(buffer);
                }
                continue;
            }
            self.signal.wait(&mut state);
        }
    }

    fn run(&self) {
        debug!(handle = %self.handle, "capture worker running");
        while let Some(buffer) = self.next_buffer() {
            let info = buffer.fill_with(|dst| self.link.fill_frame(dst));
            trace!(
                handle = %self.handle,
                frame_id = info.frame_id,
                status = ?info.status,
                bytes = info.received_size,
                "frame filled"
            );

            let callback = {
                let mut state = self.state.lock();
                let callback = state.pool.complete(buffer.id());
                self.signal.notify_all();
                callback
            };
            if let Some(callback) = callback {
                let delivered = catch_unwind(AssertUnwindSafe(|| callback(self.handle, &buffer)));
                if delivered.is_err() {
                    warn!(handle = %self.handle, "frame callback panicked");
                }
            }
        }
        debug!(handle = %self.handle, "capture worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameStatus;
    use crate::feature::{FeatureDescriptor, FeatureSnapshot};
    use crate::traits::FeatureCatalog;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Link that fills each frame with its counter after `latency`.
    struct CountingLink {
        latency: Duration,
        frames: AtomicU64,
    }

    impl DeviceLink for CountingLink {
        fn catalog(&self) -> Result<FeatureCatalog> {
            Ok(FeatureCatalog::default())
        }

        fn run_command(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn command_done(&self, _name: &str) -> Result<bool> {
            Ok(true)
        }

        fn payload_size(&self, _features: &FeatureSnapshot) -> Result<usize> {
            Ok(16)
        }

        fn start_streaming(&self, _features: &FeatureSnapshot) -> Result<()> {
            Ok(())
        }

        fn stop_streaming(&self) -> Result<()> {
            Ok(())
        }

        fn fill_frame(&self, dst: &mut [u8]) -> Result<FrameInfo> {
            thread::sleep(self.latency);
            let frame_id = self.frames.fetch_add(1, Ordering::SeqCst);
            #[allow(clippy::cast_possible_truncation)]
            dst.fill(frame_id as u8);
            Ok(FrameInfo {
                frame_id,
                status: FrameStatus::Complete,
                received_size: dst.len(),
                ..FrameInfo::default()
            })
        }
    }

    fn engine(latency: Duration) -> (Arc<AcquisitionEngine>, Mutex<FeatureRegistry>) {
        let link = Arc::new(CountingLink {
            latency,
            frames: AtomicU64::new(0),
        });
        let features = FeatureRegistry::new(
            vec![FeatureDescriptor::integer("Width", 8, 64)],
            &BTreeMap::new(),
        )
        .expect("registry");
        (AcquisitionEngine::new(DeviceHandle(1), link), Mutex::new(features))
    }

    #[test]
    fn test_queue_before_start_is_not_started() {
        let (engine, _) = engine(Duration::ZERO);
        let buffer = FrameBuffer::new(16);
        engine.announce(&buffer).expect("announce");
        assert!(matches!(
            engine.queue(&buffer, None),
            Err(CameraError::NotStarted)
        ));
    }

    #[test]
    fn test_start_twice_is_already_started() {
        let (engine, features) = engine(Duration::ZERO);
        engine.start(&features).expect("start");
        assert!(matches!(
            engine.start(&features),
            Err(CameraError::AlreadyStarted)
        ));
        engine.end().expect("end");
        assert!(matches!(engine.end(), Err(CameraError::NotStarted)));
        assert_eq!(engine.capture_state(), CaptureState::Stopped);
    }

    #[test]
    fn test_frames_are_serviced_in_fifo_order() {
        let (engine, features) = engine(Duration::from_millis(1));
        let buffers: Vec<FrameBuffer> = (0..3).map(|_| FrameBuffer::new(16)).collect();
        for buffer in &buffers {
            engine.announce(buffer).expect("announce");
        }
        engine.start(&features).expect("start");
        for buffer in &buffers {
            engine.queue(buffer, None).expect("queue");
        }

        let ids: Vec<u64> = buffers
            .iter()
            .map(|buffer| {
                engine
                    .wait(buffer, Duration::from_secs(1))
                    .expect("frame")
                    .frame_id
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        engine.end().expect("end");
    }

    #[test]
    fn test_wait_times_out_without_cancelling() {
        let (engine, features) = engine(Duration::from_millis(200));
        let buffer = FrameBuffer::new(16);
        engine.announce(&buffer).expect("announce");
        engine.start(&features).expect("start");
        engine.queue(&buffer, None).expect("queue");

        assert!(matches!(
            engine.wait(&buffer, Duration::from_millis(1)),
            Err(CameraError::Timeout)
        ));
        let info = engine.wait(&buffer, Duration::from_secs(2)).expect("frame");
        assert_eq!(info.status, FrameStatus::Complete);
        engine.end().expect("end");
    }

    #[test]
    fn test_wait_on_never_queued_buffer_is_invalid_call() {
        let (engine, features) = engine(Duration::ZERO);
        let buffer = FrameBuffer::new(16);
        engine.announce(&buffer).expect("announce");
        engine.start(&features).expect("start");
        assert!(matches!(
            engine.wait(&buffer, Duration::from_millis(10)),
            Err(CameraError::InvalidCall(_))
        ));
        engine.end().expect("end");
    }

    #[test]
    fn test_end_flushes_queued_frames() {
        let (engine, features) = engine(Duration::from_millis(50));
        let first = FrameBuffer::new(16);
        let second = FrameBuffer::new(16);
        engine.announce(&first).expect("announce");
        engine.announce(&second).expect("announce");
        engine.start(&features).expect("start");
        engine.queue(&first, None).expect("queue");
        engine.queue(&second, None).expect("queue");

        engine.end().expect("end");
        assert_eq!(engine.buffer_state(&second).expect("known"), BufferState::Announced);
        engine.revoke(&second).expect("revoke after end");
        engine.revoke(&first).expect("revoke after end");
        assert_eq!(engine.buffer_count(), 0);
    }

    #[test]
    fn test_callback_runs_once_per_frame() {
        let (engine, features) = engine(Duration::ZERO);
        let buffer = FrameBuffer::new(16);
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let callback: FrameCallback = Arc::new(move |_: DeviceHandle, _: &FrameBuffer| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        engine.announce(&buffer).expect("announce");
        engine.start(&features).expect("start");
        engine.queue(&buffer, Some(callback)).expect("queue");
        engine.wait(&buffer, Duration::from_secs(1)).expect("frame");
        engine.end().expect("end");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_revoke_all_after_end_releases_everything() {
        let (engine, features) = engine(Duration::ZERO);
        for _ in 0..4 {
            engine.announce(&FrameBuffer::new(16)).expect("announce");
        }
        engine.start(&features).expect("start");
        engine.end().expect("end");
        engine.revoke_all().expect("revoke all");
        assert_eq!(engine.buffer_count(), 0);
    }

    #[test]
    fn test_flush_while_started_keeps_capturing() {
        let (engine, features) = engine(Duration::from_millis(100));
        let first = FrameBuffer::new(16);
        let second = FrameBuffer::new(16);
        engine.announce(&first).expect("announce");
        engine.announce(&second).expect("announce");
        engine.start(&features).expect("start");
        engine.queue(&first, None).expect("queue");
        engine.queue(&second, None).expect("queue");

        engine.flush();
        assert_eq!(engine.capture_state(), CaptureState::Started);
        assert_eq!(engine.buffer_state(&second).expect("known"), BufferState::Announced);
        let info = engine.wait(&second, Duration::from_secs(1)).expect("flushed");
        assert_eq!(info.status, FrameStatus::Invalid);

        engine.queue(&second, None).expect("requeue after flush");
        let info = engine.wait(&second, Duration::from_secs(2)).expect("frame");
        assert_eq!(info.status, FrameStatus::Complete);
        engine.end().expect("end");
        engine.revoke_all().expect("revoke all");
    }

    #[test]
    fn test_revoke_all_while_started_flushes_first() {
        let (engine, features) = engine(Duration::from_millis(50));
        let buffers: Vec<FrameBuffer> = (0..3).map(|_| FrameBuffer::new(16)).collect();
        for buffer in &buffers {
            engine.announce(buffer).expect("announce");
        }
        engine.start(&features).expect("start");
        for buffer in &buffers {
            engine.queue(buffer, None).expect("queue");
        }

        engine.revoke_all().expect("revoke all");
        assert_eq!(engine.buffer_count(), 0);
        assert_eq!(engine.capture_state(), CaptureState::Started);
        engine.end().expect("end");
    }

    #[test]
    fn test_wait_accepts_unbounded_timeout() {
        let (engine, features) = engine(Duration::from_millis(5));
        let buffer = FrameBuffer::new(16);
        engine.announce(&buffer).expect("announce");
        engine.start(&features).expect("start");
        engine.queue(&buffer, None).expect("queue");

        let info = engine.wait(&buffer, Duration::MAX).expect("frame");
        assert_eq!(info.status, FrameStatus::Complete);
        engine.end().expect("end");
    }

    #[test]
    fn test_retire_requires_idle_engine() {
        let (engine, features) = engine(Duration::ZERO);
        let buffer = FrameBuffer::new(16);
        engine.announce(&buffer).expect("announce");
        assert!(matches!(engine.retire(), Err(CameraError::StillCapturing)));

        engine.revoke(&buffer).expect("revoke");
        engine.start(&features).expect("start");
        assert!(matches!(engine.retire(), Err(CameraError::StillCapturing)));
        engine.end().expect("end");

        engine.retire().expect("idle engine retires");
        assert!(matches!(
            engine.announce(&FrameBuffer::new(16)),
            Err(CameraError::InvalidHandle)
        ));
        assert!(matches!(
            engine.start(&features),
            Err(CameraError::InvalidHandle)
        ));
    }
}
