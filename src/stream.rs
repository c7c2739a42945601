//! Continuous streaming on top of the capability traits.
//!
//! [`Streamer`] announces a ring of buffers, starts capture and re-queues
//! each buffer after its frame has been handed to the consumer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::{debug, warn};

use crate::buffer::FrameBuffer;
use crate::error::{CameraError, Result};
use crate::traits::{AcquisitionControl, BufferLifecycle, DeviceHandle, FrameCallback};

/// Consumer of delivered frames.
pub type FrameHandler = Box<dyn Fn(&FrameBuffer) + Send + Sync>;

struct Requeuer<A> {
    api: Weak<A>,
    on_frame: FrameHandler,
    callback: OnceLock<FrameCallback>,
    active: AtomicBool,
    delivered: AtomicU64,
}

impl<A> Requeuer<A>
where
    A: AcquisitionControl + Send + Sync + 'static,
{
    fn deliver(&self, handle: DeviceHandle, buffer: &FrameBuffer) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        (self.on_frame)(buffer);

        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let Some(api) = self.api.upgrade() else {
            return;
        };
        if let Err(err) = api.capture_frame_queue(handle, buffer, self.callback.get().cloned()) {
            debug!(%handle, error = %err, "re-queue skipped");
        }
    }
}

/// Start/stop streaming consumer generic over the capability traits.
pub struct Streamer<A>
where
    A: BufferLifecycle + AcquisitionControl + Send + Sync + 'static,
{
    api: Arc<A>,
    handle: DeviceHandle,
    running: Option<Arc<Requeuer<A>>>,
}

impl<A> Streamer<A>
where
    A: BufferLifecycle + AcquisitionControl + Send + Sync + 'static,
{
    /// Streamer for `handle`.
    pub const fn new(api: Arc<A>, handle: DeviceHandle) -> Self {
        Self {
            api,
            handle,
            running: None,
        }
    }

    /// Announce `buffer_count` payload-sized buffers, start capture and queue
    /// them all. Every frame goes to `on_frame` and is then re-queued.
    pub fn start<F>(&mut self, buffer_count: usize, on_frame: F) -> Result<()>
    where
        F: Fn(&FrameBuffer) + Send + Sync + 'static,
    {
        if self.running.is_some() {
            return Err(CameraError::AlreadyStarted);
        }
        if buffer_count == 0 {
            return Err(CameraError::InvalidValue(
                "at least one buffer is required".to_owned(),
            ));
        }

        let size = self.api.payload_size(self.handle)?;
        let buffers: Vec<FrameBuffer> = (0..buffer_count).map(|_| FrameBuffer::new(size)).collect();

        let requeuer = Arc::new(Requeuer {
            api: Arc::downgrade(&self.api),
            on_frame: Box::new(on_frame),
            callback: OnceLock::new(),
            active: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&requeuer);
        let callback: FrameCallback = Arc::new(move |handle: DeviceHandle, buffer: &FrameBuffer| {
            if let Some(requeuer) = weak.upgrade() {
                requeuer.deliver(handle, buffer);
            }
        });
        let _ = requeuer.callback.set(Arc::clone(&callback));

        if let Err(err) = self.prime(&buffers, &callback) {
            requeuer.active.store(false, Ordering::Release);
            self.teardown();
            return Err(err);
        }

        debug!(handle = %self.handle, buffer_count, size, "streaming started");
        self.running = Some(requeuer);
        Ok(())
    }

    fn prime(&self, buffers: &[FrameBuffer], callback: &FrameCallback) -> Result<()> {
        for buffer in buffers {
            self.api.frame_announce(self.handle, buffer)?;
        }
        self.api.capture_start(self.handle)?;
        for buffer in buffers {
            self.api
                .capture_frame_queue(self.handle, buffer, Some(Arc::clone(callback)))?;
        }
        Ok(())
    }

    fn teardown(&self) {
        if let Err(err) = self.api.capture_end(self.handle) {
            debug!(handle = %self.handle, error = %err, "capture end during teardown");
        }
        if let Err(err) = self.api.frame_revoke_all(self.handle) {
            warn!(handle = %self.handle, error = %err, "revoke during teardown failed");
        }
    }

    /// End capture and revoke every buffer.
    pub fn stop(&mut self) -> Result<()> {
        let requeuer = self.running.take().ok_or(CameraError::NotStarted)?;
        requeuer.active.store(false, Ordering::Release);
        let ended = self.api.capture_end(self.handle);
        let revoked = self.api.frame_revoke_all(self.handle);
        debug!(
            handle = %self.handle,
            delivered = requeuer.delivered.load(Ordering::Relaxed),
            "streaming stopped"
        );
        ended.and(revoked)
    }

    /// Whether streaming is active.
    pub const fn is_streaming(&self) -> bool {
        self.running.is_some()
    }

    /// Frames handed to the consumer since the last start.
    pub fn frames_delivered(&self) -> u64 {
        self.running
            .as_ref()
            .map_or(0, |requeuer| requeuer.delivered.load(Ordering::Relaxed))
    }
}

impl<A> Drop for Streamer<A>
where
    A: BufferLifecycle + AcquisitionControl + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(err) = self.stop() {
                warn!(handle = %self.handle, error = %err, "stop on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceProfile, SystemConfig};
    use crate::feature::FeatureValue;
    use crate::mock::MockApi;
    use crate::notify::DispatchMode;
    use crate::session::System;
    use crate::sfnc;
    use crate::traits::AccessMode;
    use crossbeam::channel;
    use std::time::Duration;

    #[test]
    fn test_streamer_against_mock_requeues_delivered_frames() {
        let api = Arc::new(MockApi::new());
        let handle = api.handle();
        let mut streamer = Streamer::new(Arc::clone(&api), handle);
        streamer.start(3, |_| {}).expect("start");

        assert_eq!(api.calls_to("frame_announce").len(), 3);
        assert_eq!(api.calls_to("capture_start").len(), 1);
        assert_eq!(api.calls_to("capture_frame_queue").len(), 3);

        assert_eq!(api.deliver_pending(), 3);
        assert_eq!(streamer.frames_delivered(), 3);
        assert_eq!(api.calls_to("capture_frame_queue").len(), 6);

        streamer.stop().expect("stop");
        assert!(!streamer.is_streaming());
        assert_eq!(api.calls_to("capture_end").len(), 1);
        assert_eq!(api.calls_to("frame_revoke_all").len(), 1);
    }

    #[test]
    fn test_failed_start_cleans_up() {
        let api = Arc::new(MockApi::new());
        api.stub("capture_start", Err(CameraError::AlreadyStarted));
        let mut streamer = Streamer::new(Arc::clone(&api), api.handle());

        assert!(matches!(
            streamer.start(2, |_| {}),
            Err(CameraError::AlreadyStarted)
        ));
        assert!(!streamer.is_streaming());
        assert_eq!(api.calls_to("frame_revoke_all").len(), 1);
    }

    #[test]
    fn test_stop_without_start() {
        let api = Arc::new(MockApi::new());
        let mut streamer = Streamer::new(Arc::clone(&api), api.handle());
        assert!(matches!(streamer.stop(), Err(CameraError::NotStarted)));
    }

    #[test]
    fn test_streamer_against_simulator() {
        let config = SystemConfig {
            notify: DispatchMode::Inline,
            profiles: vec![DeviceProfile::standard("sim-0")
                .with_default(sfnc::WIDTH, FeatureValue::Integer(32))
                .with_default(sfnc::HEIGHT, FeatureValue::Integer(32))
                .with_default(sfnc::ACQUISITION_FRAME_RATE, FeatureValue::Float(1000.0))],
        };
        let system = Arc::new(System::simulated(&config).expect("system"));
        let handle = system.open("sim-0", AccessMode::Full).expect("open");

        let (tx, rx) = channel::unbounded();
        let mut streamer = Streamer::new(Arc::clone(&system), handle);
        streamer
            .start(2, move |buffer| {
                let _ = tx.send(buffer.info().frame_id);
            })
            .expect("start");

        let ids: Vec<u64> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("frame"))
            .collect();
        streamer.stop().expect("stop");

        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        system.close(handle).expect("close after stop");
    }
}
