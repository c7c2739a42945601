//! Frame buffers and the per-device buffer pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CameraError, Result};
use crate::traits::FrameCallback;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

/// Outcome of one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    /// Payload is complete.
    Complete,
    /// Transport lost part of the payload.
    Incomplete,
    /// Buffer was smaller than the payload; data is truncated.
    TooSmall,
    /// No capture happened (never filled, or flushed).
    #[default]
    Invalid,
}

/// Metadata of a captured frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameInfo {
    /// Transport frame counter.
    pub frame_id: u64,
    /// Capture outcome.
    pub status: FrameStatus,
    /// Valid bytes in the buffer.
    pub received_size: usize,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Pixel format symbol.
    pub pixel_format: String,
    /// Capture time relative to stream start.
    pub timestamp: Duration,
    /// Payload ends with a chunk trailer.
    pub chunk_present: bool,
}

#[derive(Debug)]
struct BufferShared {
    id: BufferId,
    size: usize,
    payload: Mutex<Vec<u8>>,
    info: Mutex<FrameInfo>,
}

/// Caller-owned storage for one frame.
///
/// Clones share the same storage and identity.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    shared: Arc<BufferShared>,
}

impl FrameBuffer {
    /// Allocate a zeroed buffer of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            shared: Arc::new(BufferShared {
                id: BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
                size,
                payload: Mutex::new(vec![0; size]),
                info: Mutex::new(FrameInfo::default()),
            }),
        }
    }

    /// Buffer identity.
    pub fn id(&self) -> BufferId {
        self.shared.id
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Metadata of the last capture.
    pub fn info(&self) -> FrameInfo {
        self.shared.info.lock().clone()
    }

    /// Copy of the valid payload bytes.
    pub fn payload(&self) -> Vec<u8> {
        self.with_payload(<[u8]>::to_vec)
    }

    /// Borrow the valid payload bytes.
    pub fn with_payload<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let received = self.shared.info.lock().received_size;
        let payload = self.shared.payload.lock();
        f(payload.get(..received).unwrap_or(payload.as_slice()))
    }

    pub(crate) fn reset_info(&self) {
        *self.shared.info.lock() = FrameInfo::default();
    }

    /// Fill through `fill` and record the resulting metadata.
    pub(crate) fn fill_with<F>(&self, fill: F) -> FrameInfo
    where
        F: FnOnce(&mut [u8]) -> Result<FrameInfo>,
    {
        let info = {
            let mut payload = self.shared.payload.lock();
            match fill(&mut payload) {
                Ok(info) => info,
                Err(err) => {
                    debug!(error = %err, "frame fill failed");
                    FrameInfo {
                        status: FrameStatus::Incomplete,
                        ..FrameInfo::default()
                    }
                }
            }
        };
        *self.shared.info.lock() = info.clone();
        info
    }
}

/// Where a buffer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Announced, not queued.
    Announced,
    /// Waiting in the capture queue.
    Queued,
    /// Handed to the transport.
    InFlight,
}

struct PoolEntry {
    buffer: FrameBuffer,
    state: BufferState,
    callback: Option<FrameCallback>,
    queued_once: bool,
}

/// Announced buffers of one device.
#[derive(Default)]
pub struct BufferPool {
    entries: HashMap<BufferId, PoolEntry>,
}

impl BufferPool {
    /// Register a buffer.
    pub fn announce(&mut self, buffer: &FrameBuffer) -> Result<()> {
        if buffer.size() == 0 {
            return Err(CameraError::InvalidValue("buffer has zero size".to_owned()));
        }
        if self.entries.contains_key(&buffer.id()) {
            return Err(CameraError::AlreadyAnnounced);
        }
        self.entries.insert(
            buffer.id(),
            PoolEntry {
                buffer: buffer.clone(),
                state: BufferState::Announced,
                callback: None,
                queued_once: false,
            },
        );
        Ok(())
    }

    /// Release one buffer that is not queued.
    pub fn revoke(&mut self, id: BufferId) -> Result<()> {
        match self.entries.get(&id).map(|entry| entry.state) {
            None => Err(CameraError::UnknownBuffer),
            Some(BufferState::Announced) => {
                self.entries.remove(&id);
                Ok(())
            }
            Some(BufferState::Queued | BufferState::InFlight) => Err(CameraError::InUse),
        }
    }

    /// Release every buffer. Callers flush and drain in-flight captures first.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Lifecycle state of a buffer.
    pub fn state(&self, id: BufferId) -> Result<BufferState> {
        self.entries
            .get(&id)
            .map(|entry| entry.state)
            .ok_or(CameraError::UnknownBuffer)
    }

    /// Whether the buffer was queued at least once.
    pub fn was_queued(&self, id: BufferId) -> Result<bool> {
        self.entries
            .get(&id)
            .map(|entry| entry.queued_once)
            .ok_or(CameraError::UnknownBuffer)
    }

    /// Mark an announced buffer as queued.
    pub fn mark_queued(&mut self, id: BufferId, callback: Option<FrameCallback>) -> Result<()> {
        let entry = self.entries.get_mut(&id).ok_or(CameraError::UnknownBuffer)?;
        if entry.state != BufferState::Announced {
            return Err(CameraError::InUse);
        }
        entry.buffer.reset_info();
        entry.state = BufferState::Queued;
        entry.callback = callback;
        entry.queued_once = true;
        Ok(())
    }

    /// Hand a queued buffer to the transport.
    pub fn mark_in_flight(&mut self, id: BufferId) -> Option<FrameBuffer> {
        let entry = self.entries.get_mut(&id)?;
        if entry.state != BufferState::Queued {
            return None;
        }
        entry.state = BufferState::InFlight;
        Some(entry.buffer.clone())
    }

    /// Return a filled buffer to the announced state and take its callback.
    pub fn complete(&mut self, id: BufferId) -> Option<FrameCallback> {
        let entry = self.entries.get_mut(&id)?;
        entry.state = BufferState::Announced;
        entry.callback.take()
    }

    /// Return a queued buffer to the announced state without capture.
    pub fn cancel(&mut self, id: BufferId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.state == BufferState::Queued {
                entry.state = BufferState::Announced;
                entry.callback = None;
            }
        }
    }

    /// Whether any buffer is with the transport.
    pub fn has_in_flight(&self) -> bool {
        self.entries
            .values()
            .any(|entry| entry.state == BufferState::InFlight)
    }

    /// Number of announced buffers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no buffer is announced.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_twice_fails() {
        let mut pool = BufferPool::default();
        let buffer = FrameBuffer::new(256);
        pool.announce(&buffer).expect("first announce");
        assert!(matches!(
            pool.announce(&buffer.clone()),
            Err(CameraError::AlreadyAnnounced)
        ));
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let mut pool = BufferPool::default();
        assert!(matches!(
            pool.announce(&FrameBuffer::new(0)),
            Err(CameraError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_revoke_unknown_buffer() {
        let mut pool = BufferPool::default();
        assert!(matches!(
            pool.revoke(FrameBuffer::new(16).id()),
            Err(CameraError::UnknownBuffer)
        ));
    }

    #[test]
    fn test_revoke_queued_buffer_is_in_use() {
        let mut pool = BufferPool::default();
        let buffer = FrameBuffer::new(16);
        pool.announce(&buffer).expect("announce");
        pool.mark_queued(buffer.id(), None).expect("queue");
        assert!(matches!(pool.revoke(buffer.id()), Err(CameraError::InUse)));
        assert_eq!(pool.state(buffer.id()).expect("known"), BufferState::Queued);

        pool.cancel(buffer.id());
        pool.revoke(buffer.id()).expect("revoke after cancel");
        assert!(pool.is_empty());
    }

    #[test]
    fn test_queue_twice_is_in_use() {
        let mut pool = BufferPool::default();
        let buffer = FrameBuffer::new(16);
        pool.announce(&buffer).expect("announce");
        pool.mark_queued(buffer.id(), None).expect("queue");
        assert!(matches!(
            pool.mark_queued(buffer.id(), None),
            Err(CameraError::InUse)
        ));
    }

    #[test]
    fn test_fill_records_info_and_limits_payload() {
        let buffer = FrameBuffer::new(8);
        let info = buffer.fill_with(|dst| {
            dst.fill(7);
            Ok(FrameInfo {
                frame_id: 3,
                status: FrameStatus::Complete,
                received_size: 4,
                ..FrameInfo::default()
            })
        });
        assert_eq!(info.frame_id, 3);
        assert_eq!(buffer.info().status, FrameStatus::Complete);
        assert_eq!(buffer.payload(), vec![7; 4]);
    }

    #[test]
    fn test_failed_fill_marks_incomplete() {
        let buffer = FrameBuffer::new(8);
        let info = buffer.fill_with(|_| Err(CameraError::Transport("link down".to_owned())));
        assert_eq!(info.status, FrameStatus::Incomplete);
        assert!(buffer.payload().is_empty());
    }
}
