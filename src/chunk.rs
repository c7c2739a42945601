//! Chunk data appended to frame payloads.
//!
//! Layout follows the GenICam trailer convention: the image comes first,
//! then each chunk as `data | id: u32 BE | len: u32 BE`. The payload is
//! parsed backwards from its end.

use std::collections::BTreeMap;

use crate::buffer::FrameBuffer;
use crate::error::{CameraError, Result};

/// Chunk carrying the image itself.
pub const CHUNK_IMAGE: u32 = 0x0000_0001;
/// Frame counter, `u64` BE.
pub const CHUNK_FRAME_ID: u32 = 0x1000_0001;
/// Exposure time in microseconds, `f64` BE.
pub const CHUNK_EXPOSURE_TIME: u32 = 0x1000_0002;
/// Gain in dB, `f64` BE.
pub const CHUNK_GAIN: u32 = 0x1000_0003;
/// Timestamp in nanoseconds, `u64` BE.
pub const CHUNK_TIMESTAMP: u32 = 0x1000_0004;

const TAG_LEN: usize = 8;

/// Bytes the trailer adds around an image when every standard chunk is present.
pub const TRAILER_OVERHEAD: usize = TAG_LEN * 5 + 8 * 4;

/// Parsed chunks of one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkData {
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl ChunkData {
    /// Parse a trailer-formatted payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut chunks = BTreeMap::new();
        let mut end = payload.len();
        while end > 0 {
            let tag_start = end
                .checked_sub(TAG_LEN)
                .ok_or_else(|| CameraError::ParsingChunkData(format!("truncated tag at {end}")))?;
            let id = read_u32(payload, tag_start)?;
            let len = read_u32(payload, tag_start + 4)? as usize;
            let data_start = tag_start.checked_sub(len).ok_or_else(|| {
                CameraError::ParsingChunkData(format!("chunk {id:#x} claims {len} bytes"))
            })?;
            let data = payload
                .get(data_start..tag_start)
                .ok_or_else(|| CameraError::ParsingChunkData(format!("chunk {id:#x} out of range")))?;
            chunks.insert(id, data.to_vec());
            end = data_start;
        }
        Ok(Self { chunks })
    }

    /// Raw bytes of one chunk.
    pub fn get(&self, id: u32) -> Option<&[u8]> {
        self.chunks.get(&id).map(Vec::as_slice)
    }

    /// Chunk ids present.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.chunks.keys().copied()
    }

    /// The image bytes.
    pub fn image(&self) -> Option<&[u8]> {
        self.get(CHUNK_IMAGE)
    }

    /// Frame counter chunk.
    pub fn frame_id(&self) -> Result<u64> {
        self.fixed(CHUNK_FRAME_ID).map(u64::from_be_bytes)
    }

    /// Exposure time chunk.
    pub fn exposure_time(&self) -> Result<f64> {
        self.fixed(CHUNK_EXPOSURE_TIME).map(f64::from_be_bytes)
    }

    /// Gain chunk.
    pub fn gain(&self) -> Result<f64> {
        self.fixed(CHUNK_GAIN).map(f64::from_be_bytes)
    }

    /// Timestamp chunk.
    pub fn timestamp(&self) -> Result<u64> {
        self.fixed(CHUNK_TIMESTAMP).map(u64::from_be_bytes)
    }

    fn fixed(&self, id: u32) -> Result<[u8; 8]> {
        let data = self
            .get(id)
            .ok_or_else(|| CameraError::NotFound(format!("chunk {id:#x}")))?;
        data.try_into().map_err(|_| {
            CameraError::ParsingChunkData(format!("chunk {id:#x} has {} bytes", data.len()))
        })
    }
}

fn read_u32(payload: &[u8], at: usize) -> Result<u32> {
    payload
        .get(at..at + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| CameraError::ParsingChunkData(format!("truncated tag at {at}")))
}

/// Appends chunks to a payload being built in place.
pub struct ChunkWriter<'a> {
    dst: &'a mut [u8],
    pos: usize,
}

impl<'a> ChunkWriter<'a> {
    /// Writer positioned after an image of `image_len` bytes already in `dst`.
    ///
    /// The image tag is written immediately.
    pub fn after_image(dst: &'a mut [u8], image_len: usize) -> Result<Self> {
        let mut writer = Self { dst, pos: image_len };
        writer.tag(CHUNK_IMAGE, image_len)?;
        Ok(writer)
    }

    fn tag(&mut self, id: u32, len: usize) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| CameraError::InvalidValue(format!("chunk {id:#x} too long")))?;
        self.put(&id.to_be_bytes())?;
        self.put(&len.to_be_bytes())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        let slot = self.dst.get_mut(self.pos..end).ok_or(CameraError::BufferTooSmall {
            written: self.pos,
            required: end,
        })?;
        slot.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    /// Append one chunk.
    pub fn chunk(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.put(data)?;
        self.tag(id, data.len())
    }

    /// Bytes written so far, image included.
    pub const fn len(&self) -> usize {
        self.pos
    }

    /// Whether nothing has been written.
    pub const fn is_empty(&self) -> bool {
        self.pos == 0
    }
}

/// Parse the chunks of a delivered frame and hand them to `access`.
///
/// Fails with `NoChunkData` when the frame carries none.
pub fn chunk_data_access<R, F>(buffer: &FrameBuffer, access: F) -> Result<R>
where
    F: FnOnce(&ChunkData) -> Result<R>,
{
    if !buffer.info().chunk_present {
        return Err(CameraError::NoChunkData);
    }
    let chunks = buffer.with_payload(ChunkData::parse)?;
    access(&chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let image = [9u8; 16];
        let mut payload = vec![0u8; image.len() + TRAILER_OVERHEAD];
        payload[..image.len()].copy_from_slice(&image);
        let mut writer = ChunkWriter::after_image(&mut payload, image.len()).expect("image tag");
        writer
            .chunk(CHUNK_FRAME_ID, &7u64.to_be_bytes())
            .expect("frame id");
        writer
            .chunk(CHUNK_EXPOSURE_TIME, &1500.0f64.to_be_bytes())
            .expect("exposure");
        writer.chunk(CHUNK_GAIN, &3.5f64.to_be_bytes()).expect("gain");
        writer
            .chunk(CHUNK_TIMESTAMP, &42u64.to_be_bytes())
            .expect("timestamp");
        assert_eq!(writer.len(), payload.len());
        payload
    }

    #[test]
    fn test_parse_reads_every_chunk() {
        let chunks = ChunkData::parse(&sample()).expect("parse");
        assert_eq!(chunks.image(), Some(&[9u8; 16][..]));
        assert_eq!(chunks.frame_id().expect("frame id"), 7);
        assert!((chunks.exposure_time().expect("exposure") - 1500.0).abs() < f64::EPSILON);
        assert!((chunks.gain().expect("gain") - 3.5).abs() < f64::EPSILON);
        assert_eq!(chunks.timestamp().expect("timestamp"), 42);
    }

    #[test]
    fn test_corrupt_length_is_parse_error() {
        let mut payload = sample();
        let len = payload.len();
        payload[len - 4..].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            ChunkData::parse(&payload),
            Err(CameraError::ParsingChunkData(_))
        ));
    }

    #[test]
    fn test_writer_reports_overflow() {
        let mut payload = vec![0u8; 20];
        let mut writer = ChunkWriter::after_image(&mut payload, 4).expect("image tag");
        assert!(matches!(
            writer.chunk(CHUNK_GAIN, &1.0f64.to_be_bytes()),
            Err(CameraError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_frame_without_chunks_is_rejected() {
        let buffer = FrameBuffer::new(32);
        assert!(matches!(
            chunk_data_access(&buffer, |_| Ok(())),
            Err(CameraError::NoChunkData)
        ));
    }
}
