//! Simulated transport for running without hardware.
//!
//! Each [`DeviceProfile`] becomes one camera. Frames are rendered from a
//! [`TestPattern`] in the pixel format selected at stream start, paced by
//! `AcquisitionFrameRate`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::buffer::{FrameInfo, FrameStatus};
use crate::chunk::{
    ChunkWriter, CHUNK_EXPOSURE_TIME, CHUNK_FRAME_ID, CHUNK_GAIN, CHUNK_TIMESTAMP, TRAILER_OVERHEAD,
};
use crate::config::DeviceProfile;
use crate::error::{CameraError, Result};
use crate::feature::{FeatureSnapshot, FeatureValue};
use crate::sfnc;
use crate::traits::{
    AccessMode, CameraInfo, DeviceLink, FeatureCatalog, InterfaceInfo, Transport,
    TransportLayerInfo,
};

/// Luminance of the eight SMPTE bars: white, yellow, cyan, green, magenta,
/// red, blue, black.
pub const COLOR_BAR_LUMA: [u8; 8] = [235, 210, 170, 145, 106, 81, 41, 16];

/// Neutral chroma for YUV output.
const NEUTRAL_CHROMA: u8 = 128;

/// Image content of simulated frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TestPattern {
    /// Eight vertical SMPTE bars.
    #[default]
    ColorBars,
    /// Horizontal ramp from dark to light.
    Gradient,
    /// Uniform luminance.
    Solid(u8),
}

impl TestPattern {
    /// Luminance at column `x` of a `width` wide image.
    pub fn luma(self, x: u32, width: u32) -> u8 {
        match self {
            Self::ColorBars => {
                let bar_width = (width / 8).max(1);
                let bar = (x / bar_width).min(7) as usize;
                COLOR_BAR_LUMA.get(bar).copied().unwrap_or(0)
            }
            Self::Gradient => {
                let ramp = u64::from(x) * 255 / u64::from(width.max(1));
                u8::try_from(ramp).unwrap_or(u8::MAX)
            }
            Self::Solid(y) => y,
        }
    }
}

/// Geometry and format of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format symbol.
    pub pixel_format: String,
    /// Bytes per pixel.
    pub bytes_per_pixel: usize,
}

impl ImageLayout {
    /// Layout described by the feature values.
    pub fn from_features(features: &FeatureSnapshot) -> Result<Self> {
        let width = features
            .int(sfnc::WIDTH)
            .and_then(|w| u32::try_from(w).ok())
            .ok_or_else(|| CameraError::InvalidCall("Width is not set".to_owned()))?;
        let height = features
            .int(sfnc::HEIGHT)
            .and_then(|h| u32::try_from(h).ok())
            .ok_or_else(|| CameraError::InvalidCall("Height is not set".to_owned()))?;
        let pixel_format = features.symbol(sfnc::PIXEL_FORMAT).unwrap_or(sfnc::MONO8);
        let bytes_per_pixel = sfnc::bytes_per_pixel(pixel_format).ok_or_else(|| {
            CameraError::InvalidValue(format!("unsupported pixel format {pixel_format}"))
        })?;
        Ok(Self {
            width,
            height,
            pixel_format: pixel_format.to_owned(),
            bytes_per_pixel,
        })
    }

    /// Image bytes.
    pub fn image_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel
    }
}

/// Render `pattern` into `dst`. Returns the bytes written, which is less
/// than the image size when `dst` is too small.
pub fn render(dst: &mut [u8], layout: &ImageLayout, pattern: TestPattern, reverse_x: bool) -> usize {
    let width = layout.width.max(1);
    let pixels = layout.width as usize * layout.height as usize;
    let mut written = 0;
    for (idx, pixel) in dst
        .chunks_exact_mut(layout.bytes_per_pixel)
        .take(pixels)
        .enumerate()
    {
        #[allow(clippy::cast_possible_truncation)]
        let column = (idx % width as usize) as u32;
        let x = if reverse_x { width - 1 - column } else { column };
        let y = pattern.luma(x, width);
        match layout.pixel_format.as_str() {
            sfnc::MONO8 | sfnc::RGB8 => pixel.fill(y),
            sfnc::YUV422_8 => pixel.copy_from_slice(&[y, NEUTRAL_CHROMA]),
            _ => pixel.copy_from_slice(&(u16::from(y) << 8).to_le_bytes()),
        }
        written += layout.bytes_per_pixel;
    }
    written
}

struct StreamSetup {
    layout: ImageLayout,
    reverse_x: bool,
    chunks: bool,
    period: Duration,
    started: Instant,
}

struct SimDevice {
    profile: DeviceProfile,
    memory: Mutex<Vec<u8>>,
}

/// Transport over simulated cameras.
pub struct SimTransport {
    devices: Vec<Arc<SimDevice>>,
}

impl SimTransport {
    /// One camera per profile. Ids must be unique.
    pub fn new(profiles: Vec<DeviceProfile>) -> Result<Self> {
        let mut devices: Vec<Arc<SimDevice>> = Vec::with_capacity(profiles.len());
        for profile in profiles {
            if devices.iter().any(|dev| dev.profile.info.id == profile.info.id) {
                return Err(CameraError::Config(format!(
                    "duplicate camera id {}",
                    profile.info.id
                )));
            }
            let memory = vec![0; profile.memory_size];
            devices.push(Arc::new(SimDevice {
                profile,
                memory: Mutex::new(memory),
            }));
        }
        Ok(Self { devices })
    }
}

impl Transport for SimTransport {
    fn cameras(&self) -> Result<Vec<CameraInfo>> {
        Ok(self
            .devices
            .iter()
            .map(|dev| dev.profile.info.clone())
            .collect())
    }

    fn transport_layers(&self) -> Result<Vec<TransportLayerInfo>> {
        Ok(vec![TransportLayerInfo {
            id: "sim-tl".to_owned(),
            name: "Simulated transport".to_owned(),
            vendor: "cam-session".to_owned(),
            path: "memory".to_owned(),
        }])
    }

    fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(vec![InterfaceInfo {
            id: "sim-if".to_owned(),
            name: "Simulated bus".to_owned(),
            transport_layer_id: "sim-tl".to_owned(),
        }])
    }

    fn open(&self, id: &str, mode: AccessMode) -> Result<Arc<dyn DeviceLink>> {
        let device = self
            .devices
            .iter()
            .find(|dev| dev.profile.info.id == id)
            .ok_or_else(|| CameraError::NotFound(format!("camera {id}")))?;
        debug!(camera = id, ?mode, "simulated link opened");
        Ok(Arc::new(SimLink {
            device: Arc::clone(device),
            live: Mutex::new(FeatureSnapshot(device.profile.initial_values())),
            stream: Mutex::new(None),
            commands: Mutex::new(HashMap::new()),
            frames: AtomicU64::new(0),
        }))
    }
}

/// Link to one simulated camera.
struct SimLink {
    device: Arc<SimDevice>,
    live: Mutex<FeatureSnapshot>,
    stream: Mutex<Option<StreamSetup>>,
    commands: Mutex<HashMap<String, Instant>>,
    frames: AtomicU64,
}

impl SimLink {
    /// Append the standard chunks after the image. Returns the payload length.
    fn append_chunks(
        &self,
        dst: &mut [u8],
        image_len: usize,
        frame_id: u64,
        timestamp: Duration,
    ) -> Result<usize> {
        let (exposure, gain) = {
            let live = self.live.lock();
            (
                live.float(sfnc::EXPOSURE_TIME).unwrap_or(0.0),
                live.float(sfnc::GAIN).unwrap_or(0.0),
            )
        };
        let nanos = u64::try_from(timestamp.as_nanos()).unwrap_or(u64::MAX);
        let mut writer = ChunkWriter::after_image(dst, image_len)?;
        writer.chunk(CHUNK_FRAME_ID, &frame_id.to_be_bytes())?;
        writer.chunk(CHUNK_EXPOSURE_TIME, &exposure.to_be_bytes())?;
        writer.chunk(CHUNK_GAIN, &gain.to_be_bytes())?;
        writer.chunk(CHUNK_TIMESTAMP, &nanos.to_be_bytes())?;
        Ok(writer.len())
    }
}

impl DeviceLink for SimLink {
    fn catalog(&self) -> Result<FeatureCatalog> {
        Ok(FeatureCatalog {
            descriptors: self.device.profile.features.clone(),
            values: FeatureSnapshot(self.device.profile.initial_values()),
        })
    }

    fn write_feature(&self, name: &str, value: &FeatureValue) -> Result<()> {
        self.live.lock().0.insert(name.to_owned(), value.clone());
        Ok(())
    }

    fn run_command(&self, name: &str) -> Result<()> {
        let busy = Duration::from_millis(self.device.profile.command_duration_ms);
        self.commands
            .lock()
            .insert(name.to_owned(), Instant::now() + busy);
        Ok(())
    }

    fn command_done(&self, name: &str) -> Result<bool> {
        Ok(self
            .commands
            .lock()
            .get(name)
            .map_or(true, |due| Instant::now() >= *due))
    }

    fn payload_size(&self, features: &FeatureSnapshot) -> Result<usize> {
        let image = ImageLayout::from_features(features)?.image_size();
        if features.flag(sfnc::CHUNK_MODE_ACTIVE).unwrap_or(false) {
            Ok(image + TRAILER_OVERHEAD)
        } else {
            Ok(image)
        }
    }

    fn start_streaming(&self, features: &FeatureSnapshot) -> Result<()> {
        let layout = ImageLayout::from_features(features)?;
        let rate = features.float(sfnc::ACQUISITION_FRAME_RATE).unwrap_or(30.0);
        let period = Duration::from_secs_f64(1.0 / rate.max(1.0));
        debug!(
            camera = %self.device.profile.info.id,
            width = layout.width,
            height = layout.height,
            format = %layout.pixel_format,
            ?period,
            "simulated stream started"
        );
        *self.stream.lock() = Some(StreamSetup {
            layout,
            reverse_x: features.flag(sfnc::REVERSE_X).unwrap_or(false),
            chunks: features.flag(sfnc::CHUNK_MODE_ACTIVE).unwrap_or(false),
            period,
            started: Instant::now(),
        });
        Ok(())
    }

    fn stop_streaming(&self) -> Result<()> {
        self.stream.lock().take();
        Ok(())
    }

    fn fill_frame(&self, dst: &mut [u8]) -> Result<FrameInfo> {
        let (layout, reverse_x, chunks, period, started) = {
            let stream = self.stream.lock();
            let setup = stream
                .as_ref()
                .ok_or_else(|| CameraError::InvalidCall("stream not started".to_owned()))?;
            (
                setup.layout.clone(),
                setup.reverse_x,
                setup.chunks,
                setup.period,
                setup.started,
            )
        };
        thread::sleep(period);

        let frame_id = self.frames.fetch_add(1, Ordering::Relaxed);
        let timestamp = started.elapsed();
        let image_size = layout.image_size();
        let mut received_size = render(dst, &layout, self.device.profile.pattern, reverse_x);
        let mut status = if received_size < image_size {
            FrameStatus::TooSmall
        } else {
            FrameStatus::Complete
        };

        let mut chunk_present = false;
        if chunks && status == FrameStatus::Complete {
            match self.append_chunks(dst, image_size, frame_id, timestamp) {
                Ok(len) => {
                    received_size = len;
                    chunk_present = true;
                }
                Err(CameraError::BufferTooSmall { .. }) => status = FrameStatus::TooSmall,
                Err(err) => return Err(err),
            }
        }
        trace!(frame_id, ?status, received_size, "simulated frame");

        Ok(FrameInfo {
            frame_id,
            status,
            received_size,
            width: layout.width,
            height: layout.height,
            pixel_format: layout.pixel_format,
            timestamp,
            chunk_present,
        })
    }

    fn memory_read(&self, address: u64, dst: &mut [u8]) -> Result<usize> {
        let memory = self.device.memory.lock();
        let start = usize::try_from(address)
            .map_err(|_| CameraError::InvalidValue(format!("address {address:#x}")))?;
        let region = memory
            .get(start..start.saturating_add(dst.len()))
            .ok_or_else(|| CameraError::InvalidValue(format!("address {address:#x} out of range")))?;
        dst.copy_from_slice(region);
        Ok(dst.len())
    }

    fn memory_write(&self, address: u64, src: &[u8]) -> Result<usize> {
        let mut memory = self.device.memory.lock();
        let start = usize::try_from(address)
            .map_err(|_| CameraError::InvalidValue(format!("address {address:#x}")))?;
        let region = memory
            .get_mut(start..start.saturating_add(src.len()))
            .ok_or_else(|| CameraError::InvalidValue(format!("address {address:#x} out of range")))?;
        region.copy_from_slice(src);
        Ok(src.len())
    }

    fn settings_save(&self, path: &Path, values: &FeatureSnapshot) -> Result<()> {
        let json =
            serde_json::to_string_pretty(values).map_err(|err| CameraError::Config(err.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn settings_load(&self, path: &Path) -> Result<FeatureSnapshot> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|err| CameraError::Config(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkData;

    fn layout(width: u32, height: u32, format: &str) -> ImageLayout {
        ImageLayout {
            width,
            height,
            pixel_format: format.to_owned(),
            bytes_per_pixel: sfnc::bytes_per_pixel(format).expect("known format"),
        }
    }

    fn link(profile: DeviceProfile) -> Arc<dyn DeviceLink> {
        let id = profile.info.id.clone();
        SimTransport::new(vec![profile])
            .expect("transport")
            .open(&id, AccessMode::Full)
            .expect("open")
    }

    fn small_profile() -> DeviceProfile {
        DeviceProfile::standard("sim-0")
            .with_default(sfnc::WIDTH, FeatureValue::Integer(16))
            .with_default(sfnc::HEIGHT, FeatureValue::Integer(16))
            .with_default(sfnc::ACQUISITION_FRAME_RATE, FeatureValue::Float(1000.0))
    }

    #[test]
    fn test_color_bars_mono8() {
        let layout = layout(640, 480, sfnc::MONO8);
        let mut data = vec![0u8; layout.image_size()];
        assert_eq!(render(&mut data, &layout, TestPattern::ColorBars, false), 640 * 480);
        assert_eq!(data.first(), Some(&235));
        assert_eq!(data.get(639), Some(&16));
    }

    #[test]
    fn test_gradient_runs_dark_to_light() {
        let layout = layout(640, 480, sfnc::MONO8);
        let mut data = vec![0u8; layout.image_size()];
        render(&mut data, &layout, TestPattern::Gradient, false);
        assert!(data.first().copied().expect("first") < 10);
        let last_row = 479 * 640;
        assert!(data.get(last_row + 638).copied().expect("last") > 200);
    }

    #[test]
    fn test_reverse_x_mirrors_rows() {
        let layout = layout(64, 2, sfnc::MONO8);
        let mut data = vec![0u8; layout.image_size()];
        render(&mut data, &layout, TestPattern::ColorBars, true);
        assert_eq!(data.first(), Some(&16));
        assert_eq!(data.get(63), Some(&235));
    }

    #[test]
    fn test_solid_yuv422() {
        let layout = layout(64, 64, sfnc::YUV422_8);
        let mut data = vec![0u8; layout.image_size()];
        render(&mut data, &layout, TestPattern::Solid(128), false);
        assert_eq!(data.get(..4), Some(&[128, 128, 128, 128][..]));
    }

    #[test]
    fn test_payload_size_includes_trailer() {
        let link = link(small_profile());
        let mut features = link.catalog().expect("catalog").values;
        assert_eq!(link.payload_size(&features).expect("size"), 256);
        features
            .0
            .insert(sfnc::CHUNK_MODE_ACTIVE.to_owned(), FeatureValue::Boolean(true));
        assert_eq!(
            link.payload_size(&features).expect("size"),
            256 + TRAILER_OVERHEAD
        );
    }

    #[test]
    fn test_undersized_buffer_is_too_small() {
        let link = link(small_profile());
        let features = link.catalog().expect("catalog").values;
        link.start_streaming(&features).expect("start");
        let mut dst = vec![0u8; 100];
        let info = link.fill_frame(&mut dst).expect("fill");
        assert_eq!(info.status, FrameStatus::TooSmall);
        assert_eq!(info.received_size, 100);
    }

    #[test]
    fn test_chunk_mode_appends_trailer() {
        let link = link(small_profile());
        let mut features = link.catalog().expect("catalog").values;
        features
            .0
            .insert(sfnc::CHUNK_MODE_ACTIVE.to_owned(), FeatureValue::Boolean(true));
        link.start_streaming(&features).expect("start");

        let mut dst = vec![0u8; link.payload_size(&features).expect("size")];
        let info = link.fill_frame(&mut dst).expect("fill");
        assert!(info.chunk_present);
        let chunks = ChunkData::parse(&dst).expect("parse");
        assert_eq!(chunks.frame_id().expect("frame id"), info.frame_id);
        assert_eq!(chunks.image().map(<[u8]>::len), Some(256));
        assert!((chunks.exposure_time().expect("exposure") - 5000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fill_before_start_is_invalid_call() {
        let link = link(small_profile());
        let mut dst = vec![0u8; 256];
        assert!(matches!(
            link.fill_frame(&mut dst),
            Err(CameraError::InvalidCall(_))
        ));
    }

    #[test]
    fn test_memory_window() {
        let link = link(small_profile());
        assert_eq!(link.memory_write(16, &[1, 2, 3]).expect("write"), 3);
        let mut dst = [0u8; 3];
        assert_eq!(link.memory_read(16, &mut dst).expect("read"), 3);
        assert_eq!(dst, [1, 2, 3]);
        assert!(matches!(
            link.memory_read(4095, &mut dst),
            Err(CameraError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let profiles = vec![
            DeviceProfile::standard("sim-0"),
            DeviceProfile::standard("sim-0"),
        ];
        assert!(matches!(
            SimTransport::new(profiles),
            Err(CameraError::Config(_))
        ));
    }

    #[test]
    fn test_interfaces_belong_to_transport_layer() {
        let transport =
            SimTransport::new(vec![DeviceProfile::standard("sim-0")]).expect("transport");
        let layers = transport.transport_layers().expect("layers");
        let interfaces = transport.interfaces().expect("interfaces");
        assert_eq!(layers.len(), 1);
        assert!(interfaces
            .iter()
            .all(|interface| layers.iter().any(|tl| tl.id == interface.transport_layer_id)));
    }
}
