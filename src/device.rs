//! V4L2 transport using the v4l crate.
//!
//! Every capture-capable `/dev/video*` node is one camera. Image format
//! becomes `Width`, `Height` and `PixelFormat`; driver controls become
//! features named after the control with spaces and punctuation removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use v4l::buffer::Type;
use v4l::control::{self, Control, MenuItem};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::buffer::{FrameInfo, FrameStatus};
use crate::error::{CameraError, Result};
use crate::feature::{EnumEntry, FeatureDescriptor, FeatureSnapshot, FeatureValue};
use crate::sfnc;
use crate::traits::{
    AccessMode, CameraInfo, DeviceLink, FeatureCatalog, Transport, TransportLayerInfo,
};

const TRANSPORT_LAYER_ID: &str = "v4l2";
const MMAP_BUFFERS: u32 = 4;
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_DIMENSION: i64 = 16384;
const CONTROL_CATEGORY: &str = "/V4L2Controls";
const IMAGE_CATEGORY: &str = "/ImageFormatControl";

fn transport<E: std::fmt::Display>(err: E) -> CameraError {
    CameraError::Transport(err.to_string())
}

/// Feature name for a driver control: `"White Balance, Automatic"` becomes
/// `WhiteBalanceAutomatic`.
pub fn feature_name(control: &str) -> String {
    control
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            })
        })
        .collect()
}

/// Pixel format symbol for a fourcc. Unknown codes keep their four letters.
pub fn pixel_format_symbol(fourcc: FourCC) -> Option<String> {
    let symbol = match &fourcc.repr {
        b"GREY" => sfnc::MONO8,
        b"Y16 " => sfnc::MONO16,
        b"RGB3" => sfnc::RGB8,
        b"YUYV" => sfnc::YUV422_8,
        b"RG12" => sfnc::BAYER_RG12,
        _ => return fourcc.str().ok().map(|code| code.trim_end().to_owned()),
    };
    Some(symbol.to_owned())
}

fn fourcc_value(fourcc: FourCC) -> i64 {
    i64::from(u32::from_le_bytes(fourcc.repr))
}

/// Transport over the local Video4Linux2 nodes.
#[derive(Debug, Default)]
pub struct V4l2Transport;

impl V4l2Transport {
    /// Transport over `/dev/video*`.
    pub const fn new() -> Self {
        Self
    }
}

impl Transport for V4l2Transport {
    fn cameras(&self) -> Result<Vec<CameraInfo>> {
        let mut cameras = Vec::new();
        for node in v4l::context::enum_devices() {
            let Ok(device) = Device::with_path(node.path()) else {
                trace!(path = %node.path().display(), "skipping node that cannot be opened");
                continue;
            };
            let Ok(caps) = device.query_caps() else {
                continue;
            };
            if !caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                continue;
            }
            cameras.push(CameraInfo {
                id: node.path().display().to_string(),
                name: caps.card.clone(),
                model: caps.card,
                serial: caps.bus,
                transport_layer_id: TRANSPORT_LAYER_ID.to_owned(),
                interface_id: caps.driver,
                permitted_access: vec![AccessMode::Full, AccessMode::Read],
            });
        }
        Ok(cameras)
    }

    fn transport_layers(&self) -> Result<Vec<TransportLayerInfo>> {
        Ok(vec![TransportLayerInfo {
            id: TRANSPORT_LAYER_ID.to_owned(),
            name: "Video4Linux2".to_owned(),
            vendor: "Linux".to_owned(),
            path: "/dev".to_owned(),
        }])
    }

    fn open(&self, id: &str, _mode: AccessMode) -> Result<Arc<dyn DeviceLink>> {
        let path = PathBuf::from(id);
        let device = Device::with_path(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => CameraError::NotFound(id.to_owned()),
            std::io::ErrorKind::PermissionDenied => CameraError::AccessDenied(id.to_owned()),
            _ => transport(err),
        })?;
        debug!(path = %path.display(), "opened V4L2 node");
        Ok(Arc::new(V4l2Link {
            path,
            device: Mutex::new(device),
            controls: Mutex::new(HashMap::new()),
            capture: Mutex::new(None),
        }))
    }
}

#[derive(Debug, Clone)]
enum ControlKind {
    Integer,
    Boolean,
    Menu(Vec<EnumEntry>),
    Button,
    String,
}

#[derive(Debug, Clone)]
struct ControlBinding {
    id: u32,
    kind: ControlKind,
}

struct CapturedFrame {
    data: Vec<u8>,
    sequence: u32,
    timestamp: Duration,
}

struct CaptureThread {
    stop: Arc<AtomicBool>,
    frames: Receiver<CapturedFrame>,
    worker: JoinHandle<()>,
    width: u32,
    height: u32,
    pixel_format: String,
}

struct V4l2Link {
    path: PathBuf,
    device: Mutex<Device>,
    controls: Mutex<HashMap<String, ControlBinding>>,
    capture: Mutex<Option<CaptureThread>>,
}

impl V4l2Link {
    fn format_features(device: &Device, catalog: &mut FeatureCatalog) -> Result<()> {
        let format = device.format().map_err(transport)?;
        let mut entries: Vec<EnumEntry> = device
            .enum_formats()
            .map_err(transport)?
            .into_iter()
            .filter_map(|desc| {
                pixel_format_symbol(desc.fourcc)
                    .map(|symbol| EnumEntry::new(&symbol, fourcc_value(desc.fourcc)))
            })
            .collect();
        let current = pixel_format_symbol(format.fourcc)
            .ok_or_else(|| CameraError::Transport("current pixel format has no name".to_owned()))?;
        if !entries.iter().any(|entry| entry.name == current) {
            entries.push(EnumEntry::new(&current, fourcc_value(format.fourcc)));
        }

        catalog.descriptors.extend([
            FeatureDescriptor::integer(sfnc::WIDTH, 1, MAX_DIMENSION)
                .locked_while_streaming()
                .in_category(IMAGE_CATEGORY),
            FeatureDescriptor::integer(sfnc::HEIGHT, 1, MAX_DIMENSION)
                .locked_while_streaming()
                .in_category(IMAGE_CATEGORY),
            FeatureDescriptor::enumeration(sfnc::PIXEL_FORMAT, entries)
                .locked_while_streaming()
                .in_category(IMAGE_CATEGORY),
        ]);
        let values = &mut catalog.values.0;
        values.insert(sfnc::WIDTH.to_owned(), FeatureValue::Integer(format.width.into()));
        values.insert(sfnc::HEIGHT.to_owned(), FeatureValue::Integer(format.height.into()));
        values.insert(sfnc::PIXEL_FORMAT.to_owned(), FeatureValue::Enum(current));
        Ok(())
    }

    fn describe_control(desc: &control::Description) -> Option<(FeatureDescriptor, ControlKind)> {
        let name = feature_name(&desc.name);
        let (descriptor, kind) = match desc.typ {
            control::Type::Integer | control::Type::Integer64 => {
                let mut descriptor = FeatureDescriptor::integer(&name, desc.minimum, desc.maximum);
                if desc.step > 1 {
                    descriptor = descriptor.with_increment(i64::try_from(desc.step).ok()?);
                }
                (descriptor, ControlKind::Integer)
            }
            control::Type::Boolean => (FeatureDescriptor::boolean(&name), ControlKind::Boolean),
            control::Type::Menu | control::Type::IntegerMenu => {
                let entries: Vec<EnumEntry> = desc
                    .items
                    .as_ref()?
                    .iter()
                    .map(|(index, item)| {
                        let symbol = match item {
                            MenuItem::Name(label) => feature_name(label),
                            MenuItem::Value(value) => format!("Value{value}"),
                        };
                        EnumEntry::new(&symbol, i64::from(*index))
                    })
                    .collect();
                (
                    FeatureDescriptor::enumeration(&name, entries.clone()),
                    ControlKind::Menu(entries),
                )
            }
            control::Type::Button => (FeatureDescriptor::command(&name), ControlKind::Button),
            control::Type::String => (
                FeatureDescriptor::string(&name, usize::try_from(desc.maximum).ok()?),
                ControlKind::String,
            ),
            _ => return None,
        };

        let mut descriptor = descriptor.in_category(CONTROL_CATEGORY);
        if desc.flags.contains(control::Flags::READ_ONLY) {
            descriptor = descriptor.read_only();
        }
        if desc.flags.contains(control::Flags::WRITE_ONLY) {
            descriptor = descriptor.write_only();
        }
        if desc.flags.contains(control::Flags::GRABBED) {
            descriptor = descriptor.locked_while_streaming();
        }
        descriptor.validate().ok()?;
        Some((descriptor, kind))
    }

    fn control_value(device: &Device, binding: &ControlBinding) -> Option<FeatureValue> {
        let control = device.control(binding.id).ok()?;
        match (&binding.kind, control.value) {
            (ControlKind::Integer, control::Value::Integer(v)) => Some(FeatureValue::Integer(v)),
            (ControlKind::Boolean, control::Value::Boolean(v)) => Some(FeatureValue::Boolean(v)),
            (ControlKind::Boolean, control::Value::Integer(v)) => Some(FeatureValue::Boolean(v != 0)),
            (ControlKind::Menu(entries), control::Value::Integer(v)) => entries
                .iter()
                .find(|entry| entry.value == v)
                .map(|entry| FeatureValue::Enum(entry.name.clone())),
            (ControlKind::String, control::Value::String(v)) => Some(FeatureValue::String(v)),
            _ => None,
        }
    }

    fn binding(&self, name: &str) -> Result<ControlBinding> {
        self.controls
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CameraError::NotFound(name.to_owned()))
    }

    /// Push the image format to the driver and return what it accepted.
    fn apply_format(&self, features: &FeatureSnapshot) -> Result<v4l::Format> {
        let device = self.device.lock();
        let mut format = device.format().map_err(transport)?;
        if let Some(width) = features.int(sfnc::WIDTH).and_then(|w| u32::try_from(w).ok()) {
            format.width = width;
        }
        if let Some(height) = features.int(sfnc::HEIGHT).and_then(|h| u32::try_from(h).ok()) {
            format.height = height;
        }
        if let Some(symbol) = features.symbol(sfnc::PIXEL_FORMAT) {
            let fourcc = device
                .enum_formats()
                .map_err(transport)?
                .into_iter()
                .map(|desc| desc.fourcc)
                .find(|fourcc| pixel_format_symbol(*fourcc).as_deref() == Some(symbol))
                .ok_or_else(|| CameraError::InvalidValue(format!("pixel format {symbol}")))?;
            format.fourcc = fourcc;
        }
        let accepted = device.set_format(&format).map_err(transport)?;
        if accepted.width != format.width || accepted.height != format.height {
            debug!(
                requested = %format!("{}x{}", format.width, format.height),
                accepted = %format!("{}x{}", accepted.width, accepted.height),
                "driver adjusted image size"
            );
        }
        Ok(accepted)
    }
}

fn capture_loop(path: &Path, stop: &AtomicBool, tx: &Sender<CapturedFrame>) -> Result<()> {
    let device = Device::with_path(path).map_err(transport)?;
    let mut stream =
        Stream::with_buffers(&device, Type::VideoCapture, MMAP_BUFFERS).map_err(transport)?;

    while !stop.load(Ordering::Acquire) {
        let (buf, meta) = stream.next().map_err(transport)?;

        // V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let used = buf.get(..meta.bytesused as usize).unwrap_or(buf);
        let frame = CapturedFrame {
            data: used.to_vec(),
            sequence: meta.sequence,
            timestamp: Duration::new(secs, nanos),
        };
        if tx.try_send(frame).is_err() {
            trace!(sequence = meta.sequence, "consumer is behind, frame dropped");
        }
    }
    Ok(())
}

impl DeviceLink for V4l2Link {
    fn catalog(&self) -> Result<FeatureCatalog> {
        let device = self.device.lock();
        let caps = device.query_caps().map_err(transport)?;

        let mut catalog = FeatureCatalog::default();
        for (name, value) in [
            (sfnc::DEVICE_VENDOR_NAME, caps.driver),
            (sfnc::DEVICE_MODEL_NAME, caps.card),
            (sfnc::DEVICE_SERIAL_NUMBER, caps.bus),
        ] {
            catalog.descriptors.push(
                FeatureDescriptor::string(name, value.len().max(64))
                    .read_only()
                    .in_category("/DeviceControl"),
            );
            catalog.values.0.insert(name.to_owned(), FeatureValue::String(value));
        }
        Self::format_features(&device, &mut catalog)?;

        let mut controls = HashMap::new();
        for desc in device.query_controls().map_err(transport)? {
            if desc.flags.contains(control::Flags::DISABLED) {
                continue;
            }
            let Some((descriptor, kind)) = Self::describe_control(&desc) else {
                trace!(control = %desc.name, "control type not mapped");
                continue;
            };
            if catalog.descriptors.iter().any(|d| d.name == descriptor.name) {
                continue;
            }
            let binding = ControlBinding { id: desc.id, kind };
            if descriptor.readable {
                if let Some(value) = Self::control_value(&device, &binding)
                    .filter(|value| descriptor.check_value(value).is_ok())
                {
                    catalog.values.0.insert(descriptor.name.clone(), value);
                }
            }
            controls.insert(descriptor.name.clone(), binding);
            catalog.descriptors.push(descriptor);
        }
        debug!(
            path = %self.path.display(),
            features = catalog.descriptors.len(),
            "V4L2 catalog built"
        );
        *self.controls.lock() = controls;
        Ok(catalog)
    }

    fn write_feature(&self, name: &str, value: &FeatureValue) -> Result<()> {
        if matches!(name, sfnc::WIDTH | sfnc::HEIGHT | sfnc::PIXEL_FORMAT) {
            // applied at stream start
            return Ok(());
        }
        let binding = self.binding(name)?;
        let value = match (&binding.kind, value) {
            (ControlKind::Integer, FeatureValue::Integer(v)) => control::Value::Integer(*v),
            (ControlKind::Boolean, FeatureValue::Boolean(v)) => control::Value::Boolean(*v),
            (ControlKind::Menu(entries), FeatureValue::Enum(symbol)) => {
                let entry = entries
                    .iter()
                    .find(|entry| &entry.name == symbol)
                    .ok_or_else(|| CameraError::InvalidValue(format!("{name} has no entry {symbol}")))?;
                control::Value::Integer(entry.value)
            }
            (ControlKind::String, FeatureValue::String(v)) => control::Value::String(v.clone()),
            _ => {
                return Err(CameraError::InvalidCall(format!(
                    "{name} cannot be written as {:?}",
                    value.kind()
                )))
            }
        };
        self.device
            .lock()
            .set_control(Control {
                id: binding.id,
                value,
            })
            .map_err(transport)
    }

    fn run_command(&self, name: &str) -> Result<()> {
        let binding = self.binding(name)?;
        if !matches!(binding.kind, ControlKind::Button) {
            return Err(CameraError::InvalidCall(format!("{name} is not a command")));
        }
        self.device
            .lock()
            .set_control(Control {
                id: binding.id,
                value: control::Value::Integer(1),
            })
            .map_err(transport)
    }

    fn command_done(&self, name: &str) -> Result<bool> {
        // buttons complete inside the ioctl
        self.binding(name).map(|_| true)
    }

    fn payload_size(&self, features: &FeatureSnapshot) -> Result<usize> {
        let format = self.apply_format(features)?;
        Ok(format.size as usize)
    }

    fn start_streaming(&self, features: &FeatureSnapshot) -> Result<()> {
        let mut capture = self.capture.lock();
        if capture.is_some() {
            return Err(CameraError::AlreadyStarted);
        }
        let format = self.apply_format(features)?;
        let pixel_format = pixel_format_symbol(format.fourcc).unwrap_or_default();

        let (tx, rx) = channel::bounded(MMAP_BUFFERS as usize);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let path = self.path.clone();
        let worker = thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || {
                if let Err(err) = capture_loop(&path, &worker_stop, &tx) {
                    warn!(path = %path.display(), error = %err, "V4L2 capture stopped");
                }
            })?;

        debug!(
            path = %self.path.display(),
            width = format.width,
            height = format.height,
            %pixel_format,
            "V4L2 streaming started"
        );
        *capture = Some(CaptureThread {
            stop,
            frames: rx,
            worker,
            width: format.width,
            height: format.height,
            pixel_format,
        });
        Ok(())
    }

    fn stop_streaming(&self) -> Result<()> {
        let Some(capture) = self.capture.lock().take() else {
            return Ok(());
        };
        capture.stop.store(true, Ordering::Release);
        drop(capture.frames);
        if capture.worker.join().is_err() {
            warn!(path = %self.path.display(), "V4L2 capture thread panicked");
        }
        debug!(path = %self.path.display(), "V4L2 streaming stopped");
        Ok(())
    }

    fn fill_frame(&self, dst: &mut [u8]) -> Result<FrameInfo> {
        let (frames, width, height, pixel_format) = {
            let capture = self.capture.lock();
            let capture = capture
                .as_ref()
                .ok_or_else(|| CameraError::InvalidCall("stream not started".to_owned()))?;
            (
                capture.frames.clone(),
                capture.width,
                capture.height,
                capture.pixel_format.clone(),
            )
        };

        let frame = frames.recv_timeout(FRAME_TIMEOUT).map_err(|err| match err {
            RecvTimeoutError::Timeout => CameraError::Timeout,
            RecvTimeoutError::Disconnected => {
                CameraError::Transport("capture thread exited".to_owned())
            }
        })?;

        let received_size = frame.data.len().min(dst.len());
        if let (Some(to), Some(from)) = (dst.get_mut(..received_size), frame.data.get(..received_size)) {
            to.copy_from_slice(from);
        }
        let status = if received_size < frame.data.len() {
            FrameStatus::TooSmall
        } else {
            FrameStatus::Complete
        };
        Ok(FrameInfo {
            frame_id: u64::from(frame.sequence),
            status,
            received_size,
            width,
            height,
            pixel_format,
            timestamp: frame.timestamp,
            chunk_present: false,
        })
    }
}

impl Drop for V4l2Link {
    fn drop(&mut self) {
        if let Err(err) = self.stop_streaming() {
            warn!(error = %err, "stopping V4L2 stream on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_name_from_control_label() {
        assert_eq!(feature_name("Brightness"), "Brightness");
        assert_eq!(feature_name("White Balance, Automatic"), "WhiteBalanceAutomatic");
        assert_eq!(feature_name("exposure_time_absolute"), "ExposureTimeAbsolute");
    }

    #[test]
    fn test_pixel_format_symbols() {
        assert_eq!(
            pixel_format_symbol(FourCC::new(b"YUYV")).as_deref(),
            Some(sfnc::YUV422_8)
        );
        assert_eq!(
            pixel_format_symbol(FourCC::new(b"GREY")).as_deref(),
            Some(sfnc::MONO8)
        );
        assert_eq!(pixel_format_symbol(FourCC::new(b"MJPG")).as_deref(), Some("MJPG"));
    }

    #[test]
    fn test_fourcc_value_is_little_endian() {
        assert_eq!(fourcc_value(FourCC::new(b"YUYV")), 0x5659_5559);
    }
}
