//! Core traits and types for the camera abstraction.
//!
//! Two sides meet here. Callers program against [`FeatureAccess`],
//! [`BufferLifecycle`] and [`AcquisitionControl`], which are implemented by the
//! real [`System`](crate::session::System) and by test doubles alike. Vendors
//! plug in underneath through [`Transport`] and [`DeviceLink`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::{FrameBuffer, FrameInfo};
use crate::error::{CameraError, Result};
use crate::feature::{EnumEntry, FeatureDescriptor, FeatureSnapshot, FeatureValue};

/// Opaque identifier of one open camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub(crate) u64);

impl DeviceHandle {
    /// Raw numeric value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// How a session may use the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Read, write and acquire. At most one per camera.
    Full,
    /// Read features only.
    Read,
}

/// Static information about a camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Unique id used to open the camera.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Owning transport layer.
    #[serde(default)]
    pub transport_layer_id: String,
    /// Owning interface.
    #[serde(default)]
    pub interface_id: String,
    /// Access modes the camera currently permits.
    #[serde(default = "all_access_modes")]
    pub permitted_access: Vec<AccessMode>,
}

fn all_access_modes() -> Vec<AccessMode> {
    vec![AccessMode::Full, AccessMode::Read]
}

/// API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Transport layer description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportLayerInfo {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Vendor.
    pub vendor: String,
    /// Location of the producer.
    pub path: String,
}

/// Interface (bus, NIC, ...) description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owning transport layer.
    pub transport_layer_id: String,
}

/// Capture state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    /// Capture was never started.
    #[default]
    Idle,
    /// Capture is running.
    Started,
    /// Capture was ended.
    Stopped,
}

/// Identity of one invalidation registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub(crate) u64);

/// Observer of feature changes.
pub type InvalidationCallback = Arc<dyn Fn(DeviceHandle, &str) + Send + Sync>;

/// Observer of delivered frames.
pub type FrameCallback = Arc<dyn Fn(DeviceHandle, &FrameBuffer) + Send + Sync>;

/// Copy `src` into `dst`, reporting truncation.
///
/// On truncation the first `dst.len()` bytes are valid.
pub fn copy_truncated(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    let written = src.len().min(dst.len());
    if let (Some(to), Some(from)) = (dst.get_mut(..written), src.get(..written)) {
        to.copy_from_slice(from);
    }
    if written < src.len() {
        return Err(CameraError::BufferTooSmall {
            written,
            required: src.len(),
        });
    }
    Ok(written)
}

/// Typed feature access.
pub trait FeatureAccess {
    /// Descriptor of one feature.
    fn feature_info(&self, handle: DeviceHandle, name: &str) -> Result<FeatureDescriptor>;

    /// All features of the device.
    fn features_list(&self, handle: DeviceHandle) -> Result<Vec<FeatureDescriptor>>;

    /// Features selected by `name`.
    fn features_list_selected(
        &self,
        handle: DeviceHandle,
        name: &str,
    ) -> Result<Vec<FeatureDescriptor>>;

    /// Effective `(readable, writeable)` for this session.
    fn feature_access(&self, handle: DeviceHandle, name: &str) -> Result<(bool, bool)>;

    /// Read an integer feature.
    fn int_get(&self, handle: DeviceHandle, name: &str) -> Result<i64>;
    /// Write an integer feature.
    fn int_set(&self, handle: DeviceHandle, name: &str, value: i64) -> Result<()>;
    /// Integer range `(min, max)`.
    fn int_range(&self, handle: DeviceHandle, name: &str) -> Result<(i64, i64)>;
    /// Integer increment.
    fn int_increment(&self, handle: DeviceHandle, name: &str) -> Result<i64>;
    /// Integer valid-value set.
    fn int_valid_set(&self, handle: DeviceHandle, name: &str) -> Result<Vec<i64>>;

    /// Read a float feature.
    fn float_get(&self, handle: DeviceHandle, name: &str) -> Result<f64>;
    /// Write a float feature.
    fn float_set(&self, handle: DeviceHandle, name: &str, value: f64) -> Result<()>;
    /// Float range `(min, max)`.
    fn float_range(&self, handle: DeviceHandle, name: &str) -> Result<(f64, f64)>;
    /// Float increment, `None` when the feature has none.
    fn float_increment(&self, handle: DeviceHandle, name: &str) -> Result<Option<f64>>;

    /// Read an enum feature.
    fn enum_get(&self, handle: DeviceHandle, name: &str) -> Result<String>;
    /// Write an enum feature.
    fn enum_set(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<()>;
    /// Currently available symbols.
    fn enum_range(&self, handle: DeviceHandle, name: &str) -> Result<Vec<String>>;
    /// Whether `value` is currently available.
    fn enum_is_available(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<bool>;
    /// Symbol to integer.
    fn enum_as_int(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<i64>;
    /// Integer to symbol.
    fn enum_as_string(&self, handle: DeviceHandle, name: &str, value: i64) -> Result<String>;
    /// Full entry for `entry`.
    fn enum_entry(&self, handle: DeviceHandle, name: &str, entry: &str) -> Result<EnumEntry>;

    /// Read a string feature.
    fn string_get(&self, handle: DeviceHandle, name: &str) -> Result<String>;
    /// Write a string feature.
    fn string_set(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<()>;
    /// Maximum string length in bytes.
    fn string_max_length(&self, handle: DeviceHandle, name: &str) -> Result<usize>;

    /// Copy a string feature into `dst`, reporting truncation.
    fn string_get_into(&self, handle: DeviceHandle, name: &str, dst: &mut [u8]) -> Result<usize> {
        let value = self.string_get(handle, name)?;
        copy_truncated(value.as_bytes(), dst)
    }

    /// Read a boolean feature.
    fn bool_get(&self, handle: DeviceHandle, name: &str) -> Result<bool>;
    /// Write a boolean feature.
    fn bool_set(&self, handle: DeviceHandle, name: &str, value: bool) -> Result<()>;

    /// Start a command.
    fn command_run(&self, handle: DeviceHandle, name: &str) -> Result<()>;
    /// Whether the last run of a command completed.
    fn command_is_done(&self, handle: DeviceHandle, name: &str) -> Result<bool>;

    /// Read a raw feature.
    fn raw_get(&self, handle: DeviceHandle, name: &str) -> Result<Vec<u8>>;
    /// Write a raw feature.
    fn raw_set(&self, handle: DeviceHandle, name: &str, value: &[u8]) -> Result<()>;
    /// Current length of a raw feature.
    fn raw_length(&self, handle: DeviceHandle, name: &str) -> Result<usize>;
    /// Maximum length of a raw feature.
    fn raw_max_length(&self, handle: DeviceHandle, name: &str) -> Result<usize>;

    /// Copy a raw feature into `dst`, reporting truncation.
    fn raw_get_into(&self, handle: DeviceHandle, name: &str, dst: &mut [u8]) -> Result<usize> {
        let value = self.raw_get(handle, name)?;
        copy_truncated(&value, dst)
    }

    /// Observe changes of `name`.
    fn register_invalidation(
        &self,
        handle: DeviceHandle,
        name: &str,
        callback: InvalidationCallback,
    ) -> Result<RegistrationId>;

    /// Remove one registration.
    fn unregister_invalidation(
        &self,
        handle: DeviceHandle,
        name: &str,
        id: RegistrationId,
    ) -> Result<()>;
}

/// Frame buffer announce and revoke.
pub trait BufferLifecycle {
    /// Bytes needed for one frame with the current settings.
    fn payload_size(&self, handle: DeviceHandle) -> Result<usize>;
    /// Register a buffer for capture.
    fn frame_announce(&self, handle: DeviceHandle, buffer: &FrameBuffer) -> Result<()>;
    /// Release one buffer.
    fn frame_revoke(&self, handle: DeviceHandle, buffer: &FrameBuffer) -> Result<()>;
    /// Flush, then release every buffer.
    fn frame_revoke_all(&self, handle: DeviceHandle) -> Result<()>;
}

/// Capture state machine and frame queue.
pub trait AcquisitionControl {
    /// Idle/Stopped to Started.
    fn capture_start(&self, handle: DeviceHandle) -> Result<()>;
    /// Started to Stopped, flushing the queue.
    fn capture_end(&self, handle: DeviceHandle) -> Result<()>;
    /// Queue a buffer for the next capture.
    fn capture_frame_queue(
        &self,
        handle: DeviceHandle,
        buffer: &FrameBuffer,
        callback: Option<FrameCallback>,
    ) -> Result<()>;
    /// Block until `buffer` completes or `timeout` elapses.
    fn capture_frame_wait(
        &self,
        handle: DeviceHandle,
        buffer: &FrameBuffer,
        timeout: Duration,
    ) -> Result<FrameInfo>;
    /// Return all queued, undelivered buffers to the announced state.
    fn capture_queue_flush(&self, handle: DeviceHandle) -> Result<()>;
    /// Current capture state.
    fn capture_state(&self, handle: DeviceHandle) -> Result<CaptureState>;
}

/// Vendor entry point: enumeration and device opening.
pub trait Transport: Send + Sync {
    /// Cameras currently reachable.
    fn cameras(&self) -> Result<Vec<CameraInfo>>;

    /// Transport layers known to the vendor stack.
    fn transport_layers(&self) -> Result<Vec<TransportLayerInfo>> {
        Err(CameraError::NotImplemented("transport_layers"))
    }

    /// Interfaces known to the vendor stack.
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Err(CameraError::NotImplemented("interfaces"))
    }

    /// Open a link to one camera.
    fn open(&self, id: &str, mode: AccessMode) -> Result<Arc<dyn DeviceLink>>;
}

/// Feature metadata a link reports when opened.
#[derive(Debug, Clone, Default)]
pub struct FeatureCatalog {
    /// Descriptors in presentation order.
    pub descriptors: Vec<FeatureDescriptor>,
    /// Initial values.
    pub values: FeatureSnapshot,
}

/// Vendor side of one open camera.
pub trait DeviceLink: Send + Sync {
    /// Feature metadata and current values.
    fn catalog(&self) -> Result<FeatureCatalog>;

    /// Push a validated feature write to the device.
    fn write_feature(&self, _name: &str, _value: &FeatureValue) -> Result<()> {
        Ok(())
    }

    /// Start a command.
    fn run_command(&self, name: &str) -> Result<()>;

    /// Whether the last run of a command completed.
    fn command_done(&self, name: &str) -> Result<bool>;

    /// Payload size for the given feature values.
    fn payload_size(&self, features: &FeatureSnapshot) -> Result<usize>;

    /// Prepare the device for streaming with the given feature values.
    fn start_streaming(&self, features: &FeatureSnapshot) -> Result<()>;

    /// Stop streaming.
    fn stop_streaming(&self) -> Result<()>;

    /// Capture one frame into `dst`. Blocks for the transport's latency.
    fn fill_frame(&self, dst: &mut [u8]) -> Result<FrameInfo>;

    /// Read device memory.
    fn memory_read(&self, _address: u64, _dst: &mut [u8]) -> Result<usize> {
        Err(CameraError::NotImplemented("memory_read"))
    }

    /// Write device memory.
    fn memory_write(&self, _address: u64, _src: &[u8]) -> Result<usize> {
        Err(CameraError::NotImplemented("memory_write"))
    }

    /// Persist feature values.
    fn settings_save(&self, _path: &Path, _values: &FeatureSnapshot) -> Result<()> {
        Err(CameraError::NotImplemented("settings_save"))
    }

    /// Load persisted feature values.
    fn settings_load(&self, _path: &Path) -> Result<FeatureSnapshot> {
        Err(CameraError::NotImplemented("settings_load"))
    }
}
