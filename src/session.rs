//! Device sessions and the system entry point.
//!
//! [`System`] owns the transport, the invalidation notifier and every open
//! [`DeviceHandle`]. Each handle composes a feature registry, an acquisition
//! engine and the link to the device. Handles lock independently; operations
//! on one never wait for another.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::acquisition::AcquisitionEngine;
use crate::buffer::{FrameBuffer, FrameInfo};
use crate::config::SystemConfig;
use crate::error::{CameraError, Result};
use crate::feature::{
    EnumEntry, FeatureDescriptor, FeatureKind, FeatureRegistry, FeatureSnapshot, FeatureValue,
};
use crate::notify::InvalidationNotifier;
use crate::sim::SimTransport;
use crate::traits::{
    AccessMode, AcquisitionControl, BufferLifecycle, CameraInfo, CaptureState, DeviceHandle,
    DeviceLink, FeatureAccess, FrameCallback, InterfaceInfo, InvalidationCallback,
    RegistrationId, Transport, TransportLayerInfo, VersionInfo,
};

struct Session {
    info: CameraInfo,
    mode: AccessMode,
    link: Arc<dyn DeviceLink>,
    features: Mutex<FeatureRegistry>,
    engine: Arc<AcquisitionEngine>,
}

impl Session {
    fn is_streaming(&self) -> bool {
        self.engine.capture_state() == CaptureState::Started
    }

    /// Validate and apply one write. Returns the features to invalidate.
    fn apply(
        &self,
        features: &mut FeatureRegistry,
        name: &str,
        value: FeatureValue,
    ) -> Result<Vec<String>> {
        let descriptor = features.check_write(name, &value)?;
        if descriptor.streaming_locked && self.is_streaming() {
            return Err(CameraError::AccessDenied(format!(
                "{name} is locked while streaming"
            )));
        }
        let mut invalidated = Vec::with_capacity(1 + descriptor.selected_features.len());
        invalidated.push(name.to_owned());
        invalidated.extend(descriptor.selected_features.iter().cloned());

        self.link.write_feature(name, &value)?;
        if features.store(name, value)? {
            Ok(invalidated)
        } else {
            Ok(Vec::new())
        }
    }

    /// Put `names` back to their values in `before`, newest first.
    fn restore(
        &self,
        features: &mut FeatureRegistry,
        before: &FeatureSnapshot,
        names: &[String],
    ) {
        for name in names.iter().rev() {
            let Some(value) = before.0.get(name) else {
                continue;
            };
            if let Err(err) = self.link.write_feature(name, value) {
                warn!(feature = %name, error = %err, "restoring feature failed");
            }
            if let Err(err) = features.store(name, value.clone()) {
                warn!(feature = %name, error = %err, "restoring stored value failed");
            }
        }
    }
}

/// Entry point: enumeration, open/close and every per-handle operation.
pub struct System {
    transport: Arc<dyn Transport>,
    notifier: InvalidationNotifier,
    sessions: RwLock<HashMap<DeviceHandle, Arc<Session>>>,
    exclusive: Mutex<HashSet<String>>,
    next_handle: AtomicU64,
    running: AtomicBool,
}

impl System {
    /// Start the API over `transport`.
    pub fn startup(transport: Arc<dyn Transport>, config: &SystemConfig) -> Result<Self> {
        let notifier = InvalidationNotifier::new(config.notify)?;
        info!(notify = ?config.notify, "camera API started");
        Ok(Self {
            transport,
            notifier,
            sessions: RwLock::new(HashMap::new()),
            exclusive: Mutex::new(HashSet::new()),
            next_handle: AtomicU64::new(1),
            running: AtomicBool::new(true),
        })
    }

    /// Start the API over the simulated cameras in `config`.
    pub fn simulated(config: &SystemConfig) -> Result<Self> {
        let transport = SimTransport::new(config.profiles.clone())?;
        Self::startup(Arc::new(transport), config)
    }

    /// End capture, revoke buffers and close every handle. Later calls fail
    /// with `ApiNotStarted`.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let sessions: Vec<(DeviceHandle, Arc<Session>)> =
            self.sessions.write().drain().collect();
        for (handle, session) in sessions {
            session.engine.force_stop();
            self.notifier.unregister_all(handle);
            debug!(%handle, "closed on shutdown");
        }
        self.exclusive.lock().clear();
        info!("camera API shut down");
    }

    /// API version.
    pub fn version(&self) -> VersionInfo {
        VersionInfo {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CameraError::ApiNotStarted)
        }
    }

    fn session(&self, handle: DeviceHandle) -> Result<Arc<Session>> {
        self.ensure_running()?;
        self.sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or(CameraError::InvalidHandle)
    }

    /// Session that may write and acquire.
    fn full_session(&self, handle: DeviceHandle) -> Result<Arc<Session>> {
        let session = self.session(handle)?;
        if session.mode != AccessMode::Full {
            return Err(CameraError::AccessDenied(format!(
                "{handle} was opened read-only"
            )));
        }
        Ok(session)
    }

    /// Cameras currently reachable.
    pub fn cameras(&self) -> Result<Vec<CameraInfo>> {
        self.ensure_running()?;
        self.transport.cameras()
    }

    /// Information about one camera.
    pub fn camera_info(&self, id: &str) -> Result<CameraInfo> {
        self.cameras()?
            .into_iter()
            .find(|camera| camera.id == id)
            .ok_or_else(|| CameraError::NotFound(format!("camera {id}")))
    }

    /// Information about the camera behind an open handle.
    pub fn camera_info_by_handle(&self, handle: DeviceHandle) -> Result<CameraInfo> {
        Ok(self.session(handle)?.info.clone())
    }

    /// Transport layers known to the transport.
    pub fn transport_layers(&self) -> Result<Vec<TransportLayerInfo>> {
        self.ensure_running()?;
        self.transport.transport_layers()
    }

    /// Interfaces known to the transport.
    pub fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        self.ensure_running()?;
        self.transport.interfaces()
    }

    /// Open a camera. Only one `Full` session per camera may exist.
    pub fn open(&self, id: &str, mode: AccessMode) -> Result<DeviceHandle> {
        let info = self.camera_info(id)?;
        if !info.permitted_access.contains(&mode) {
            return Err(CameraError::AccessDenied(format!(
                "camera {id} does not permit {mode:?} access"
            )));
        }
        if mode == AccessMode::Full && !self.exclusive.lock().insert(id.to_owned()) {
            return Err(CameraError::AccessDenied(format!(
                "camera {id} is already open with full access"
            )));
        }

        let (handle, session) = match self.connect(info, mode) {
            Ok(opened) => opened,
            Err(err) => {
                if mode == AccessMode::Full {
                    self.exclusive.lock().remove(id);
                }
                return Err(err);
            }
        };

        self.sessions.write().insert(handle, Arc::new(session));
        debug!(%handle, camera = id, ?mode, "camera opened");
        Ok(handle)
    }

    fn connect(&self, info: CameraInfo, mode: AccessMode) -> Result<(DeviceHandle, Session)> {
        let link = self.transport.open(&info.id, mode)?;
        let catalog = link.catalog()?;
        let features = FeatureRegistry::new(catalog.descriptors, &catalog.values.0)?;
        let handle = DeviceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let engine = AcquisitionEngine::new(handle, Arc::clone(&link));
        Ok((
            handle,
            Session {
                info,
                mode,
                link,
                features: Mutex::new(features),
                engine,
            },
        ))
    }

    /// Close a handle. Capture must be ended and every buffer revoked first.
    pub fn close(&self, handle: DeviceHandle) -> Result<()> {
        self.ensure_running()?;
        let session = {
            let mut sessions = self.sessions.write();
            let session = sessions.get(&handle).ok_or(CameraError::InvalidHandle)?;
            session.engine.retire()?;
            sessions.remove(&handle).ok_or(CameraError::InvalidHandle)?
        };
        self.notifier.unregister_all(handle);
        if session.mode == AccessMode::Full {
            self.exclusive.lock().remove(&session.info.id);
        }
        debug!(%handle, camera = %session.info.id, "camera closed");
        Ok(())
    }

    /// Read device memory at `address` into `dst`.
    pub fn memory_read(&self, handle: DeviceHandle, address: u64, dst: &mut [u8]) -> Result<usize> {
        self.session(handle)?.link.memory_read(address, dst)
    }

    /// Write `src` to device memory at `address`.
    pub fn memory_write(&self, handle: DeviceHandle, address: u64, src: &[u8]) -> Result<usize> {
        self.full_session(handle)?.link.memory_write(address, src)
    }

    /// Persist the readable and writeable feature values.
    pub fn settings_save(&self, handle: DeviceHandle, path: &Path) -> Result<()> {
        let session = self.session(handle)?;
        let values = {
            let features = session.features.lock();
            let snapshot = features.snapshot();
            FeatureSnapshot(
                features
                    .list()
                    .filter(|descriptor| descriptor.readable && descriptor.writeable)
                    .filter_map(|descriptor| {
                        snapshot
                            .0
                            .get(&descriptor.name)
                            .map(|value| (descriptor.name.clone(), value.clone()))
                    })
                    .collect(),
            )
        };
        session.link.settings_save(path, &values)?;
        debug!(%handle, path = %path.display(), count = values.0.len(), "settings saved");
        Ok(())
    }

    /// Load persisted values and apply them through the validated write path.
    ///
    /// Every value is checked before any is applied. If the device refuses
    /// one, the values already applied are written back to what they were.
    pub fn settings_load(&self, handle: DeviceHandle, path: &Path) -> Result<()> {
        let session = self.full_session(handle)?;
        let values = session.link.settings_load(path)?;
        let invalidated = {
            let mut features = session.features.lock();
            for (name, value) in &values.0 {
                let descriptor = features.check_write(name, value)?;
                if descriptor.streaming_locked && session.is_streaming() {
                    return Err(CameraError::AccessDenied(format!(
                        "{name} is locked while streaming"
                    )));
                }
            }
            let before = features.snapshot();
            let mut applied = Vec::new();
            let mut invalidated = Vec::new();
            for (name, value) in values.0 {
                match session.apply(&mut features, &name, value) {
                    Ok(names) => invalidated.extend(names),
                    Err(err) => {
                        session.restore(&mut features, &before, &applied);
                        return Err(err);
                    }
                }
                applied.push(name);
            }
            invalidated
        };
        debug!(%handle, path = %path.display(), "settings loaded");
        self.invalidate(handle, &invalidated);
        Ok(())
    }

    fn invalidate(&self, handle: DeviceHandle, names: &[String]) {
        for name in names {
            self.notifier.notify(handle, name);
        }
    }

    fn read_value<T, F>(
        &self,
        handle: DeviceHandle,
        name: &str,
        kind: FeatureKind,
        extract: F,
    ) -> Result<T>
    where
        F: FnOnce(&FeatureValue) -> Option<T>,
    {
        let session = self.session(handle)?;
        let features = session.features.lock();
        let value = features.read(name, kind)?;
        extract(value).ok_or_else(|| CameraError::WrongType {
            name: name.to_owned(),
            expected: kind,
            actual: value.kind(),
        })
    }

    fn write_value(&self, handle: DeviceHandle, name: &str, value: FeatureValue) -> Result<()> {
        let session = self.full_session(handle)?;
        let invalidated = {
            let mut features = session.features.lock();
            session.apply(&mut features, name, value)?
        };
        self.invalidate(handle, &invalidated);
        Ok(())
    }

    fn query<T, F>(&self, handle: DeviceHandle, query: F) -> Result<T>
    where
        F: FnOnce(&FeatureRegistry) -> Result<T>,
    {
        let session = self.session(handle)?;
        let features = session.features.lock();
        query(&features)
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FeatureAccess for System {
    fn feature_info(&self, handle: DeviceHandle, name: &str) -> Result<FeatureDescriptor> {
        self.query(handle, |features| features.describe(name).cloned())
    }

    fn features_list(&self, handle: DeviceHandle) -> Result<Vec<FeatureDescriptor>> {
        self.query(handle, |features| Ok(features.list().cloned().collect()))
    }

    fn features_list_selected(
        &self,
        handle: DeviceHandle,
        name: &str,
    ) -> Result<Vec<FeatureDescriptor>> {
        self.query(handle, |features| {
            Ok(features
                .list_selected(name)?
                .into_iter()
                .cloned()
                .collect())
        })
    }

    fn feature_access(&self, handle: DeviceHandle, name: &str) -> Result<(bool, bool)> {
        let session = self.session(handle)?;
        let features = session.features.lock();
        let descriptor = features.describe(name)?;
        let writeable = descriptor.writeable
            && session.mode == AccessMode::Full
            && !(descriptor.streaming_locked && session.is_streaming());
        Ok((descriptor.readable, writeable))
    }

    fn int_get(&self, handle: DeviceHandle, name: &str) -> Result<i64> {
        self.read_value(handle, name, FeatureKind::Integer, |value| match value {
            FeatureValue::Integer(v) => Some(*v),
            _ => None,
        })
    }

    fn int_set(&self, handle: DeviceHandle, name: &str, value: i64) -> Result<()> {
        self.write_value(handle, name, FeatureValue::Integer(value))
    }

    fn int_range(&self, handle: DeviceHandle, name: &str) -> Result<(i64, i64)> {
        self.query(handle, |features| features.int_range(name))
    }

    fn int_increment(&self, handle: DeviceHandle, name: &str) -> Result<i64> {
        self.query(handle, |features| features.int_increment(name))
    }

    fn int_valid_set(&self, handle: DeviceHandle, name: &str) -> Result<Vec<i64>> {
        self.query(handle, |features| features.int_valid_set(name))
    }

    fn float_get(&self, handle: DeviceHandle, name: &str) -> Result<f64> {
        self.read_value(handle, name, FeatureKind::Float, |value| match value {
            FeatureValue::Float(v) => Some(*v),
            _ => None,
        })
    }

    fn float_set(&self, handle: DeviceHandle, name: &str, value: f64) -> Result<()> {
        self.write_value(handle, name, FeatureValue::Float(value))
    }

    fn float_range(&self, handle: DeviceHandle, name: &str) -> Result<(f64, f64)> {
        self.query(handle, |features| features.float_range(name))
    }

    fn float_increment(&self, handle: DeviceHandle, name: &str) -> Result<Option<f64>> {
        self.query(handle, |features| features.float_increment(name))
    }

    fn enum_get(&self, handle: DeviceHandle, name: &str) -> Result<String> {
        self.read_value(handle, name, FeatureKind::Enum, |value| match value {
            FeatureValue::Enum(v) => Some(v.clone()),
            _ => None,
        })
    }

    fn enum_set(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<()> {
        self.write_value(handle, name, FeatureValue::Enum(value.to_owned()))
    }

    fn enum_range(&self, handle: DeviceHandle, name: &str) -> Result<Vec<String>> {
        self.query(handle, |features| features.enum_range(name))
    }

    fn enum_is_available(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<bool> {
        self.query(handle, |features| features.enum_is_available(name, value))
    }

    fn enum_as_int(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<i64> {
        self.query(handle, |features| features.enum_as_int(name, value))
    }

    fn enum_as_string(&self, handle: DeviceHandle, name: &str, value: i64) -> Result<String> {
        self.query(handle, |features| features.enum_as_string(name, value))
    }

    fn enum_entry(&self, handle: DeviceHandle, name: &str, entry: &str) -> Result<EnumEntry> {
        self.query(handle, |features| {
            features.describe(name)?.enum_entry(entry).cloned()
        })
    }

    fn string_get(&self, handle: DeviceHandle, name: &str) -> Result<String> {
        self.read_value(handle, name, FeatureKind::String, |value| match value {
            FeatureValue::String(v) => Some(v.clone()),
            _ => None,
        })
    }

    fn string_set(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<()> {
        self.write_value(handle, name, FeatureValue::String(value.to_owned()))
    }

    fn string_max_length(&self, handle: DeviceHandle, name: &str) -> Result<usize> {
        self.query(handle, |features| {
            features.describe(name)?.expect_kind(FeatureKind::String)?;
            features.max_length(name)
        })
    }

    fn bool_get(&self, handle: DeviceHandle, name: &str) -> Result<bool> {
        self.read_value(handle, name, FeatureKind::Boolean, |value| match value {
            FeatureValue::Boolean(v) => Some(*v),
            _ => None,
        })
    }

    fn bool_set(&self, handle: DeviceHandle, name: &str, value: bool) -> Result<()> {
        self.write_value(handle, name, FeatureValue::Boolean(value))
    }

    fn command_run(&self, handle: DeviceHandle, name: &str) -> Result<()> {
        let session = self.full_session(handle)?;
        {
            let features = session.features.lock();
            let descriptor = features.describe(name)?;
            descriptor.expect_kind(FeatureKind::Command)?;
            if !descriptor.writeable {
                return Err(CameraError::AccessDenied(format!("{name} is not writeable")));
            }
        }
        session.link.run_command(name)?;
        debug!(%handle, command = name, "command started");
        Ok(())
    }

    fn command_is_done(&self, handle: DeviceHandle, name: &str) -> Result<bool> {
        let session = self.session(handle)?;
        session
            .features
            .lock()
            .describe(name)?
            .expect_kind(FeatureKind::Command)?;
        session.link.command_done(name)
    }

    fn raw_get(&self, handle: DeviceHandle, name: &str) -> Result<Vec<u8>> {
        self.read_value(handle, name, FeatureKind::Raw, |value| match value {
            FeatureValue::Raw(v) => Some(v.clone()),
            _ => None,
        })
    }

    fn raw_set(&self, handle: DeviceHandle, name: &str, value: &[u8]) -> Result<()> {
        self.write_value(handle, name, FeatureValue::Raw(value.to_vec()))
    }

    fn raw_length(&self, handle: DeviceHandle, name: &str) -> Result<usize> {
        self.read_value(handle, name, FeatureKind::Raw, |value| match value {
            FeatureValue::Raw(v) => Some(v.len()),
            _ => None,
        })
    }

    fn raw_max_length(&self, handle: DeviceHandle, name: &str) -> Result<usize> {
        self.query(handle, |features| {
            features.describe(name)?.expect_kind(FeatureKind::Raw)?;
            features.max_length(name)
        })
    }

    fn register_invalidation(
        &self,
        handle: DeviceHandle,
        name: &str,
        callback: InvalidationCallback,
    ) -> Result<RegistrationId> {
        self.query(handle, |features| features.describe(name).map(|_| ()))?;
        Ok(self.notifier.register(handle, name, callback))
    }

    fn unregister_invalidation(
        &self,
        handle: DeviceHandle,
        name: &str,
        id: RegistrationId,
    ) -> Result<()> {
        self.session(handle)?;
        self.notifier.unregister(handle, name, id)
    }
}

impl BufferLifecycle for System {
    fn payload_size(&self, handle: DeviceHandle) -> Result<usize> {
        let session = self.session(handle)?;
        let snapshot = session.features.lock().snapshot();
        session.link.payload_size(&snapshot)
    }

    fn frame_announce(&self, handle: DeviceHandle, buffer: &FrameBuffer) -> Result<()> {
        self.full_session(handle)?.engine.announce(buffer)
    }

    fn frame_revoke(&self, handle: DeviceHandle, buffer: &FrameBuffer) -> Result<()> {
        self.full_session(handle)?.engine.revoke(buffer)
    }

    fn frame_revoke_all(&self, handle: DeviceHandle) -> Result<()> {
        self.full_session(handle)?.engine.revoke_all()
    }
}

impl AcquisitionControl for System {
    fn capture_start(&self, handle: DeviceHandle) -> Result<()> {
        let session = self.full_session(handle)?;
        session.engine.start(&session.features)
    }

    fn capture_end(&self, handle: DeviceHandle) -> Result<()> {
        self.full_session(handle)?.engine.end()
    }

    fn capture_frame_queue(
        &self,
        handle: DeviceHandle,
        buffer: &FrameBuffer,
        callback: Option<FrameCallback>,
    ) -> Result<()> {
        self.full_session(handle)?.engine.queue(buffer, callback)
    }

    fn capture_frame_wait(
        &self,
        handle: DeviceHandle,
        buffer: &FrameBuffer,
        timeout: Duration,
    ) -> Result<FrameInfo> {
        let session = self.full_session(handle)?;
        let result = session.engine.wait(buffer, timeout);
        if let Err(CameraError::Timeout) = &result {
            warn!(%handle, ?timeout, "frame wait timed out");
        }
        result
    }

    fn capture_queue_flush(&self, handle: DeviceHandle) -> Result<()> {
        self.full_session(handle)?.engine.flush();
        Ok(())
    }

    fn capture_state(&self, handle: DeviceHandle) -> Result<CaptureState> {
        Ok(self.session(handle)?.engine.capture_state())
    }
}
