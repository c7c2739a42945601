//! Recording test double for the capability traits.
//!
//! [`MockApi`] implements [`FeatureAccess`], [`BufferLifecycle`] and
//! [`AcquisitionControl`]. Every call is recorded with its arguments. Replies
//! default to success with zero values and can be stubbed per method, either
//! once or for every call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::{BufferId, FrameBuffer, FrameInfo};
use crate::error::{CameraError, Result};
use crate::feature::{EnumEntry, FeatureDescriptor, FeatureValue};
use crate::traits::{
    AcquisitionControl, BufferLifecycle, CaptureState, DeviceHandle, FeatureAccess,
    FrameCallback, InvalidationCallback, RegistrationId,
};

/// Payload size reported when `payload_size` is not stubbed.
pub const DEFAULT_PAYLOAD_SIZE: usize = 256;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Trait method name, e.g. `int_set`.
    pub method: &'static str,
    /// Handle passed in.
    pub handle: DeviceHandle,
    /// Feature name, for feature calls.
    pub feature: Option<String>,
    /// Value written, for setters.
    pub value: Option<FeatureValue>,
    /// Buffer passed in, for buffer and capture calls.
    pub buffer: Option<BufferId>,
}

impl Call {
    const fn new(method: &'static str, handle: DeviceHandle) -> Self {
        Self {
            method,
            handle,
            feature: None,
            value: None,
            buffer: None,
        }
    }

    fn feature(mut self, name: &str) -> Self {
        self.feature = Some(name.to_owned());
        self
    }

    fn value(mut self, value: FeatureValue) -> Self {
        self.value = Some(value);
        self
    }

    fn buffer(mut self, buffer: &FrameBuffer) -> Self {
        self.buffer = Some(buffer.id());
        self
    }
}

/// Stubbed reply; the variant must match the method's return type.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `()`.
    Unit,
    /// Integer value.
    Int(i64),
    /// Float value.
    Float(f64),
    /// Optional float, for `float_increment`.
    OptFloat(Option<f64>),
    /// String or enum symbol.
    Text(String),
    /// Boolean value.
    Flag(bool),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Size or length.
    Size(usize),
    /// Integer range.
    IntRange(i64, i64),
    /// Float range.
    FloatRange(f64, f64),
    /// Integer list.
    Ints(Vec<i64>),
    /// Symbol list.
    Texts(Vec<String>),
    /// One descriptor.
    Descriptor(FeatureDescriptor),
    /// Descriptor list.
    Descriptors(Vec<FeatureDescriptor>),
    /// Enum entry.
    Entry(EnumEntry),
    /// Frame metadata.
    Frame(FrameInfo),
    /// Capture state.
    State(CaptureState),
    /// `(readable, writeable)`.
    Access(bool, bool),
}

macro_rules! reply_into {
    ($($fn_name:ident: $variant:ident -> $ty:ty;)+) => {
        impl Reply {
            $(
                fn $fn_name(self) -> Option<$ty> {
                    match self {
                        Self::$variant(value) => Some(value),
                        _ => None,
                    }
                }
            )+
        }
    };
}

reply_into! {
    into_int: Int -> i64;
    into_float: Float -> f64;
    into_opt_float: OptFloat -> Option<f64>;
    into_text: Text -> String;
    into_flag: Flag -> bool;
    into_bytes: Bytes -> Vec<u8>;
    into_size: Size -> usize;
    into_ints: Ints -> Vec<i64>;
    into_texts: Texts -> Vec<String>;
    into_descriptor: Descriptor -> FeatureDescriptor;
    into_descriptors: Descriptors -> Vec<FeatureDescriptor>;
    into_entry: Entry -> EnumEntry;
    into_frame: Frame -> FrameInfo;
    into_state: State -> CaptureState;
}

impl Reply {
    fn into_unit(self) -> Option<()> {
        match self {
            Self::Unit => Some(()),
            _ => None,
        }
    }

    fn into_int_range(self) -> Option<(i64, i64)> {
        match self {
            Self::IntRange(min, max) => Some((min, max)),
            _ => None,
        }
    }

    fn into_float_range(self) -> Option<(f64, f64)> {
        match self {
            Self::FloatRange(min, max) => Some((min, max)),
            _ => None,
        }
    }

    fn into_access(self) -> Option<(bool, bool)> {
        match self {
            Self::Access(readable, writeable) => Some((readable, writeable)),
            _ => None,
        }
    }
}

type StubFn = Arc<dyn Fn(&Call) -> Result<Reply> + Send + Sync>;

#[derive(Default)]
struct Stubs {
    once: HashMap<&'static str, VecDeque<Result<Reply>>>,
    always: HashMap<&'static str, StubFn>,
}

struct Pending {
    handle: DeviceHandle,
    buffer: FrameBuffer,
    callback: FrameCallback,
}

struct Observer {
    handle: DeviceHandle,
    name: String,
    id: RegistrationId,
    callback: InvalidationCallback,
}

/// Contract-based test double with a call recorder.
#[derive(Default)]
pub struct MockApi {
    calls: Mutex<Vec<Call>>,
    stubs: Mutex<Stubs>,
    pending: Mutex<Vec<Pending>>,
    observers: Mutex<Vec<Observer>>,
    next_registration: AtomicU64,
}

impl MockApi {
    /// Fresh double with no stubs.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to pass to the double.
    pub const fn handle(&self) -> DeviceHandle {
        DeviceHandle(1)
    }

    /// Reply to the next call of `method` with `result`. Queued per method.
    pub fn stub(&self, method: &'static str, result: Result<Reply>) {
        self.stubs
            .lock()
            .once
            .entry(method)
            .or_default()
            .push_back(result);
    }

    /// Reply to every call of `method` through `reply`, after one-shot stubs
    /// are used up.
    pub fn stub_with<F>(&self, method: &'static str, reply: F)
    where
        F: Fn(&Call) -> Result<Reply> + Send + Sync + 'static,
    {
        self.stubs.lock().always.insert(method, Arc::new(reply));
    }

    /// Every recorded call, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Recorded calls of one method.
    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Invoke the callbacks of every queued frame once. Returns how many ran.
    ///
    /// Frames queued by the callbacks themselves wait for the next call.
    pub fn deliver_pending(&self) -> usize {
        let pending: Vec<Pending> = self.pending.lock().drain(..).collect();
        for frame in &pending {
            (frame.callback)(frame.handle, &frame.buffer);
        }
        pending.len()
    }

    /// Invoke every observer of `(handle, name)`. Returns how many ran.
    pub fn fire_invalidation(&self, handle: DeviceHandle, name: &str) -> usize {
        let targets: Vec<InvalidationCallback> = self
            .observers
            .lock()
            .iter()
            .filter(|observer| observer.handle == handle && observer.name == name)
            .map(|observer| Arc::clone(&observer.callback))
            .collect();
        for callback in &targets {
            callback(handle, name);
        }
        targets.len()
    }

    fn invoke(&self, call: Call) -> Result<Option<Reply>> {
        let (once, always) = {
            let mut stubs = self.stubs.lock();
            let once = stubs
                .once
                .get_mut(call.method)
                .and_then(VecDeque::pop_front);
            let always = stubs.always.get(call.method).cloned();
            (once, always)
        };
        self.calls.lock().push(call.clone());
        match (once, always) {
            (Some(result), _) => result.map(Some),
            (None, Some(reply)) => reply(&call).map(Some),
            (None, None) => Ok(None),
        }
    }

    fn answer<T, F>(&self, call: Call, default: Result<T>, extract: F) -> Result<T>
    where
        F: FnOnce(Reply) -> Option<T>,
    {
        let method = call.method;
        match self.invoke(call)? {
            None => default,
            Some(reply) => extract(reply).ok_or_else(|| {
                CameraError::InvalidCall(format!("stub for {method} has the wrong reply type"))
            }),
        }
    }

    fn unit(&self, call: Call) -> Result<()> {
        self.answer(call, Ok(()), Reply::into_unit)
    }
}

impl FeatureAccess for MockApi {
    fn feature_info(&self, handle: DeviceHandle, name: &str) -> Result<FeatureDescriptor> {
        self.answer(
            Call::new("feature_info", handle).feature(name),
            Err(CameraError::NotFound(name.to_owned())),
            Reply::into_descriptor,
        )
    }

    fn features_list(&self, handle: DeviceHandle) -> Result<Vec<FeatureDescriptor>> {
        self.answer(
            Call::new("features_list", handle),
            Ok(Vec::new()),
            Reply::into_descriptors,
        )
    }

    fn features_list_selected(
        &self,
        handle: DeviceHandle,
        name: &str,
    ) -> Result<Vec<FeatureDescriptor>> {
        self.answer(
            Call::new("features_list_selected", handle).feature(name),
            Ok(Vec::new()),
            Reply::into_descriptors,
        )
    }

    fn feature_access(&self, handle: DeviceHandle, name: &str) -> Result<(bool, bool)> {
        self.answer(
            Call::new("feature_access", handle).feature(name),
            Ok((true, true)),
            Reply::into_access,
        )
    }

    fn int_get(&self, handle: DeviceHandle, name: &str) -> Result<i64> {
        self.answer(Call::new("int_get", handle).feature(name), Ok(0), Reply::into_int)
    }

    fn int_set(&self, handle: DeviceHandle, name: &str, value: i64) -> Result<()> {
        self.unit(
            Call::new("int_set", handle)
                .feature(name)
                .value(FeatureValue::Integer(value)),
        )
    }

    fn int_range(&self, handle: DeviceHandle, name: &str) -> Result<(i64, i64)> {
        self.answer(
            Call::new("int_range", handle).feature(name),
            Ok((0, 0)),
            Reply::into_int_range,
        )
    }

    fn int_increment(&self, handle: DeviceHandle, name: &str) -> Result<i64> {
        self.answer(
            Call::new("int_increment", handle).feature(name),
            Ok(1),
            Reply::into_int,
        )
    }

    fn int_valid_set(&self, handle: DeviceHandle, name: &str) -> Result<Vec<i64>> {
        self.answer(
            Call::new("int_valid_set", handle).feature(name),
            Ok(Vec::new()),
            Reply::into_ints,
        )
    }

    fn float_get(&self, handle: DeviceHandle, name: &str) -> Result<f64> {
        self.answer(
            Call::new("float_get", handle).feature(name),
            Ok(0.0),
            Reply::into_float,
        )
    }

    fn float_set(&self, handle: DeviceHandle, name: &str, value: f64) -> Result<()> {
        self.unit(
            Call::new("float_set", handle)
                .feature(name)
                .value(FeatureValue::Float(value)),
        )
    }

    fn float_range(&self, handle: DeviceHandle, name: &str) -> Result<(f64, f64)> {
        self.answer(
            Call::new("float_range", handle).feature(name),
            Ok((0.0, 0.0)),
            Reply::into_float_range,
        )
    }

    fn float_increment(&self, handle: DeviceHandle, name: &str) -> Result<Option<f64>> {
        self.answer(
            Call::new("float_increment", handle).feature(name),
            Ok(None),
            Reply::into_opt_float,
        )
    }

    fn enum_get(&self, handle: DeviceHandle, name: &str) -> Result<String> {
        self.answer(
            Call::new("enum_get", handle).feature(name),
            Ok(String::new()),
            Reply::into_text,
        )
    }

    fn enum_set(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<()> {
        self.unit(
            Call::new("enum_set", handle)
                .feature(name)
                .value(FeatureValue::Enum(value.to_owned())),
        )
    }

    fn enum_range(&self, handle: DeviceHandle, name: &str) -> Result<Vec<String>> {
        self.answer(
            Call::new("enum_range", handle).feature(name),
            Ok(Vec::new()),
            Reply::into_texts,
        )
    }

    fn enum_is_available(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<bool> {
        self.answer(
            Call::new("enum_is_available", handle)
                .feature(name)
                .value(FeatureValue::Enum(value.to_owned())),
            Ok(false),
            Reply::into_flag,
        )
    }

    fn enum_as_int(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<i64> {
        self.answer(
            Call::new("enum_as_int", handle)
                .feature(name)
                .value(FeatureValue::Enum(value.to_owned())),
            Ok(0),
            Reply::into_int,
        )
    }

    fn enum_as_string(&self, handle: DeviceHandle, name: &str, value: i64) -> Result<String> {
        self.answer(
            Call::new("enum_as_string", handle)
                .feature(name)
                .value(FeatureValue::Integer(value)),
            Ok(String::new()),
            Reply::into_text,
        )
    }

    fn enum_entry(&self, handle: DeviceHandle, name: &str, entry: &str) -> Result<EnumEntry> {
        self.answer(
            Call::new("enum_entry", handle)
                .feature(name)
                .value(FeatureValue::Enum(entry.to_owned())),
            Err(CameraError::NotFound(format!("{name} has no entry {entry}"))),
            Reply::into_entry,
        )
    }

    fn string_get(&self, handle: DeviceHandle, name: &str) -> Result<String> {
        self.answer(
            Call::new("string_get", handle).feature(name),
            Ok(String::new()),
            Reply::into_text,
        )
    }

    fn string_set(&self, handle: DeviceHandle, name: &str, value: &str) -> Result<()> {
        self.unit(
            Call::new("string_set", handle)
                .feature(name)
                .value(FeatureValue::String(value.to_owned())),
        )
    }

    fn string_max_length(&self, handle: DeviceHandle, name: &str) -> Result<usize> {
        self.answer(
            Call::new("string_max_length", handle).feature(name),
            Ok(0),
            Reply::into_size,
        )
    }

    fn bool_get(&self, handle: DeviceHandle, name: &str) -> Result<bool> {
        self.answer(
            Call::new("bool_get", handle).feature(name),
            Ok(false),
            Reply::into_flag,
        )
    }

    fn bool_set(&self, handle: DeviceHandle, name: &str, value: bool) -> Result<()> {
        self.unit(
            Call::new("bool_set", handle)
                .feature(name)
                .value(FeatureValue::Boolean(value)),
        )
    }

    fn command_run(&self, handle: DeviceHandle, name: &str) -> Result<()> {
        self.unit(Call::new("command_run", handle).feature(name))
    }

    fn command_is_done(&self, handle: DeviceHandle, name: &str) -> Result<bool> {
        self.answer(
            Call::new("command_is_done", handle).feature(name),
            Ok(true),
            Reply::into_flag,
        )
    }

    fn raw_get(&self, handle: DeviceHandle, name: &str) -> Result<Vec<u8>> {
        self.answer(
            Call::new("raw_get", handle).feature(name),
            Ok(Vec::new()),
            Reply::into_bytes,
        )
    }

    fn raw_set(&self, handle: DeviceHandle, name: &str, value: &[u8]) -> Result<()> {
        self.unit(
            Call::new("raw_set", handle)
                .feature(name)
                .value(FeatureValue::Raw(value.to_vec())),
        )
    }

    fn raw_length(&self, handle: DeviceHandle, name: &str) -> Result<usize> {
        self.answer(
            Call::new("raw_length", handle).feature(name),
            Ok(0),
            Reply::into_size,
        )
    }

    fn raw_max_length(&self, handle: DeviceHandle, name: &str) -> Result<usize> {
        self.answer(
            Call::new("raw_max_length", handle).feature(name),
            Ok(0),
            Reply::into_size,
        )
    }

    fn register_invalidation(
        &self,
        handle: DeviceHandle,
        name: &str,
        callback: InvalidationCallback,
    ) -> Result<RegistrationId> {
        self.unit(Call::new("register_invalidation", handle).feature(name))?;
        let id = RegistrationId(self.next_registration.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push(Observer {
            handle,
            name: name.to_owned(),
            id,
            callback,
        });
        Ok(id)
    }

    fn unregister_invalidation(
        &self,
        handle: DeviceHandle,
        name: &str,
        id: RegistrationId,
    ) -> Result<()> {
        self.unit(Call::new("unregister_invalidation", handle).feature(name))?;
        let mut observers = self.observers.lock();
        let pos = observers
            .iter()
            .position(|observer| observer.handle == handle && observer.name == name && observer.id == id)
            .ok_or_else(|| CameraError::NotFound(format!("registration for {name}")))?;
        observers.remove(pos);
        Ok(())
    }
}

impl BufferLifecycle for MockApi {
    fn payload_size(&self, handle: DeviceHandle) -> Result<usize> {
        self.answer(
            Call::new("payload_size", handle),
            Ok(DEFAULT_PAYLOAD_SIZE),
            Reply::into_size,
        )
    }

    fn frame_announce(&self, handle: DeviceHandle, buffer: &FrameBuffer) -> Result<()> {
        self.unit(Call::new("frame_announce", handle).buffer(buffer))
    }

    fn frame_revoke(&self, handle: DeviceHandle, buffer: &FrameBuffer) -> Result<()> {
        self.unit(Call::new("frame_revoke", handle).buffer(buffer))
    }

    fn frame_revoke_all(&self, handle: DeviceHandle) -> Result<()> {
        self.pending.lock().retain(|frame| frame.handle != handle);
        self.unit(Call::new("frame_revoke_all", handle))
    }
}

impl AcquisitionControl for MockApi {
    fn capture_start(&self, handle: DeviceHandle) -> Result<()> {
        self.unit(Call::new("capture_start", handle))
    }

    fn capture_end(&self, handle: DeviceHandle) -> Result<()> {
        self.unit(Call::new("capture_end", handle))
    }

    fn capture_frame_queue(
        &self,
        handle: DeviceHandle,
        buffer: &FrameBuffer,
        callback: Option<FrameCallback>,
    ) -> Result<()> {
        self.unit(Call::new("capture_frame_queue", handle).buffer(buffer))?;
        if let Some(callback) = callback {
            self.pending.lock().push(Pending {
                handle,
                buffer: buffer.clone(),
                callback,
            });
        }
        Ok(())
    }

    fn capture_frame_wait(
        &self,
        handle: DeviceHandle,
        buffer: &FrameBuffer,
        _timeout: Duration,
    ) -> Result<FrameInfo> {
        self.answer(
            Call::new("capture_frame_wait", handle).buffer(buffer),
            Ok(buffer.info()),
            Reply::into_frame,
        )
    }

    fn capture_queue_flush(&self, handle: DeviceHandle) -> Result<()> {
        self.pending.lock().retain(|frame| frame.handle != handle);
        self.unit(Call::new("capture_queue_flush", handle))
    }

    fn capture_state(&self, handle: DeviceHandle) -> Result<CaptureState> {
        self.answer(
            Call::new("capture_state", handle),
            Ok(CaptureState::Idle),
            Reply::into_state,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calls_are_recorded_with_arguments() {
        let api = MockApi::new();
        let handle = api.handle();
        api.int_set(handle, "Width", 64).expect("set");
        api.enum_get(handle, "PixelFormat").expect("get");

        let calls = api.calls();
        assert_eq!(calls.len(), 2);
        let first = calls.first().expect("first call");
        assert_eq!(first.method, "int_set");
        assert_eq!(first.feature.as_deref(), Some("Width"));
        assert_eq!(first.value, Some(FeatureValue::Integer(64)));
    }

    #[test]
    fn test_one_shot_stub_then_default() {
        let api = MockApi::new();
        let handle = api.handle();
        api.stub(
            "enum_set",
            Err(CameraError::InvalidValue("no such entry".to_owned())),
        );

        let err = api
            .enum_set(handle, "TriggerMode", "")
            .expect_err("stubbed failure");
        assert_eq!(err.code(), -11);
        api.enum_set(handle, "TriggerMode", "On")
            .expect("default reply");
    }

    #[test]
    fn test_stubbed_output_argument() {
        let api = MockApi::new();
        let handle = api.handle();
        api.stub_with("enum_range", |_: &Call| {
            Ok(Reply::Texts(vec!["Off".to_owned(), "On".to_owned()]))
        });
        assert_eq!(
            api.enum_range(handle, "TriggerMode").expect("range"),
            vec!["Off", "On"]
        );
        assert_eq!(
            api.enum_range(handle, "TriggerMode").expect("range again"),
            vec!["Off", "On"]
        );
    }

    #[test]
    fn test_wrong_reply_type_is_reported() {
        let api = MockApi::new();
        api.stub("int_get", Ok(Reply::Flag(true)));
        assert!(matches!(
            api.int_get(api.handle(), "Width"),
            Err(CameraError::InvalidCall(_))
        ));
    }

    #[test]
    fn test_string_into_truncates_stubbed_value() {
        let api = MockApi::new();
        api.stub("string_get", Ok(Reply::Text("Mono8".to_owned())));
        let mut dst = [0u8; 3];
        assert!(matches!(
            api.string_get_into(api.handle(), "PixelFormat", &mut dst),
            Err(CameraError::BufferTooSmall {
                written: 3,
                required: 5
            })
        ));
        assert_eq!(&dst, b"Mon");
    }

    #[test]
    fn test_invalidation_registry() {
        let api = MockApi::new();
        let handle = api.handle();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let id = api
            .register_invalidation(
                handle,
                "Gain",
                Arc::new(move |_: DeviceHandle, _: &str| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("register");

        assert_eq!(api.fire_invalidation(handle, "Gain"), 1);
        api.unregister_invalidation(handle, "Gain", id)
            .expect("unregister");
        assert_eq!(api.fire_invalidation(handle, "Gain"), 0);
        assert!(matches!(
            api.unregister_invalidation(handle, "Gain", id),
            Err(CameraError::NotFound(_))
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
