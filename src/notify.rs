//! Feature invalidation observers.
//!
//! Registrations are keyed by `(handle, feature)`. A change enumerates the
//! live registrations for that key in registration order and invokes each one
//! exactly once, on the dispatcher thread in [`DispatchMode::Background`] or on
//! the notifying thread in [`DispatchMode::Inline`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CameraError, Result};
use crate::traits::{DeviceHandle, InvalidationCallback, RegistrationId};

/// Where invalidation callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// On the thread that changed the feature, before the setter returns.
    Inline,
    /// On the notifier's own thread.
    #[default]
    Background,
}

struct Registration {
    id: RegistrationId,
    callback: InvalidationCallback,
    live: AtomicBool,
}

struct Job {
    handle: DeviceHandle,
    name: String,
    targets: Vec<Arc<Registration>>,
}

type Key = (DeviceHandle, String);

/// Registry of invalidation observers plus their dispatcher.
pub struct InvalidationNotifier {
    registrations: Mutex<HashMap<Key, Vec<Arc<Registration>>>>,
    next_id: AtomicU64,
    sender: Option<Sender<Job>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl InvalidationNotifier {
    /// Create a notifier; `Background` spawns the dispatcher thread.
    pub fn new(mode: DispatchMode) -> Result<Self> {
        let (sender, dispatcher) = match mode {
            DispatchMode::Inline => (None, None),
            DispatchMode::Background => {
                let (tx, rx) = channel::unbounded::<Job>();
                let handle = thread::Builder::new()
                    .name("cam-notify".to_owned())
                    .spawn(move || {
                        for job in rx {
                            deliver(&job);
                        }
                        debug!("invalidation dispatcher stopped");
                    })?;
                (Some(tx), Some(handle))
            }
        };

        Ok(Self {
            registrations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sender,
            dispatcher,
        })
    }

    /// Add an observer for `(handle, name)`.
    pub fn register(
        &self,
        handle: DeviceHandle,
        name: &str,
        callback: InvalidationCallback,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations
            .lock()
            .entry((handle, name.to_owned()))
            .or_default()
            .push(Arc::new(Registration {
                id,
                callback,
                live: AtomicBool::new(true),
            }));
        debug!(%handle, feature = name, id = id.0, "invalidation registered");
        id
    }

    /// Remove one observer. Removing twice fails with `NotFound`.
    pub fn unregister(&self, handle: DeviceHandle, name: &str, id: RegistrationId) -> Result<()> {
        let mut registrations = self.registrations.lock();
        let key = (handle, name.to_owned());
        let list = registrations
            .get_mut(&key)
            .ok_or_else(|| CameraError::NotFound(format!("no registration for {name}")))?;
        let pos = list
            .iter()
            .position(|reg| reg.id == id)
            .ok_or_else(|| CameraError::NotFound(format!("registration {} for {name}", id.0)))?;
        let removed = list.remove(pos);
        removed.live.store(false, Ordering::Release);
        if list.is_empty() {
            registrations.remove(&key);
        }
        Ok(())
    }

    /// Drop every observer of a device.
    pub fn unregister_all(&self, handle: DeviceHandle) {
        self.registrations.lock().retain(|(owner, _), list| {
            if *owner == handle {
                for reg in list.iter() {
                    reg.live.store(false, Ordering::Release);
                }
                false
            } else {
                true
            }
        });
    }

    /// Number of live observers of `(handle, name)`.
    pub fn count(&self, handle: DeviceHandle, name: &str) -> usize {
        self.registrations
            .lock()
            .get(&(handle, name.to_owned()))
            .map_or(0, Vec::len)
    }

    /// Signal that `name` changed on `handle`.
    pub fn notify(&self, handle: DeviceHandle, name: &str) {
        let targets = match self.registrations.lock().get(&(handle, name.to_owned())) {
            Some(list) => list.clone(),
            None => return,
        };
        let job = Job {
            handle,
            name: name.to_owned(),
            targets,
        };
        match &self.sender {
            Some(sender) => {
                if let Err(err) = sender.send(job) {
                    warn!(%handle, feature = name, "dispatcher gone, delivering inline");
                    deliver(&err.into_inner());
                }
            }
            None => deliver(&job),
        }
    }
}

fn deliver(job: &Job) {
    for reg in &job.targets {
        if !reg.live.load(Ordering::Acquire) {
            continue;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| (reg.callback)(job.handle, &job.name)));
        if outcome.is_err() {
            warn!(handle = %job.handle, feature = %job.name, "invalidation callback panicked");
        }
    }
}

impl Drop for InvalidationNotifier {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                warn!("invalidation dispatcher panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const HANDLE: DeviceHandle = DeviceHandle(1);

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> InvalidationCallback {
        let log = Arc::clone(log);
        Arc::new(move |_: DeviceHandle, _: &str| log.lock().push(tag))
    }

    #[test]
    fn test_inline_delivery_in_registration_order() {
        let notifier = InvalidationNotifier::new(DispatchMode::Inline).expect("notifier");
        let log = Arc::new(Mutex::new(Vec::new()));
        notifier.register(HANDLE, "Gain", recorder(&log, "first"));
        notifier.register(HANDLE, "Gain", recorder(&log, "second"));

        notifier.notify(HANDLE, "Gain");
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_unregister_leaves_other_observer() {
        let notifier = InvalidationNotifier::new(DispatchMode::Inline).expect("notifier");
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = notifier.register(HANDLE, "Gain", recorder(&log, "first"));
        notifier.register(HANDLE, "Gain", recorder(&log, "second"));

        notifier.unregister(HANDLE, "Gain", first).expect("unregister");
        notifier.notify(HANDLE, "Gain");
        assert_eq!(*log.lock(), vec!["second"]);
    }

    #[test]
    fn test_unregister_twice_is_not_found() {
        let notifier = InvalidationNotifier::new(DispatchMode::Inline).expect("notifier");
        let id = notifier.register(HANDLE, "Gain", Arc::new(|_: DeviceHandle, _: &str| {}));
        notifier.unregister(HANDLE, "Gain", id).expect("first");
        assert!(matches!(
            notifier.unregister(HANDLE, "Gain", id),
            Err(CameraError::NotFound(_))
        ));
        assert_eq!(notifier.count(HANDLE, "Gain"), 0);
    }

    #[test]
    fn test_other_handles_are_isolated() {
        let notifier = InvalidationNotifier::new(DispatchMode::Inline).expect("notifier");
        let log = Arc::new(Mutex::new(Vec::new()));
        notifier.register(DeviceHandle(2), "Gain", recorder(&log, "other"));
        notifier.notify(HANDLE, "Gain");
        assert!(log.lock().is_empty());

        notifier.unregister_all(DeviceHandle(2));
        assert_eq!(notifier.count(DeviceHandle(2), "Gain"), 0);
    }

    #[test]
    fn test_background_delivery_runs_off_caller_thread() {
        let notifier = InvalidationNotifier::new(DispatchMode::Background).expect("notifier");
        let (tx, rx) = channel::unbounded();
        let caller = thread::current().id();
        notifier.register(
            HANDLE,
            "ExposureTime",
            Arc::new(move |handle: DeviceHandle, name: &str| {
                let _ = tx.send((handle, name.to_owned(), thread::current().id()));
            }),
        );

        notifier.notify(HANDLE, "ExposureTime");
        let (handle, name, thread_id) = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("callback delivered");
        assert_eq!(handle, HANDLE);
        assert_eq!(name, "ExposureTime");
        assert_ne!(thread_id, caller);
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_panicking_callback_does_not_stop_others() {
        let notifier = InvalidationNotifier::new(DispatchMode::Inline).expect("notifier");
        let log = Arc::new(Mutex::new(Vec::new()));
        notifier.register(
            HANDLE,
            "Gain",
            Arc::new(|_: DeviceHandle, _: &str| panic!("observer failure")),
        );
        notifier.register(HANDLE, "Gain", recorder(&log, "survivor"));
        notifier.notify(HANDLE, "Gain");
        assert_eq!(*log.lock(), vec!["survivor"]);
    }
}
