//! cam-session: typed feature access and frame acquisition for machine-vision cameras
//!
//! This library exposes a vendor-neutral camera API behind capability traits,
//! enabling both production use with real transports and testing with the
//! simulator or a recording test double.

pub mod acquisition;
pub mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub mod feature;
pub mod notify;
pub mod session;
pub mod sfnc;
pub mod sim;
pub mod stream;
pub mod traits;
pub mod validation;

#[cfg(feature = "v4l2")]
pub mod device;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use buffer::{BufferId, FrameBuffer, FrameInfo, FrameStatus};
pub use config::{DeviceProfile, SystemConfig};
pub use error::{CameraError, Result};
pub use feature::{EnumEntry, FeatureDescriptor, FeatureKind, FeatureValue};
pub use session::System;
pub use stream::Streamer;
pub use traits::{
    AccessMode, AcquisitionControl, BufferLifecycle, CameraInfo, CaptureState, DeviceHandle,
    FeatureAccess,
};

#[cfg(feature = "v4l2")]
pub use device::V4l2Transport;
