//! Status taxonomy shared by every camera operation.
//!
//! Each variant corresponds to one vendor status code, so callers bridging to
//! a C-style surface can recover the numeric value with [`CameraError::code`].

use thiserror::Error;

use crate::feature::FeatureKind;

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device handle is closed or was never issued.
    #[error("invalid device handle")]
    InvalidHandle,

    /// Unknown feature name, camera id or enum entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Read or write permission mismatch, or a write through a read-only session.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Value outside the declared range, increment, valid set or length.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Accessor kind does not match the registered feature kind.
    #[error("feature {name} is {actual:?}, accessed as {expected:?}")]
    WrongType {
        /// Feature name.
        name: String,
        /// Kind the accessor expected.
        expected: FeatureKind,
        /// Kind the feature was registered with.
        actual: FeatureKind,
    },

    /// Buffer identity already announced on this handle.
    #[error("buffer already announced")]
    AlreadyAnnounced,

    /// Buffer is queued or being filled.
    #[error("buffer is in use")]
    InUse,

    /// Buffer was never announced on this handle.
    #[error("unknown buffer")]
    UnknownBuffer,

    /// Capture has not been started.
    #[error("capture not started")]
    NotStarted,

    /// Capture is already running.
    #[error("capture already started")]
    AlreadyStarted,

    /// Device still has a running capture or announced buffers.
    #[error("device is still capturing")]
    StillCapturing,

    /// Wait expired before the frame completed.
    #[error("operation timed out")]
    Timeout,

    /// Destination buffer is too small; `written` bytes are valid.
    #[error("buffer too small: wrote {written} of {required} bytes")]
    BufferTooSmall {
        /// Bytes copied into the destination.
        written: usize,
        /// Bytes needed for the full value.
        required: usize,
    },

    /// Call is not valid in the current state.
    #[error("invalid call: {0}")]
    InvalidCall(String),

    /// The transport does not provide this operation.
    #[error("not implemented by transport: {0}")]
    NotImplemented(&'static str),

    /// Frame carries no chunk data.
    #[error("frame carries no chunk data")]
    NoChunkData,

    /// Chunk trailer is malformed.
    #[error("malformed chunk data: {0}")]
    ParsingChunkData(String),

    /// The system was shut down.
    #[error("API not started")]
    ApiNotStarted,

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure reported by the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Vendor status code for this error.
    pub const fn code(&self) -> i32 {
        match self {
            Self::Transport(_) => -1,
            Self::ApiNotStarted => -2,
            Self::NotFound(_) => -3,
            Self::InvalidHandle => -4,
            Self::AccessDenied(_) => -6,
            Self::Config(_) => -7,
            Self::BufferTooSmall { .. } => -9,
            Self::WrongType { .. } => -10,
            Self::InvalidValue(_) => -11,
            Self::Timeout => -12,
            Self::InvalidCall(_) | Self::NotStarted => -15,
            Self::NotImplemented(_) => -17,
            Self::Io(_) => -20,
            Self::StillCapturing => -24,
            Self::ParsingChunkData(_) => -26,
            Self::InUse => -27,
            Self::UnknownBuffer => -28,
            Self::AlreadyAnnounced | Self::AlreadyStarted => -33,
            Self::NoChunkData => -34,
        }
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
