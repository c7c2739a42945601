//! Standard feature names used by the built-in profile and the simulator.

/// Vendor name (`DeviceVendorName`).
pub const DEVICE_VENDOR_NAME: &str = "DeviceVendorName";
/// Model name (`DeviceModelName`).
pub const DEVICE_MODEL_NAME: &str = "DeviceModelName";
/// Serial number (`DeviceSerialNumber`).
pub const DEVICE_SERIAL_NUMBER: &str = "DeviceSerialNumber";
/// User-assigned name (`DeviceUserID`).
pub const DEVICE_USER_ID: &str = "DeviceUserID";
/// Sensor temperature in degrees Celsius (`DeviceTemperature`).
pub const DEVICE_TEMPERATURE: &str = "DeviceTemperature";

/// Image width in pixels (`Width`).
pub const WIDTH: &str = "Width";
/// Image height in pixels (`Height`).
pub const HEIGHT: &str = "Height";
/// Pixel format enumeration (`PixelFormat`).
pub const PIXEL_FORMAT: &str = "PixelFormat";
/// Horizontal mirroring (`ReverseX`).
pub const REVERSE_X: &str = "ReverseX";
/// Horizontal binning factor (`BinningHorizontal`).
pub const BINNING_HORIZONTAL: &str = "BinningHorizontal";

/// Exposure time in microseconds (`ExposureTime`).
pub const EXPOSURE_TIME: &str = "ExposureTime";
/// Gain in dB (`Gain`).
pub const GAIN: &str = "Gain";
/// Selects which gain `Gain` controls (`GainSelector`).
pub const GAIN_SELECTOR: &str = "GainSelector";

/// Frame rate in Hz (`AcquisitionFrameRate`).
pub const ACQUISITION_FRAME_RATE: &str = "AcquisitionFrameRate";
/// Trigger mode enumeration (`TriggerMode`).
pub const TRIGGER_MODE: &str = "TriggerMode";
/// Trigger source enumeration (`TriggerSource`).
pub const TRIGGER_SOURCE: &str = "TriggerSource";

/// Appends chunk data to every frame (`ChunkModeActive`).
pub const CHUNK_MODE_ACTIVE: &str = "ChunkModeActive";

/// Loads the selected user set (`UserSetLoad`).
pub const USER_SET_LOAD: &str = "UserSetLoad";
/// Latches the device timestamp (`TimestampLatch`).
pub const TIMESTAMP_LATCH: &str = "TimestampLatch";

/// Lookup table contents (`LUTValueAll`).
pub const LUT_VALUE_ALL: &str = "LUTValueAll";

/// 8-bit monochrome.
pub const MONO8: &str = "Mono8";
/// 16-bit monochrome.
pub const MONO16: &str = "Mono16";
/// Packed 8-bit RGB.
pub const RGB8: &str = "RGB8";
/// YUV 4:2:2, 8 bits per component.
pub const YUV422_8: &str = "YUV422_8";
/// 12-bit Bayer RG, listed but not selectable on the simulator.
pub const BAYER_RG12: &str = "BayerRG12";

/// Bytes per pixel of a pixel format symbol.
pub fn bytes_per_pixel(format: &str) -> Option<usize> {
    match format {
        MONO8 => Some(1),
        MONO16 | YUV422_8 | BAYER_RG12 => Some(2),
        RGB8 => Some(3),
        _ => None,
    }
}
