//! System configuration: notifier dispatch mode and simulated device profiles.
//!
//! Loaded from TOML, then overlaid with environment variables:
//!
//! - `CAM_SESSION_NOTIFY`: `inline` or `background`

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CameraError, Result};
use crate::feature::{EnumEntry, FeatureDescriptor, FeatureValue};
use crate::notify::DispatchMode;
use crate::sfnc;
use crate::sim::TestPattern;
use crate::traits::{AccessMode, CameraInfo};

/// Environment variable overriding [`SystemConfig::notify`].
pub const NOTIFY_ENV: &str = "CAM_SESSION_NOTIFY";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Where invalidation callbacks run.
    #[serde(default)]
    pub notify: DispatchMode,
    /// Simulated cameras.
    #[serde(default = "default_profiles")]
    pub profiles: Vec<DeviceProfile>,
}

fn default_profiles() -> Vec<DeviceProfile> {
    vec![DeviceProfile::standard("sim-0")]
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            notify: DispatchMode::default(),
            profiles: default_profiles(),
        }
    }
}

impl SystemConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|err| CameraError::Config(err.to_string()))
    }

    /// Load from `path`, or use the defaults, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                debug!(path = %path.display(), "loading configuration");
                Self::from_toml_str(&contents)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Overlay environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var(NOTIFY_ENV) {
            self.notify = match value.to_ascii_lowercase().as_str() {
                "inline" => DispatchMode::Inline,
                "background" => DispatchMode::Background,
                other => {
                    return Err(CameraError::Config(format!(
                        "{NOTIFY_ENV} must be inline or background, got {other}"
                    )))
                }
            };
            debug!(notify = ?self.notify, "dispatch mode from environment");
        }
        Ok(())
    }
}

/// One simulated camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Identity reported by enumeration.
    pub info: CameraInfo,
    /// Feature set; the standard set when omitted.
    #[serde(default = "standard_features")]
    pub features: Vec<FeatureDescriptor>,
    /// Values overriding the factory defaults.
    #[serde(default)]
    pub defaults: BTreeMap<String, FeatureValue>,
    /// Image the simulator renders.
    #[serde(default)]
    pub pattern: TestPattern,
    /// Size of the device memory window.
    #[serde(default = "default_memory_size")]
    pub memory_size: usize,
    /// How long a command stays busy after it is run.
    #[serde(default = "default_command_duration_ms")]
    pub command_duration_ms: u64,
}

const fn default_memory_size() -> usize {
    4096
}

const fn default_command_duration_ms() -> u64 {
    5
}

impl DeviceProfile {
    /// Profile with the standard feature set.
    pub fn standard(id: &str) -> Self {
        Self {
            info: CameraInfo {
                id: id.to_owned(),
                name: format!("Simulated Camera {id}"),
                model: "SIM-1".to_owned(),
                serial: format!("SN-{id}"),
                transport_layer_id: "sim-tl".to_owned(),
                interface_id: "sim-if".to_owned(),
                permitted_access: vec![AccessMode::Full, AccessMode::Read],
            },
            features: standard_features(),
            defaults: BTreeMap::new(),
            pattern: TestPattern::default(),
            memory_size: default_memory_size(),
            command_duration_ms: default_command_duration_ms(),
        }
    }

    /// Override one default value.
    #[must_use]
    pub fn with_default(mut self, name: &str, value: FeatureValue) -> Self {
        self.defaults.insert(name.to_owned(), value);
        self
    }

    /// Render `pattern` instead of the default.
    #[must_use]
    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Factory defaults for the features present, overlaid with [`Self::defaults`].
    pub fn initial_values(&self) -> BTreeMap<String, FeatureValue> {
        let mut values = factory_defaults(&self.info);
        values.retain(|name, _| self.features.iter().any(|feature| &feature.name == name));
        values.extend(self.defaults.clone());
        values
    }
}

fn factory_defaults(info: &CameraInfo) -> BTreeMap<String, FeatureValue> {
    [
        (sfnc::DEVICE_VENDOR_NAME, FeatureValue::String("cam-session".to_owned())),
        (sfnc::DEVICE_MODEL_NAME, FeatureValue::String(info.model.clone())),
        (sfnc::DEVICE_SERIAL_NUMBER, FeatureValue::String(info.serial.clone())),
        (sfnc::DEVICE_TEMPERATURE, FeatureValue::Float(42.5)),
        (sfnc::WIDTH, FeatureValue::Integer(640)),
        (sfnc::HEIGHT, FeatureValue::Integer(480)),
        (sfnc::PIXEL_FORMAT, FeatureValue::Enum(sfnc::MONO8.to_owned())),
        (sfnc::EXPOSURE_TIME, FeatureValue::Float(5000.0)),
        (sfnc::ACQUISITION_FRAME_RATE, FeatureValue::Float(200.0)),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_owned(), value))
    .collect()
}

/// Features of the standard simulated camera.
pub fn standard_features() -> Vec<FeatureDescriptor> {
    vec![
        FeatureDescriptor::string(sfnc::DEVICE_VENDOR_NAME, 64)
            .read_only()
            .in_category("/DeviceControl"),
        FeatureDescriptor::string(sfnc::DEVICE_MODEL_NAME, 64)
            .read_only()
            .in_category("/DeviceControl"),
        FeatureDescriptor::string(sfnc::DEVICE_SERIAL_NUMBER, 64)
            .read_only()
            .in_category("/DeviceControl"),
        FeatureDescriptor::string(sfnc::DEVICE_USER_ID, 16).in_category("/DeviceControl"),
        FeatureDescriptor::float(sfnc::DEVICE_TEMPERATURE, -40.0, 125.0)
            .read_only()
            .in_category("/DeviceControl"),
        FeatureDescriptor::integer(sfnc::WIDTH, 8, 1920)
            .with_increment(8)
            .locked_while_streaming()
            .in_category("/ImageFormatControl"),
        FeatureDescriptor::integer(sfnc::HEIGHT, 8, 1080)
            .with_increment(2)
            .locked_while_streaming()
            .in_category("/ImageFormatControl"),
        FeatureDescriptor::enumeration(
            sfnc::PIXEL_FORMAT,
            vec![
                EnumEntry::new(sfnc::MONO8, 0x0108_0001),
                EnumEntry::new(sfnc::MONO16, 0x0110_0007),
                EnumEntry::new(sfnc::RGB8, 0x0218_0014),
                EnumEntry::new(sfnc::YUV422_8, 0x0210_0032),
                EnumEntry::new(sfnc::BAYER_RG12, 0x0110_0011).unavailable(),
            ],
        )
        .locked_while_streaming()
        .in_category("/ImageFormatControl"),
        FeatureDescriptor::boolean(sfnc::REVERSE_X).in_category("/ImageFormatControl"),
        FeatureDescriptor::integer(sfnc::BINNING_HORIZONTAL, 1, 4)
            .with_valid_set(&[1, 2, 4])
            .locked_while_streaming()
            .in_category("/ImageFormatControl"),
        FeatureDescriptor::float(sfnc::EXPOSURE_TIME, 10.0, 1_000_000.0)
            .in_category("/AcquisitionControl"),
        FeatureDescriptor::float(sfnc::ACQUISITION_FRAME_RATE, 1.0, 1000.0)
            .in_category("/AcquisitionControl"),
        FeatureDescriptor::enumeration(
            sfnc::TRIGGER_MODE,
            vec![EnumEntry::new("Off", 0), EnumEntry::new("On", 1)],
        )
        .in_category("/AcquisitionControl"),
        FeatureDescriptor::enumeration(
            sfnc::TRIGGER_SOURCE,
            vec![
                EnumEntry::new("Software", 0),
                EnumEntry::new("Line0", 1),
                EnumEntry::new("Line1", 2),
            ],
        )
        .in_category("/AcquisitionControl"),
        FeatureDescriptor::enumeration(
            sfnc::GAIN_SELECTOR,
            vec![EnumEntry::new("AnalogAll", 0), EnumEntry::new("DigitalAll", 1)],
        )
        .selecting(&[sfnc::GAIN])
        .in_category("/AnalogControl"),
        FeatureDescriptor::float(sfnc::GAIN, 0.0, 24.0)
            .with_float_increment(0.1)
            .in_category("/AnalogControl"),
        FeatureDescriptor::boolean(sfnc::CHUNK_MODE_ACTIVE)
            .locked_while_streaming()
            .in_category("/ChunkDataControl"),
        FeatureDescriptor::command(sfnc::USER_SET_LOAD).in_category("/UserSetControl"),
        FeatureDescriptor::command(sfnc::TIMESTAMP_LATCH).in_category("/DeviceControl"),
        FeatureDescriptor::raw(sfnc::LUT_VALUE_ALL, 256).in_category("/LUTControl"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureRegistry;
    use serial_test::serial;

    #[test]
    fn test_standard_profile_builds_registry() {
        let profile = DeviceProfile::standard("sim-0");
        let registry = FeatureRegistry::new(profile.features.clone(), &profile.initial_values())
            .expect("standard profile is consistent");
        assert_eq!(
            registry.enum_range(sfnc::PIXEL_FORMAT).expect("formats"),
            vec!["Mono8", "Mono16", "RGB8", "YUV422_8"]
        );
    }

    #[test]
    fn test_defaults_override_factory_values() {
        let profile =
            DeviceProfile::standard("sim-0").with_default(sfnc::WIDTH, FeatureValue::Integer(16));
        assert_eq!(
            profile.initial_values().get(sfnc::WIDTH),
            Some(&FeatureValue::Integer(16))
        );
    }

    #[test]
    #[serial]
    fn test_parse_minimal_toml() {
        env::remove_var(NOTIFY_ENV);
        let config = SystemConfig::from_toml_str(
            r#"
            notify = "inline"

            [[profiles]]
            pattern = "Gradient"

            [profiles.info]
            id = "bench-1"
            name = "Bench"
            model = "SIM-1"
            serial = "0001"

            [profiles.defaults]
            Width = { Integer = 64 }
            "#,
        )
        .expect("parse");
        assert_eq!(config.notify, DispatchMode::Inline);
        let profile = config.profiles.first().expect("one profile");
        assert_eq!(profile.info.id, "bench-1");
        assert_eq!(profile.pattern, TestPattern::Gradient);
        assert_eq!(profile.features.len(), standard_features().len());
        assert_eq!(profile.info.permitted_access.len(), 2);
    }

    #[test]
    fn test_parse_error_is_config_error() {
        assert!(matches!(
            SystemConfig::from_toml_str("notify = 3"),
            Err(CameraError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides_dispatch_mode() {
        env::set_var(NOTIFY_ENV, "inline");
        let config = SystemConfig::load(None).expect("load");
        env::remove_var(NOTIFY_ENV);
        assert_eq!(config.notify, DispatchMode::Inline);
    }

    #[test]
    #[serial]
    fn test_bad_env_value_is_rejected() {
        env::set_var(NOTIFY_ENV, "sometimes");
        let result = SystemConfig::load(None);
        env::remove_var(NOTIFY_ENV);
        assert!(matches!(result, Err(CameraError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        env::remove_var(NOTIFY_ENV);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cameras.toml");
        std::fs::write(&path, "notify = \"background\"\n").expect("write");
        let config = SystemConfig::load(Some(&path)).expect("load");
        assert_eq!(config.notify, DispatchMode::Background);
        assert_eq!(config.profiles, default_profiles());
    }
}
