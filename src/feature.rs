//! Feature registry: typed descriptors, constraint checks and the per-device
//! value store.
//!
//! Every feature is keyed by a name that is unique within one device. Its kind
//! is fixed by the variant of [`Constraints`] it was registered with, so it
//! cannot drift after construction.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{CameraError, Result};

/// Value kind of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    /// 64-bit signed integer.
    Integer,
    /// Double precision float.
    Float,
    /// Symbolic enumeration with an integer mapping.
    Enum,
    /// UTF-8 string.
    String,
    /// Boolean flag.
    Boolean,
    /// Fire-and-poll command.
    Command,
    /// Opaque byte block.
    Raw,
}

/// A feature value tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    /// Integer value.
    Integer(i64),
    /// Float value.
    Float(f64),
    /// Enum entry name.
    Enum(String),
    /// String value.
    String(String),
    /// Boolean value.
    Boolean(bool),
    /// Raw bytes.
    Raw(Vec<u8>),
}

impl FeatureValue {
    /// Kind this value belongs to.
    pub const fn kind(&self) -> FeatureKind {
        match self {
            Self::Integer(_) => FeatureKind::Integer,
            Self::Float(_) => FeatureKind::Float,
            Self::Enum(_) => FeatureKind::Enum,
            Self::String(_) => FeatureKind::String,
            Self::Boolean(_) => FeatureKind::Boolean,
            Self::Raw(_) => FeatureKind::Raw,
        }
    }
}

/// One entry of an enumeration feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumEntry {
    /// Symbolic name, e.g. `Mono8`.
    pub name: String,
    /// Integer the symbol maps to.
    pub value: i64,
    /// Human readable name.
    #[serde(default)]
    pub display_name: String,
    /// Whether the entry can currently be selected.
    #[serde(default = "default_true")]
    pub available: bool,
}

impl EnumEntry {
    /// Create an available entry.
    pub fn new(name: &str, value: i64) -> Self {
        Self {
            name: name.to_owned(),
            value,
            display_name: name.to_owned(),
            available: true,
        }
    }

    /// Mark the entry as present but not selectable.
    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// Kind-specific constraints. The variant determines the feature kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Constraints {
    /// Integer range with optional increment and valid-value set.
    Integer {
        /// Smallest legal value.
        min: i64,
        /// Largest legal value.
        max: i64,
        /// Step from `min`, when constrained.
        #[serde(default)]
        increment: Option<i64>,
        /// Explicit list of legal values.
        #[serde(default)]
        valid_set: Option<Vec<i64>>,
    },
    /// Float range with optional increment.
    Float {
        /// Smallest legal value.
        min: f64,
        /// Largest legal value.
        max: f64,
        /// Step from `min`, when constrained.
        #[serde(default)]
        increment: Option<f64>,
    },
    /// Enumeration entries.
    Enum {
        /// Entries in declaration order.
        entries: Vec<EnumEntry>,
    },
    /// String with a maximum byte length.
    String {
        /// Maximum length in bytes.
        max_length: usize,
    },
    /// Boolean flag.
    Boolean,
    /// Command.
    Command,
    /// Raw block with a maximum byte length.
    Raw {
        /// Maximum length in bytes.
        max_length: usize,
    },
}

/// Static description of a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    /// Unique name within the device.
    pub name: String,
    /// Category path, e.g. `/ImageFormatControl`.
    #[serde(default)]
    pub category: String,
    /// Whether the value can be read.
    #[serde(default = "default_true")]
    pub readable: bool,
    /// Whether the value can be written.
    #[serde(default = "default_true")]
    pub writeable: bool,
    /// Writes are refused while capture is running.
    #[serde(default)]
    pub streaming_locked: bool,
    /// Features selected by this one (a selector and its dependents).
    #[serde(default)]
    pub selected_features: Vec<String>,
    /// Kind and constraints.
    pub constraints: Constraints,
}

const fn default_true() -> bool {
    true
}

impl FeatureDescriptor {
    fn with_constraints(name: &str, constraints: Constraints) -> Self {
        Self {
            name: name.to_owned(),
            category: String::new(),
            readable: true,
            writeable: true,
            streaming_locked: false,
            selected_features: Vec::new(),
            constraints,
        }
    }

    /// Integer feature with an inclusive range.
    pub fn integer(name: &str, min: i64, max: i64) -> Self {
        Self::with_constraints(
            name,
            Constraints::Integer {
                min,
                max,
                increment: None,
                valid_set: None,
            },
        )
    }

    /// Float feature with an inclusive range.
    pub fn float(name: &str, min: f64, max: f64) -> Self {
        Self::with_constraints(
            name,
            Constraints::Float {
                min,
                max,
                increment: None,
            },
        )
    }

    /// Enumeration feature.
    pub fn enumeration(name: &str, entries: Vec<EnumEntry>) -> Self {
        Self::with_constraints(name, Constraints::Enum { entries })
    }

    /// String feature.
    pub fn string(name: &str, max_length: usize) -> Self {
        Self::with_constraints(name, Constraints::String { max_length })
    }

    /// Boolean feature.
    pub fn boolean(name: &str) -> Self {
        Self::with_constraints(name, Constraints::Boolean)
    }

    /// Command feature.
    pub fn command(name: &str) -> Self {
        Self::with_constraints(name, Constraints::Command)
    }

    /// Raw feature.
    pub fn raw(name: &str, max_length: usize) -> Self {
        Self::with_constraints(name, Constraints::Raw { max_length })
    }

    /// Clear the writeable flag.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.writeable = false;
        self
    }

    /// Clear the readable flag.
    #[must_use]
    pub fn write_only(mut self) -> Self {
        self.readable = false;
        self
    }

    /// Refuse writes while capture is running.
    #[must_use]
    pub fn locked_while_streaming(mut self) -> Self {
        self.streaming_locked = true;
        self
    }

    /// Place the feature in a category.
    #[must_use]
    pub fn in_category(mut self, category: &str) -> Self {
        category.clone_into(&mut self.category);
        self
    }

    /// Declare the features this one selects.
    #[must_use]
    pub fn selecting(mut self, names: &[&str]) -> Self {
        self.selected_features = names.iter().map(|&name| name.to_owned()).collect();
        self
    }

    /// Set an increment on an integer feature.
    #[must_use]
    pub fn with_increment(mut self, step: i64) -> Self {
        if let Constraints::Integer { increment, .. } = &mut self.constraints {
            *increment = Some(step);
        }
        self
    }

    /// Set an increment on a float feature.
    #[must_use]
    pub fn with_float_increment(mut self, step: f64) -> Self {
        if let Constraints::Float { increment, .. } = &mut self.constraints {
            *increment = Some(step);
        }
        self
    }

    /// Restrict an integer feature to an explicit set of values.
    #[must_use]
    pub fn with_valid_set(mut self, values: &[i64]) -> Self {
        if let Constraints::Integer { valid_set, .. } = &mut self.constraints {
            *valid_set = Some(values.to_vec());
        }
        self
    }

    /// Kind derived from the constraints.
    pub const fn kind(&self) -> FeatureKind {
        match self.constraints {
            Constraints::Integer { .. } => FeatureKind::Integer,
            Constraints::Float { .. } => FeatureKind::Float,
            Constraints::Enum { .. } => FeatureKind::Enum,
            Constraints::String { .. } => FeatureKind::String,
            Constraints::Boolean => FeatureKind::Boolean,
            Constraints::Command => FeatureKind::Command,
            Constraints::Raw { .. } => FeatureKind::Raw,
        }
    }

    /// Fail with `WrongType` unless the feature has the `expected` kind.
    pub fn expect_kind(&self, expected: FeatureKind) -> Result<()> {
        let actual = self.kind();
        if actual == expected {
            Ok(())
        } else {
            Err(CameraError::WrongType {
                name: self.name.clone(),
                expected,
                actual,
            })
        }
    }

    /// Enum entries, or `WrongType` for other kinds.
    pub fn enum_entries(&self) -> Result<&[EnumEntry]> {
        match &self.constraints {
            Constraints::Enum { entries } => Ok(entries),
            _ => Err(CameraError::WrongType {
                name: self.name.clone(),
                expected: FeatureKind::Enum,
                actual: self.kind(),
            }),
        }
    }

    /// Look up an enum entry by symbol.
    pub fn enum_entry(&self, symbol: &str) -> Result<&EnumEntry> {
        self.enum_entries()?
            .iter()
            .find(|entry| entry.name == symbol)
            .ok_or_else(|| CameraError::NotFound(format!("{}::{symbol}", self.name)))
    }

    /// Check internal consistency of the constraints.
    pub fn validate(&self) -> Result<()> {
        let invalid = |why: String| Err(CameraError::InvalidValue(format!("{}: {why}", self.name)));

        if self.name.is_empty() {
            return Err(CameraError::InvalidValue("empty feature name".to_owned()));
        }

        match &self.constraints {
            Constraints::Integer {
                min,
                max,
                increment,
                valid_set,
            } => {
                if min > max {
                    return invalid(format!("min {min} > max {max}"));
                }
                if let Some(step) = increment {
                    if *step <= 0 {
                        return invalid(format!("increment {step} must be positive"));
                    }
                }
                if let Some(set) = valid_set {
                    if let Some(bad) = set.iter().find(|v| **v < *min || **v > *max) {
                        return invalid(format!("valid-set value {bad} outside [{min}, {max}]"));
                    }
                }
            }
            Constraints::Float {
                min,
                max,
                increment,
            } => {
                if min.is_nan() || max.is_nan() || min > max {
                    return invalid(format!("min {min} > max {max}"));
                }
                if let Some(step) = increment {
                    if step.is_nan() || *step <= 0.0 {
                        return invalid(format!("increment {step} must be positive"));
                    }
                }
            }
            Constraints::Enum { entries } => {
                if entries.is_empty() {
                    return invalid("enumeration has no entries".to_owned());
                }
                for (idx, entry) in entries.iter().enumerate() {
                    if entry.name.is_empty() {
                        return invalid("empty enum entry name".to_owned());
                    }
                    let later = entries.iter().skip(idx + 1);
                    for other in later {
                        if other.name == entry.name {
                            return invalid(format!("duplicate entry {}", entry.name));
                        }
                        if other.value == entry.value {
                            return invalid(format!(
                                "entries {} and {} share value {}",
                                entry.name, other.name, entry.value
                            ));
                        }
                    }
                }
            }
            Constraints::String { .. }
            | Constraints::Boolean
            | Constraints::Command
            | Constraints::Raw { .. } => {}
        }
        Ok(())
    }

    /// Check a candidate value against kind and constraints.
    pub fn check_value(&self, value: &FeatureValue) -> Result<()> {
        self.expect_kind(value.kind())?;
        let invalid = |why: String| Err(CameraError::InvalidValue(format!("{}: {why}", self.name)));

        match (&self.constraints, value) {
            (
                Constraints::Integer {
                    min,
                    max,
                    increment,
                    valid_set,
                },
                FeatureValue::Integer(v),
            ) => {
                if v < min || v > max {
                    return invalid(format!("{v} outside [{min}, {max}]"));
                }
                if let Some(step) = increment {
                    if v.abs_diff(*min) % step.unsigned_abs().max(1) != 0 {
                        return invalid(format!("{v} is not {min} + k*{step}"));
                    }
                }
                if let Some(set) = valid_set {
                    if !set.contains(v) {
                        return invalid(format!("{v} not in valid set"));
                    }
                }
            }
            (
                Constraints::Float {
                    min,
                    max,
                    increment,
                },
                FeatureValue::Float(v),
            ) => {
                if v.is_nan() || v < min || v > max {
                    return invalid(format!("{v} outside [{min}, {max}]"));
                }
                if let Some(step) = increment {
                    let steps = (v - min) / step;
                    if (steps - steps.round()).abs() > 1e-6 {
                        return invalid(format!("{v} is not {min} + k*{step}"));
                    }
                }
            }
            (Constraints::Enum { entries }, FeatureValue::Enum(symbol)) => {
                match entries.iter().find(|entry| entry.name == *symbol) {
                    Some(entry) if entry.available => {}
                    Some(_) => return invalid(format!("entry {symbol} is not available")),
                    None => return invalid(format!("{symbol:?} is not a valid entry")),
                }
            }
            (Constraints::String { max_length }, FeatureValue::String(text)) => {
                if text.len() > *max_length {
                    return invalid(format!("length {} exceeds {max_length}", text.len()));
                }
            }
            (Constraints::Raw { max_length }, FeatureValue::Raw(bytes)) => {
                if bytes.len() > *max_length {
                    return invalid(format!("length {} exceeds {max_length}", bytes.len()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Value a feature starts with when no default is configured.
    pub fn initial_value(&self) -> Option<FeatureValue> {
        match &self.constraints {
            Constraints::Integer { min, valid_set, .. } => Some(FeatureValue::Integer(
                valid_set
                    .as_ref()
                    .and_then(|set| set.first().copied())
                    .unwrap_or(*min),
            )),
            Constraints::Float { min, .. } => Some(FeatureValue::Float(*min)),
            Constraints::Enum { entries } => entries
                .iter()
                .find(|entry| entry.available)
                .map(|entry| FeatureValue::Enum(entry.name.clone())),
            Constraints::String { .. } => Some(FeatureValue::String(String::new())),
            Constraints::Boolean => Some(FeatureValue::Boolean(false)),
            Constraints::Raw { .. } => Some(FeatureValue::Raw(Vec::new())),
            Constraints::Command => None,
        }
    }
}

/// Point-in-time copy of feature values, handed to the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot(pub BTreeMap<String, FeatureValue>);

impl FeatureSnapshot {
    /// Integer value by name.
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(FeatureValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    /// Float value by name.
    pub fn float(&self, name: &str) -> Option<f64> {
        match self.0.get(name) {
            Some(FeatureValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    /// Enum symbol by name.
    pub fn symbol(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(FeatureValue::Enum(v)) => Some(v),
            _ => None,
        }
    }

    /// Boolean value by name.
    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.0.get(name) {
            Some(FeatureValue::Boolean(v)) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct FeatureSlot {
    descriptor: FeatureDescriptor,
    value: Option<FeatureValue>,
}

/// Per-device mapping from feature name to descriptor and current value.
#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    slots: Vec<FeatureSlot>,
    index: HashMap<String, usize>,
}

impl FeatureRegistry {
    /// Build a registry, validating every descriptor and default value.
    pub fn new(
        descriptors: Vec<FeatureDescriptor>,
        defaults: &BTreeMap<String, FeatureValue>,
    ) -> Result<Self> {
        let mut registry = Self::default();
        for descriptor in descriptors {
            descriptor.validate()?;
            if registry.index.contains_key(&descriptor.name) {
                return Err(CameraError::InvalidValue(format!(
                    "duplicate feature {}",
                    descriptor.name
                )));
            }
            let value = match defaults.get(&descriptor.name) {
                Some(value) => {
                    descriptor.check_value(value)?;
                    Some(value.clone())
                }
                None => descriptor.initial_value(),
            };
            registry
                .index
                .insert(descriptor.name.clone(), registry.slots.len());
            registry.slots.push(FeatureSlot { descriptor, value });
        }

        if let Some(name) = defaults.keys().find(|name| !registry.index.contains_key(*name)) {
            return Err(CameraError::NotFound(format!("default for unknown feature {name}")));
        }

        Ok(registry)
    }

    fn slot(&self, name: &str) -> Result<&FeatureSlot> {
        self.index
            .get(name)
            .and_then(|idx| self.slots.get(*idx))
            .ok_or_else(|| CameraError::NotFound(name.to_owned()))
    }

    /// Descriptor for `name`.
    pub fn describe(&self, name: &str) -> Result<&FeatureDescriptor> {
        self.slot(name).map(|slot| &slot.descriptor)
    }

    /// All descriptors in registration order.
    pub fn list(&self) -> impl Iterator<Item = &FeatureDescriptor> {
        self.slots.iter().map(|slot| &slot.descriptor)
    }

    /// Descriptors selected by the feature `name`.
    pub fn list_selected(&self, name: &str) -> Result<Vec<&FeatureDescriptor>> {
        let selector = self.describe(name)?;
        selector
            .selected_features
            .iter()
            .map(|selected| self.describe(selected))
            .collect()
    }

    /// Current value of a readable feature of the `expected` kind.
    pub fn read(&self, name: &str, expected: FeatureKind) -> Result<&FeatureValue> {
        let slot = self.slot(name)?;
        slot.descriptor.expect_kind(expected)?;
        if !slot.descriptor.readable {
            return Err(CameraError::AccessDenied(format!("{name} is not readable")));
        }
        slot.value
            .as_ref()
            .ok_or_else(|| CameraError::InvalidCall(format!("{name} has no value")))
    }

    /// Validate a write without applying it.
    pub fn check_write(&self, name: &str, value: &FeatureValue) -> Result<&FeatureDescriptor> {
        let descriptor = self.describe(name)?;
        descriptor.expect_kind(value.kind())?;
        if !descriptor.writeable {
            return Err(CameraError::AccessDenied(format!("{name} is not writeable")));
        }
        descriptor.check_value(value)?;
        Ok(descriptor)
    }

    /// Apply a value that already passed [`Self::check_write`].
    ///
    /// Returns whether the stored value changed.
    pub fn store(&mut self, name: &str, value: FeatureValue) -> Result<bool> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| CameraError::NotFound(name.to_owned()))?;
        let slot = self
            .slots
            .get_mut(idx)
            .ok_or_else(|| CameraError::NotFound(name.to_owned()))?;
        let changed = slot.value.as_ref() != Some(&value);
        slot.value = Some(value);
        Ok(changed)
    }

    /// Copy of every stored value.
    pub fn snapshot(&self) -> FeatureSnapshot {
        FeatureSnapshot(
            self.slots
                .iter()
                .filter_map(|slot| {
                    slot.value
                        .clone()
                        .map(|value| (slot.descriptor.name.clone(), value))
                })
                .collect(),
        )
    }

    /// Integer range.
    pub fn int_range(&self, name: &str) -> Result<(i64, i64)> {
        match &self.describe(name)?.constraints {
            Constraints::Integer { min, max, .. } => Ok((*min, *max)),
            _ => Err(self.wrong_kind(name, FeatureKind::Integer)),
        }
    }

    /// Integer increment (1 when unconstrained).
    pub fn int_increment(&self, name: &str) -> Result<i64> {
        match &self.describe(name)?.constraints {
            Constraints::Integer { increment, .. } => Ok(increment.unwrap_or(1)),
            _ => Err(self.wrong_kind(name, FeatureKind::Integer)),
        }
    }

    /// Integer valid-value set.
    pub fn int_valid_set(&self, name: &str) -> Result<Vec<i64>> {
        match &self.describe(name)?.constraints {
            Constraints::Integer { valid_set, .. } => valid_set
                .clone()
                .ok_or_else(|| CameraError::InvalidCall(format!("{name} has no valid-value set"))),
            _ => Err(self.wrong_kind(name, FeatureKind::Integer)),
        }
    }

    /// Float range.
    pub fn float_range(&self, name: &str) -> Result<(f64, f64)> {
        match &self.describe(name)?.constraints {
            Constraints::Float { min, max, .. } => Ok((*min, *max)),
            _ => Err(self.wrong_kind(name, FeatureKind::Float)),
        }
    }

    /// Float increment, `None` when the feature has none.
    pub fn float_increment(&self, name: &str) -> Result<Option<f64>> {
        match &self.describe(name)?.constraints {
            Constraints::Float { increment, .. } => Ok(*increment),
            _ => Err(self.wrong_kind(name, FeatureKind::Float)),
        }
    }

    /// Symbols of the currently available enum entries.
    pub fn enum_range(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .describe(name)?
            .enum_entries()?
            .iter()
            .filter(|entry| entry.available)
            .map(|entry| entry.name.clone())
            .collect())
    }

    /// Whether `symbol` is an available entry of the enum feature.
    pub fn enum_is_available(&self, name: &str, symbol: &str) -> Result<bool> {
        Ok(self.describe(name)?.enum_entry(symbol)?.available)
    }

    /// Symbol to integer.
    pub fn enum_as_int(&self, name: &str, symbol: &str) -> Result<i64> {
        Ok(self.describe(name)?.enum_entry(symbol)?.value)
    }

    /// Integer to symbol.
    pub fn enum_as_string(&self, name: &str, value: i64) -> Result<String> {
        self.describe(name)?
            .enum_entries()?
            .iter()
            .find(|entry| entry.value == value)
            .map(|entry| entry.name.clone())
            .ok_or_else(|| CameraError::NotFound(format!("{name} has no entry for {value}")))
    }

    /// Maximum length of a string or raw feature.
    pub fn max_length(&self, name: &str) -> Result<usize> {
        match &self.describe(name)?.constraints {
            Constraints::String { max_length } | Constraints::Raw { max_length } => Ok(*max_length),
            _ => Err(self.wrong_kind(name, FeatureKind::String)),
        }
    }

    fn wrong_kind(&self, name: &str, expected: FeatureKind) -> CameraError {
        match self.describe(name) {
            Ok(descriptor) => CameraError::WrongType {
                name: name.to_owned(),
                expected,
                actual: descriptor.kind(),
            },
            Err(err) => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn registry() -> FeatureRegistry {
        let descriptors = vec![
            FeatureDescriptor::integer("Width", 8, 1024).with_increment(8),
            FeatureDescriptor::float("ExposureTime", 10.0, 100_000.0),
            FeatureDescriptor::enumeration(
                "TriggerMode",
                vec![EnumEntry::new("Off", 0), EnumEntry::new("On", 1)],
            ),
            FeatureDescriptor::enumeration(
                "PixelFormat",
                vec![
                    EnumEntry::new("Mono8", 0x0108_0001),
                    EnumEntry::new("Mono12", 0x0110_0005).unavailable(),
                ],
            ),
            FeatureDescriptor::string("DeviceUserID", 8),
            FeatureDescriptor::string("DeviceModelName", 32).read_only(),
            FeatureDescriptor::integer("BinningHorizontal", 1, 8).with_valid_set(&[1, 2, 4]),
            FeatureDescriptor::enumeration(
                "GainSelector",
                vec![EnumEntry::new("All", 0)],
            )
            .selecting(&["Gain"]),
            FeatureDescriptor::float("Gain", 0.0, 24.0),
        ];
        let mut defaults = BTreeMap::new();
        defaults.insert(
            "DeviceModelName".to_owned(),
            FeatureValue::String("Sim".to_owned()),
        );
        FeatureRegistry::new(descriptors, &defaults).expect("registry should build")
    }

    #[test]
    fn test_describe_unknown_feature() {
        let reg = registry();
        assert!(matches!(
            reg.describe("Nope"),
            Err(CameraError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_preserves_registration_order() {
        let reg = registry();
        let names: Vec<_> = reg.list().map(|d| d.name.as_str()).collect();
        assert_eq!(names.first(), Some(&"Width"));
        assert_eq!(names.last(), Some(&"Gain"));
    }

    #[test]
    fn test_list_selected_follows_selector() {
        let reg = registry();
        let selected = reg.list_selected("GainSelector").expect("selector exists");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected.first().map(|d| d.name.as_str()), Some("Gain"));
        assert!(reg.list_selected("Width").expect("width exists").is_empty());
    }

    #[test]
    fn test_inconsistent_range_rejected() {
        let result = FeatureRegistry::new(
            vec![FeatureDescriptor::integer("Bad", 10, 1)],
            &BTreeMap::new(),
        );
        assert!(matches!(result, Err(CameraError::InvalidValue(_))));
    }

    #[test]
    fn test_zero_increment_rejected() {
        let result = FeatureRegistry::new(
            vec![FeatureDescriptor::float("Bad", 0.0, 1.0).with_float_increment(0.0)],
            &BTreeMap::new(),
        );
        assert!(matches!(result, Err(CameraError::InvalidValue(_))));
    }

    #[test]
    fn test_enum_mapping_must_be_injective() {
        let result = FeatureRegistry::new(
            vec![FeatureDescriptor::enumeration(
                "Mode",
                vec![EnumEntry::new("A", 1), EnumEntry::new("B", 1)],
            )],
            &BTreeMap::new(),
        );
        assert!(matches!(result, Err(CameraError::InvalidValue(_))));
    }

    #[test]
    fn test_duplicate_feature_rejected() {
        let result = FeatureRegistry::new(
            vec![
                FeatureDescriptor::boolean("ReverseX"),
                FeatureDescriptor::boolean("ReverseX"),
            ],
            &BTreeMap::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_default_for_unknown_feature_rejected() {
        let mut defaults = BTreeMap::new();
        defaults.insert("Ghost".to_owned(), FeatureValue::Boolean(true));
        let result = FeatureRegistry::new(vec![FeatureDescriptor::boolean("Real")], &defaults);
        assert!(matches!(result, Err(CameraError::NotFound(_))));
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut reg = registry();
        let value = FeatureValue::Integer(640);
        reg.check_write("Width", &value).expect("640 is legal");
        assert!(reg.store("Width", value.clone()).expect("stored"));
        assert_eq!(reg.read("Width", FeatureKind::Integer).expect("readable"), &value);
    }

    #[test]
    fn test_increment_violation() {
        let reg = registry();
        assert!(matches!(
            reg.check_write("Width", &FeatureValue::Integer(643)),
            Err(CameraError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_kind_mismatch() {
        let reg = registry();
        assert!(matches!(
            reg.check_write("Width", &FeatureValue::Float(640.0)),
            Err(CameraError::WrongType { .. })
        ));
        assert!(matches!(
            reg.read("Width", FeatureKind::Float),
            Err(CameraError::WrongType { .. })
        ));
    }

    #[test]
    fn test_read_only_feature_refuses_write() {
        let reg = registry();
        assert!(matches!(
            reg.check_write("DeviceModelName", &FeatureValue::String("x".to_owned())),
            Err(CameraError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_string_length_limit() {
        let reg = registry();
        assert!(reg
            .check_write("DeviceUserID", &FeatureValue::String("12345678".to_owned()))
            .is_ok());
        assert!(matches!(
            reg.check_write("DeviceUserID", &FeatureValue::String("123456789".to_owned())),
            Err(CameraError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_enum_rejects_unavailable_and_empty() {
        let reg = registry();
        assert!(matches!(
            reg.check_write("PixelFormat", &FeatureValue::Enum("Mono12".to_owned())),
            Err(CameraError::InvalidValue(_))
        ));
        assert!(matches!(
            reg.check_write("PixelFormat", &FeatureValue::Enum(String::new())),
            Err(CameraError::InvalidValue(_))
        ));
        assert_eq!(reg.enum_range("PixelFormat").expect("enum"), vec!["Mono8"]);
        assert!(!reg.enum_is_available("PixelFormat", "Mono12").expect("entry"));
    }

    #[test]
    fn test_enum_int_mapping_both_directions() {
        let reg = registry();
        assert_eq!(reg.enum_as_int("TriggerMode", "On").expect("entry"), 1);
        assert_eq!(reg.enum_as_string("TriggerMode", 0).expect("entry"), "Off");
        assert!(matches!(
            reg.enum_as_string("TriggerMode", 7),
            Err(CameraError::NotFound(_))
        ));
    }

    #[test]
    fn test_valid_set_query_and_enforcement() {
        let reg = registry();
        assert_eq!(reg.int_valid_set("BinningHorizontal").expect("set"), vec![1, 2, 4]);
        assert!(matches!(
            reg.check_write("BinningHorizontal", &FeatureValue::Integer(3)),
            Err(CameraError::InvalidValue(_))
        ));
        assert!(matches!(
            reg.int_valid_set("Width"),
            Err(CameraError::InvalidCall(_))
        ));
    }

    #[test]
    fn test_increment_queries() {
        let reg = registry();
        assert_eq!(reg.int_increment("Width").expect("int"), 8);
        assert_eq!(reg.float_increment("ExposureTime").expect("float"), None);
        assert!(matches!(
            reg.float_increment("Width"),
            Err(CameraError::WrongType { .. })
        ));
    }

    #[test]
    fn test_snapshot_skips_commands() {
        let reg = FeatureRegistry::new(
            vec![
                FeatureDescriptor::command("UserSetLoad"),
                FeatureDescriptor::boolean("ReverseX"),
            ],
            &BTreeMap::new(),
        )
        .expect("registry");
        let snapshot = reg.snapshot();
        assert_eq!(snapshot.0.len(), 1);
        assert_eq!(snapshot.flag("ReverseX"), Some(false));
    }

    proptest! {
        #[test]
        fn prop_integer_range_bounds(min in -1000i64..1000, span in 0i64..1000, candidate in -3000i64..3000) {
            let max = min + span;
            let descriptor = FeatureDescriptor::integer("Value", min, max);
            let result = descriptor.check_value(&FeatureValue::Integer(candidate));
            prop_assert_eq!(result.is_ok(), candidate >= min && candidate <= max);
        }

        #[test]
        fn prop_float_bounds_inclusive(min in -1.0e6f64..1.0e6, span in 0.0f64..1.0e6) {
            let max = min + span;
            let descriptor = FeatureDescriptor::float("Value", min, max);
            prop_assert!(descriptor.check_value(&FeatureValue::Float(min)).is_ok());
            prop_assert!(descriptor.check_value(&FeatureValue::Float(max)).is_ok());
        }

        #[test]
        fn prop_increment_over_full_i64_range(value in any::<i64>(), step in 1i64..=16) {
            let descriptor = FeatureDescriptor::integer("Offset", i64::MIN, i64::MAX)
                .with_increment(step);
            let on_grid = (i128::from(value) - i128::from(i64::MIN)) % i128::from(step) == 0;
            let result = descriptor.check_value(&FeatureValue::Integer(value));
            prop_assert_eq!(result.is_ok(), on_grid);
        }
    }

    #[test]
    fn test_increment_check_near_i64_bounds() {
        let descriptor = FeatureDescriptor::integer("Offset", i64::MIN, i64::MAX).with_increment(2);
        assert!(descriptor.check_value(&FeatureValue::Integer(0)).is_ok());
        assert!(descriptor.check_value(&FeatureValue::Integer(i64::MIN)).is_ok());
        assert!(matches!(
            descriptor.check_value(&FeatureValue::Integer(i64::MAX)),
            Err(CameraError::InvalidValue(_))
        ));
    }
}
