//! Core identifier types and the crate error

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use bacsync_runtime::TaskError;

use crate::bacnet::ProtocolError;

// ─────────────────────────────────────────────────────────────────────────────
// Object Type
// ─────────────────────────────────────────────────────────────────────────────

/// Object type tag, e.g. `analogInput`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectType(Cow<'static, str>);

impl ObjectType {
    pub const DEVICE: Self = Self::from_static("device");
    pub const ACCUMULATOR: Self = Self::from_static("accumulator");
    pub const ANALOG_INPUT: Self = Self::from_static("analogInput");
    pub const ANALOG_OUTPUT: Self = Self::from_static("analogOutput");
    pub const ANALOG_VALUE: Self = Self::from_static("analogValue");
    pub const BINARY_INPUT: Self = Self::from_static("binaryInput");
    pub const BINARY_OUTPUT: Self = Self::from_static("binaryOutput");
    pub const BINARY_VALUE: Self = Self::from_static("binaryValue");
    pub const MULTI_STATE_INPUT: Self = Self::from_static("multiStateInput");
    pub const MULTI_STATE_OUTPUT: Self = Self::from_static("multiStateOutput");
    pub const MULTI_STATE_VALUE: Self = Self::from_static("multiStateValue");
    pub const ALERT_ENROLLMENT: Self = Self::from_static("alertEnrollment");
    pub const EVENT_ENROLLMENT: Self = Self::from_static("eventEnrollment");
    pub const INTEGER_VALUE: Self = Self::from_static("integerValue");
    pub const LARGE_ANALOG_VALUE: Self = Self::from_static("largeAnalogValue");
    pub const POSITIVE_INTEGER_VALUE: Self = Self::from_static("positiveIntegerValue");
    pub const CALENDAR: Self = Self::from_static("calendar");
    pub const PULSE_CONVERTER: Self = Self::from_static("pulseConverter");
    pub const PROGRAM: Self = Self::from_static("program");
    pub const LIGHTING_OUTPUT: Self = Self::from_static("lightingOutput");
    pub const CHARACTER_STRING_VALUE: Self = Self::from_static("characterstringValue");
    pub const SCHEDULE: Self = Self::from_static("schedule");
    pub const FILE: Self = Self::from_static("file");
    pub const TREND_LOG: Self = Self::from_static("trendLog");
    pub const TREND_LOG_MULTIPLE: Self = Self::from_static("trendLogMultiple");
    pub const EVENT_LOG: Self = Self::from_static("eventLog");
    pub const NOTIFICATION_CLASS: Self = Self::from_static("notificationClass");

    /// Types every standard stack can describe
    pub const STANDARD: &'static [ObjectType] = &[
        Self::DEVICE,
        Self::ACCUMULATOR,
        Self::ANALOG_INPUT,
        Self::ANALOG_OUTPUT,
        Self::ANALOG_VALUE,
        Self::BINARY_INPUT,
        Self::BINARY_OUTPUT,
        Self::BINARY_VALUE,
        Self::MULTI_STATE_INPUT,
        Self::MULTI_STATE_OUTPUT,
        Self::MULTI_STATE_VALUE,
        Self::ALERT_ENROLLMENT,
        Self::EVENT_ENROLLMENT,
        Self::INTEGER_VALUE,
        Self::LARGE_ANALOG_VALUE,
        Self::POSITIVE_INTEGER_VALUE,
        Self::CALENDAR,
        Self::PULSE_CONVERTER,
        Self::PROGRAM,
        Self::LIGHTING_OUTPUT,
        Self::CHARACTER_STRING_VALUE,
        Self::SCHEDULE,
        Self::FILE,
        Self::TREND_LOG,
        Self::TREND_LOG_MULTIPLE,
        Self::EVENT_LOG,
        Self::NOTIFICATION_CLASS,
    ];

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Analog-like types whose present value is a real number
    pub fn is_analog(&self) -> bool {
        matches!(
            self.as_str(),
            "analogInput" | "analogOutput" | "analogValue" | "largeAnalogValue"
        )
    }

    /// Types whose present value is an active/inactive enumeration
    pub fn is_binary(&self) -> bool {
        matches!(self.as_str(), "binaryInput" | "binaryOutput" | "binaryValue")
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Property Identifier
// ─────────────────────────────────────────────────────────────────────────────

/// Property name, e.g. `presentValue`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyIdentifier(Cow<'static, str>);

impl PropertyIdentifier {
    pub const OBJECT_IDENTIFIER: Self = Self::from_static("objectIdentifier");
    pub const OBJECT_NAME: Self = Self::from_static("objectName");
    pub const OBJECT_TYPE: Self = Self::from_static("objectType");
    pub const OBJECT_LIST: Self = Self::from_static("objectList");
    pub const PROPERTY_LIST: Self = Self::from_static("propertyList");
    pub const PRESENT_VALUE: Self = Self::from_static("presentValue");
    pub const OUT_OF_SERVICE: Self = Self::from_static("outOfService");
    pub const COV_INCREMENT: Self = Self::from_static("covIncrement");
    pub const STATUS_FLAGS: Self = Self::from_static("statusFlags");
    pub const EVENT_STATE: Self = Self::from_static("eventState");
    pub const RELIABILITY: Self = Self::from_static("reliability");
    pub const PROTOCOL_SERVICES_SUPPORTED: Self = Self::from_static("protocolServicesSupported");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PropertyIdentifier {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Object Identifier
// ─────────────────────────────────────────────────────────────────────────────

/// `(type, instance)` pair, rendered as `type:instance`
///
/// A device is identified by the object identifier of its own device object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentifier {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectIdentifier {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// Identifier of a device object
    pub fn device(instance: u32) -> Self {
        Self::new(ObjectType::DEVICE, instance)
    }

    pub fn is_device(&self) -> bool {
        self.object_type == ObjectType::DEVICE
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

impl FromStr for ObjectIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (object_type, instance) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidIdentifier(s.to_string()))?;

        if object_type.is_empty() {
            return Err(Error::InvalidIdentifier(s.to_string()));
        }

        let instance = instance
            .trim()
            .parse()
            .map_err(|_| Error::InvalidIdentifier(s.to_string()))?;

        Ok(Self::new(ObjectType::new(object_type.trim()), instance))
    }
}

impl Serialize for ObjectIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Address
// ─────────────────────────────────────────────────────────────────────────────

/// Network address of a device as understood by the fieldbus stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Engine stopped")]
    EngineStopped,
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_identifier_roundtrip() {
        let id: ObjectIdentifier = "analogInput:12".parse().unwrap();
        assert_eq!(id.object_type, ObjectType::ANALOG_INPUT);
        assert_eq!(id.instance, 12);
        assert_eq!(id.to_string(), "analogInput:12");
    }

    #[test]
    fn test_object_identifier_rejects_garbage() {
        assert!("analogInput".parse::<ObjectIdentifier>().is_err());
        assert!(":3".parse::<ObjectIdentifier>().is_err());
        assert!("device:x".parse::<ObjectIdentifier>().is_err());
    }

    #[test]
    fn test_borrowed_and_owned_types_compare_equal() {
        assert_eq!(ObjectType::new("device"), ObjectType::DEVICE);
        assert!(ObjectIdentifier::device(10).is_device());
    }

    #[test]
    fn test_object_identifier_serde_as_string() {
        let id = ObjectIdentifier::device(10);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"device:10\"");
        let back: ObjectIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
