//! Fixed property and object type sets

use crate::types::{ObjectType, PropertyIdentifier};

const fn p(name: &'static str) -> PropertyIdentifier {
    PropertyIdentifier::from_static(name)
}

/// Properties read once from a device's own object during exploration.
/// Also the fallback when the device will not report its property list.
pub const DEVICE_PROPERTIES: &[PropertyIdentifier] = &[
    p("objectIdentifier"),
    p("objectType"),
    p("objectName"),
    p("systemStatus"),
    p("vendorName"),
    p("vendorIdentifier"),
    p("description"),
    p("modelName"),
    p("firmwareRevision"),
    p("applicationSoftwareVersion"),
    p("protocolVersion"),
    p("protocolRevision"),
    p("protocolServicesSupported"),
    p("protocolObjectTypesSupported"),
    p("segmentationSupported"),
    p("apduTimeout"),
    p("numberOfApduRetries"),
    p("databaseRevision"),
    p("maxApduLengthAccepted"),
    p("maxSegmentsAccepted"),
    p("objectList"),
    p("serialNumber"),
];

/// Properties read once from every other object during exploration
pub const OBJECT_PROPERTIES: &[PropertyIdentifier] = &[
    p("objectIdentifier"),
    p("objectType"),
    p("objectName"),
    p("description"),
    p("presentValue"),
    p("statusFlags"),
    p("outOfService"),
    p("units"),
    p("eventState"),
    p("reliability"),
    p("covIncrement"),
    p("stateText"),
    p("numberOfStates"),
    p("notificationClass"),
    p("minPresValue"),
    p("maxPresValue"),
    p("activeText"),
    p("inactiveText"),
    p("polarity"),
    p("relinquishDefault"),
    p("resolution"),
];

/// Properties that change at runtime: re-read by poll tasks and accepted
/// from change-of-value notifications
pub const PERIODIC_PROPERTIES: &[PropertyIdentifier] = &[
    p("presentValue"),
    p("statusFlags"),
    p("outOfService"),
    p("eventState"),
    p("reliability"),
    p("covIncrement"),
];

/// Object types that accept a change-of-value subscription
pub const SUBSCRIBABLE_TYPES: &[ObjectType] = &[
    ObjectType::ACCUMULATOR,
    ObjectType::ANALOG_VALUE,
    ObjectType::ANALOG_INPUT,
    ObjectType::ANALOG_OUTPUT,
    ObjectType::BINARY_VALUE,
    ObjectType::BINARY_INPUT,
    ObjectType::BINARY_OUTPUT,
    ObjectType::MULTI_STATE_VALUE,
    ObjectType::MULTI_STATE_INPUT,
    ObjectType::MULTI_STATE_OUTPUT,
    ObjectType::ALERT_ENROLLMENT,
    ObjectType::EVENT_ENROLLMENT,
    ObjectType::INTEGER_VALUE,
    ObjectType::CALENDAR,
    ObjectType::PULSE_CONVERTER,
    ObjectType::PROGRAM,
    ObjectType::LARGE_ANALOG_VALUE,
    ObjectType::POSITIVE_INTEGER_VALUE,
    ObjectType::LIGHTING_OUTPUT,
];

/// Position of read-property-multiple in `protocolServicesSupported`
pub const READ_MULTIPLE_SERVICE_BIT: usize = 14;

pub fn is_subscribable(object_type: &ObjectType) -> bool {
    SUBSCRIBABLE_TYPES.contains(object_type)
}
