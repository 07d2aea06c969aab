//! Fieldbus client trait and request/response types

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::types::{Address, ObjectIdentifier, ObjectType, PropertyIdentifier};

use super::value::RawValue;

// ─────────────────────────────────────────────────────────────────────────────
// Protocol Error
// ─────────────────────────────────────────────────────────────────────────────

/// Failure outcome of a single request to the field network
///
/// Callers switch on the variant to pick a fallback; nothing here is fatal to
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The property is not implemented by the object
    #[error("unknown-property")]
    UnknownProperty,

    /// The object does not exist on the device
    #[error("unknown-object")]
    UnknownObject,

    /// The device does not implement the requested service
    #[error("unrecognized-service")]
    UnrecognizedService,

    /// The response would need segmentation the device cannot do
    #[error("segmentation-not-supported")]
    SegmentationNotSupported,

    /// The response could not be decoded
    #[error("invalid-tag")]
    InvalidTag,

    /// No response within the stack's retry budget
    #[error("no-response")]
    Timeout,

    /// No address is known for the device
    #[error("unknown device {0}")]
    UnknownDevice(ObjectIdentifier),

    /// Reject, abort or error PDU for this specific request
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ProtocolError {
    /// Whether a batch read failing this way should be retried per property
    pub fn is_batch_fallback(&self) -> bool {
        matches!(
            self,
            ProtocolError::SegmentationNotSupported
                | ProtocolError::UnrecognizedService
                | ProtocolError::InvalidTag
        )
    }
}

/// Outcome of a request to the field network
pub type ReadResult<T> = Result<T, ProtocolError>;

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// One object's part of a read-property-multiple request
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessSpec {
    pub object: ObjectIdentifier,
    pub properties: Vec<PropertyIdentifier>,
}

/// One entry of a read-property-multiple response
///
/// A property the device could not read comes back as [`RawValue::Error`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessResult {
    pub object: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
    pub value: RawValue,
}

/// A change-of-value subscription as known to the stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovRequest {
    pub device: ObjectIdentifier,
    pub address: Address,
    pub object: ObjectIdentifier,
    pub process_id: u32,
    pub confirmed: bool,
    /// Seconds, 0 for indefinite
    pub lifetime: u32,
}

/// A single notified value
#[derive(Debug, Clone, PartialEq)]
pub struct CovNotification {
    pub property: PropertyIdentifier,
    pub value: RawValue,
}

/// I-Am received from the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub device: ObjectIdentifier,
    pub address: Address,
}

// ─────────────────────────────────────────────────────────────────────────────
// Fieldbus Client
// ─────────────────────────────────────────────────────────────────────────────

/// The operations the engine consumes from a BACnet stack
#[async_trait]
pub trait FieldbusClient: Send + Sync + 'static {
    /// Broadcast a Who-Is and collect the I-Am responses for `timeout`
    async fn who_is(&self, timeout: Duration) -> Vec<Announce>;

    /// Broadcast our own I-Am
    async fn i_am(&self) -> ReadResult<()>;

    fn address_for_device(&self, device: &ObjectIdentifier) -> Option<Address>;

    /// Whether the stack has a class definition for this object type
    fn knows_object_type(&self, object_type: &ObjectType) -> bool;

    async fn read_property(
        &self,
        address: &Address,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
        array_index: Option<u32>,
    ) -> ReadResult<RawValue>;

    async fn read_property_multiple(
        &self,
        address: &Address,
        specs: &[ReadAccessSpec],
    ) -> ReadResult<Vec<ReadAccessResult>>;

    async fn write_property(
        &self,
        address: &Address,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
        value: RawValue,
        array_index: Option<u32>,
        priority: Option<u8>,
    ) -> ReadResult<()>;

    /// Subscribe and return the stream of notified values
    async fn subscribe_cov(
        &self,
        request: &CovRequest,
    ) -> ReadResult<mpsc::Receiver<CovNotification>>;

    /// Re-issue the subscription before its lifetime runs out
    async fn renew_cov(&self, request: &CovRequest) -> ReadResult<()>;

    /// Point the stack's subscription context at a device's new address
    fn rekey_cov(&self, request: &CovRequest, new_address: &Address);

    async fn unsubscribe_cov(&self, request: &CovRequest) -> ReadResult<()>;

    /// Unsolicited I-Am announcements
    fn announcements(&self) -> broadcast::Receiver<Announce>;
}
