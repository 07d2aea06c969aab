//! Simulated Network
//!
//! In-memory [`FieldbusClient`] with per-device switches for the partial
//! protocol support real devices show: no batch reads, no segmentation, no
//! property list, rejected or failing subscriptions, silence.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::types::{Address, ObjectIdentifier, ObjectType, PropertyIdentifier, Result};

use super::properties::READ_MULTIPLE_SERVICE_BIT;
use super::protocol::{
    Announce, CovNotification, CovRequest, FieldbusClient, ProtocolError, ReadAccessResult,
    ReadAccessSpec, ReadResult,
};
use super::value::RawValue;

/// Largest response, counted in values, a device without segmentation returns
const MAX_UNSEGMENTED: usize = 6;

fn yes() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Simulated Device
// ─────────────────────────────────────────────────────────────────────────────

/// A device on the simulated network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDevice {
    pub device: ObjectIdentifier,
    pub address: Address,

    /// Implements read-property-multiple
    #[serde(default = "yes")]
    pub read_multiple: bool,

    /// Can return responses larger than one segment
    #[serde(default = "yes")]
    pub segmentation: bool,

    /// Answers reads of `propertyList`
    #[serde(default = "yes")]
    pub property_list: bool,

    /// Rejects every subscribe request
    #[serde(default)]
    pub reject_cov: bool,

    /// Rejects every subscription renewal
    #[serde(default)]
    pub fail_renewals: bool,

    /// Answers requests at all
    #[serde(default = "yes")]
    pub responsive: bool,

    #[serde(default)]
    pub objects: BTreeMap<ObjectIdentifier, BTreeMap<PropertyIdentifier, RawValue>>,
}

impl SimDevice {
    /// A responsive device with a populated device object
    pub fn new(instance: u32, address: &str) -> Self {
        let device = ObjectIdentifier::device(instance);
        let mut services = vec![false; 40];
        services[READ_MULTIPLE_SERVICE_BIT] = true;

        let mut props = BTreeMap::new();
        props.insert(
            PropertyIdentifier::OBJECT_NAME,
            RawValue::CharacterString(format!("Simulated device {instance}")),
        );
        props.insert(
            PropertyIdentifier::OBJECT_TYPE,
            RawValue::enumerated(8, "device"),
        );
        props.insert(
            PropertyIdentifier::new("vendorName"),
            RawValue::CharacterString("bacsync".into()),
        );
        props.insert(PropertyIdentifier::new("vendorIdentifier"), RawValue::Unsigned(999));
        props.insert(
            PropertyIdentifier::new("systemStatus"),
            RawValue::enumerated(0, "operational"),
        );
        props.insert(
            PropertyIdentifier::new("segmentationSupported"),
            RawValue::enumerated(0, "segmentedBoth"),
        );
        props.insert(
            PropertyIdentifier::PROTOCOL_SERVICES_SUPPORTED,
            RawValue::BitString(services),
        );
        props.insert(PropertyIdentifier::new("maxApduLengthAccepted"), RawValue::Unsigned(1476));

        let mut objects = BTreeMap::new();
        objects.insert(device.clone(), props);

        let mut sim = Self {
            device,
            address: Address::new(address),
            read_multiple: true,
            segmentation: true,
            property_list: true,
            reject_cov: false,
            fail_renewals: false,
            responsive: true,
            objects,
        };
        sim.finish();
        sim
    }

    /// Add an object with the given properties
    pub fn with_object(mut self, object: ObjectIdentifier, props: Vec<(&str, RawValue)>) -> Self {
        let props = props
            .into_iter()
            .map(|(name, value)| (PropertyIdentifier::new(name), value))
            .collect();
        self.objects.insert(object, props);
        self.finish();
        self
    }

    /// Add an analog object with the usual property set
    pub fn with_analog(self, object: ObjectIdentifier, present_value: f32) -> Self {
        let name = format!("{object}");
        self.with_object(
            object,
            vec![
                ("objectName", RawValue::CharacterString(name)),
                ("presentValue", RawValue::Real(present_value)),
                ("statusFlags", RawValue::BitString(vec![false; 4])),
                ("outOfService", RawValue::Boolean(false)),
                ("eventState", RawValue::enumerated(0, "normal")),
                ("units", RawValue::enumerated(62, "degreesCelsius")),
                ("covIncrement", RawValue::Real(0.5)),
            ],
        )
    }

    /// Add a binary object with the usual property set
    pub fn with_binary(self, object: ObjectIdentifier, active: bool) -> Self {
        let name = format!("{object}");
        let value = if active {
            RawValue::enumerated(1, "active")
        } else {
            RawValue::enumerated(0, "inactive")
        };
        self.with_object(
            object,
            vec![
                ("objectName", RawValue::CharacterString(name)),
                ("presentValue", value),
                ("statusFlags", RawValue::BitString(vec![false; 4])),
                ("outOfService", RawValue::Boolean(false)),
                ("activeText", RawValue::CharacterString("On".into())),
                ("inactiveText", RawValue::CharacterString("Off".into())),
            ],
        )
    }

    pub fn without_read_multiple(mut self) -> Self {
        self.read_multiple = false;
        if let Some(RawValue::BitString(bits)) = self
            .objects
            .get_mut(&self.device)
            .and_then(|props| props.get_mut(&PropertyIdentifier::PROTOCOL_SERVICES_SUPPORTED))
        {
            if let Some(bit) = bits.get_mut(READ_MULTIPLE_SERVICE_BIT) {
                *bit = false;
            }
        }
        self
    }

    pub fn without_segmentation(mut self) -> Self {
        self.segmentation = false;
        if let Some(props) = self.objects.get_mut(&self.device) {
            props.insert(
                PropertyIdentifier::new("segmentationSupported"),
                RawValue::enumerated(3, "noSegmentation"),
            );
        }
        self
    }

    pub fn without_property_list(mut self) -> Self {
        self.property_list = false;
        self
    }

    /// Fill in `objectIdentifier` everywhere and keep the device's
    /// `objectList` in step with its objects
    fn finish(&mut self) {
        let ids: Vec<ObjectIdentifier> = self.objects.keys().cloned().collect();
        for (id, props) in self.objects.iter_mut() {
            props
                .entry(PropertyIdentifier::OBJECT_IDENTIFIER)
                .or_insert_with(|| RawValue::ObjectIdentifier(id.clone()));
        }

        // Device object first, like real devices report it
        let mut list = vec![RawValue::ObjectIdentifier(self.device.clone())];
        list.extend(
            ids.into_iter()
                .filter(|id| *id != self.device)
                .map(RawValue::ObjectIdentifier),
        );

        let device = self.device.clone();
        self.objects
            .entry(device)
            .or_default()
            .insert(PropertyIdentifier::OBJECT_LIST, RawValue::Array(list));
    }

    fn announce(&self) -> Announce {
        Announce {
            device: self.device.clone(),
            address: self.address.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Simulated Network
// ─────────────────────────────────────────────────────────────────────────────

/// A write the network has accepted
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub device: ObjectIdentifier,
    pub object: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub value: RawValue,
    pub array_index: Option<u32>,
    pub priority: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    devices: Vec<SimDevice>,
}

struct SimSubscription {
    device: ObjectIdentifier,
    object: ObjectIdentifier,
    tx: mpsc::Sender<CovNotification>,
}

#[derive(Default)]
struct SimState {
    devices: BTreeMap<ObjectIdentifier, SimDevice>,
    subscriptions: HashMap<(Address, u32), SimSubscription>,
    writes: Vec<RecordedWrite>,
    unsubscribes: usize,
    renewals: usize,
    i_ams: usize,
}

impl SimState {
    fn device_at(&self, address: &Address) -> ReadResult<&SimDevice> {
        let device = self
            .devices
            .values()
            .find(|d| d.address == *address)
            .ok_or(ProtocolError::Timeout)?;
        if !device.responsive {
            return Err(ProtocolError::Timeout);
        }
        Ok(device)
    }

    fn device_at_mut(&mut self, address: &Address) -> ReadResult<&mut SimDevice> {
        let device = self
            .devices
            .values_mut()
            .find(|d| d.address == *address)
            .ok_or(ProtocolError::Timeout)?;
        if !device.responsive {
            return Err(ProtocolError::Timeout);
        }
        Ok(device)
    }

    fn notify(&self, device: &ObjectIdentifier, object: &ObjectIdentifier, property: &PropertyIdentifier, value: &RawValue) -> usize {
        let mut delivered = 0;
        for sub in self.subscriptions.values() {
            if sub.device == *device && sub.object == *object {
                let notification = CovNotification {
                    property: property.clone(),
                    value: value.clone(),
                };
                if sub.tx.try_send(notification).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// Artificial response times
#[derive(Debug, Default, Clone, Copy)]
struct Latency {
    read: Duration,
    unsubscribe: Duration,
}

/// Counts one read while it is in flight
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory field network
pub struct SimulatedNetwork {
    state: Mutex<SimState>,
    announce_tx: broadcast::Sender<Announce>,
    latency: Mutex<Latency>,
    reads_in_flight: AtomicUsize,
    max_reads_in_flight: AtomicUsize,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        let (announce_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(SimState::default()),
            announce_tx,
            latency: Mutex::new(Latency::default()),
            reads_in_flight: AtomicUsize::new(0),
            max_reads_in_flight: AtomicUsize::new(0),
        }
    }

    /// Build a network from devices
    pub fn with_devices(devices: impl IntoIterator<Item = SimDevice>) -> Self {
        let network = Self::new();
        for device in devices {
            network.add_device(device);
        }
        network
    }

    /// Parse a `{"devices": [...]}` fixture
    pub fn from_json(json: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(json)?;
        Ok(Self::with_devices(fixture.devices))
    }

    /// Load a fixture file
    pub fn from_fixture(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// A small building: one controller with a few points and a plant
    /// controller without batch reads
    pub fn demo() -> Self {
        let ahu = SimDevice::new(100, "192.168.1.100")
            .with_analog(ObjectIdentifier::new(ObjectType::ANALOG_INPUT, 0), 21.5)
            .with_analog(ObjectIdentifier::new(ObjectType::ANALOG_INPUT, 1), 18.25)
            .with_analog(ObjectIdentifier::new(ObjectType::ANALOG_VALUE, 0), 22.0)
            .with_binary(ObjectIdentifier::new(ObjectType::BINARY_OUTPUT, 0), true);
        let plant = SimDevice::new(200, "192.168.1.200")
            .with_analog(ObjectIdentifier::new(ObjectType::ANALOG_INPUT, 0), 6.5)
            .with_binary(ObjectIdentifier::new(ObjectType::BINARY_VALUE, 3), false)
            .without_read_multiple();
        Self::with_devices([ahu, plant])
    }

    pub fn add_device(&self, mut device: SimDevice) {
        device.finish();
        self.state.lock().devices.insert(device.device.clone(), device);
    }

    /// Broadcast an unsolicited I-Am for a device
    pub fn announce(&self, device: &ObjectIdentifier) -> bool {
        let announce = self.state.lock().devices.get(device).map(SimDevice::announce);
        match announce {
            Some(announce) => self.announce_tx.send(announce).is_ok(),
            None => false,
        }
    }

    /// Change a value on the device and notify its subscribers
    pub fn inject_cov(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        property: &str,
        value: RawValue,
    ) -> usize {
        let property = PropertyIdentifier::new(property);
        let mut state = self.state.lock();
        if let Some(props) = state
            .devices
            .get_mut(device)
            .and_then(|d| d.objects.get_mut(object))
        {
            props.insert(property.clone(), value.clone());
        }
        state.notify(device, object, &property, &value)
    }

    /// Set a value without notifying anyone
    pub fn set_value(&self, device: &ObjectIdentifier, object: &ObjectIdentifier, property: &str, value: RawValue) {
        let mut state = self.state.lock();
        if let Some(props) = state
            .devices
            .get_mut(device)
            .and_then(|d| d.objects.get_mut(object))
        {
            props.insert(PropertyIdentifier::new(property), value);
        }
    }

    /// Move a device to a new address
    pub fn migrate(&self, device: &ObjectIdentifier, address: &str) {
        if let Some(d) = self.state.lock().devices.get_mut(device) {
            d.address = Address::new(address);
        }
    }

    pub fn set_responsive(&self, device: &ObjectIdentifier, responsive: bool) {
        if let Some(d) = self.state.lock().devices.get_mut(device) {
            d.responsive = responsive;
        }
    }

    pub fn set_fail_renewals(&self, device: &ObjectIdentifier, fail: bool) {
        if let Some(d) = self.state.lock().devices.get_mut(device) {
            d.fail_renewals = fail;
        }
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    /// Live subscriptions on a device
    pub fn subscription_count(&self, device: &ObjectIdentifier) -> usize {
        self.state
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.device == *device)
            .count()
    }

    /// Address a subscription is currently keyed under
    pub fn subscription_addresses(&self, device: &ObjectIdentifier) -> Vec<Address> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|(_, s)| s.device == *device)
            .map(|((address, _), _)| address.clone())
            .collect()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state.lock().unsubscribes
    }

    pub fn renewal_count(&self) -> usize {
        self.state.lock().renewals
    }

    pub fn i_am_count(&self) -> usize {
        self.state.lock().i_ams
    }

    /// Every read takes `delay` to answer
    pub fn set_read_delay(&self, delay: Duration) {
        self.latency.lock().read = delay;
    }

    /// Every unsubscribe takes `delay` to answer
    pub fn set_unsubscribe_delay(&self, delay: Duration) {
        self.latency.lock().unsubscribe = delay;
    }

    /// Highest number of reads that were answered at the same time
    pub fn max_concurrent_reads(&self) -> usize {
        self.max_reads_in_flight.load(Ordering::SeqCst)
    }

    async fn begin_read(&self) -> InFlight<'_> {
        let in_flight = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_reads_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let guard = InFlight(&self.reads_in_flight);

        let delay = self.latency.lock().read;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        guard
    }
}

fn weight(value: &RawValue) -> usize {
    match value {
        RawValue::Array(items) => items.len().max(1),
        _ => 1,
    }
}

fn property_list(props: &BTreeMap<PropertyIdentifier, RawValue>) -> RawValue {
    // objectIdentifier, objectName, objectType and propertyList are implied
    let implied = [
        PropertyIdentifier::OBJECT_IDENTIFIER,
        PropertyIdentifier::OBJECT_NAME,
        PropertyIdentifier::OBJECT_TYPE,
        PropertyIdentifier::PROPERTY_LIST,
    ];
    RawValue::Array(
        props
            .keys()
            .filter(|p| !implied.contains(p))
            .enumerate()
            .map(|(i, p)| RawValue::Enumerated {
                value: i as u32,
                name: Some(p.to_string()),
            })
            .collect(),
    )
}

#[async_trait]
impl FieldbusClient for SimulatedNetwork {
    async fn who_is(&self, _timeout: Duration) -> Vec<Announce> {
        self.state
            .lock()
            .devices
            .values()
            .filter(|d| d.responsive)
            .map(SimDevice::announce)
            .collect()
    }

    async fn i_am(&self) -> ReadResult<()> {
        self.state.lock().i_ams += 1;
        Ok(())
    }

    fn address_for_device(&self, device: &ObjectIdentifier) -> Option<Address> {
        self.state.lock().devices.get(device).map(|d| d.address.clone())
    }

    fn knows_object_type(&self, object_type: &ObjectType) -> bool {
        ObjectType::STANDARD.contains(object_type)
    }

    async fn read_property(
        &self,
        address: &Address,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
        array_index: Option<u32>,
    ) -> ReadResult<RawValue> {
        let _reading = self.begin_read().await;
        let state = self.state.lock();
        let device = state.device_at(address)?;
        let props = device
            .objects
            .get(object)
            .ok_or(ProtocolError::UnknownObject)?;

        let value = if *property == PropertyIdentifier::PROPERTY_LIST {
            if !device.property_list {
                return Err(ProtocolError::UnknownProperty);
            }
            property_list(props)
        } else {
            props
                .get(property)
                .cloned()
                .ok_or(ProtocolError::UnknownProperty)?
        };

        if let RawValue::Error { code, .. } = &value {
            return Err(ProtocolError::Rejected(code.clone()));
        }

        match (array_index, &value) {
            (None, _) => {
                if !device.segmentation && weight(&value) > MAX_UNSEGMENTED {
                    return Err(ProtocolError::SegmentationNotSupported);
                }
                Ok(value)
            }
            (Some(0), RawValue::Array(items)) => Ok(RawValue::Unsigned(items.len() as u64)),
            (Some(i), RawValue::Array(items)) => items
                .get(i as usize - 1)
                .cloned()
                .ok_or_else(|| ProtocolError::Rejected("invalid-array-index".into())),
            (Some(_), _) => Err(ProtocolError::Rejected("property-is-not-an-array".into())),
        }
    }

    async fn read_property_multiple(
        &self,
        address: &Address,
        specs: &[ReadAccessSpec],
    ) -> ReadResult<Vec<ReadAccessResult>> {
        let _reading = self.begin_read().await;
        let state = self.state.lock();
        let device = state.device_at(address)?;
        if !device.read_multiple {
            return Err(ProtocolError::UnrecognizedService);
        }

        let mut results = Vec::new();
        for spec in specs {
            let props = device.objects.get(&spec.object);
            for property in &spec.properties {
                let value = match props {
                    None => RawValue::error("object", "unknownObject"),
                    Some(props) if *property == PropertyIdentifier::PROPERTY_LIST && device.property_list => {
                        property_list(props)
                    }
                    Some(props) => props
                        .get(property)
                        .cloned()
                        .unwrap_or_else(|| RawValue::error("property", "unknownProperty")),
                };
                results.push(ReadAccessResult {
                    object: spec.object.clone(),
                    property: property.clone(),
                    array_index: None,
                    value,
                });
            }
        }

        let total: usize = results.iter().map(|r| weight(&r.value)).sum();
        if !device.segmentation && total > MAX_UNSEGMENTED {
            return Err(ProtocolError::SegmentationNotSupported);
        }

        Ok(results)
    }

    async fn write_property(
        &self,
        address: &Address,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
        value: RawValue,
        array_index: Option<u32>,
        priority: Option<u8>,
    ) -> ReadResult<()> {
        let mut state = self.state.lock();
        let device = state.device_at_mut(address)?;
        let device_id = device.device.clone();
        let props = device
            .objects
            .get_mut(object)
            .ok_or(ProtocolError::UnknownObject)?;
        if !props.contains_key(property) {
            return Err(ProtocolError::Rejected("write-access-denied".into()));
        }
        props.insert(property.clone(), value.clone());

        state.writes.push(RecordedWrite {
            device: device_id.clone(),
            object: object.clone(),
            property: property.clone(),
            value: value.clone(),
            array_index,
            priority,
        });
        state.notify(&device_id, object, property, &value);
        Ok(())
    }

    async fn subscribe_cov(
        &self,
        request: &CovRequest,
    ) -> ReadResult<mpsc::Receiver<CovNotification>> {
        let mut state = self.state.lock();
        let device = state.device_at(&request.address)?;
        if device.reject_cov {
            return Err(ProtocolError::Rejected("cov-subscription-failed".into()));
        }
        let props = device
            .objects
            .get(&request.object)
            .ok_or_else(|| ProtocolError::Rejected("unknown-object".into()))?;

        let (tx, rx) = mpsc::channel(64);

        // Devices answer a new subscription with the current values
        for property in [PropertyIdentifier::PRESENT_VALUE, PropertyIdentifier::STATUS_FLAGS] {
            if let Some(value) = props.get(&property) {
                let _ = tx.try_send(CovNotification {
                    property,
                    value: value.clone(),
                });
            }
        }

        let device_id = device.device.clone();
        state.subscriptions.insert(
            (request.address.clone(), request.process_id),
            SimSubscription {
                device: device_id,
                object: request.object.clone(),
                tx,
            },
        );
        Ok(rx)
    }

    async fn renew_cov(&self, request: &CovRequest) -> ReadResult<()> {
        let mut state = self.state.lock();
        let device = state.device_at(&request.address)?;
        if device.fail_renewals {
            return Err(ProtocolError::Rejected("resources".into()));
        }
        if !state
            .subscriptions
            .contains_key(&(request.address.clone(), request.process_id))
        {
            return Err(ProtocolError::Rejected("unknown-subscription".into()));
        }
        state.renewals += 1;
        Ok(())
    }

    fn rekey_cov(&self, request: &CovRequest, new_address: &Address) {
        let mut state = self.state.lock();
        if let Some(sub) = state
            .subscriptions
            .remove(&(request.address.clone(), request.process_id))
        {
            state
                .subscriptions
                .insert((new_address.clone(), request.process_id), sub);
        }
    }

    async fn unsubscribe_cov(&self, request: &CovRequest) -> ReadResult<()> {
        let delay = self.latency.lock().unsubscribe;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.unsubscribes += 1;
        if state
            .subscriptions
            .remove(&(request.address.clone(), request.process_id))
            .is_none()
        {
            tracing::debug!(object = %request.object, "Unsubscribe for unknown subscription");
        }
        Ok(())
    }

    fn announcements(&self) -> broadcast::Receiver<Announce> {
        self.announce_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ai(instance: u32) -> ObjectIdentifier {
        ObjectIdentifier::new(ObjectType::ANALOG_INPUT, instance)
    }

    #[test]
    fn test_object_list_tracks_objects() {
        let device = SimDevice::new(10, "10.0.0.10").with_analog(ai(0), 1.0);
        let list = &device.objects[&device.device][&PropertyIdentifier::OBJECT_LIST];
        assert_eq!(
            *list,
            RawValue::Array(vec![
                RawValue::ObjectIdentifier(ObjectIdentifier::device(10)),
                RawValue::ObjectIdentifier(ai(0)),
            ])
        );
    }

    #[tokio::test]
    async fn test_unsegmented_device_needs_indexed_reads() {
        let mut device = SimDevice::new(10, "10.0.0.10").without_segmentation();
        for i in 0..8 {
            device = device.with_analog(ai(i), i as f32);
        }
        let network = SimulatedNetwork::with_devices([device]);
        let address = Address::new("10.0.0.10");
        let dev = ObjectIdentifier::device(10);

        let whole = network
            .read_property(&address, &dev, &PropertyIdentifier::OBJECT_LIST, None)
            .await;
        assert_eq!(whole, Err(ProtocolError::SegmentationNotSupported));

        let len = network
            .read_property(&address, &dev, &PropertyIdentifier::OBJECT_LIST, Some(0))
            .await;
        assert_eq!(len, Ok(RawValue::Unsigned(9)));

        let first = network
            .read_property(&address, &dev, &PropertyIdentifier::OBJECT_LIST, Some(1))
            .await;
        assert_eq!(first, Ok(RawValue::ObjectIdentifier(dev.clone())));
    }

    #[tokio::test]
    async fn test_batch_read_reports_missing_properties_inline() {
        let network = SimulatedNetwork::with_devices([SimDevice::new(10, "10.0.0.10").with_analog(ai(0), 1.0)]);
        let results = network
            .read_property_multiple(
                &Address::new("10.0.0.10"),
                &[ReadAccessSpec {
                    object: ai(0),
                    properties: vec![PropertyIdentifier::PRESENT_VALUE, PropertyIdentifier::new("bogus")],
                }],
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].value, RawValue::Real(1.0));
        assert!(results[1].value.is_error());
    }

    #[tokio::test]
    async fn test_cov_injection_and_rekey() {
        let network = SimulatedNetwork::with_devices([SimDevice::new(10, "10.0.0.10").with_analog(ai(0), 1.0)]);
        let request = CovRequest {
            device: ObjectIdentifier::device(10),
            address: Address::new("10.0.0.10"),
            object: ai(0),
            process_id: 7,
            confirmed: true,
            lifetime: 60,
        };
        let mut rx = network.subscribe_cov(&request).await.unwrap();

        // initial values
        assert_eq!(rx.recv().await.unwrap().property, PropertyIdentifier::PRESENT_VALUE);
        assert_eq!(rx.recv().await.unwrap().property, PropertyIdentifier::STATUS_FLAGS);

        let delivered = network.inject_cov(&request.device, &ai(0), "presentValue", RawValue::Real(2.0));
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap().value, RawValue::Real(2.0));

        network.migrate(&request.device, "10.0.0.99");
        network.rekey_cov(&request, &Address::new("10.0.0.99"));
        assert_eq!(
            network.subscription_addresses(&request.device),
            vec![Address::new("10.0.0.99")]
        );
    }

    #[test]
    fn test_fixture_loading() {
        let json = r#"{
            "devices": [{
                "device": "device:5",
                "address": "10.0.0.5",
                "read_multiple": false,
                "objects": {
                    "analogValue:1": {
                        "presentValue": {"type": "real", "value": 20.0}
                    }
                }
            }]
        }"#;
        let network = SimulatedNetwork::from_json(json).unwrap();
        let device = ObjectIdentifier::device(5);
        assert_eq!(
            network.address_for_device(&device),
            Some(Address::new("10.0.0.5"))
        );
        assert!(!network.state.lock().devices[&device].read_multiple);
    }
}
