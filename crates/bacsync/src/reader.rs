//! Property Reader
//!
//! Batch reads with fallbacks for devices with partial protocol support:
//! batch → one read per property → one read per array element. Every request
//! holds a permit of the shared read limit while it is in flight.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::bacnet::{
    FieldbusClient, ProtocolError, READ_MULTIPLE_SERVICE_BIT, RawValue, ReadAccessSpec,
    ReadResult, sanitize,
};
use crate::dictionary::{DeviceDictionary, Node};
use crate::types::{Address, ObjectIdentifier, PropertyIdentifier};

/// Fewer reported properties than this means the list is not trustworthy
const MIN_PROPERTY_LIST: usize = 4;

#[derive(Clone)]
pub struct PropertyReader {
    client: Arc<dyn FieldbusClient>,
    dictionary: Arc<DeviceDictionary>,
    read_limit: Arc<Semaphore>,
}

impl PropertyReader {
    pub fn new(
        client: Arc<dyn FieldbusClient>,
        dictionary: Arc<DeviceDictionary>,
        read_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            client,
            dictionary,
            read_limit,
        }
    }

    fn address(&self, device: &ObjectIdentifier) -> Option<Address> {
        let address = self.client.address_for_device(device);
        if address.is_none() {
            tracing::warn!(device = %device, "No address known for device");
        }
        address
    }

    async fn read_raw(
        &self,
        address: &Address,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
        array_index: Option<u32>,
    ) -> ReadResult<RawValue> {
        let _permit = self
            .read_limit
            .acquire()
            .await
            .map_err(|_| ProtocolError::Rejected("read limit closed".into()))?;
        self.client
            .read_property(address, object, property, array_index)
            .await
    }

    /// Read a single property and return the raw value without storing it
    pub async fn read_value(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
    ) -> ReadResult<RawValue> {
        let address = self
            .client
            .address_for_device(device)
            .ok_or_else(|| ProtocolError::UnknownDevice(device.clone()))?;
        self.read_raw(&address, object, property, None).await
    }

    /// Whether the device advertises read-property-multiple
    pub fn supports_read_multiple(&self, device: &ObjectIdentifier) -> bool {
        self.dictionary
            .get(device, device, &PropertyIdentifier::PROTOCOL_SERVICES_SUPPORTED)
            .and_then(|bits| bits.get(READ_MULTIPLE_SERVICE_BIT).and_then(|b| b.as_bool()))
            .unwrap_or(false)
    }

    /// The properties an object reports, or `fallback` when it will not say
    pub async fn property_list(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        fallback: &[PropertyIdentifier],
    ) -> Vec<PropertyIdentifier> {
        let Some(address) = self.address(device) else {
            return fallback.to_vec();
        };

        let list = match self
            .read_raw(&address, object, &PropertyIdentifier::PROPERTY_LIST, None)
            .await
        {
            Ok(RawValue::Array(items)) => {
                let mut list: Vec<PropertyIdentifier> =
                    items.iter().filter_map(property_name).collect();
                list.push(PropertyIdentifier::OBJECT_IDENTIFIER);
                list.push(PropertyIdentifier::OBJECT_NAME);
                list
            }
            Ok(other) => {
                tracing::warn!(device = %device, object = %object, value = ?other, "Invalid property list");
                return fallback.to_vec();
            }
            Err(e) => {
                tracing::debug!(device = %device, object = %object, error = %e, "No property list");
                return fallback.to_vec();
            }
        };

        if list.len() < MIN_PROPERTY_LIST {
            return fallback.to_vec();
        }
        list
    }

    /// Properties of `wanted` the object actually has, in `wanted` order
    pub async fn readable_properties(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        wanted: &[PropertyIdentifier],
    ) -> Vec<PropertyIdentifier> {
        let available = self.property_list(device, object, wanted).await;
        wanted
            .iter()
            .filter(|p| available.contains(p))
            .cloned()
            .collect()
    }

    /// Read with whichever strategy the device supports
    pub async fn read_object(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        properties: &[PropertyIdentifier],
    ) -> bool {
        if self.supports_read_multiple(device) {
            self.read_multiple(device, object, properties).await
        } else {
            self.read_each(device, object, properties).await
        }
    }

    /// Batch-read properties of one object, falling back to single reads when
    /// the device cannot do the batch
    pub async fn read_multiple(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        properties: &[PropertyIdentifier],
    ) -> bool {
        if properties.is_empty() {
            return true;
        }
        let Some(address) = self.address(device) else {
            return false;
        };

        tracing::debug!(device = %device, object = %object, "Read multiple");

        let spec = ReadAccessSpec {
            object: object.clone(),
            properties: properties.to_vec(),
        };
        let response = {
            let Ok(_permit) = self.read_limit.acquire().await else {
                return false;
            };
            self.client.read_property_multiple(&address, &[spec]).await
        };

        match response {
            Ok(results) => {
                let values: Vec<(PropertyIdentifier, serde_json::Value)> = results
                    .iter()
                    .filter_map(|r| sanitize(&r.value).map(|v| (r.property.clone(), v)))
                    .collect();
                if !values.is_empty() {
                    self.dictionary.merge(Node::object(device, object, values));
                }
                true
            }
            Err(e) if e.is_batch_fallback() => {
                tracing::warn!(device = %device, object = %object, error = %e, "Batch read failed, reading properties one by one");
                self.read_each(device, object, properties).await
            }
            Err(e) => {
                tracing::warn!(device = %device, object = %object, error = %e, "Batch read failed");
                false
            }
        }
    }

    /// Read every property on its own, concurrently
    ///
    /// Unknown properties are skipped; any other failure makes the result
    /// `false` without stopping the sibling reads.
    pub async fn read_each(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        properties: &[PropertyIdentifier],
    ) -> bool {
        let Some(address) = self.address(device) else {
            return false;
        };

        tracing::debug!(device = %device, object = %object, "Read");

        let reads = properties
            .iter()
            .map(|property| self.read_one(&address, device, object, property));
        join_all(reads).await.into_iter().all(|ok| ok)
    }

    async fn read_one(
        &self,
        address: &Address,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
    ) -> bool {
        match self.read_raw(address, object, property, None).await {
            Ok(raw) => {
                if let Some(value) = sanitize(&raw) {
                    self.dictionary.merge_property(device, object, property, value);
                }
                true
            }
            Err(ProtocolError::SegmentationNotSupported) => {
                self.read_indexed(address, device, object, property).await
            }
            Err(ProtocolError::UnknownProperty) => true,
            Err(e) => {
                tracing::warn!(device = %device, object = %object, property = %property, error = %e, "Read failed");
                false
            }
        }
    }

    /// Read an array property element by element: length at index 0, then
    /// each index
    async fn read_indexed(
        &self,
        address: &Address,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
    ) -> bool {
        tracing::debug!(device = %device, object = %object, property = %property, "Read list property");

        let len = match self.read_raw(address, object, property, Some(0)).await {
            Ok(RawValue::Unsigned(n)) if n > 0 => n,
            Ok(other) => {
                tracing::debug!(device = %device, object = %object, property = %property, value = ?other, "Empty or invalid list length");
                return false;
            }
            Err(e) => {
                tracing::warn!(device = %device, object = %object, property = %property, error = %e, "Error reading list size");
                return false;
            }
        };
        let Ok(len) = u32::try_from(len) else {
            return false;
        };

        let reads = (1..=len).map(|index| self.read_raw(address, object, property, Some(index)));
        let items: ReadResult<Vec<RawValue>> = join_all(reads).await.into_iter().collect();

        match items {
            Ok(items) => {
                if let Some(value) = sanitize(&RawValue::Array(items)) {
                    self.dictionary.merge_property(device, object, property, value);
                }
                true
            }
            Err(e) => {
                tracing::warn!(device = %device, object = %object, property = %property, error = %e, "Error reading list element");
                false
            }
        }
    }
}

fn property_name(raw: &RawValue) -> Option<PropertyIdentifier> {
    match raw {
        RawValue::Enumerated { name: Some(name), .. } => Some(PropertyIdentifier::new(name.as_str())),
        RawValue::CharacterString(name) => Some(PropertyIdentifier::new(name.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::{OBJECT_PROPERTIES, SimDevice, SimulatedNetwork};
    use crate::types::ObjectType;
    use serde_json::json;
    use std::time::Duration;

    fn ai(i: u32) -> ObjectIdentifier {
        ObjectIdentifier::new(ObjectType::ANALOG_INPUT, i)
    }

    fn reader_for(device: SimDevice, permits: usize) -> (PropertyReader, Arc<DeviceDictionary>) {
        let network: Arc<dyn FieldbusClient> = Arc::new(SimulatedNetwork::with_devices([device]));
        let dictionary = Arc::new(DeviceDictionary::new());
        let reader = PropertyReader::new(network, Arc::clone(&dictionary), Arc::new(Semaphore::new(permits)));
        (reader, dictionary)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_stay_within_limit() {
        let mut device = SimDevice::new(10, "10.0.0.10").without_read_multiple();
        for i in 0..30 {
            device = device.with_analog(ai(i), i as f32);
        }
        let network = Arc::new(SimulatedNetwork::with_devices([device]));
        network.set_read_delay(Duration::from_millis(100));
        let reader = PropertyReader::new(
            network.clone(),
            Arc::new(DeviceDictionary::new()),
            Arc::new(Semaphore::new(3)),
        );

        let dev = ObjectIdentifier::device(10);
        let objects: Vec<ObjectIdentifier> = (0..30).map(ai).collect();
        let present_value = PropertyIdentifier::PRESENT_VALUE;
        let results = join_all(
            objects
                .iter()
                .map(|object| reader.read_value(&dev, object, &present_value)),
        )
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(network.max_concurrent_reads(), 3);
    }

    #[tokio::test]
    async fn test_property_list_intersects_wanted() {
        let (reader, _) = reader_for(SimDevice::new(10, "10.0.0.10").with_analog(ai(0), 1.0), 4);
        let props = reader
            .readable_properties(&ObjectIdentifier::device(10), &ai(0), OBJECT_PROPERTIES)
            .await;

        assert!(props.contains(&PropertyIdentifier::PRESENT_VALUE));
        assert!(props.contains(&PropertyIdentifier::OBJECT_NAME));
        assert!(!props.contains(&PropertyIdentifier::new("relinquishDefault")));
    }

    #[tokio::test]
    async fn test_property_list_fallback() {
        let device = SimDevice::new(10, "10.0.0.10").with_analog(ai(0), 1.0).without_property_list();
        let (reader, _) = reader_for(device, 4);
        let props = reader
            .property_list(&ObjectIdentifier::device(10), &ai(0), OBJECT_PROPERTIES)
            .await;
        assert_eq!(props, OBJECT_PROPERTIES.to_vec());
    }

    #[tokio::test]
    async fn test_batch_falls_back_to_single_reads() {
        let device = SimDevice::new(10, "10.0.0.10").with_analog(ai(0), 21.5).without_read_multiple();
        let (reader, dictionary) = reader_for(device, 2);
        let dev = ObjectIdentifier::device(10);

        let ok = reader
            .read_multiple(&dev, &ai(0), &[PropertyIdentifier::PRESENT_VALUE, PropertyIdentifier::new("notThere")])
            .await;

        assert!(ok);
        assert_eq!(
            dictionary.get(&dev, &ai(0), &PropertyIdentifier::PRESENT_VALUE),
            Some(json!(21.5))
        );
        assert!(!reader.supports_read_multiple(&dev));
    }

    #[tokio::test]
    async fn test_segmented_list_read_by_index() {
        let mut device = SimDevice::new(10, "10.0.0.10").without_segmentation();
        for i in 0..7 {
            device = device.with_analog(ai(i), 0.0);
        }
        let (reader, dictionary) = reader_for(device, 3);
        let dev = ObjectIdentifier::device(10);

        assert!(reader.read_each(&dev, &dev, &[PropertyIdentifier::OBJECT_LIST]).await);
        assert_eq!(dictionary.object_list(&dev).unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_silent_device_fails_read() {
        let network = Arc::new(SimulatedNetwork::with_devices([SimDevice::new(10, "10.0.0.10").with_analog(ai(0), 1.0)]));
        network.set_responsive(&ObjectIdentifier::device(10), false);
        let dictionary = Arc::new(DeviceDictionary::new());
        let reader = PropertyReader::new(network, Arc::clone(&dictionary), Arc::new(Semaphore::new(1)));

        let dev = ObjectIdentifier::device(10);
        assert!(!reader.read_multiple(&dev, &ai(0), &[PropertyIdentifier::PRESENT_VALUE]).await);
        assert!(!reader.read_each(&dev, &ai(0), &[PropertyIdentifier::PRESENT_VALUE]).await);
        assert!(dictionary.devices().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_device_fails_read() {
        let (reader, _) = reader_for(SimDevice::new(10, "10.0.0.10"), 1);
        assert!(!reader.read_multiple(&ObjectIdentifier::device(99), &ai(0), &[PropertyIdentifier::PRESENT_VALUE]).await);
    }
}
