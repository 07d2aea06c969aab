//! Write Bridge
//!
//! Decides what happens to a write arriving from the field network for one of
//! the engine's own objects. Present-value writes on an in-service object are
//! handed to the application over a channel and answered with its verdict;
//! configuration writes are applied to the dictionary directly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::bacnet::{RawValue, sanitize};
use crate::dictionary::DeviceDictionary;
use crate::types::{ObjectIdentifier, PropertyIdentifier};

/// Protocol-level answer to an incoming write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteVerdict {
    Ack,
    Reject,
}

/// How a write is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Hand to the application and mirror its verdict
    Forward,
    /// Apply to the dictionary and acknowledge
    Apply,
    Reject,
}

/// Routing rule for a write to `property` on an object whose out-of-service
/// flag is `out_of_service`
pub fn route(property: &PropertyIdentifier, out_of_service: bool) -> Route {
    if *property == PropertyIdentifier::PRESENT_VALUE {
        if out_of_service { Route::Apply } else { Route::Forward }
    } else if *property == PropertyIdentifier::COV_INCREMENT || *property == PropertyIdentifier::OUT_OF_SERVICE {
        Route::Apply
    } else {
        Route::Reject
    }
}

/// A write received from the field network
#[derive(Debug, Clone)]
pub struct IncomingWrite {
    pub object: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub value: RawValue,
    pub array_index: Option<u32>,
    pub priority: Option<u8>,
}

/// A write waiting for the application's verdict
#[derive(Debug)]
pub struct BridgedWrite {
    pub object: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub value: Value,
    pub array_index: Option<u32>,
    pub priority: Option<u8>,
    reply: oneshot::Sender<WriteVerdict>,
}

impl BridgedWrite {
    pub fn ack(self) {
        let _ = self.reply.send(WriteVerdict::Ack);
    }

    pub fn reject(self) {
        let _ = self.reply.send(WriteVerdict::Reject);
    }
}

pub struct WriteBridge {
    dictionary: Arc<DeviceDictionary>,
    local_device: ObjectIdentifier,
    tx: mpsc::Sender<BridgedWrite>,
    verdict_timeout: Duration,
}

impl WriteBridge {
    /// Create a bridge and the receiver the application answers writes on
    pub fn new(
        dictionary: Arc<DeviceDictionary>,
        local_device: ObjectIdentifier,
        verdict_timeout: Duration,
    ) -> (Self, mpsc::Receiver<BridgedWrite>) {
        let (tx, rx) = mpsc::channel(64);
        let bridge = Self {
            dictionary,
            local_device,
            tx,
            verdict_timeout,
        };
        (bridge, rx)
    }

    pub fn local_device(&self) -> &ObjectIdentifier {
        &self.local_device
    }

    pub async fn handle(&self, write: IncomingWrite) -> WriteVerdict {
        if !self.dictionary.contains_object(&self.local_device, &write.object) {
            tracing::warn!(object = %write.object, "Write to unknown local object");
            return WriteVerdict::Reject;
        }

        let out_of_service = self
            .dictionary
            .get(&self.local_device, &write.object, &PropertyIdentifier::OUT_OF_SERVICE)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let decision = route(&write.property, out_of_service);
        if decision == Route::Reject {
            tracing::warn!(object = %write.object, property = %write.property, "Rejecting write");
            return WriteVerdict::Reject;
        }

        let Some(value) = sanitize(&write.value) else {
            tracing::warn!(object = %write.object, property = %write.property, "Rejecting unusable value");
            return WriteVerdict::Reject;
        };

        let verdict = match decision {
            Route::Forward => self.forward(&write, value.clone()).await,
            _ => WriteVerdict::Ack,
        };

        if verdict == WriteVerdict::Ack {
            self.dictionary
                .merge_property(&self.local_device, &write.object, &write.property, value);
        }
        tracing::debug!(object = %write.object, property = %write.property, ?verdict, "Handled write");
        verdict
    }

    async fn forward(&self, write: &IncomingWrite, value: Value) -> WriteVerdict {
        let (reply, verdict) = oneshot::channel();
        let bridged = BridgedWrite {
            object: write.object.clone(),
            property: write.property.clone(),
            value,
            array_index: write.array_index,
            priority: write.priority,
            reply,
        };

        if self.tx.send(bridged).await.is_err() {
            tracing::warn!(object = %write.object, "No application listening for writes");
            return WriteVerdict::Reject;
        }

        match tokio::time::timeout(self.verdict_timeout, verdict).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => WriteVerdict::Reject,
            Err(_) => {
                tracing::warn!(object = %write.object, "No write verdict in time");
                WriteVerdict::Reject
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn av1() -> ObjectIdentifier {
        "analogValue:1".parse().unwrap()
    }

    fn setup(out_of_service: bool) -> (WriteBridge, mpsc::Receiver<BridgedWrite>, Arc<DeviceDictionary>) {
        let dictionary = Arc::new(DeviceDictionary::new());
        let local = ObjectIdentifier::device(60);
        dictionary.merge_property(&local, &av1(), &PropertyIdentifier::PRESENT_VALUE, json!(20.0));
        dictionary.merge_property(&local, &av1(), &PropertyIdentifier::OUT_OF_SERVICE, json!(out_of_service));

        let (bridge, rx) = WriteBridge::new(dictionary.clone(), local, Duration::from_secs(10));
        (bridge, rx, dictionary)
    }

    fn write(property: PropertyIdentifier, value: RawValue) -> IncomingWrite {
        IncomingWrite {
            object: av1(),
            property,
            value,
            array_index: None,
            priority: None,
        }
    }

    fn present_value(dictionary: &DeviceDictionary) -> Option<Value> {
        dictionary.get(&ObjectIdentifier::device(60), &av1(), &PropertyIdentifier::PRESENT_VALUE)
    }

    #[test]
    fn test_route() {
        assert_eq!(route(&PropertyIdentifier::PRESENT_VALUE, false), Route::Forward);
        assert_eq!(route(&PropertyIdentifier::PRESENT_VALUE, true), Route::Apply);
        assert_eq!(route(&PropertyIdentifier::COV_INCREMENT, false), Route::Apply);
        assert_eq!(route(&PropertyIdentifier::OUT_OF_SERVICE, false), Route::Apply);
        assert_eq!(route(&PropertyIdentifier::OBJECT_NAME, true), Route::Reject);
    }

    #[tokio::test]
    async fn test_rejected_forward_is_not_merged() {
        let (bridge, mut rx, dictionary) = setup(false);

        let app = tokio::spawn(async move {
            let bridged = rx.recv().await.unwrap();
            assert_eq!(bridged.value, json!(22.5));
            bridged.reject();
        });

        let verdict = bridge
            .handle(write(PropertyIdentifier::PRESENT_VALUE, RawValue::Real(22.5)))
            .await;
        app.await.unwrap();

        assert_eq!(verdict, WriteVerdict::Reject);
        assert_eq!(present_value(&dictionary), Some(json!(20.0)));
    }

    #[tokio::test]
    async fn test_acked_forward_is_merged() {
        let (bridge, mut rx, dictionary) = setup(false);

        tokio::spawn(async move {
            while let Some(bridged) = rx.recv().await {
                bridged.ack();
            }
        });

        let verdict = bridge
            .handle(write(PropertyIdentifier::PRESENT_VALUE, RawValue::Real(22.5)))
            .await;

        assert_eq!(verdict, WriteVerdict::Ack);
        assert_eq!(present_value(&dictionary), Some(json!(22.5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_verdict_rejects() {
        let (bridge, _rx, dictionary) = setup(false);

        let verdict = bridge
            .handle(write(PropertyIdentifier::PRESENT_VALUE, RawValue::Real(22.5)))
            .await;

        assert_eq!(verdict, WriteVerdict::Reject);
        assert_eq!(present_value(&dictionary), Some(json!(20.0)));
    }

    #[tokio::test]
    async fn test_out_of_service_applies_directly() {
        let (bridge, mut rx, dictionary) = setup(true);

        let verdict = bridge
            .handle(write(PropertyIdentifier::PRESENT_VALUE, RawValue::Real(18.0)))
            .await;

        assert_eq!(verdict, WriteVerdict::Ack);
        assert_eq!(present_value(&dictionary), Some(json!(18.0)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_object_and_property_rejected() {
        let (bridge, _rx, _dictionary) = setup(true);

        let mut unknown = write(PropertyIdentifier::PRESENT_VALUE, RawValue::Real(1.0));
        unknown.object = "analogValue:99".parse().unwrap();
        assert_eq!(bridge.handle(unknown).await, WriteVerdict::Reject);

        let name = write(PropertyIdentifier::OBJECT_NAME, RawValue::CharacterString("x".into()));
        assert_eq!(bridge.handle(name).await, WriteVerdict::Reject);
    }
}
