//! Device Dictionary
//!
//! The in-memory model: device → object → property → value. The only way to
//! change it is a deep merge of a path-shaped fragment; each merge call bumps
//! the `updated` counter once.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::types::{ObjectIdentifier, ObjectType, PropertyIdentifier};

// ─────────────────────────────────────────────────────────────────────────────
// Tree
// ─────────────────────────────────────────────────────────────────────────────

/// A node of the dictionary tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Map(BTreeMap<String, Node>),
    Value(Value),
}

impl Default for Node {
    fn default() -> Self {
        Node::Map(BTreeMap::new())
    }
}

impl Node {
    /// A fragment holding `value` at `path`
    pub fn at_path(path: &[&str], value: Value) -> Self {
        path.iter().rev().fold(Node::Value(value), |child, key| {
            Node::Map(BTreeMap::from([(key.to_string(), child)]))
        })
    }

    /// Fragment for a single property
    pub fn property(
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
        value: Value,
    ) -> Self {
        Self::at_path(
            &[&device.to_string(), &object.to_string(), property.as_str()],
            value,
        )
    }

    /// Fragment for several properties of one object
    pub fn object(
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        props: impl IntoIterator<Item = (PropertyIdentifier, Value)>,
    ) -> Self {
        let props = props
            .into_iter()
            .map(|(k, v)| (k.to_string(), Node::Value(v)))
            .collect();
        let objects = BTreeMap::from([(object.to_string(), Node::Map(props))]);
        Node::Map(BTreeMap::from([(device.to_string(), Node::Map(objects))]))
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Map(map) => map.get(key),
            Node::Value(_) => None,
        }
    }

    pub fn get_path(&self, path: &[&str]) -> Option<&Node> {
        path.iter().try_fold(self, |node, key| node.get(key))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Node::Value(v) => Some(v),
            Node::Map(_) => None,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self {
            Node::Map(map) => map.keys().cloned().collect(),
            Node::Value(_) => Vec::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Node::Value(v) => v.clone(),
            Node::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Merge `fragment` into `old`
///
/// Maps merge key by key; anything else in the fragment replaces what was
/// there. Keys absent from the fragment are left alone.
pub fn merge(mut old: Node, fragment: Node) -> Node {
    merge_into(&mut old, fragment);
    old
}

fn merge_into(target: &mut Node, fragment: Node) {
    match (target, fragment) {
        (Node::Map(existing), Node::Map(incoming)) => {
            for (key, child) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => merge_into(slot, child),
                    None => {
                        existing.insert(key, child);
                    }
                }
            }
        }
        (slot, fragment) => *slot = fragment,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Dictionary
// ─────────────────────────────────────────────────────────────────────────────

/// Shared, merge-only device model
pub struct DeviceDictionary {
    root: RwLock<Node>,
    updated: watch::Sender<u64>,
}

impl Default for DeviceDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDictionary {
    pub fn new() -> Self {
        let (updated, _) = watch::channel(0);
        Self {
            root: RwLock::new(Node::default()),
            updated,
        }
    }

    /// Deep-merge a fragment and raise the updated signal once
    pub fn merge(&self, fragment: Node) {
        merge_into(&mut self.root.write(), fragment);
        self.updated.send_modify(|n| *n += 1);
    }

    /// Merge a single property value
    pub fn merge_property(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
        value: Value,
    ) {
        self.merge(Node::property(device, object, property, value));
    }

    /// Receiver of the merge counter; `changed()` fires after each merge
    pub fn updated(&self) -> watch::Receiver<u64> {
        self.updated.subscribe()
    }

    /// Number of merges so far
    pub fn revision(&self) -> u64 {
        *self.updated.borrow()
    }

    pub fn get(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
    ) -> Option<Value> {
        self.root
            .read()
            .get_path(&[&device.to_string(), &object.to_string(), property.as_str()])
            .map(Node::to_json)
    }

    pub fn device(&self, device: &ObjectIdentifier) -> Option<Value> {
        self.root.read().get(&device.to_string()).map(Node::to_json)
    }

    pub fn object(&self, device: &ObjectIdentifier, object: &ObjectIdentifier) -> Option<Value> {
        self.root
            .read()
            .get_path(&[&device.to_string(), &object.to_string()])
            .map(Node::to_json)
    }

    pub fn contains_object(&self, device: &ObjectIdentifier, object: &ObjectIdentifier) -> bool {
        self.root
            .read()
            .get_path(&[&device.to_string(), &object.to_string()])
            .is_some()
    }

    /// A device is known once its own device object is present
    pub fn is_known(&self, device: &ObjectIdentifier) -> bool {
        self.contains_object(device, device)
    }

    /// Devices present in the dictionary
    pub fn devices(&self) -> Vec<ObjectIdentifier> {
        self.root
            .read()
            .keys()
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect()
    }

    /// Objects stored for a device
    pub fn objects(&self, device: &ObjectIdentifier) -> Vec<ObjectIdentifier> {
        self.root
            .read()
            .get(&device.to_string())
            .map(Node::keys)
            .unwrap_or_default()
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect()
    }

    /// Properties stored for an object
    pub fn property_names(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
    ) -> Vec<PropertyIdentifier> {
        self.root
            .read()
            .get_path(&[&device.to_string(), &object.to_string()])
            .map(Node::keys)
            .unwrap_or_default()
            .into_iter()
            .map(PropertyIdentifier::new)
            .collect()
    }

    /// The device's `objectList`, parsed back into identifiers
    pub fn object_list(&self, device: &ObjectIdentifier) -> Option<Vec<ObjectIdentifier>> {
        let list = self.get(device, device, &PropertyIdentifier::OBJECT_LIST)?;
        let items = list.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|item| {
                    let pair = item.as_array()?;
                    let object_type = pair.first()?.as_str()?;
                    let instance = pair.get(1)?.as_u64()?;
                    Some(ObjectIdentifier::new(
                        ObjectType::new(object_type),
                        u32::try_from(instance).ok()?,
                    ))
                })
                .collect(),
        )
    }

    /// Drop a device's entry; raises the updated signal if there was one
    pub fn remove_device(&self, device: &ObjectIdentifier) -> bool {
        let removed = match &mut *self.root.write() {
            Node::Map(map) => map.remove(&device.to_string()).is_some(),
            Node::Value(_) => false,
        };
        if removed {
            self.updated.send_modify(|n| *n += 1);
        }
        removed
    }

    /// Copy of the whole tree as JSON
    pub fn snapshot(&self) -> Value {
        self.root.read().to_json()
    }

    /// Copy of every device subtree, keyed by device
    pub fn device_nodes(&self) -> Vec<(String, Node)> {
        match &*self.root.read() {
            Node::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Node::Value(_) => Vec::new(),
        }
    }
}
