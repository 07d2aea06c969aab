//! Snapshot store
//!
//! Persists the device dictionary in a redb database so a restart does not
//! need a full rediscovery before the model has data again. One row per
//! device: device key → JSON of its object map.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::dictionary::{DeviceDictionary, Node};
use crate::types::{Error, Result};

const DEVICES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

#[derive(Clone)]
pub struct SnapshotStore {
    db: Arc<Database>,
}

impl SnapshotStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)
            .map_err(|e| Error::Store(format!("Failed to open database: {}", e)))?;

        // Ensure table exists
        let write_txn = db.begin_write().map_err(|e| Error::Store(e.to_string()))?;
        write_txn
            .open_table(DEVICES_TABLE)
            .map_err(|e| Error::Store(e.to_string()))?;
        write_txn
            .commit()
            .map_err(|e| Error::Store(e.to_string()))?;

        tracing::info!(path = %path.display(), "Opened snapshot store");
        Ok(Self { db: Arc::new(db) })
    }

    /// Replace the stored snapshot with `devices`
    pub fn save(&self, devices: Vec<(String, Node)>) -> Result<usize> {
        let count = devices.len();

        let write_txn = self.db.begin_write().map_err(|e| Error::Store(e.to_string()))?;
        write_txn
            .delete_table(DEVICES_TABLE)
            .map_err(|e| Error::Store(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(DEVICES_TABLE)
                .map_err(|e| Error::Store(e.to_string()))?;
            for (key, node) in devices {
                let bytes = serde_json::to_vec(&node)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(|e| Error::Store(e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| Error::Store(e.to_string()))?;

        tracing::debug!(devices = count, "Saved snapshot");
        Ok(count)
    }

    /// Load the stored snapshot
    pub fn load(&self) -> Result<Vec<(String, Node)>> {
        let read_txn = self.db.begin_read().map_err(|e| Error::Store(e.to_string()))?;
        let table = read_txn
            .open_table(DEVICES_TABLE)
            .map_err(|e| Error::Store(e.to_string()))?;

        let mut devices = Vec::new();
        for entry in table.iter().map_err(|e| Error::Store(e.to_string()))? {
            let (key, value) = entry.map_err(|e| Error::Store(e.to_string()))?;
            let node: Node = serde_json::from_slice(value.value())?;
            devices.push((key.value().to_string(), node));
        }
        Ok(devices)
    }

    /// Merge the stored snapshot into `dictionary` in a single merge
    pub fn restore(&self, dictionary: &DeviceDictionary) -> Result<usize> {
        let devices = self.load()?;
        let count = devices.len();
        if count > 0 {
            let root: BTreeMap<String, Node> = devices.into_iter().collect();
            dictionary.merge(Node::Map(root));
            tracing::info!(devices = count, "Restored snapshot");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio_test::assert_ok;

    use crate::types::{ObjectIdentifier, PropertyIdentifier};

    #[test]
    fn test_save_and_restore() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(&dir.path().join("data/snapshot.redb")).unwrap();

        let source = DeviceDictionary::new();
        let dev = ObjectIdentifier::device(10);
        let ai0: ObjectIdentifier = "analogInput:0".parse().unwrap();
        source.merge_property(&dev, &ai0, &PropertyIdentifier::PRESENT_VALUE, json!(20.5));
        source.merge_property(&dev, &dev, &PropertyIdentifier::OBJECT_NAME, json!("AHU-1"));

        assert_eq!(assert_ok!(store.save(source.device_nodes())), 1);

        let target = DeviceDictionary::new();
        assert_eq!(assert_ok!(store.restore(&target)), 1);
        assert_eq!(target.snapshot(), source.snapshot());
        assert_eq!(target.revision(), 1);
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(&dir.path().join("snapshot.redb")).unwrap();
        let dictionary = DeviceDictionary::new();

        for instance in [10, 20] {
            let dev = ObjectIdentifier::device(instance);
            dictionary.merge_property(&dev, &dev, &PropertyIdentifier::OBJECT_NAME, json!("x"));
        }
        store.save(dictionary.device_nodes()).unwrap();

        dictionary.remove_device(&ObjectIdentifier::device(20));
        store.save(dictionary.device_nodes()).unwrap();

        let keys: Vec<String> = store.load().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["device:10".to_string()]);
    }

    #[test]
    fn test_empty_store_restores_nothing() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(&dir.path().join("snapshot.redb")).unwrap();
        let dictionary = DeviceDictionary::new();

        assert_eq!(store.restore(&dictionary).unwrap(), 0);
        assert_eq!(dictionary.revision(), 0);
    }
}
