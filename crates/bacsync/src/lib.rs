//! bacsync - BACnet device state synchronization
//!
//! Keeps a live model of the devices on a BACnet network:
//! - Discovery and exploration of devices and their objects
//! - Per-device monitoring policy resolved into subscription and poll tasks
//! - A merge-only device dictionary with an update signal
//! - A write bridge between the field network and the application
//! - Snapshot persistence via redb

// Re-export the task runtime
pub use bacsync_runtime;

// Fieldbus seam, raw values and the simulator
pub mod bacnet;

pub mod bridge;
pub mod config;
pub mod context;
pub mod dictionary;
pub mod engine;
pub mod explorer;
pub mod policy;
pub mod reader;
pub mod store;

// Subscription and poll tasks
pub mod tasks;

pub mod types;

pub use bridge::{BridgedWrite, IncomingWrite, WriteVerdict};
pub use config::{DeviceConfiguration, EngineOptions};
pub use dictionary::DeviceDictionary;
pub use engine::{Engine, EngineHandle, WriteRequest};
pub use store::SnapshotStore;
pub use types::{Error, ObjectIdentifier, ObjectType, PropertyIdentifier, Result};
