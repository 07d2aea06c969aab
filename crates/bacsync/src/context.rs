//! Shared handles passed to the explorer and the background tasks

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::bacnet::FieldbusClient;
use crate::config::EngineOptions;
use crate::dictionary::DeviceDictionary;
use crate::reader::PropertyReader;

/// Everything a sync task needs; cheap to clone
#[derive(Clone)]
pub struct SyncContext {
    pub client: Arc<dyn FieldbusClient>,
    pub dictionary: Arc<DeviceDictionary>,
    /// Caps in-flight reads and subscription renewals
    pub read_limit: Arc<Semaphore>,
    pub options: Arc<EngineOptions>,
}

impl SyncContext {
    pub fn new(client: Arc<dyn FieldbusClient>, options: EngineOptions) -> Self {
        Self {
            client,
            dictionary: Arc::new(DeviceDictionary::new()),
            read_limit: Arc::new(Semaphore::new(options.read_concurrency.max(1))),
            options: Arc::new(options),
        }
    }

    pub fn reader(&self) -> PropertyReader {
        PropertyReader::new(
            Arc::clone(&self.client),
            Arc::clone(&self.dictionary),
            Arc::clone(&self.read_limit),
        )
    }
}
