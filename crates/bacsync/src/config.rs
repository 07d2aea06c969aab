//! Engine Options
//!
//! Layered with figment: built-in defaults, then the JSON options file, then
//! `BACSYNC_` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};

use crate::types::{ObjectIdentifier, ObjectType, Result};

/// Key of the wildcard configuration entry
pub const ALL: &str = "all";

// ─────────────────────────────────────────────────────────────────────────────
// Device Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Monitoring policy for one device, or for every device when `device_id`
/// is `"all"`
///
/// Item lists hold object identifiers as strings; `"all"` stands for every
/// object of the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    #[serde(rename = "deviceID")]
    pub device_id: String,

    /// Subscription lifetime in seconds
    #[serde(rename = "CoV_lifetime", default = "default_cov_lifetime")]
    pub cov_lifetime: u32,

    #[serde(rename = "CoV_list", default)]
    pub cov_items: Vec<String>,

    /// Seconds between quick polls
    #[serde(rename = "quick_poll_rate", default = "default_quick_poll_rate")]
    pub poll_rate_quick: u64,

    #[serde(rename = "quick_poll_list", default)]
    pub poll_items_quick: Vec<String>,

    /// Seconds between slow polls
    #[serde(rename = "slow_poll_rate", default = "default_slow_poll_rate")]
    pub poll_rate_slow: u64,

    #[serde(rename = "slow_poll_list", default)]
    pub poll_items_slow: Vec<String>,

    #[serde(default)]
    pub resub_on_iam: bool,

    #[serde(default)]
    pub reread_on_iam: bool,
}

fn default_cov_lifetime() -> u32 {
    60
}

fn default_quick_poll_rate() -> u64 {
    10
}

fn default_slow_poll_rate() -> u64 {
    300
}

impl DeviceConfiguration {
    /// Configuration with no subscriptions and no polling
    pub fn empty(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            cov_lifetime: default_cov_lifetime(),
            cov_items: Vec::new(),
            poll_rate_quick: default_quick_poll_rate(),
            poll_items_quick: Vec::new(),
            poll_rate_slow: default_slow_poll_rate(),
            poll_items_slow: Vec::new(),
            resub_on_iam: false,
            reread_on_iam: false,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.device_id == ALL
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Options
// ─────────────────────────────────────────────────────────────────────────────

/// Global engine parameters plus the per-device policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Ordered device policies
    #[serde(default)]
    pub devices_setup: Vec<DeviceConfiguration>,

    /// Simultaneous in-flight reads against the network
    pub read_concurrency: usize,

    /// Priority for application writes that do not name one
    #[serde(rename = "defaultPriority")]
    pub default_priority: u8,

    pub object_types_to_ignore: Vec<ObjectType>,

    pub who_is_timeout_secs: u64,

    /// Wait for a notification before checking the subscription's health
    pub cov_value_timeout_secs: u64,

    /// Gap between task creations during reconciliation
    pub task_spawn_delay_ms: u64,

    /// How long a bridged write waits for the application's verdict
    pub write_verdict_timeout_secs: u64,

    pub snapshot_interval_secs: u64,

    pub snapshot_path: Option<PathBuf>,

    /// The engine's own device, owner of the locally served objects
    pub local_device: ObjectIdentifier,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            devices_setup: Vec::new(),
            read_concurrency: 20,
            default_priority: 15,
            object_types_to_ignore: vec![
                ObjectType::FILE,
                ObjectType::TREND_LOG,
                ObjectType::TREND_LOG_MULTIPLE,
                ObjectType::EVENT_LOG,
                ObjectType::NOTIFICATION_CLASS,
            ],
            who_is_timeout_secs: 5,
            cov_value_timeout_secs: 60,
            task_spawn_delay_ms: 1,
            write_verdict_timeout_secs: 10,
            snapshot_interval_secs: 300,
            snapshot_path: None,
            local_device: ObjectIdentifier::device(60),
        }
    }
}

impl EngineOptions {
    /// Provider chain: defaults, options file, environment
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Json::file(path));
        }
        figment.merge(Env::prefixed("BACSYNC_"))
    }

    /// Load options from an optional JSON file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let options = Self::figment(path).extract()?;
        Ok(options)
    }

    /// Defaults overlaid with a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let options = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Json::string(json))
            .extract()?;
        Ok(options)
    }

    pub fn who_is_timeout(&self) -> Duration {
        Duration::from_secs(self.who_is_timeout_secs)
    }

    pub fn cov_value_timeout(&self) -> Duration {
        Duration::from_secs(self.cov_value_timeout_secs)
    }

    pub fn task_spawn_delay(&self) -> Duration {
        Duration::from_millis(self.task_spawn_delay_ms)
    }

    pub fn write_verdict_timeout(&self) -> Duration {
        Duration::from_secs(self.write_verdict_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn is_ignored(&self, object_type: &ObjectType) -> bool {
        self.object_types_to_ignore.contains(object_type)
    }
}
