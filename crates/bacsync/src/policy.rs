//! Policy Resolver
//!
//! Turns the configured policies into one concrete, de-duplicated
//! [`ResolvedConfiguration`] for a device.

use std::time::Duration;

use serde::Serialize;

use crate::config::{ALL, DeviceConfiguration};
use crate::types::{ObjectIdentifier, ObjectType};

/// Concrete monitoring plan for one device
///
/// `cov_items`, `poll_items_quick` and `poll_items_slow` are disjoint and never
/// contain the device's own identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfiguration {
    pub device: ObjectIdentifier,
    pub cov_items: Vec<ObjectIdentifier>,
    pub cov_lifetime: u32,
    pub poll_items_quick: Vec<ObjectIdentifier>,
    pub poll_rate_quick: Duration,
    pub poll_items_slow: Vec<ObjectIdentifier>,
    pub poll_rate_slow: Duration,
    pub resub_on_iam: bool,
    pub reread_on_iam: bool,
}

impl ResolvedConfiguration {
    pub fn is_empty(&self) -> bool {
        self.cov_items.is_empty() && self.poll_items_quick.is_empty() && self.poll_items_slow.is_empty()
    }
}

/// Pick the entry for `device`: its own entry, else the wildcard entry
/// rewritten for it, else an empty policy
pub fn select(device: &ObjectIdentifier, configs: &[DeviceConfiguration]) -> DeviceConfiguration {
    let key = device.to_string();

    if let Some(specific) = configs.iter().find(|c| c.device_id == key) {
        return specific.clone();
    }

    if let Some(wildcard) = configs.iter().find(|c| c.is_wildcard()) {
        return DeviceConfiguration {
            device_id: key,
            ..wildcard.clone()
        };
    }

    DeviceConfiguration::empty(key)
}

/// Resolve the policy for `device` against its object list
///
/// `ignore` and `known` filter what an `"all"` item expands to.
pub fn resolve(
    device: &ObjectIdentifier,
    object_list: &[ObjectIdentifier],
    configs: &[DeviceConfiguration],
    ignore: &[ObjectType],
    known: &dyn Fn(&ObjectType) -> bool,
) -> ResolvedConfiguration {
    let config = select(device, configs);

    let candidates: Vec<ObjectIdentifier> = object_list
        .iter()
        .filter(|obj| *obj != device)
        .filter(|obj| !ignore.contains(&obj.object_type))
        .filter(|obj| known(&obj.object_type))
        .cloned()
        .collect();

    let cov_items = expand(device, &config.cov_items, &candidates);
    let mut poll_items_quick = expand(device, &config.poll_items_quick, &candidates);
    let mut poll_items_slow = expand(device, &config.poll_items_slow, &candidates);

    // subscription beats quick poll beats slow poll
    poll_items_slow.retain(|obj| !poll_items_quick.contains(obj) && !cov_items.contains(obj));
    poll_items_quick.retain(|obj| !cov_items.contains(obj));

    ResolvedConfiguration {
        device: device.clone(),
        cov_items,
        cov_lifetime: config.cov_lifetime,
        poll_items_quick,
        poll_rate_quick: Duration::from_secs(config.poll_rate_quick),
        poll_items_slow,
        poll_rate_slow: Duration::from_secs(config.poll_rate_slow),
        resub_on_iam: config.resub_on_iam,
        reread_on_iam: config.reread_on_iam,
    }
}

fn expand(
    device: &ObjectIdentifier,
    items: &[String],
    candidates: &[ObjectIdentifier],
) -> Vec<ObjectIdentifier> {
    let mut out: Vec<ObjectIdentifier> = Vec::new();

    for item in items {
        if item == ALL {
            for obj in candidates {
                if !out.contains(obj) {
                    out.push(obj.clone());
                }
            }
            continue;
        }

        match item.parse::<ObjectIdentifier>() {
            Ok(obj) if obj == *device => {}
            Ok(obj) => {
                if !out.contains(&obj) {
                    out.push(obj);
                }
            }
            Err(e) => {
                tracing::warn!(device = %device, item = %item, error = %e, "Skipping invalid object in configuration");
            }
        }
    }

    out
}
