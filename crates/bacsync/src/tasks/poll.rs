//! Poll Task
//!
//! Re-reads the periodic properties of one object at a fixed interval.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use bacsync_runtime::{Task, TaskContext, TaskResult, TaskSpec};

use crate::bacnet::PERIODIC_PROPERTIES;
use crate::context::SyncContext;
use crate::types::{ObjectIdentifier, PropertyIdentifier};

use super::{POLL_KIND, poll_name};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub struct PollTask {
    ctx: SyncContext,
    device: ObjectIdentifier,
    object: ObjectIdentifier,
    interval: Duration,
}

impl PollTask {
    pub fn new(ctx: SyncContext, device: ObjectIdentifier, object: ObjectIdentifier, interval: Duration) -> Self {
        Self {
            ctx,
            device,
            object,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn name(&self) -> String {
        poll_name(&self.device, &self.object)
    }

    /// Periodic properties the object is known to have, fixed at start
    fn properties(&self) -> Vec<PropertyIdentifier> {
        let existing = self.ctx.dictionary.property_names(&self.device, &self.object);
        let properties: Vec<PropertyIdentifier> = PERIODIC_PROPERTIES
            .iter()
            .filter(|p| existing.contains(p))
            .cloned()
            .collect();

        if properties.is_empty() {
            PERIODIC_PROPERTIES.to_vec()
        } else {
            properties
        }
    }
}

#[async_trait]
impl Task for PollTask {
    fn spec(&self) -> TaskSpec {
        TaskSpec::new(self.name()).with_kind(POLL_KIND)
    }

    async fn run(&mut self, ctx: &TaskContext) -> TaskResult<()> {
        let properties = self.properties();
        let reader = self.ctx.reader();
        let mut failures: u64 = 0;

        ctx.report(json!({
            "device": self.device,
            "object": self.object,
            "interval_secs": self.interval.as_secs_f64(),
            "properties": properties,
            "last_poll": null,
            "last_poll_ok": null,
            "failures": 0,
        }));

        loop {
            tokio::time::sleep(self.interval).await;

            let ok = reader.read_object(&self.device, &self.object, &properties).await;
            if ok {
                failures = 0;
            } else {
                failures += 1;
                tracing::warn!(device = %self.device, object = %self.object, failures, "Poll read failed");
            }

            ctx.report_field("last_poll", json!(Utc::now().to_rfc3339()));
            ctx.report_field("last_poll_ok", json!(ok));
            ctx.report_field("failures", json!(failures));
        }
    }
}
