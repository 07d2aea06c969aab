//! Subscription Task
//!
//! Holds one change-of-value subscription: `starting → active ⇄ refreshing →
//! ending`. Notified values go through the sanitizer into the dictionary.
//! Renewal runs at 80 % of the lifetime in a spawned future; its outcome is
//! checked when the value wait times out or at the next renewal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use bacsync_runtime::{StopReason, Task, TaskContext, TaskError, TaskResult, TaskSpec};

use crate::bacnet::{
    CovNotification, CovRequest, PERIODIC_PROPERTIES, ProtocolError, ReadResult, sanitize,
};
use crate::context::SyncContext;
use crate::types::ObjectIdentifier;

use super::{SUBSCRIPTION_KIND, confirmation, subscription_name};

/// Upper bound of a subscriber process identifier
const MAX_PROCESS_ID: u32 = 0x003F_FFFF;

/// Bound for the unsubscribe round trip in `on_stop`
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SubscriptionTask {
    ctx: SyncContext,
    device: ObjectIdentifier,
    object: ObjectIdentifier,
    confirmed: bool,
    /// Seconds, 0 for indefinite
    lifetime: u32,

    /// Set once the device accepted the subscription
    active: Option<CovRequest>,
    refresh: Option<JoinHandle<ReadResult<()>>>,
}

impl SubscriptionTask {
    pub fn new(
        ctx: SyncContext,
        device: ObjectIdentifier,
        object: ObjectIdentifier,
        confirmed: bool,
        lifetime: u32,
    ) -> Self {
        Self {
            ctx,
            device,
            object,
            confirmed,
            lifetime,
            active: None,
            refresh: None,
        }
    }

    pub fn name(&self) -> String {
        subscription_name(&self.device, &self.object, self.confirmed)
    }

    fn renew_period(&self) -> Option<Duration> {
        (self.lifetime > 0).then(|| Duration::from_secs(u64::from(self.lifetime)).mul_f64(0.8))
    }

    fn apply(&self, notification: CovNotification) {
        if !PERIODIC_PROPERTIES.contains(&notification.property) {
            tracing::warn!(
                device = %self.device,
                object = %self.object,
                property = %notification.property,
                "Ignoring notified property"
            );
            return;
        }

        match sanitize(&notification.value) {
            Some(value) => {
                self.ctx
                    .dictionary
                    .merge_property(&self.device, &self.object, &notification.property, value);
            }
            None => {
                tracing::debug!(
                    device = %self.device,
                    object = %self.object,
                    property = %notification.property,
                    "Discarded notified value"
                );
            }
        }
    }

    /// Re-key the subscription if the device answers from a new address
    fn follow_migration(&mut self, ctx: &TaskContext) {
        let Some(request) = self.active.as_mut() else {
            return;
        };
        let Some(current) = self.ctx.client.address_for_device(&self.device) else {
            return;
        };
        if current == request.address {
            return;
        }

        tracing::info!(
            device = %self.device,
            object = %self.object,
            from = %request.address,
            to = %current,
            "Device moved, re-keying subscription"
        );
        self.ctx.client.rekey_cov(request, &current);
        request.address = current;
        ctx.report_field("address", json!(request.address));
    }

    fn spawn_refresh(&mut self, ctx: &TaskContext) {
        let Some(request) = self.active.clone() else {
            return;
        };
        let client = Arc::clone(&self.ctx.client);
        let read_limit = Arc::clone(&self.ctx.read_limit);

        self.refresh = Some(tokio::spawn(async move {
            let _permit = read_limit
                .acquire_owned()
                .await
                .map_err(|_| ProtocolError::Rejected("read limit closed".into()))?;
            client.renew_cov(&request).await
        }));
        ctx.report_field("state", json!("refreshing"));
    }

    /// Surface the outcome of a finished refresh
    async fn check_refresh(&mut self, ctx: &TaskContext) -> TaskResult<()> {
        if !self.refresh.as_ref().is_some_and(|h| h.is_finished()) {
            return Ok(());
        }
        let Some(handle) = self.refresh.take() else {
            return Ok(());
        };

        let outcome = match handle.await {
            Ok(result) => result,
            Err(e) => return Err(TaskError::Failed(format!("refresh panicked: {e}"))),
        };

        ctx.report_field("last_refresh", json!(Utc::now().to_rfc3339()));
        match outcome {
            Ok(()) => {
                ctx.report_field("last_refresh_ok", json!(true));
                ctx.report_field("state", json!("active"));
                Ok(())
            }
            Err(e) => {
                ctx.report_field("last_refresh_ok", json!(false));
                Err(TaskError::Failed(format!("refresh failed: {e}")))
            }
        }
    }
}

fn report_remaining(ctx: &TaskContext, next_renewal: Option<Instant>) {
    let remaining = next_renewal.map(|at| at.saturating_duration_since(Instant::now()).as_secs());
    ctx.report_field("lifetime_remaining", json!(remaining));
}

#[async_trait]
impl Task for SubscriptionTask {
    fn spec(&self) -> TaskSpec {
        TaskSpec::new(self.name())
            .with_kind(SUBSCRIPTION_KIND)
            .with_shutdown_timeout(UNSUBSCRIBE_TIMEOUT)
    }

    async fn run(&mut self, ctx: &TaskContext) -> TaskResult<()> {
        ctx.report(json!({
            "device": self.device,
            "object": self.object,
            "confirmation": confirmation(self.confirmed),
            "lifetime": self.lifetime,
            "lifetime_remaining": null,
            "state": "starting",
            "address": null,
            "last_refresh": null,
            "last_refresh_ok": null,
            "created_at": Utc::now().to_rfc3339(),
        }));

        let address = self
            .ctx
            .client
            .address_for_device(&self.device)
            .ok_or_else(|| TaskError::Failed(format!("no address for {}", self.device)))?;

        let request = CovRequest {
            device: self.device.clone(),
            address,
            object: self.object.clone(),
            process_id: rand::thread_rng().gen_range(1..=MAX_PROCESS_ID),
            confirmed: self.confirmed,
            lifetime: self.lifetime,
        };

        let subscribed = {
            let _permit = self
                .ctx
                .read_limit
                .acquire()
                .await
                .map_err(|_| TaskError::ChannelClosed)?;
            self.ctx.client.subscribe_cov(&request).await
        };
        let mut notifications = subscribed.map_err(|e| {
            tracing::error!(device = %self.device, object = %self.object, error = %e, "Subscribe failed");
            TaskError::Failed(e.to_string())
        })?;

        ctx.report_field("address", json!(request.address));
        ctx.report_field("state", json!("active"));
        self.active = Some(request);
        tracing::debug!(device = %self.device, object = %self.object, "Created subscription");

        let renew_period = self.renew_period();
        let mut next_renewal = renew_period.map(|period| Instant::now() + period);
        let value_timeout = self.ctx.options.cov_value_timeout();
        report_remaining(ctx, next_renewal);

        loop {
            let renewal = async move {
                match next_renewal {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = renewal => {
                    self.check_refresh(ctx).await?;
                    if self.refresh.is_none() {
                        self.spawn_refresh(ctx);
                    }
                    next_renewal = renew_period.map(|period| Instant::now() + period);
                    report_remaining(ctx, next_renewal);
                }

                received = tokio::time::timeout(value_timeout, notifications.recv()) => {
                    match received {
                        Ok(Some(notification)) => {
                            self.apply(notification);
                            report_remaining(ctx, next_renewal);
                        }
                        Ok(None) => {
                            return Err(TaskError::Failed("notification stream closed".into()));
                        }
                        Err(_) => {
                            self.follow_migration(ctx);
                            self.check_refresh(ctx).await?;
                            report_remaining(ctx, next_renewal);
                        }
                    }
                }
            }
        }
    }

    async fn on_stop(&mut self, ctx: &TaskContext, reason: &StopReason) -> TaskResult<()> {
        ctx.report_field("state", json!("ending"));

        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }

        match reason {
            StopReason::Cancelled => {
                tracing::info!(device = %self.device, object = %self.object, "Cancelling subscription");
            }
            StopReason::Failed(e) => {
                tracing::error!(device = %self.device, object = %self.object, error = %e, "Subscription ended");
            }
            StopReason::Finished => {}
        }

        if let Some(request) = self.active.take() {
            if let Err(e) = self.ctx.client.unsubscribe_cov(&request).await {
                tracing::warn!(device = %self.device, object = %self.object, error = %e, "Unsubscribe failed");
            }
        }

        Ok(())
    }
}
