//! Reconciler
//!
//! Creates the subscription and poll tasks a [`ResolvedConfiguration`] asks
//! for. Tasks that already exist under the same name are left alone, so
//! running it twice creates nothing the second time.

use std::sync::Arc;
use std::time::Duration;

use bacsync_runtime::{TaskError, TaskRegistry};

use crate::bacnet::is_subscribable;
use crate::context::SyncContext;
use crate::policy::ResolvedConfiguration;
use crate::types::ObjectIdentifier;

use super::{PollTask, SubscriptionTask, poll_name, subscription_name};

pub struct Reconciler {
    ctx: SyncContext,
    registry: Arc<TaskRegistry>,
}

impl Reconciler {
    pub fn new(ctx: SyncContext, registry: Arc<TaskRegistry>) -> Self {
        Self { ctx, registry }
    }

    /// Create missing tasks and return how many were started
    ///
    /// On the first run everything is created. Afterwards polls are only
    /// recreated with `reread_on_iam` and subscriptions with `resub_on_iam`.
    pub async fn reconcile(&self, config: &ResolvedConfiguration, first_run: bool) -> usize {
        let mut created = 0;

        if first_run || config.resub_on_iam {
            created += self.create_subscriptions(config).await;
        }
        if first_run || config.reread_on_iam {
            created += self
                .create_polls(&config.device, &config.poll_items_quick, config.poll_rate_quick)
                .await;
            created += self
                .create_polls(&config.device, &config.poll_items_slow, config.poll_rate_slow)
                .await;
        }

        if created > 0 {
            tracing::info!(device = %config.device, created, first_run, "Reconciled tasks");
        }
        created
    }

    async fn create_subscriptions(&self, config: &ResolvedConfiguration) -> usize {
        let device = &config.device;
        let mut created = 0;

        for object in &config.cov_items {
            if self.registry.is_closed() {
                break;
            }
            if !self.admissible(device, object) {
                continue;
            }
            if !is_subscribable(&object.object_type) {
                tracing::warn!(device = %device, object = %object, "Object type does not support subscriptions");
                continue;
            }
            if self.registry.contains(&subscription_name(device, object, true)) {
                continue;
            }

            let task = SubscriptionTask::new(
                self.ctx.clone(),
                device.clone(),
                object.clone(),
                true,
                config.cov_lifetime,
            );
            if self.started(self.registry.spawn(task).map(|_| ()), object) {
                created += 1;
                self.pace().await;
            }
        }

        created
    }

    async fn create_polls(&self, device: &ObjectIdentifier, objects: &[ObjectIdentifier], rate: Duration) -> usize {
        let mut created = 0;

        for object in objects {
            if self.registry.is_closed() {
                break;
            }
            if !self.admissible(device, object) {
                continue;
            }
            if self.registry.contains(&poll_name(device, object)) {
                continue;
            }
            if !self.ctx.dictionary.contains_object(device, object) {
                tracing::warn!(device = %device, object = %object, "Object not in dictionary, not polling");
                continue;
            }

            let task = PollTask::new(self.ctx.clone(), device.clone(), object.clone(), rate);
            if self.started(self.registry.spawn(task).map(|_| ()), object) {
                created += 1;
                self.pace().await;
            }
        }

        created
    }

    fn admissible(&self, device: &ObjectIdentifier, object: &ObjectIdentifier) -> bool {
        object != device
            && !self.ctx.options.is_ignored(&object.object_type)
            && self.ctx.client.knows_object_type(&object.object_type)
    }

    fn started(&self, result: Result<(), TaskError>, object: &ObjectIdentifier) -> bool {
        match result {
            Ok(()) => true,
            // lost a race with a concurrent reconcile
            Err(TaskError::AlreadyRunning(_)) => false,
            Err(TaskError::Closed) => false,
            Err(e) => {
                tracing::warn!(object = %object, error = %e, "Failed to start task");
                false
            }
        }
    }

    async fn pace(&self) {
        let delay = self.ctx.options.task_spawn_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
