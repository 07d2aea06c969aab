//! Engine
//!
//! Owns the dictionary, the task registry and everything that feeds them.
//! `Engine::run` restores the snapshot, sweeps the network with who-is,
//! explores and reconciles every device it hears from, then serves
//! announcements and [`EngineHandle`] commands until shut down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use bacsync_runtime::{TaskError, TaskRegistry, TaskState};

use crate::bacnet::{
    Announce, DEVICE_PROPERTIES, FieldbusClient, OBJECT_PROPERTIES, RawValue, sanitize,
};
use crate::bridge::{BridgedWrite, IncomingWrite, WriteBridge, WriteVerdict};
use crate::config::EngineOptions;
use crate::context::SyncContext;
use crate::dictionary::Node;
use crate::explorer::Explorer;
use crate::policy::{self, ResolvedConfiguration};
use crate::store::SnapshotStore;
use crate::tasks::{Reconciler, SUBSCRIPTION_KIND, SubscriptionTask, subscription_prefix};
use crate::types::{Error, ObjectIdentifier, ObjectType, PropertyIdentifier, Result};

/// An application-originated write to a field device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub device: ObjectIdentifier,
    pub object: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub value: Value,
    #[serde(default)]
    pub array_index: Option<u32>,
    /// Falls back to the configured default priority
    #[serde(default)]
    pub priority: Option<u8>,
}

enum EngineCommand {
    WhoIs {
        reply: oneshot::Sender<usize>,
    },
    RereadAll {
        reply: oneshot::Sender<usize>,
    },
    Subscribe {
        device: ObjectIdentifier,
        object: ObjectIdentifier,
        confirmed: bool,
        lifetime: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        device: ObjectIdentifier,
        object: ObjectIdentifier,
        reply: oneshot::Sender<Result<usize>>,
    },
    Write {
        request: WriteRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    IncomingWrite {
        write: IncomingWrite,
        reply: oneshot::Sender<WriteVerdict>,
    },
    Shutdown,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

pub struct Engine {
    inner: Arc<EngineInner>,
    commands: mpsc::Receiver<EngineCommand>,
    announcements: broadcast::Receiver<Announce>,
}

struct EngineInner {
    ctx: SyncContext,
    registry: Arc<TaskRegistry>,
    explorer: Explorer,
    reconciler: Reconciler,
    bridge: WriteBridge,
    store: Option<SnapshotStore>,

    /// Last resolved policy per device
    resolved: DashMap<ObjectIdentifier, ResolvedConfiguration>,
    /// Devices with an exploration in flight
    exploring: DashSet<ObjectIdentifier>,
    discovery_complete: AtomicBool,
    ready: watch::Sender<bool>,
}

impl Engine {
    /// Create the engine, a handle to it, and the receiver the application
    /// answers bridged writes on
    pub fn new(
        options: EngineOptions,
        client: Arc<dyn FieldbusClient>,
        store: Option<SnapshotStore>,
    ) -> (Engine, EngineHandle, mpsc::Receiver<BridgedWrite>) {
        let announcements = client.announcements();
        let ctx = SyncContext::new(client, options);
        let registry = Arc::new(TaskRegistry::new());
        let (bridge, bridged) = WriteBridge::new(
            Arc::clone(&ctx.dictionary),
            ctx.options.local_device.clone(),
            ctx.options.write_verdict_timeout(),
        );
        let (ready, _) = watch::channel(false);

        let inner = Arc::new(EngineInner {
            explorer: Explorer::new(ctx.clone()),
            reconciler: Reconciler::new(ctx.clone(), Arc::clone(&registry)),
            ctx,
            registry,
            bridge,
            store,
            resolved: DashMap::new(),
            exploring: DashSet::new(),
            discovery_complete: AtomicBool::new(false),
            ready,
        });

        let (tx, commands) = mpsc::channel(64);
        let handle = EngineHandle {
            inner: Arc::clone(&inner),
            commands: tx,
        };
        let engine = Engine {
            inner,
            commands,
            announcements,
        };

        (engine, handle, bridged)
    }

    /// Run until [`EngineHandle::shutdown`] or until every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tracing::info!(local_device = %inner.local_device(), "Starting engine");

        if let Some(store) = &inner.store {
            if let Err(e) = store.restore(&inner.ctx.dictionary) {
                tracing::warn!(error = %e, "Failed to restore snapshot");
            }
        }
        inner.publish_local_device();

        // Discovery, announce handling and command replies; all of them may
        // spawn tasks, so they are stopped before the registry drains
        let mut workers = JoinSet::new();
        workers.spawn({
            let inner = Arc::clone(&inner);
            async move {
                let devices = inner.discover().await;
                inner.ready.send_replace(true);
                tracing::info!(devices, "Initial discovery complete");
            }
        });

        let snapshot_every = inner.ctx.options.snapshot_interval().max(Duration::from_secs(1));
        let mut snapshot_timer = tokio::time::interval(snapshot_every);
        snapshot_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        snapshot_timer.tick().await;
        let mut announcements_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.dispatch(&mut workers, command),
                },

                announce = self.announcements.recv(), if announcements_open => match announce {
                    Ok(announce) => {
                        let inner = Arc::clone(&inner);
                        workers.spawn(async move { inner.on_announce(announce).await });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Missed announcements");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        announcements_open = false;
                    }
                },

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Engine worker panicked");
                        }
                    }
                }

                _ = snapshot_timer.tick(), if inner.store.is_some() => {
                    inner.save_snapshot().await;
                }
            }
        }

        tracing::info!(workers = workers.len(), "Shutting down engine");
        workers.shutdown().await;
        if let Err(e) = inner.registry.shutdown_all().await {
            tracing::warn!(error = %e, "Some tasks did not shut down cleanly");
        }
        inner.save_snapshot().await;
        inner.ready.send_replace(false);

        Ok(())
    }

    fn dispatch(&self, workers: &mut JoinSet<()>, command: EngineCommand) {
        let inner = Arc::clone(&self.inner);
        workers.spawn(async move {
            match command {
                EngineCommand::WhoIs { reply } => {
                    let _ = reply.send(inner.discover().await);
                }
                EngineCommand::RereadAll { reply } => {
                    let _ = reply.send(inner.reread_all().await);
                }
                EngineCommand::Subscribe {
                    device,
                    object,
                    confirmed,
                    lifetime,
                    reply,
                } => {
                    let _ = reply.send(inner.subscribe(device, object, confirmed, lifetime));
                }
                EngineCommand::Unsubscribe { device, object, reply } => {
                    let _ = reply.send(inner.unsubscribe(&device, &object).await);
                }
                EngineCommand::Write { request, reply } => {
                    let _ = reply.send(inner.write(request).await);
                }
                EngineCommand::IncomingWrite { write, reply } => {
                    let _ = reply.send(inner.bridge.handle(write).await);
                }
                EngineCommand::Shutdown => {}
            }
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

impl EngineInner {
    fn local_device(&self) -> &ObjectIdentifier {
        self.bridge.local_device()
    }

    fn is_discovery_complete(&self) -> bool {
        self.discovery_complete.load(Ordering::SeqCst)
    }

    /// Who-is sweep; returns how many devices were handled
    async fn discover(&self) -> usize {
        let announced = self.ctx.client.who_is(self.ctx.options.who_is_timeout()).await;

        let mut devices: Vec<ObjectIdentifier> = Vec::new();
        for announce in announced {
            if announce.device != *self.local_device() && !devices.contains(&announce.device) {
                devices.push(announce.device);
            }
        }
        tracing::info!(devices = devices.len(), "Who-is answered");

        let prepared = join_all(devices.iter().map(|device| self.prepare(device))).await;
        self.discovery_complete.store(true, Ordering::SeqCst);

        let mut handled = 0;
        for (config, first_run) in prepared.into_iter().flatten() {
            self.reconciler.reconcile(&config, first_run).await;
            handled += 1;
        }
        handled
    }

    /// Known devices reuse their policy, new ones are explored first
    async fn prepare(&self, device: &ObjectIdentifier) -> Option<(ResolvedConfiguration, bool)> {
        if self.is_discovery_complete() && self.ctx.dictionary.is_known(device) {
            return Some((self.retrieve_config(device), false));
        }
        self.explore(device).await.map(|config| (config, true))
    }

    async fn on_announce(&self, announce: Announce) {
        if !self.is_discovery_complete() {
            tracing::debug!(device = %announce.device, "Announce before discovery finished, ignoring");
            return;
        }
        if announce.device == *self.local_device() {
            return;
        }

        tracing::debug!(device = %announce.device, address = %announce.address, "Device announced");
        if let Some((config, first_run)) = self.prepare(&announce.device).await {
            self.reconciler.reconcile(&config, first_run).await;
        }
    }

    async fn explore(&self, device: &ObjectIdentifier) -> Option<ResolvedConfiguration> {
        if !self.exploring.insert(device.clone()) {
            tracing::debug!(device = %device, "Already exploring");
            return None;
        }

        let state = self.explorer.explore(device).await;
        self.exploring.remove(device);

        if !state.is_success() {
            if self.ctx.dictionary.remove_device(device) {
                tracing::warn!(device = %device, "Removed partially explored device");
            }
            return None;
        }

        let config = self.resolve(device);
        self.resolved.insert(device.clone(), config.clone());
        Some(config)
    }

    fn retrieve_config(&self, device: &ObjectIdentifier) -> ResolvedConfiguration {
        if let Some(config) = self.resolved.get(device) {
            return config.clone();
        }
        let config = self.resolve(device);
        self.resolved.insert(device.clone(), config.clone());
        config
    }

    fn resolve(&self, device: &ObjectIdentifier) -> ResolvedConfiguration {
        let object_list = self.ctx.dictionary.object_list(device).unwrap_or_default();
        let client = &self.ctx.client;
        let known = |object_type: &ObjectType| client.knows_object_type(object_type);

        policy::resolve(
            device,
            &object_list,
            &self.ctx.options.devices_setup,
            &self.ctx.options.object_types_to_ignore,
            &known,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

impl EngineInner {
    /// Re-read the stored read-once properties of every remote object
    async fn reread_all(&self) -> usize {
        let reader = self.ctx.reader();
        let mut reads = Vec::new();

        for device in self.ctx.dictionary.devices() {
            if device == *self.local_device() {
                continue;
            }
            for object in self.ctx.dictionary.objects(&device) {
                let wanted = if object == device { DEVICE_PROPERTIES } else { OBJECT_PROPERTIES };
                let existing = self.ctx.dictionary.property_names(&device, &object);
                let properties: Vec<PropertyIdentifier> =
                    wanted.iter().filter(|p| existing.contains(p)).cloned().collect();
                reads.push((device.clone(), object, properties));
            }
        }

        let results = join_all(
            reads
                .iter()
                .map(|(device, object, properties)| reader.read_object(device, object, properties)),
        )
        .await;

        let ok = results.iter().filter(|ok| **ok).count();
        tracing::info!(objects = results.len(), ok, "Reread all objects");
        ok
    }

    fn subscribe(
        &self,
        device: ObjectIdentifier,
        object: ObjectIdentifier,
        confirmed: bool,
        lifetime: u32,
    ) -> Result<()> {
        if !self.ctx.dictionary.is_known(&device) {
            return Err(Error::NotFound(device.to_string()));
        }

        let prefix = subscription_prefix(&device, &object);
        if !self.registry.names_with_prefix(&prefix).is_empty() {
            return Err(TaskError::AlreadyRunning(prefix).into());
        }

        let task = SubscriptionTask::new(self.ctx.clone(), device, object, confirmed, lifetime);
        self.registry.spawn(task)?;
        Ok(())
    }

    async fn unsubscribe(&self, device: &ObjectIdentifier, object: &ObjectIdentifier) -> Result<usize> {
        let names = self.registry.names_with_prefix(&subscription_prefix(device, object));
        if names.is_empty() {
            return Err(Error::NotFound(format!("{device},{object}")));
        }

        let mut cancelled = 0;
        for name in names {
            match self.registry.cancel(&name).await {
                Ok(()) => cancelled += 1,
                Err(TaskError::NotRunning(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(cancelled)
    }

    async fn write(&self, request: WriteRequest) -> Result<()> {
        let address = self
            .ctx
            .client
            .address_for_device(&request.device)
            .ok_or_else(|| Error::NotFound(request.device.to_string()))?;
        let priority = request.priority.unwrap_or(self.ctx.options.default_priority);
        let value = RawValue::from_json(&request.object.object_type, &request.property, &request.value);

        self.ctx
            .client
            .write_property(
                &address,
                &request.object,
                &request.property,
                value,
                request.array_index,
                Some(priority),
            )
            .await?;
        tracing::debug!(
            device = %request.device,
            object = %request.object,
            property = %request.property,
            priority,
            "Wrote property"
        );

        match self
            .ctx
            .reader()
            .read_value(&request.device, &request.object, &request.property)
            .await
        {
            Ok(raw) => {
                if let Some(value) = sanitize(&raw) {
                    self.ctx
                        .dictionary
                        .merge_property(&request.device, &request.object, &request.property, value);
                }
            }
            Err(e) => {
                tracing::warn!(
                    device = %request.device,
                    object = %request.object,
                    property = %request.property,
                    error = %e,
                    "Read back after write failed"
                );
            }
        }

        Ok(())
    }

    /// Make sure the engine's own device object is in the dictionary
    fn publish_local_device(&self) {
        let device = self.local_device();
        let mut properties = vec![
            (PropertyIdentifier::OBJECT_IDENTIFIER, json!([device.object_type, device.instance])),
            (PropertyIdentifier::OBJECT_TYPE, json!(device.object_type)),
        ];
        if self.ctx.dictionary.get(device, device, &PropertyIdentifier::OBJECT_NAME).is_none() {
            properties.push((PropertyIdentifier::OBJECT_NAME, json!("bacsync")));
        }
        if self.ctx.dictionary.object_list(device).is_none() {
            properties.push((PropertyIdentifier::OBJECT_LIST, json!([[device.object_type, device.instance]])));
        }
        self.ctx.dictionary.merge(Node::object(device, device, properties));
    }

    fn publish_local(&self, object: &ObjectIdentifier, properties: Vec<(PropertyIdentifier, Value)>) {
        let device = self.local_device();
        let mut list = self.ctx.dictionary.object_list(device).unwrap_or_default();
        if !list.contains(object) {
            list.push(object.clone());
            let list: Vec<Value> = list
                .iter()
                .map(|o| json!([o.object_type, o.instance]))
                .collect();
            self.ctx.dictionary.merge_property(
                device,
                device,
                &PropertyIdentifier::OBJECT_LIST,
                Value::Array(list),
            );
        }
        self.ctx.dictionary.merge(Node::object(device, object, properties));
    }

    async fn save_snapshot(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let devices = self.ctx.dictionary.device_nodes();

        match tokio::task::spawn_blocking(move || store.save(devices)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to save snapshot"),
            Err(e) => tracing::warn!(error = %e, "Snapshot save panicked"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle used by the application layer
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::EngineStopped)?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Whole dictionary as JSON
    pub fn snapshot(&self) -> Value {
        self.inner.ctx.dictionary.snapshot()
    }

    pub fn device(&self, device: &ObjectIdentifier) -> Option<Value> {
        self.inner.ctx.dictionary.device(device)
    }

    pub fn object(&self, device: &ObjectIdentifier, object: &ObjectIdentifier) -> Option<Value> {
        self.inner.ctx.dictionary.object(device, object)
    }

    pub fn property(
        &self,
        device: &ObjectIdentifier,
        object: &ObjectIdentifier,
        property: &PropertyIdentifier,
    ) -> Option<Value> {
        self.inner.ctx.dictionary.get(device, object, property)
    }

    /// Fires after every dictionary merge
    pub fn updated(&self) -> watch::Receiver<u64> {
        self.inner.ctx.dictionary.updated()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Wait until the initial discovery has finished
    pub async fn ready(&self) -> Result<()> {
        let mut ready = self.inner.ready.subscribe();
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| Error::EngineStopped)
    }

    /// Sweep the network again; returns how many devices were handled
    pub async fn who_is(&self) -> Result<usize> {
        self.ask(|reply| EngineCommand::WhoIs { reply }).await
    }

    /// Announce the engine's own device
    pub async fn i_am(&self) -> Result<()> {
        self.inner.ctx.client.i_am().await?;
        Ok(())
    }

    /// Re-read every remote object; returns how many reads succeeded
    pub async fn reread_all(&self) -> Result<usize> {
        self.ask(|reply| EngineCommand::RereadAll { reply }).await
    }

    /// Start a subscription; fails if the object already has one
    pub async fn subscribe(
        &self,
        device: ObjectIdentifier,
        object: ObjectIdentifier,
        confirmed: bool,
        lifetime: u32,
    ) -> Result<()> {
        self.ask(|reply| EngineCommand::Subscribe {
            device,
            object,
            confirmed,
            lifetime,
            reply,
        })
        .await?
    }

    /// Cancel the object's subscriptions; returns how many were cancelled
    pub async fn unsubscribe(&self, device: ObjectIdentifier, object: ObjectIdentifier) -> Result<usize> {
        self.ask(|reply| EngineCommand::Unsubscribe { device, object, reply })
            .await?
    }

    /// Lifecycle state and status of every live subscription
    pub fn subscriptions(&self) -> Vec<(String, TaskState, Value)> {
        self.inner.registry.statuses_of_kind(SUBSCRIPTION_KIND)
    }

    pub async fn write(&self, request: WriteRequest) -> Result<()> {
        self.ask(|reply| EngineCommand::Write { request, reply }).await?
    }

    /// Route a write received from the field network
    pub async fn incoming_write(&self, write: IncomingWrite) -> Result<WriteVerdict> {
        self.ask(|reply| EngineCommand::IncomingWrite { write, reply }).await
    }

    /// Serve an object on the engine's own device
    pub fn publish_local(&self, object: &ObjectIdentifier, properties: Vec<(PropertyIdentifier, Value)>) {
        self.inner.publish_local(object, properties);
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| Error::EngineStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bacnet::{SimDevice, SimulatedNetwork};
    use crate::tasks::POLL_KIND;

    fn obj(s: &str) -> ObjectIdentifier {
        s.parse().unwrap()
    }

    fn device_10() -> SimDevice {
        SimDevice::new(10, "10.0.0.10")
            .with_analog(obj("analogInput:0"), 20.0)
            .with_analog(obj("analogValue:1"), 22.5)
    }

    fn options(setup: &str) -> EngineOptions {
        EngineOptions::from_json(&format!(r#"{{ "devices_setup": {setup} }}"#)).unwrap()
    }

    async fn start(
        network: Arc<SimulatedNetwork>,
        options: EngineOptions,
        store: Option<SnapshotStore>,
    ) -> (EngineHandle, mpsc::Receiver<BridgedWrite>, tokio::task::JoinHandle<Result<()>>) {
        let (engine, handle, bridged) = Engine::new(options, network, store);
        let running = tokio::spawn(engine.run());
        handle.ready().await.unwrap();
        (handle, bridged, running)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cov_all_creates_one_subscription_per_object() {
        let network = Arc::new(SimulatedNetwork::with_devices([device_10()]));
        let (handle, _bridged, running) = start(
            network,
            options(r#"[{ "deviceID": "all", "CoV_list": ["all"] }]"#),
            None,
        )
        .await;

        let mut names = handle.task_names();
        names.sort();
        assert_eq!(
            names,
            vec!["device:10,analogInput:0,confirmed", "device:10,analogValue:1,confirmed"]
        );
        assert!(handle.inner.registry.statuses_of_kind(POLL_KIND).is_empty());
        assert_eq!(handle.subscriptions().len(), 2);

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
        assert!(handle.task_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reannounce_creates_no_duplicates() {
        let network = Arc::new(SimulatedNetwork::with_devices([device_10()]));
        let (handle, _bridged, running) = start(
            network.clone(),
            options(r#"[{ "deviceID": "device:10", "CoV_list": ["analogInput:0"], "quick_poll_list": ["all"], "resub_on_iam": true, "reread_on_iam": true }]"#),
            None,
        )
        .await;
        assert_eq!(handle.task_names().len(), 2);

        assert!(network.announce(&ObjectIdentifier::device(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.who_is().await.unwrap(), 1);

        let mut names = handle.task_names();
        names.sort();
        assert_eq!(names, vec!["device:10,analogInput:0,confirmed", "device:10,analogValue:1"]);

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_device_explored_on_announce() {
        let network = Arc::new(SimulatedNetwork::with_devices([device_10()]));
        let (handle, _bridged, running) = start(network.clone(), EngineOptions::default(), None).await;
        let dev = ObjectIdentifier::device(20);
        assert!(handle.device(&dev).is_none());

        network.add_device(SimDevice::new(20, "10.0.0.20").with_binary(obj("binaryInput:3"), true));
        network.announce(&dev);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            handle.property(&dev, &obj("binaryInput:3"), &PropertyIdentifier::PRESENT_VALUE),
            Some(json!("active"))
        );

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_announcer_stays_absent() {
        let network = Arc::new(SimulatedNetwork::with_devices([device_10()]));
        let (handle, _bridged, running) = start(network.clone(), EngineOptions::default(), None).await;
        let dev = ObjectIdentifier::device(30);

        network.add_device(SimDevice::new(30, "10.0.0.30"));
        network.set_responsive(&dev, false);
        network.announce(&dev);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.device(&dev).is_none());
        assert!(handle.inner.exploring.is_empty());

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_reconcile_leaves_no_tasks() {
        let network = Arc::new(SimulatedNetwork::with_devices([device_10()]));
        let mut options = options(r#"[{ "deviceID": "all", "CoV_list": ["all"] }]"#);
        options.task_spawn_delay_ms = 50;
        let (handle, _bridged, running) = start(network.clone(), options, None).await;

        let dev = ObjectIdentifier::device(40);
        let mut large = SimDevice::new(40, "10.0.0.40");
        for i in 0..40 {
            large = large.with_analog(obj(&format!("analogValue:{i}")), i as f32);
        }
        network.add_device(large);
        network.announce(&dev);
        tokio::time::sleep(Duration::from_millis(120)).await;

        // part way through the announced device's subscriptions
        let live = handle.task_names().len();
        assert!(live > 2 && live < 42, "live tasks: {live}");

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
        assert!(handle.task_names().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.task_names().is_empty());
        assert_eq!(network.subscription_count(&dev), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_incoming_write_leaves_value() {
        let network = Arc::new(SimulatedNetwork::new());
        let (handle, mut bridged, running) = start(network, EngineOptions::default(), None).await;
        let local = ObjectIdentifier::device(60);
        let av1 = obj("analogValue:1");

        handle.publish_local(
            &av1,
            vec![
                (PropertyIdentifier::PRESENT_VALUE, json!(20.0)),
                (PropertyIdentifier::OUT_OF_SERVICE, json!(false)),
            ],
        );
        tokio::spawn(async move {
            while let Some(write) = bridged.recv().await {
                write.reject();
            }
        });

        let verdict = handle
            .incoming_write(IncomingWrite {
                object: av1.clone(),
                property: PropertyIdentifier::PRESENT_VALUE,
                value: RawValue::Real(22.5),
                array_index: None,
                priority: Some(8),
            })
            .await
            .unwrap();

        assert_eq!(verdict, WriteVerdict::Reject);
        assert_eq!(
            handle.property(&local, &av1, &PropertyIdentifier::PRESENT_VALUE),
            Some(json!(20.0))
        );
        assert_eq!(handle.inner.ctx.dictionary.object_list(&local).unwrap(), vec![local.clone(), av1]);

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_goes_out_and_reads_back() {
        let network = Arc::new(SimulatedNetwork::with_devices([device_10()]));
        let (handle, _bridged, running) = start(network.clone(), EngineOptions::default(), None).await;
        let dev = ObjectIdentifier::device(10);
        let av1 = obj("analogValue:1");

        handle
            .write(WriteRequest {
                device: dev.clone(),
                object: av1.clone(),
                property: PropertyIdentifier::PRESENT_VALUE,
                value: json!(21.5),
                array_index: None,
                priority: None,
            })
            .await
            .unwrap();

        let writes = network.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].priority, Some(15));
        assert_eq!(writes[0].value, RawValue::Real(21.5));
        assert_eq!(handle.property(&dev, &av1, &PropertyIdentifier::PRESENT_VALUE), Some(json!(21.5)));

        let missing = handle
            .write(WriteRequest {
                device: ObjectIdentifier::device(99),
                object: av1,
                property: PropertyIdentifier::PRESENT_VALUE,
                value: json!(1.0),
                array_index: None,
                priority: None,
            })
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_and_unsubscribe() {
        let network = Arc::new(SimulatedNetwork::with_devices([device_10()]));
        let (handle, _bridged, running) = start(network.clone(), EngineOptions::default(), None).await;
        let dev = ObjectIdentifier::device(10);
        let ai0 = obj("analogInput:0");

        handle.subscribe(dev.clone(), ai0.clone(), false, 300).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.task_names(), vec!["device:10,analogInput:0,unconfirmed"]);

        let duplicate = handle.subscribe(dev.clone(), ai0.clone(), true, 300).await;
        assert!(matches!(duplicate, Err(Error::Task(TaskError::AlreadyRunning(_)))));

        let (_, _, status) = &handle.subscriptions()[0];
        assert_eq!(status["confirmation"], json!("unconfirmed"));
        assert_eq!(status["address"], json!("10.0.0.10"));

        assert_eq!(handle.unsubscribe(dev.clone(), ai0.clone()).await.unwrap(), 1);
        assert!(handle.task_names().is_empty());
        assert_eq!(network.subscription_count(&dev), 0);

        let again = handle.unsubscribe(dev, ai0).await;
        assert!(matches!(again, Err(Error::NotFound(_))));

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reread_all_refreshes_values() {
        let network = Arc::new(SimulatedNetwork::with_devices([device_10()]));
        let (handle, _bridged, running) = start(network.clone(), EngineOptions::default(), None).await;
        let dev = ObjectIdentifier::device(10);
        let ai0 = obj("analogInput:0");

        network.set_value(&dev, &ai0, "presentValue", RawValue::Real(19.25));
        assert_eq!(handle.reread_all().await.unwrap(), 3);
        assert_eq!(handle.property(&dev, &ai0, &PropertyIdentifier::PRESENT_VALUE), Some(json!(19.25)));

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_saved_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.redb");
        let network = Arc::new(SimulatedNetwork::with_devices([device_10()]));

        let store = SnapshotStore::open(&path).unwrap();
        let (handle, _bridged, running) = start(network, EngineOptions::default(), Some(store.clone())).await;
        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();

        let keys: Vec<String> = store.load().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["device:10".to_string(), "device:60".to_string()]);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let network = Arc::new(SimulatedNetwork::new());
        let (handle, _bridged, running) = start(network, EngineOptions::default(), None).await;

        handle.shutdown().await.unwrap();
        running.await.unwrap().unwrap();

        assert!(matches!(handle.who_is().await, Err(Error::EngineStopped)));
        handle.i_am().await.unwrap();
    }
}
