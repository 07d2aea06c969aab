//! Explorer
//!
//! One-time discovery of a newly seen device:
//!
//! `Discovered → PropertyListKnown → DevicePropsRead → ObjectListRead → ObjectsExplored`
//!
//! or `Failed` when the device object cannot be read or has no object list.
//! Cleaning up a failed device's partial entry is the caller's job.

use std::fmt;

use futures::future::join_all;

use crate::bacnet::{DEVICE_PROPERTIES, OBJECT_PROPERTIES};
use crate::context::SyncContext;
use crate::reader::PropertyReader;
use crate::types::ObjectIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExploreState {
    Discovered,
    PropertyListKnown,
    DevicePropsRead,
    ObjectListRead,
    ObjectsExplored,
    Failed,
}

impl ExploreState {
    pub fn is_success(&self) -> bool {
        *self == ExploreState::ObjectsExplored
    }
}

impl fmt::Display for ExploreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExploreState::Discovered => "discovered",
            ExploreState::PropertyListKnown => "property-list-known",
            ExploreState::DevicePropsRead => "device-props-read",
            ExploreState::ObjectListRead => "object-list-read",
            ExploreState::ObjectsExplored => "objects-explored",
            ExploreState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct Explorer {
    ctx: SyncContext,
    reader: PropertyReader,
}

impl Explorer {
    pub fn new(ctx: SyncContext) -> Self {
        let reader = ctx.reader();
        Self { ctx, reader }
    }

    /// Run the discovery sequence and return the state it ended in
    pub async fn explore(&self, device: &ObjectIdentifier) -> ExploreState {
        let mut state = ExploreState::Discovered;
        tracing::info!(device = %device, "Exploring device");

        let properties = self
            .reader
            .readable_properties(device, device, DEVICE_PROPERTIES)
            .await;
        state = self.advance(device, state, ExploreState::PropertyListKnown);

        if !self.reader.read_multiple(device, device, &properties).await
            && !self.ctx.dictionary.is_known(device)
        {
            tracing::warn!(device = %device, "Failed to get device properties");
            return self.advance(device, state, ExploreState::Failed);
        }
        state = self.advance(device, state, ExploreState::DevicePropsRead);

        let Some(object_list) = self.ctx.dictionary.object_list(device) else {
            tracing::warn!(device = %device, "Device has no object list");
            return self.advance(device, state, ExploreState::Failed);
        };
        state = self.advance(device, state, ExploreState::ObjectListRead);

        let objects: Vec<ObjectIdentifier> = object_list
            .into_iter()
            .filter(|obj| obj != device)
            .filter(|obj| !self.ctx.options.is_ignored(&obj.object_type))
            .filter(|obj| {
                let known = self.ctx.client.knows_object_type(&obj.object_type);
                if !known {
                    tracing::warn!(device = %device, object = %obj, "Object type is unknown");
                }
                known
            })
            .collect();

        let results = join_all(objects.iter().map(|obj| self.explore_object(device, obj))).await;
        let failed = results.iter().filter(|ok| !**ok).count();
        if failed > 0 {
            tracing::warn!(device = %device, failed, total = objects.len(), "Some objects failed to read");
        }

        self.advance(device, state, ExploreState::ObjectsExplored)
    }

    async fn explore_object(&self, device: &ObjectIdentifier, object: &ObjectIdentifier) -> bool {
        let properties = self
            .reader
            .readable_properties(device, object, OBJECT_PROPERTIES)
            .await;
        self.reader.read_object(device, object, &properties).await
    }

    fn advance(&self, device: &ObjectIdentifier, from: ExploreState, to: ExploreState) -> ExploreState {
        tracing::debug!(device = %device, from = %from, to = %to, "Explore transition");
        to
    }
}
