//! Status patch helpers and event recording.

use std::fmt::Debug;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Api;
use kube::Resource;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::install::FIELD_MANAGER;

/// Merge-patch the status subresource of `name`.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<K, kube::Error>
where
    K: Clone + DeserializeOwned + Debug,
    S: Serialize + Debug,
{
    debug!(name, status = ?status, "Patching status");

    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
}

/// Event recorder bundled with its target `ObjectReference`.
pub struct EventRecorder {
    recorder: Recorder,
    obj_ref: ObjectReference,
}

impl EventRecorder {
    pub fn new<K>(client: kube::Client, obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            obj_ref: obj.object_ref(&()),
        }
    }

    /// Publish a Normal event. Failures are logged, never returned.
    pub async fn publish(&self, reason: &str, message: &str) {
        self.recorder
            .publish(&event(reason, message), &self.obj_ref)
            .await
            .unwrap_or_else(|e| tracing::warn!(reason, error = %e, "Failed to publish event"));
    }
}

fn event(reason: &str, message: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: reason.into(),
        note: Some(message.into()),
        action: reason.into(),
        secondary: None,
    }
}
