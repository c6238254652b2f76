use crate::ResourceId;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use webapp_controller_k8s_api::{
    events::{Event, EventType, Recorder, Reporter},
    Api, Client, ObjectReference, Patch, PatchParams, WebApp, WebAppStatus, FIELD_MANAGER,
};

/// Reason attached to every lifecycle event.
pub const INSTANCE_CREATED_OR_UPDATED: &str = "InstanceCreatedOrUpdated";

/// Writes reconciliation progress back to the API server.
#[async_trait::async_trait]
pub trait StatusReporter: Send + Sync {
    /// Replaces the instance's status.
    ///
    /// When `resource_version` is set the write only succeeds against that
    /// version of the object.
    async fn patch_conditions(
        &self,
        id: &ResourceId,
        resource_version: Option<&str>,
        status: &WebAppStatus,
    ) -> Result<(), StatusError>;

    /// Records an event against the instance. Failures are logged, never
    /// returned.
    async fn record_event(&self, reference: &ObjectReference, event: LifecycleEvent);
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status was modified concurrently")]
    Conflict,

    #[error("status patch timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to patch status: {0}")]
    Api(#[from] webapp_controller_k8s_api::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Level {
    Normal,
    Warning,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub level: Level,
    pub reason: &'static str,
    pub message: &'static str,
}

/// Patches the `WebApp` status subresource and publishes Kubernetes events.
pub struct KubeReporter {
    client: Client,
    recorder: Recorder,
    patch_timeout: Duration,
}

// === impl LifecycleEvent ===

impl LifecycleEvent {
    pub const PENDING: Self = Self::normal("Pending");
    pub const RECONCILED: Self = Self::normal("Reconciled");
    pub const FAILED: Self = Self {
        level: Level::Warning,
        reason: INSTANCE_CREATED_OR_UPDATED,
        message: "Failed",
    };

    const fn normal(message: &'static str) -> Self {
        Self {
            level: Level::Normal,
            reason: INSTANCE_CREATED_OR_UPDATED,
            message,
        }
    }
}

// === impl KubeReporter ===

impl KubeReporter {
    pub fn new(client: Client, controller_name: impl ToString, patch_timeout: Duration) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            patch_timeout,
        }
    }
}

#[async_trait::async_trait]
impl StatusReporter for KubeReporter {
    async fn patch_conditions(
        &self,
        id: &ResourceId,
        resource_version: Option<&str>,
        status: &WebAppStatus,
    ) -> Result<(), StatusError> {
        let api = Api::<WebApp>::namespaced(self.client.clone(), &id.namespace);
        let patch = status_patch(resource_version, status);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        match time::timeout(
            self.patch_timeout,
            api.patch_status(&id.name, &params, &Patch::Merge(&patch)),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(webapp_controller_k8s_api::Error::Api(rsp))) if rsp.code == 409 => {
                Err(StatusError::Conflict)
            }
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(StatusError::Timeout(self.patch_timeout)),
        }
    }

    async fn record_event(&self, reference: &ObjectReference, event: LifecycleEvent) {
        let type_ = match event.level {
            Level::Normal => EventType::Normal,
            Level::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: event.reason.to_string(),
            note: Some(event.message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, reference).await {
            tracing::warn!(
                reason = %event.reason,
                %error,
                "Failed to publish event"
            );
        }
    }
}

/// Builds the merge patch for the status subresource.
///
/// With a resource version the API server rejects the write (409) unless the
/// object is still at that version.
fn status_patch(resource_version: Option<&str>, status: &WebAppStatus) -> serde_json::Value {
    let mut patch = serde_json::json!({ "status": status });
    if let Some(version) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": version });
    }
    patch
}
