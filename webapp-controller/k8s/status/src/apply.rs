use std::{fmt, time::Duration};
use thiserror::Error;
use tokio::time;
use webapp_controller_core::generate::ChildResources;
use webapp_controller_k8s_api::{
    Api, Client, NamespaceResourceScope, Patch, PatchParams, Resource, ResourceExt,
    FIELD_MANAGER,
};

/// Applies generated children to the cluster.
#[async_trait::async_trait]
pub trait ChildApplier: Send + Sync {
    async fn apply(&self, children: &ChildResources) -> Result<(), ApplyError>;
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{kind} is missing a name or namespace")]
    Incomplete { kind: String },

    #[error("failed to apply {kind} {name}: {source}")]
    Api {
        kind: String,
        name: String,
        #[source]
        source: webapp_controller_k8s_api::Error,
    },

    #[error("applying {kind} {name} timed out after {timeout:?}")]
    Timeout {
        kind: String,
        name: String,
        timeout: Duration,
    },
}

/// Server-side applies each child, Deployment first.
pub struct KubeApplier {
    client: Client,
    timeout: Duration,
}

// === impl KubeApplier ===

impl KubeApplier {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn apply_one<K>(&self, obj: &K) -> Result<(), ApplyError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + fmt::Debug
            + serde::de::DeserializeOwned
            + serde::Serialize,
    {
        let kind = K::kind(&()).to_string();
        let (Some(namespace), Some(name)) = (obj.namespace(), obj.meta().name.clone()) else {
            return Err(ApplyError::Incomplete { kind });
        };

        let api = Api::<K>::namespaced(self.client.clone(), &namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        tracing::debug!(%kind, %namespace, %name, "Applying");
        match time::timeout(self.timeout, api.patch(&name, &params, &Patch::Apply(obj))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(source)) => Err(ApplyError::Api { kind, name, source }),
            Err(_) => Err(ApplyError::Timeout {
                kind,
                name,
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ChildApplier for KubeApplier {
    async fn apply(&self, children: &ChildResources) -> Result<(), ApplyError> {
        self.apply_one(&children.deployment).await?;
        self.apply_one(&children.service).await
    }
}
