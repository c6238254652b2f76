//! Maps a `WebApp` to the child objects that implement it.
//!
//! Output is a deterministic function of the instance's identity and spec, so
//! re-applying it against unchanged live objects produces no diff.

use std::collections::BTreeMap;
use thiserror::Error;
use webapp_controller_k8s_api::{
    Container, ContainerPort, Deployment, DeploymentSpec, EnvVar, IntOrString, LabelSelector,
    ObjectMeta, PodSpec, PodTemplateSpec, Resource, ResourceExt, Service, ServicePort,
    ServiceSpec, WebApp, FIELD_MANAGER,
};

const NAME_LABEL: &str = "app.kubernetes.io/name";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const THEME_LABEL: &str = "webapp.example.com/theme";
const LANGUAGE_LABEL: &str = "webapp.example.com/language";
const SERVICE_PORT: i32 = 80;

/// Settings shared by every generated workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub image: String,
    pub container_port: i32,
}

/// The complete set of children for one instance.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildResources {
    pub deployment: Deployment,
    pub service: Service,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerateError {
    #[error("WebApp {0} has no namespace")]
    MissingNamespace(String),

    #[error("replicas must be between 1 and {max}, got {0}", max = i32::MAX)]
    Replicas(i64),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image: "nginx:stable".to_string(),
            container_port: 80,
        }
    }
}

/// Builds the full set of children before anything is applied.
pub fn generate(app: &WebApp, config: &Config) -> Result<ChildResources, GenerateError> {
    let name = app.name_any();
    let namespace = app
        .namespace()
        .ok_or_else(|| GenerateError::MissingNamespace(name.clone()))?;
    let replicas = i32::try_from(app.spec.replicas)
        .ok()
        .filter(|r| *r >= 1)
        .ok_or(GenerateError::Replicas(app.spec.replicas))?;

    let selector = BTreeMap::from([(NAME_LABEL.to_string(), name.clone())]);
    let labels = {
        let mut labels = selector.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
        labels.insert(THEME_LABEL.to_string(), app.spec.theme.to_string());
        labels.insert(LANGUAGE_LABEL.to_string(), app.spec.language.to_string());
        labels
    };
    let metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace),
        labels: Some(labels.clone()),
        owner_references: app.controller_owner_ref(&()).map(|oref| vec![oref]),
        ..Default::default()
    };

    let container = Container {
        name: "web".to_string(),
        image: Some(config.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: config.container_port,
            ..Default::default()
        }]),
        env: Some(vec![
            env("LANGUAGE", app.spec.language.as_str()),
            env("THEME", app.spec.theme.as_str()),
        ]),
        ..Default::default()
    };

    let deployment = Deployment {
        metadata: metadata.clone(),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let service = Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::String("http".to_string())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(ChildResources {
        deployment,
        service,
    })
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}
