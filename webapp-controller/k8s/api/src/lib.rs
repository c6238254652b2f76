#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod webapp;

pub use self::webapp::{
    Condition, ConditionStatus, Language, Theme, WebApp, WebAppSpec, WebAppStatus,
};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, ObjectReference, Pod, PodSpec, PodTemplateSpec,
            SecurityContext, Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::LabelSelector,
        util::intstr::IntOrString,
    },
};
pub use kube::{
    api::{Api, DynamicObject, ObjectMeta, Patch, PatchParams, ResourceExt},
    core::NamespaceResourceScope,
    runtime::events,
    Client, Error, Resource,
};

/// Field manager used for every write the controller makes.
pub const FIELD_MANAGER: &str = "webapp-controller";

/// Records the time of the last admission pass that approved an instance.
pub const LAST_ADMITTED_ANNOTATION: &str = "webapp.example.com/last-admitted";
