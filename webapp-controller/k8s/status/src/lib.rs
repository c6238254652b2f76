#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod apply;
mod controller;
mod index;
mod metrics;
mod report;
mod resource_id;


pub use self::{
    apply::{ApplyError, ChildApplier, KubeApplier},
    controller::{Controller, Outcome},
    index::{EventKind, Index, SharedIndex, Work},
    metrics::{ControllerMetrics, IndexMetrics},
    report::{KubeReporter, Level, LifecycleEvent, StatusError, StatusReporter},
    resource_id::ResourceId,
};
