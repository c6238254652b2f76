#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use webapp_controller_core as core;
pub use webapp_controller_k8s_api as k8s;
pub use webapp_controller_k8s_status as status;

mod admission;
mod args;

pub use self::{
    admission::{Admission, Kind, Phase},
    args::Args,
};
