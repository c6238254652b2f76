#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Pure decision logic for the WebApp controller.
//!
//! Nothing in this crate performs I/O. Admission verdicts, the reconciliation
//! guard and child-resource generation are all functions of their explicit
//! inputs, so they may be called concurrently from any number of tasks.

pub mod admission;
pub mod generate;
pub mod ledger;
pub mod pod_security;
pub mod reconcile;

pub use self::ledger::Ledger;

/// HTTP status used to deny a `WebApp` with an invalid spec.
pub const UNPROCESSABLE_ENTITY: u16 = 422;

/// HTTP status used to deny a pod that requests privilege escalation.
pub const FORBIDDEN: u16 = 403;

/// The outcome of a single admission step.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    /// Admit the object, optionally applying a JSON patch first.
    Approve(Option<json_patch::Patch>),

    /// Reject the object with an HTTP-style status code and one message per
    /// violated rule.
    Deny { code: u16, messages: Vec<String> },
}

// === impl Verdict ===

impl Verdict {
    pub const fn approve() -> Self {
        Self::Approve(None)
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Approve(_))
    }

    pub fn patch(&self) -> Option<&json_patch::Patch> {
        match self {
            Self::Approve(patch) => patch.as_ref(),
            Self::Deny { .. } => None,
        }
    }
}
