use crate::Ledger;
use chrono::{DateTime, Utc};
use webapp_controller_k8s_api::{Condition, ConditionStatus};

pub const PROCESSING: &str = "Processing";
pub const RECONCILED: &str = "Reconciled";
pub const COULD_NOT_RECONCILE: &str = "Could not reconcile";

/// What the controller should do for an observed instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    NoAction,
    Deploy { generation: i64 },
}

/// Decides whether `generation` still needs to be deployed.
///
/// Deployment is required only when the ledger has not yet observed this
/// generation and no deployment is in flight. Calling this again after the
/// cycle's conditions have been recorded always yields `NoAction`.
pub fn plan(generation: i64, ledger: &Ledger) -> Plan {
    let current = ledger.current();
    let in_flight =
        current.status == Some(ConditionStatus::Pending) || current.reason == PROCESSING;
    if generation == current.observed_generation || in_flight {
        return Plan::NoAction;
    }
    Plan::Deploy { generation }
}

pub fn pending(generation: i64, now: DateTime<Utc>) -> Condition {
    condition(ConditionStatus::Pending, PROCESSING, generation, now)
}

pub fn ready(generation: i64, now: DateTime<Utc>) -> Condition {
    condition(ConditionStatus::Ready, RECONCILED, generation, now)
}

pub fn failed(generation: i64, now: DateTime<Utc>) -> Condition {
    condition(ConditionStatus::Failed, COULD_NOT_RECONCILE, generation, now)
}

fn condition(
    status: ConditionStatus,
    reason: &str,
    observed_generation: i64,
    now: DateTime<Utc>,
) -> Condition {
    Condition {
        status,
        reason: reason.to_string(),
        observed_generation,
        last_transition_time: now,
    }
}
