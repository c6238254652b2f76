use webapp_controller_k8s_api::{Condition, ConditionStatus, WebAppStatus};

/// The append-only list of conditions recorded on a `WebApp` instance.
///
/// The last element is authoritative for the instance's current state. An
/// empty ledger is reported as [`Current::EMPTY`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ledger(Vec<Condition>);

/// A view of the ledger's last entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Current<'a> {
    /// `None` only for the empty-ledger sentinel.
    pub status: Option<ConditionStatus>,
    pub reason: &'a str,
    pub observed_generation: i64,
}

impl Current<'static> {
    pub const EMPTY: Self = Self {
        status: None,
        reason: "",
        observed_generation: 0,
    };
}

// === impl Ledger ===

impl Ledger {
    /// Reads the ledger from a raw JSON `status` value, as found in an
    /// admission request.
    ///
    /// A missing or malformed status is treated as an empty ledger.
    pub fn from_json(status: Option<&serde_json::Value>) -> Self {
        let Some(status) = status else {
            return Self::default();
        };
        match serde_json::from_value::<WebAppStatus>(status.clone()) {
            Ok(status) => Self(status.conditions),
            Err(error) => {
                tracing::debug!(%error, "Ignoring malformed status");
                Self::default()
            }
        }
    }

    pub fn current(&self) -> Current<'_> {
        match self.0.last() {
            Some(last) => Current {
                status: Some(last.status),
                reason: &last.reason,
                observed_generation: last.observed_generation,
            },
            None => Current::EMPTY,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.current().status == Some(ConditionStatus::Pending)
    }

    pub fn push(&mut self, condition: Condition) {
        self.0.push(condition);
    }

    pub fn to_status(&self) -> WebAppStatus {
        WebAppStatus {
            conditions: self.0.clone(),
        }
    }
}

impl From<Option<&WebAppStatus>> for Ledger {
    fn from(status: Option<&WebAppStatus>) -> Self {
        Self(status.map(|s| s.conditions.clone()).unwrap_or_default())
    }
}

impl From<Vec<Condition>> for Ledger {
    fn from(conditions: Vec<Condition>) -> Self {
        Self(conditions)
    }
}
