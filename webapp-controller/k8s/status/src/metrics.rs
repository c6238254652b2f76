use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    reconciles: Family<OutcomeLabels, Counter>,
    status_patches: Family<PatchLabels, Counter>,
}

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    dispatched: Counter,
    skipped: Counter,
    deferred: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PatchLabels {
    result: &'static str,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of reconciliation cycles by outcome",
            reconciles.clone(),
        );

        let status_patches = Family::default();
        prom.register(
            "status_patches",
            "Count of status patches by result",
            status_patches.clone(),
        );

        Self {
            reconciles,
            status_patches,
        }
    }

    pub(crate) fn reconciled(&self, outcome: &'static str) {
        self.reconciles
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }

    pub(crate) fn patched(&self, result: &'static str) {
        self.status_patches
            .get_or_create(&PatchLabels { result })
            .inc();
    }
}

// === impl IndexMetrics ===

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let dispatched = Counter::default();
        prom.register(
            "dispatched",
            "Count of reconciliations dispatched to the controller",
            dispatched.clone(),
        );

        let skipped = Counter::default();
        prom.register(
            "skipped",
            "Count of watch events that required no reconciliation",
            skipped.clone(),
        );

        let deferred = Counter::default();
        prom.register(
            "deferred",
            "Count of reconciliations deferred because the work queue was full",
            deferred.clone(),
        );

        Self {
            dispatched,
            skipped,
            deferred,
        }
    }

    pub(crate) fn dispatched(&self) {
        self.dispatched.inc();
    }

    pub(crate) fn skipped(&self) {
        self.skipped.inc();
    }

    pub(crate) fn deferred(&self) {
        self.deferred.inc();
    }
}
