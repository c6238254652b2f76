use crate::{IndexMetrics, ResourceId};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{self, Duration, MissedTickBehavior},
};
use webapp_controller_core::{
    reconcile::{plan, Plan},
    Ledger,
};
use webapp_controller_k8s_api::{ResourceExt, WebApp};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Watches `WebApp` instances and dispatches those that need deploying to the
/// [`Controller`](crate::Controller).
pub struct Index {
    work: mpsc::Sender<Work>,
    instances: HashMap<ResourceId, Instance>,
    metrics: IndexMetrics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
}

/// A request to run one reconciliation cycle against a snapshot.
#[derive(Debug)]
pub struct Work {
    pub id: ResourceId,
    pub event: EventKind,
    pub app: WebApp,
}

#[derive(Debug, Default)]
struct Instance {
    dispatched: Option<Attempt>,
    /// The latest snapshot that needs a cycle but did not fit in the queue.
    backlog: Option<Work>,
}

/// The snapshot an instance was last dispatched with.
///
/// A redelivered watch event for the same snapshot must not dispatch a
/// second cycle. A newer resource version of the same generation may: the
/// earlier cycle's Pending write will be rejected as a conflict.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Attempt {
    generation: i64,
    resource_version: Option<String>,
}

impl Index {
    pub fn shared(work: mpsc::Sender<Work>, metrics: IndexMetrics) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            work,
            instances: HashMap::new(),
            metrics,
        }))
    }

    /// Periodically retries work that could not be queued.
    ///
    /// Watches do not redeliver unchanged objects, so without this an instance
    /// dispatched into a full queue would wait for its next edit. Returns once
    /// the controller has stopped receiving.
    pub async fn run(index: SharedIndex, period: Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let mut guard = index.write();
            if guard.work.is_closed() {
                tracing::debug!("Work queue closed");
                return;
            }
            guard.flush_backlog();
        }
    }

    /// Dispatches deferred work until the queue fills again.
    pub fn flush_backlog(&mut self) {
        for instance in self.instances.values_mut() {
            let Some(work) = instance.backlog.take() else {
                continue;
            };
            if !dispatch(&self.work, &self.metrics, instance, work) {
                return;
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<WebApp> for Index {
    fn apply(&mut self, app: WebApp) {
        let Some(namespace) = app.namespace() else {
            tracing::warn!(name = %app.name_any(), "Ignoring WebApp without a namespace");
            return;
        };
        let id = ResourceId::new(namespace, app.name_unchecked());
        let event = if self.instances.contains_key(&id) {
            EventKind::Updated
        } else {
            EventKind::Created
        };
        let instance = self.instances.entry(id.clone()).or_default();
        // Superseded by this snapshot either way.
        instance.backlog = None;

        let generation = app.metadata.generation.unwrap_or_default();
        let ledger = Ledger::from(app.status.as_ref());
        let Plan::Deploy { generation } = plan(generation, &ledger) else {
            tracing::debug!(
                %id,
                ?event,
                generation,
                current = ?ledger.current(),
                "No reconciliation required"
            );
            self.metrics.skipped();
            return;
        };

        if instance.dispatched.as_ref() == Some(&Attempt::of(&app)) {
            tracing::debug!(%id, generation, "Reconciliation already dispatched");
            self.metrics.skipped();
            return;
        }

        dispatch(&self.work, &self.metrics, instance, Work { id, event, app });
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        tracing::debug!(%id, "WebApp deleted");
        self.instances.remove(&id);
    }

    // Resets are handled by applying each listed instance and deleting the
    // removed ones, which the default implementation already does.
}

/// Queues `work`, or parks it on the instance if the queue is full. Returns
/// false when nothing more can be queued.
fn dispatch(
    tx: &mpsc::Sender<Work>,
    metrics: &IndexMetrics,
    instance: &mut Instance,
    work: Work,
) -> bool {
    let attempt = Attempt::of(&work.app);
    let (id, event) = (work.id.clone(), work.event);
    match tx.try_send(work) {
        Ok(()) => {
            tracing::debug!(
                %id,
                ?event,
                generation = attempt.generation,
                "Dispatched reconciliation"
            );
            instance.dispatched = Some(attempt);
            metrics.dispatched();
            true
        }
        Err(TrySendError::Full(work)) => {
            tracing::info!(
                %id,
                generation = attempt.generation,
                "Work queue full; deferring reconciliation"
            );
            instance.backlog = Some(work);
            metrics.deferred();
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::warn!(%id, "Work queue closed; dropping reconciliation");
            false
        }
    }
}

// === impl Attempt ===

impl Attempt {
    fn of(app: &WebApp) -> Self {
        Self {
            generation: app.metadata.generation.unwrap_or_default(),
            resource_version: app.metadata.resource_version.clone(),
        }
    }
}
