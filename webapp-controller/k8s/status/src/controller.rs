use crate::{
    ApplyError, ChildApplier, ControllerMetrics, LifecycleEvent, ResourceId, StatusError,
    StatusReporter, Work,
};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info_span, Instrument};
use webapp_controller_core::{
    generate::{self, GenerateError},
    reconcile::{self, plan, Plan},
    Ledger,
};
use webapp_controller_k8s_api::{Resource, ResourceExt, WebApp};

/// Runs reconciliation cycles, one at a time, in the order they were
/// dispatched.
pub struct Controller<R, A> {
    reporter: R,
    applier: A,
    config: generate::Config,
    metrics: ControllerMetrics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The instance needed no work.
    Skipped,
    Ready,
    Failed,
    /// Another writer changed the instance before the Pending condition
    /// could be recorded.
    Aborted,
}

#[derive(Debug, Error)]
enum DeployError {
    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

// === impl Outcome ===

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

// === impl Controller ===

impl<R, A> Controller<R, A>
where
    R: StatusReporter,
    A: ChildApplier,
{
    pub fn new(
        reporter: R,
        applier: A,
        config: generate::Config,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            reporter,
            applier,
            config,
            metrics,
        }
    }

    /// Processes work until every sender has been dropped.
    pub async fn run(self, mut work: mpsc::Receiver<Work>) {
        while let Some(Work { id, event, app }) = work.recv().await {
            let span = info_span!("reconcile", ns = %id.namespace, name = %id.name, ?event);
            self.reconcile(&app).instrument(span).await;
        }
        tracing::debug!("Work queue closed");
    }

    /// Runs one cycle against the given snapshot of an instance.
    ///
    /// The ledger is extended locally and the full ledger is persisted after
    /// every transition, so a Failed cycle records both its Pending and Failed
    /// entries.
    pub async fn reconcile(&self, app: &WebApp) -> Outcome {
        let outcome = self.cycle(app).await;
        if outcome != Outcome::Skipped {
            self.metrics.reconciled(outcome.as_str());
        }
        outcome
    }

    async fn cycle(&self, app: &WebApp) -> Outcome {
        let Some(namespace) = app.namespace() else {
            tracing::warn!("Skipping WebApp without a namespace");
            return Outcome::Skipped;
        };
        let id = ResourceId::new(namespace, app.name_any());
        let mut ledger = Ledger::from(app.status.as_ref());

        let generation = app.metadata.generation.unwrap_or_default();
        let Plan::Deploy { generation } = plan(generation, &ledger) else {
            tracing::debug!(%id, generation, current = ?ledger.current(), "Nothing to do");
            return Outcome::Skipped;
        };
        let reference = app.object_ref(&());

        ledger.push(reconcile::pending(generation, Utc::now()));
        // Only the Pending write is conditional on the observed version, so
        // that two cycles for one generation cannot both record Pending.
        let resource_version = app.metadata.resource_version.as_deref();
        if let Err(StatusError::Conflict) = self.persist(&id, resource_version, &ledger).await {
            tracing::info!(%id, generation, "Instance changed concurrently; abandoning");
            return Outcome::Aborted;
        }
        self.reporter
            .record_event(&reference, LifecycleEvent::PENDING)
            .await;

        let (condition, event, outcome) = match self.deploy(app).await {
            Ok(()) => {
                tracing::info!(%id, generation, "Reconciled");
                (
                    reconcile::ready(generation, Utc::now()),
                    LifecycleEvent::RECONCILED,
                    Outcome::Ready,
                )
            }
            Err(error) => {
                tracing::warn!(%id, generation, %error, "Could not reconcile");
                (
                    reconcile::failed(generation, Utc::now()),
                    LifecycleEvent::FAILED,
                    Outcome::Failed,
                )
            }
        };

        // The terminal write is unconditional: a concurrent spec change must
        // not leave the ledger stuck on Pending.
        ledger.push(condition);
        let _ = self.persist(&id, None, &ledger).await;
        self.reporter.record_event(&reference, event).await;

        outcome
    }

    async fn deploy(&self, app: &WebApp) -> Result<(), DeployError> {
        let children = generate::generate(app, &self.config)?;
        self.applier.apply(&children).await?;
        Ok(())
    }

    /// Writes the ledger, logging (but otherwise swallowing) failures.
    async fn persist(
        &self,
        id: &ResourceId,
        resource_version: Option<&str>,
        ledger: &Ledger,
    ) -> Result<(), StatusError> {
        let res = self
            .reporter
            .patch_conditions(id, resource_version, &ledger.to_status())
            .await;
        match &res {
            Ok(_) => self.metrics.patched("ok"),
            Err(StatusError::Conflict) => self.metrics.patched("conflict"),
            Err(error) => {
                tracing::warn!(%id, %error, "Failed to patch status");
                self.metrics.patched("error");
            }
        }
        res
    }
}
