use crate::{
    admission::Admission,
    core::generate,
    k8s::{self, Client, Resource},
    status,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, warn, Instrument};

// How often the index retries work that did not fit in the queue.
const BACKLOG_PERIOD: Duration = Duration::from_secs(10);

// The maximum number of reconciliations to buffer. Work that doesn't fit is
// parked on the index and retried every `BACKLOG_PERIOD`.
const WORK_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Parser)]
#[clap(name = "webapp-controller", about = "A WebApp resource controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "webapp=info,warn",
        env = "WEBAPP_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Bounds each status patch and each child resource apply.
    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// The container image deployed for every WebApp.
    #[clap(long, default_value = "nginx:stable")]
    image: String,

    #[clap(long, default_value = "80")]
    container_port: i32,

    /// Reported as the source of lifecycle events.
    #[clap(long, default_value = "webapp-controller")]
    controller_name: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            patch_timeout_ms,
            image,
            container_port,
            controller_name,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };
        let patch_timeout = Duration::from_millis(patch_timeout_ms);

        let mut prom = <Registry>::default();
        let reconcile = prom.sub_registry_with_prefix("webapp_reconcile");
        let controller_metrics = status::ControllerMetrics::register(reconcile);
        let index_metrics = status::IndexMetrics::register(reconcile);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        if !api_resource_exists::<k8s::WebApp>(&runtime.client()).await {
            warn!("webapps.webapp.example.com resource kind not found; is the CRD installed?");
        }

        // The index decides which watch events warrant a reconciliation and
        // hands them to the controller, which processes them one at a time.
        let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE_SIZE);
        let index = status::Index::shared(work_tx, index_metrics);

        let webapps = runtime.watch_all::<k8s::WebApp>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), webapps).instrument(info_span!("webapps")),
        );
        tokio::spawn(
            status::Index::run(index, BACKLOG_PERIOD).instrument(info_span!("index_backlog")),
        );

        let client = runtime.client();
        let controller = status::Controller::new(
            status::KubeReporter::new(client.clone(), controller_name, patch_timeout),
            status::KubeApplier::new(client, patch_timeout),
            generate::Config {
                image,
                container_port,
            },
            controller_metrics,
        );
        tokio::spawn(controller.run(work_rx).instrument(info_span!("controller")));

        let admission = Admission::new();
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
