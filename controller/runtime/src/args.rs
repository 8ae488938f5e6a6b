use crate::{
    admission::Admission,
    broker::{Broker, BrokerMetrics},
    clusters::Clusters,
    connector::{self, Launcher, Settings},
    health,
    k8s::{self, watcher},
    lease::{self, Leadership},
    mesh::{self, MeshWatch},
    publish::PublishMetrics,
    reconciler::Reconciler,
    repo, status,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::Duration,
};
use tracing::{info, info_span, Instrument};

const REPO_POLL_INTERVAL: Duration = Duration::from_secs(5);
const REPO_STARTUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// The maximum number of status patches to buffer. Each connector queues at
// most a few patches per export change.
const STATUS_UPDATE_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Parser)]
#[clap(
    name = "erie-canal-controller",
    about = "A multi-cluster service and ingress controller"
)]
pub struct Args {
    #[clap(long, default_value = "erie_canal=info,warn", env = "ERIE_CANAL_LOG")]
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

    #[clap(long, default_value = "erie-canal", env = "ERIE_CANAL_NAMESPACE")]
    controller_namespace: String,

    #[clap(long, default_value = "erie-canal-manager")]
    manager_deployment_name: String,

    #[clap(long, default_value = "erie-canal-mesh-config")]
    mesh_config_name: String,

    /// Serves `/healthz` and `/readyz`.
    #[clap(long, default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// How often every ServiceExport is revalidated, e.g. `15m`.
    #[clap(long, default_value = "15m", value_parser = parse_duration)]
    resync_period: Duration,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// The IngressClass whose Ingresses are compiled into routes.
    #[clap(long, default_value = "pipy")]
    ingress_class: String,
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
            controller_namespace,
            manager_deployment_name,
            mesh_config_name,
            health_addr,
            resync_period,
            patch_timeout_ms,
            ingress_class,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("resource_status"));
        let broker_metrics = BrokerMetrics::register(prom.sub_registry_with_prefix("broker"));
        let publish_metrics = PublishMetrics::register(prom.sub_registry_with_prefix("publish"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let hostname = std::env::var("HOSTNAME")
            .context("failed to fetch the HOSTNAME environment variable")?;

        // The control plane cannot do anything useful until its configuration
        // is valid, the API server is supported and the repo is up.
        let client = runtime.client();
        let mesh_config = mesh::load(&client, &controller_namespace, &mesh_config_name).await?;
        info!(
            cluster = %mesh_config.cluster_key(),
            certificate_manager = %mesh_config.certificate_manager()?,
            "Loaded MeshConfig"
        );
        connector::check_version(&client).await?;
        repo::Client::new(mesh_config.repo_root_url())?
            .wait_until_up(REPO_POLL_INTERVAL, REPO_STARTUP_TIMEOUT)
            .await
            .context("repo is not available")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &manager_deployment_name,
            &hostname,
        )
        .await?;
        let leadership = Leadership::new(claims.clone(), hostname.clone());

        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_controller = status::Controller::new(
            claims,
            hostname,
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        let (broker, dispatcher) = Broker::new(broker_metrics);
        tokio::spawn(
            dispatcher
                .run(runtime.shutdown_handle())
                .instrument(info_span!("broker")),
        );

        let (mesh_tx, mesh_rx) = watch::channel(Arc::new(mesh_config));
        let mesh_watch = MeshWatch {
            client: client.clone(),
            namespace: controller_namespace.clone(),
            name: mesh_config_name.clone(),
            config: mesh_tx,
            leadership: leadership.clone(),
        };
        tokio::spawn(
            mesh_watch
                .run(runtime.shutdown_handle())
                .instrument(info_span!("mesh_config")),
        );

        let (clusters_tx, clusters_rx) = mpsc::unbounded_channel();
        let clusters = Clusters::shared(clusters_tx);
        let cluster_events = runtime.watch_all::<k8s::Cluster>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(clusters.clone(), cluster_events)
                .instrument(info_span!("clusters")),
        );

        let (ready_tx, ready_rx) = watch::channel(false);
        let ctx = connector::Context {
            settings: Arc::new(Settings {
                controller_namespace: controller_namespace.clone(),
                manager_deployment_name,
                mesh_config_name: mesh_config_name.clone(),
                ingress_class,
                resync_period,
            }),
            home: client,
            broker,
            status: updates_tx,
            mesh: mesh_rx.clone(),
            leadership,
            clusters: clusters.clone(),
            ready: Arc::new(ready_tx),
            publish_metrics,
        };
        let launcher = Arc::new(Launcher::new(ctx.clone()));
        let (reconciler, requeue) = Reconciler::new(ctx, launcher);
        tokio::spawn(
            reconciler
                .run(clusters_rx, requeue, runtime.shutdown_handle())
                .instrument(info_span!("reconciler")),
        );

        tokio::spawn(health::serve(
            health_addr,
            ready_rx,
            runtime.shutdown_handle(),
        ));

        let runtime = runtime.spawn_server(move || {
            Admission::new(clusters, mesh_rx, &controller_namespace, &mesh_config_name)
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let offset = s
        .rfind(|c: char| c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("{s} does not contain a duration value"))?;
    let (magnitude, unit) = s.split_at(offset + 1);
    let magnitude = magnitude.parse::<u64>()?;

    let mul = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => bail!("invalid duration unit {unit:?} (expected one of 's', 'm' or 'h')"),
    };
    let secs = magnitude
        .checked_mul(mul)
        .ok_or_else(|| anyhow::anyhow!("duration {s} overflows"))?;
    if secs == 0 {
        bail!("duration must be positive");
    }
    Ok(Duration::from_secs(secs))
}
