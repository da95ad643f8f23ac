use crate::admission::Admission;
use crate::lease;
use crate::metrics::Metrics;
use crate::reconciler::{self, Context};
use crate::tracker::{Key, Kind, Tracker};
use anyhow::{bail, Result};
use clap::Parser;
use conventions_controller_k8s_api::cert_manager::CertificateRequest;
use conventions_controller_k8s_api::convention::ClusterPodConvention;
use conventions_controller_k8s_api::intent::PodIntent;
use conventions_controller_k8s_api::{Api, ResourceExt, Secret, ServiceAccount};
use futures::{future, prelude::*};
use kube::runtime::{controller::Controller, watcher, WatchStreamExt};
use prometheus_client::registry::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "conventions", about = "Pod conventions controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "conventions=info,warn",
        env = "CONVENTIONS_CONTROLLER_LOG"
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

    /// Directory backing the content-addressed image blob cache
    /// (e.g. /var/cache/ggcr).
    #[clap(long)]
    cache_dir: Option<PathBuf>,

    /// PEM file with additional roots trusted for registry TLS
    /// (e.g. /var/conventions/tls/ca-certificates.crt).
    #[clap(long)]
    registry_ca_cert_path: Option<PathBuf>,

    /// Per-call deadline, in seconds, for convention webhook and registry
    /// requests.
    #[clap(long, default_value = "30")]
    webhook_timeout_seconds: u64,

    #[clap(long)]
    enable_leader_election: bool,

    /// Namespace the controller runs in.
    #[clap(long, env = "SYSTEM_NAMESPACE", default_value = "conventions-system")]
    system_namespace: String,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            admission_controller_disabled,
            cache_dir,
            registry_ca_cert_path,
            webhook_timeout_seconds,
            enable_leader_election,
            system_namespace,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("conventions"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let client = runtime.client();

        if enable_leader_election {
            let hostname = std::env::var("HOSTNAME")
                .unwrap_or_else(|_| "conventions-controller".to_string());
            let mut claims = lease::init(&runtime, &system_namespace, &hostname).await?;
            info!("Waiting for leadership");
            while !claims.borrow_and_update().is_current_for(&hostname) {
                claims.changed().await?;
            }
            info!("Acquired leadership");
        }

        let tracker = Tracker::default();
        let ctx = Arc::new(Context {
            client: client.clone(),
            tracker: tracker.clone(),
            cache_dir,
            registry_ca_cert_path,
            webhook_timeout: Duration::from_secs(webhook_timeout_seconds),
            metrics,
        });

        // The catalog is cluster-scoped input to every intent, so convention
        // and certificate-request changes requeue everything; secrets and
        // service accounts requeue only their tracked dependents.
        let conventions_changed = watcher(
            Api::<ClusterPodConvention>::all(client.clone()),
            watcher::Config::default(),
        )
        .touched_objects()
        .filter_map(|r| future::ready(r.ok().map(|_| ())));

        let cert_requests_changed = watcher(
            Api::<CertificateRequest>::all(client.clone()),
            watcher::Config::default(),
        )
        .touched_objects()
        .filter_map(|r| future::ready(r.ok().map(|_| ())));

        let secret_tracker = tracker.clone();
        let sa_tracker = tracker;

        let shutdown = runtime.shutdown_handle();
        let controller = Controller::new(
            Api::<PodIntent>::all(client.clone()),
            watcher::Config::default(),
        )
        .watches(
            Api::<Secret>::all(client.clone()),
            watcher::Config::default(),
            move |secret: Secret| {
                let namespace = secret.namespace().unwrap_or_default();
                let name = secret.name_any();
                secret_tracker.tracked_by(&Key::new(Kind::Secret, namespace, name))
            },
        )
        .watches(
            Api::<ServiceAccount>::all(client.clone()),
            watcher::Config::default(),
            move |sa: ServiceAccount| {
                let namespace = sa.namespace().unwrap_or_default();
                let name = sa.name_any();
                sa_tracker.tracked_by(&Key::new(Kind::ServiceAccount, namespace, name))
            },
        )
        .reconcile_all_on(conventions_changed)
        .reconcile_all_on(cert_requests_changed)
        .graceful_shutdown_on(async move {
            let _ = shutdown.signaled().await;
        })
        .run(reconciler::reconcile, reconciler::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((intent, _)) => debug!(name = %intent.name, "Reconciled"),
                Err(error) => debug!(%error, "Reconciliation error"),
            }
        });
        tokio::spawn(controller.instrument(info_span!("podintents")));

        let runtime = runtime.spawn_server(Admission::new);

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
