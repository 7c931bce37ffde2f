//! Session operator entrypoint - binds Cloudflare sessions to session pods

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use session_common::crd::SessionBinding;
use session_common::{LEADER_LEASE_NAME, MANAGED_BY, MANAGED_BY_LABEL};
use session_operator::controller::{error_policy, reconcile, Context};
use session_operator::harness::{self, ReadyFlag, ReconcileMetrics};
use session_operator::leader::LeaderLease;

/// Kubernetes operator that materialises Cloudflare sessions as dedicated
/// pods and programs return routes in the edge.
#[derive(Parser, Debug)]
#[command(name = "session-operator", version, about, long_about = None)]
struct Cli {
    /// The address the metrics endpoint binds to.
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,

    /// The address the probe endpoint binds to.
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Enable leader election so exactly one replica reconciles at a time.
    #[arg(long)]
    leader_elect: bool,

    /// Generate the SessionBinding CRD manifest and exit.
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&SessionBinding::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("session operator starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    // The operator installs its own CRD on startup so the schema always
    // matches the operator version.
    ensure_crd_installed(&client).await?;

    let ctx = Arc::new(Context::builder(client.clone()).build()?);

    let ready = ReadyFlag::default();
    let metrics = Arc::new(ReconcileMetrics::default());

    tokio::spawn(harness::serve(
        harness::health_routes(ready.clone()),
        cli.health_probe_bind_address.clone(),
        "health probe",
    ));
    tokio::spawn(harness::serve(
        harness::metrics_routes(metrics.clone()),
        cli.metrics_bind_address.clone(),
        "metrics",
    ));

    // With leader election enabled, block until this replica holds the lease.
    let leader = if cli.leader_elect {
        let namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "session-operator".to_string());
        let lease = LeaderLease::new(client.clone(), &namespace, LEADER_LEASE_NAME, &identity);
        lease.acquire().await;
        Some(lease)
    } else {
        None
    };

    let bindings: Api<SessionBinding> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);
    let owned_pods = WatcherConfig::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY}"));

    let controller = Controller::new(bindings, WatcherConfig::default());

    // /readyz flips once the binding cache completes its initial list; until
    // then the watch is not established and reconciles cannot be trusted.
    let store = controller.store();
    let ready_signal = ready.clone();
    tokio::spawn(async move {
        if store.wait_until_ready().await.is_ok() {
            ready_signal.set_ready();
            tracing::info!("binding cache synced, reporting ready");
        }
    });

    tracing::info!("starting SessionBinding controller");
    let metrics_for_results = metrics.clone();
    let controller = controller
        .owns(pods, owned_pods)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let metrics = metrics_for_results.clone();
            async move {
                match result {
                    Ok(obj) => {
                        metrics.observe_success();
                        tracing::debug!(?obj, "reconciliation completed");
                    }
                    Err(e) => {
                        metrics.observe_error();
                        tracing::error!(error = ?e, "reconciliation error");
                    }
                }
            }
        });

    match leader {
        Some(lease) => {
            tokio::select! {
                _ = controller => tracing::info!("controller completed"),
                _ = lease.hold() => {
                    // Exit so the replacement replica takes over cleanly.
                    tracing::error!("leadership lost, exiting");
                    std::process::exit(1);
                }
            }
        }
        None => controller.await,
    }

    tracing::info!("session operator shutting down");
    Ok(())
}

/// Install the SessionBinding CRD via server-side apply.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("session-operator").force();

    tracing::info!("installing SessionBinding CRD");
    crds.patch(
        "sessionbindings.cloudflare.example.com",
        &params,
        &Patch::Apply(&SessionBinding::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install SessionBinding CRD: {e}"))?;

    Ok(())
}
