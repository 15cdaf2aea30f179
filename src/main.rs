//! Startup Scaler
//!
//! A Kubernetes controller that in-place resizes a designated container's
//! resources between startup and post-startup values.
//!
//! ## Usage
//!
//! ```bash
//! # Run the controller (requires kubeconfig)
//! startup-scaler
//!
//! # Run with custom log level
//! RUST_LOG=debug startup-scaler
//! ```

use axum::routing::get;
use axum::Router;
use clap::Parser;
use kube::Client;
use startup_scaler::leader_election::{self, LeaderElector};
use startup_scaler::{
    metrics, watch, KubeEventPublisher, PodController, PodEventPublisher, PodPatcher, Settings,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Startup Scaler
#[derive(Parser, Debug)]
#[command(name = "startup-scaler")]
#[command(version, about = "In-place container startup resource scaling for Kubernetes")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,

    /// Metrics and health bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,

    /// Enable CPU scaling
    #[arg(long, default_value = "true")]
    cpu_scaling: bool,

    /// Enable memory scaling
    #[arg(long, default_value = "true")]
    memory_scaling: bool,

    /// Proceed as post-startup when the container spec matches neither triplet
    #[arg(long, default_value = "false")]
    scale_when_unknown_resources: bool,

    /// Seconds to wait for the informer cache to reflect a patch
    #[arg(long, default_value = "5")]
    cache_sync_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting Startup Scaler");
    info!("Leader election: {}", args.leader_election);
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    let settings = Settings {
        cpu_scaling: args.cpu_scaling,
        memory_scaling: args.memory_scaling,
        scale_when_unknown_resources: args.scale_when_unknown_resources,
        cache_sync_timeout: Duration::from_secs(args.cache_sync_timeout_secs),
        namespace: args.namespace.clone(),
        ..Settings::default()
    };

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Leader election — acquire lease before starting the controller
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns, &settings);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    // Metrics and health server
    let server_handle = {
        let app = Router::new()
            .route("/metrics", get(|| async { metrics::render() }))
            .route("/healthz", get(|| async { "ok" }));
        let bind_address = args.bind_address.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind_address).await {
                Ok(l) => l,
                Err(e) => {
                    error!("Failed to bind {}: {}", bind_address, e);
                    return;
                }
            };
            info!("Serving /metrics and /healthz on {}", bind_address);
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server error: {}", e);
            }
        })
    };

    // Pod watch feeding the in-process event publisher
    let publisher = Arc::new(PodEventPublisher::new());
    let watch_handle = {
        let client = client.clone();
        let settings = settings.clone();
        let publisher = Arc::clone(&publisher);
        tokio::spawn(async move {
            if let Err(e) = watch::run(client, &settings, publisher).await {
                error!("Pod watch error: {}", e);
            }
        })
    };

    // Pod controller
    let patcher = Arc::new(PodPatcher::new(client.clone(), Arc::clone(&publisher)));
    let events = Arc::new(KubeEventPublisher::new(client.clone()));
    let controller = Arc::new(PodController::new(
        client.clone(),
        patcher,
        events,
        settings,
    ));
    let controller_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Pod controller error: {}", e);
            }
        })
    };

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!("Pod controller task failed: {}", e);
            }
        }
        result = watch_handle => {
            if let Err(e) = result {
                error!("Pod watch task failed: {}", e);
            }
        }
        result = server_handle => {
            if let Err(e) = result {
                error!("Metrics server task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Release the lease before exiting so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Startup Scaler shutting down");
    Ok(())
}
