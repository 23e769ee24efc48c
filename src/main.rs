//! Istio Kubernetes Operator
//!
//! Manages the Galley component described by Istio `Config` resources.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! istio-operator --namespace istio-system
//!
//! # Run with custom log level
//! RUST_LOG=istio_operator=debug istio-operator
//! ```

use clap::{Parser, ValueEnum};
use istio_operator::leader_election::{self, LeaderElector};
use istio_operator::{ConfigController, Settings};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Plain,
}

/// Istio Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "istio-operator")]
#[command(version, about = "Kubernetes Operator for the Istio control plane")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, env = "LEADER_ELECTION", default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "")]
    leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Seconds between periodic reconciliations
    #[arg(long, env = "REQUEUE_INTERVAL_SECS", default_value_t = 60)]
    requeue_interval_secs: u64,

    /// Seconds before retrying a failed reconciliation
    #[arg(long, env = "ERROR_REQUEUE_SECS", default_value_t = 30)]
    error_requeue_secs: u64,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings::default()
            .with_namespace(&self.namespace)
            .with_requeue_interval(self.requeue_interval_secs)
            .with_error_requeue_interval(self.error_requeue_secs)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let settings = args.settings();
    info!("Starting Istio Kubernetes Operator");
    info!("Leader election: {}", args.leader_election);
    info!(
        "Watching namespace: {}",
        settings.namespace.as_deref().unwrap_or("all")
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let config_controller = Arc::new(ConfigController::new(client.clone(), settings));
    let config_handle = {
        let controller = Arc::clone(&config_controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Config controller error: {}", e);
            }
        })
    };

    // No-op future when leader election is disabled
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

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = config_handle => {
            if let Err(e) = result {
                error!("Config controller task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Istio Operator shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["istio-operator"]);
        let settings = args.settings();
        assert!(!args.leader_election);
        assert!(settings.namespace.is_none());
        assert_eq!(settings.requeue_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_args_namespace_and_intervals() {
        let args = Args::parse_from([
            "istio-operator",
            "--namespace",
            "istio-system",
            "--requeue-interval-secs",
            "120",
            "--log-format",
            "plain",
        ]);
        let settings = args.settings();
        assert_eq!(settings.namespace.as_deref(), Some("istio-system"));
        assert_eq!(settings.requeue_interval, Duration::from_secs(120));
        assert!(matches!(args.log_format, LogFormat::Plain));
    }
}
