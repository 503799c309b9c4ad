use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cockroach_operator::health::{HEALTH_PORT_ENV, HealthState, health_port, run_health_server};
use cockroach_operator::{OperatorConfig, run_controller};

const LEASE_NAME: &str = "cockroach-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to in-flight reconciles after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // The SQL client and kube both need a process-wide provider
    let installed = rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_ok();
    if !installed && rustls::crypto::CryptoProvider::get_default().is_none() {
        return Err("no rustls crypto provider available".into());
    }

    init_tracing()?;

    let config = OperatorConfig::from_env()?;
    info!(
        features = ?config.features,
        versions = config.versions.versions().len(),
        cluster_domain = %config.cluster_domain,
        watch_namespace = config.watch_namespace.as_deref().unwrap_or("all"),
        "starting cockroach-operator"
    );

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    // Probes answer while this replica is still a follower
    let port = health_port(std::env::var(HEALTH_PORT_ENV).ok().as_deref());
    let health = tokio::spawn({
        let state = health_state.clone();
        async move {
            if let Err(e) = run_health_server(state, port).await {
                error!(port, error = %e, "health server stopped");
            }
        }
    });

    let holder = holder_id();
    let namespace = pod_namespace();
    info!(%holder, %namespace, lease = LEASE_NAME, "joining leader election");

    let lock = LeaseLock::new(client.clone(), &namespace, lease_params(&holder));
    acquire_leadership(&lock).await;
    let renewal = spawn_lease_renewal(LeaseLock::new(client.clone(), &namespace, lease_params(&holder)));

    let controller = tokio::spawn(run_controller(client, config, Some(health_state.clone())));

    tokio::select! {
        joined = controller => {
            if let Err(e) = joined {
                error!(error = %e, "controller task panicked");
            }
        }
        joined = health => {
            if let Err(e) = joined {
                error!(error = %e, "health server task panicked");
            }
        }
        Err(e) = renewal => {
            error!(error = %e, "lease renewal task panicked");
        }
        () = shutdown_signal() => {
            info!(grace = ?SHUTDOWN_GRACE, "shutdown requested, draining");
            health_state.set_ready(false);
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    }

    info!("operator stopped");
    Ok(())
}

fn init_tracing() -> Result<(), BoxError> {
    let filter = EnvFilter::from_default_env()
        .add_directive("cockroach_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn holder_id() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        warn!(%host, "POD_NAME not set, using hostname as lease holder");
        host
    })
}

fn lease_params(holder: &str) -> LeaseLockParams {
    LeaseLockParams {
        holder_id: holder.to_string(),
        lease_name: LEASE_NAME.to_string(),
        lease_ttl: LEASE_TTL,
    }
}

fn pod_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, holding the lease in 'default'");
        "default".to_string()
    })
}

/// Block until this replica holds the lease
async fn acquire_leadership(lock: &LeaseLock) {
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(lease) if lease.acquired_lease => {
                info!("acquired leadership");
                return;
            }
            Ok(_) => info!("another replica leads, standing by"),
            Err(e) => warn!(error = %e, "lease acquisition failed"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Keep renewing the lease, exiting the process once it is lost so the pod
/// restarts as a follower.
fn spawn_lease_renewal(lock: LeaseLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lock.try_acquire_or_renew().await {
                Ok(lease) if lease.acquired_lease => {}
                Ok(_) => {
                    error!("leadership lost");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "lease renewal failed");
                    std::process::exit(1);
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {},
        () = terminate => {},
    }
}
