//! peerlink operator - multi-cluster network fabric

mod controller_runner;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use kube::Client;

use peerlink_common::crd::owned_crds;
use peerlink_common::kube_utils::{apply_crds, create_client};
use peerlink_common::retry::{retry_with_backoff, RetryConfig};
use peerlink_common::telemetry::{init_telemetry, TelemetryConfig};
use peerlink_common::PEERLINK_SYSTEM_NAMESPACE;
use peerlink_gateway::GatewayContext;
use peerlink_ipam::{ConfigMapStorage, Ipam, IpamStorage};
use peerlink_network::{KubeNetworkStore, NetworkContext, ReadinessGate};
use peerlink_tunnel::wireguard::driver::{DEFAULT_LISTEN_PORT, DEFAULT_MTU};
use peerlink_tunnel::wireguard::{
    CommandDevice, SecretKeyStore, WireGuardConfig, WireGuardDriver, KEY_SECRET_NAME,
};
use peerlink_tunnel::DriverRegistry;

use controller_runner::{
    build_gateway_controllers, build_local_controllers, build_network_controllers,
    ControllerFuture,
};

/// Attempts for startup calls against the API server before giving up
const STARTUP_ATTEMPTS: u32 = 5;

/// Which halves of the fabric this process runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    /// NetworkConfig and TunnelEndpoint reconciliation
    Network,
    /// Tunnel drivers on the gateway node
    Gateway,
    /// Both
    All,
}

impl Role {
    fn runs_network(self) -> bool {
        matches!(self, Role::Network | Role::All)
    }

    fn runs_gateway(self) -> bool {
        matches!(self, Role::Gateway | Role::All)
    }
}

/// peerlink - connects pod networks of peered clusters
#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// ID of the local cluster
    #[arg(long, env = "PEERLINK_CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Namespace holding NetworkConfigs, TunnelEndpoints and keys
    #[arg(long, env = "PEERLINK_NAMESPACE", default_value = PEERLINK_SYSTEM_NAMESPACE)]
    namespace: String,

    /// Components to run
    #[arg(long, env = "PEERLINK_ROLE", value_enum, default_value = "all")]
    role: Role,

    /// Service exposing the gateway's tunnel port
    #[arg(long, env = "PEERLINK_GATEWAY_SERVICE", default_value = "peerlink-gateway")]
    gateway_service: String,

    /// Secret holding the WireGuard key pair
    #[arg(long, env = "PEERLINK_WIREGUARD_SECRET", default_value = KEY_SECRET_NAME)]
    wireguard_secret: String,

    /// WireGuard link name
    #[arg(long, env = "PEERLINK_INTERFACE", default_value = "peerlink0")]
    interface: String,

    /// WireGuard UDP listen port
    #[arg(long, env = "PEERLINK_LISTEN_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    listen_port: u16,

    /// WireGuard link MTU
    #[arg(long, env = "PEERLINK_MTU", default_value_t = DEFAULT_MTU)]
    mtu: u16,

    /// Path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Emit human-readable logs instead of JSON
    #[arg(long, env = "PEERLINK_LOG_TEXT")]
    log_text: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in owned_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "peerlink-operator".to_string(),
        json: !cli.log_text,
    })?;

    let cluster_id = cli
        .cluster_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| anyhow::anyhow!("--cluster-id (PEERLINK_CLUSTER_ID) is required"))?;

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    run(cli, cluster_id, client).await
}

async fn run(cli: Cli, cluster_id: String, client: Client) -> anyhow::Result<()> {
    tracing::info!(cluster_id = %cluster_id, role = ?cli.role, "Starting peerlink");

    let store = Arc::new(KubeNetworkStore::new(client.clone()));
    let mut controllers: Vec<ControllerFuture> = Vec::new();
    let mut ipam = None;
    let mut registry = None;
    let startup_retry = RetryConfig::with_max_attempts(STARTUP_ATTEMPTS);

    if cli.role.runs_network() {
        apply_crds(&client, &owned_crds()).await?;
        tracing::info!("CRDs installed/updated");

        let storage: Arc<dyn IpamStorage> =
            Arc::new(ConfigMapStorage::new(client.clone(), &cli.namespace));
        let shared_ipam = Arc::new(
            retry_with_backoff(&startup_retry, "load_ipam_state", || {
                Ipam::new(storage.clone())
            })
            .await?,
        );
        let ctx = Arc::new(
            NetworkContext::builder(store.clone(), shared_ipam.clone(), cluster_id.clone())
                .namespace(cli.namespace.clone())
                .gate(Arc::new(ReadinessGate::default()))
                .build(),
        );

        tracing::info!("Starting network controllers:");
        controllers.extend(build_local_controllers(
            client.clone(),
            ctx.clone(),
            &cli.wireguard_secret,
            &cli.gateway_service,
        ));
        controllers.extend(build_network_controllers(client.clone(), ctx));
        ipam = Some(shared_ipam);
    }

    if cli.role.runs_gateway() {
        let driver = WireGuardDriver::new(
            WireGuardConfig {
                interface: cli.interface.clone(),
                listen_port: cli.listen_port,
                mtu: cli.mtu,
            },
            Arc::new(CommandDevice::new()),
            Arc::new(SecretKeyStore::with_name(
                client.clone(),
                &cli.namespace,
                cli.wireguard_secret.clone(),
            )),
        );
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(driver));
        retry_with_backoff(&startup_retry, "init_tunnel_drivers", || drivers.init_all()).await?;

        let ctx = Arc::new(
            GatewayContext::builder(store, drivers.clone())
                .namespace(cli.namespace.clone())
                .build(),
        );
        tracing::info!("Starting gateway controllers:");
        controllers.extend(build_gateway_controllers(client, ctx));
        registry = Some(drivers);
    }

    // Every controller stops on SIGTERM/SIGINT; the first to finish ends the run
    let (_, index, _) = futures::future::select_all(controllers).await;
    tracing::info!(controller = index, "Controller stopped, shutting down");

    if let Some(ipam) = ipam {
        ipam.shutdown().await;
    }
    if let Some(registry) = registry {
        registry.close_all().await?;
    }

    tracing::info!("peerlink shutting down");
    Ok(())
}
