//! Controller runner - builds controller futures for each role
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use peerlink_common::crd::{ForeignCluster, NetworkConfig, PeeringConfig, TunnelEndpoint};
use peerlink_gateway::GatewayContext;
use peerlink_network::{controller, local, peering, peering_config, NetworkContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be polled
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn named(name: &str) -> WatcherConfig {
    watcher_config().fields(&format!("metadata.name={name}"))
}

/// Build the watches that feed the readiness gate
///
/// PeeringConfig, the tunnel key Secret and the gateway Service. These run
/// immediately; the network controllers wait for them.
pub fn build_local_controllers(
    client: Client,
    ctx: Arc<NetworkContext>,
    key_secret: &str,
    gateway_service: &str,
) -> Vec<ControllerFuture> {
    let peering_configs: Api<PeeringConfig> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &ctx.namespace);
    let services: Api<Service> = Api::namespaced(client, &ctx.namespace);

    tracing::info!("- PeeringConfig controller");
    tracing::info!(secret = %key_secret, "- tunnel key watch");
    tracing::info!(service = %gateway_service, "- gateway Service watch");

    vec![
        Box::pin(
            Controller::new(peering_configs, watcher_config())
                .shutdown_on_signal()
                .run(peering_config::reconcile, peering_config::error_policy, ctx.clone())
                .for_each(log_reconcile_result("PeeringConfig")),
        ),
        Box::pin(
            Controller::new(secrets, named(key_secret))
                .shutdown_on_signal()
                .run(local::reconcile_key_secret, local::error_policy, ctx.clone())
                .for_each(log_reconcile_result("KeySecret")),
        ),
        Box::pin(
            Controller::new(services, named(gateway_service))
                .shutdown_on_signal()
                .run(local::reconcile_gateway_service, local::error_policy, ctx)
                .for_each(log_reconcile_result("GatewayService")),
        ),
    ]
}

/// Build the ForeignCluster and NetworkConfig controllers
///
/// Both start only once the readiness gate has opened.
pub fn build_network_controllers(client: Client, ctx: Arc<NetworkContext>) -> Vec<ControllerFuture> {
    let foreign_clusters: Api<ForeignCluster> = Api::all(client.clone());
    let network_configs: Api<NetworkConfig> = Api::namespaced(client.clone(), &ctx.namespace);
    let tunnel_endpoints: Api<TunnelEndpoint> = Api::namespaced(client, &ctx.namespace);

    tracing::info!("- ForeignCluster controller (gated)");
    tracing::info!("- NetworkConfig controller (gated)");

    let fc_ctrl = Controller::new(foreign_clusters, watcher_config())
        .shutdown_on_signal()
        .run(peering::reconcile, peering::error_policy, ctx.clone())
        .for_each(log_reconcile_result("ForeignCluster"));

    let nc_ctrl = Controller::new(network_configs, watcher_config())
        .owns(tunnel_endpoints, watcher_config())
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx.clone())
        .for_each(log_reconcile_result("NetworkConfig"));

    vec![
        gated(ctx.clone(), fc_ctrl),
        gated(ctx, nc_ctrl),
    ]
}

/// Build the gateway TunnelEndpoint controller
pub fn build_gateway_controllers(client: Client, ctx: Arc<GatewayContext>) -> Vec<ControllerFuture> {
    let tunnel_endpoints: Api<TunnelEndpoint> = Api::namespaced(client, &ctx.namespace);

    tracing::info!(backends = ?ctx.registry.backends(), "- TunnelEndpoint gateway controller");

    vec![Box::pin(
        Controller::new(tunnel_endpoints, watcher_config())
            .shutdown_on_signal()
            .run(
                peerlink_gateway::controller::reconcile,
                peerlink_gateway::controller::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("TunnelEndpoint")),
    )]
}

fn gated<F>(ctx: Arc<NetworkContext>, controller: F) -> ControllerFuture
where
    F: Future<Output = ()> + Send + 'static,
{
    Box::pin(async move {
        if !ctx.gate.is_open() {
            tracing::info!(pending = ?ctx.gate.pending(), "Waiting for local network parameters");
        }
        if let Err(e) = ctx.gate.wait().await {
            tracing::error!(error = %e, "Readiness gate never opened, controller not started");
            return;
        }
        controller.await;
    })
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
