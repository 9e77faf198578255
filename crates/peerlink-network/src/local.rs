//! Watches that feed the local endpoint and tunnel public key
//!
//! The gateway publishes its public key in a Secret and is exposed through a
//! Service. Both land in [`LocalParameters`](crate::gate::LocalParameters)
//! and each reports to the readiness gate the first time it is seen.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use peerlink_common::{Error, Result, PUBLIC_KEY_CONFIG};
use tracing::{debug, info, instrument, warn};

use crate::context::{backoff_key, NetworkContext};
use crate::gate::GateSource;

/// Service annotation overriding the advertised endpoint address
pub const ENDPOINT_IP_ANNOTATION: &str = "net.peerlink.dev/endpoint-ip";

/// Service annotation overriding the advertised endpoint port
pub const ENDPOINT_PORT_ANNOTATION: &str = "net.peerlink.dev/endpoint-port";

/// Name of the tunnel port on the gateway Service
pub const GATEWAY_PORT_NAME: &str = "wireguard";

/// Public key stored in the tunnel key Secret
pub fn public_key_from_secret(secret: &Secret) -> Option<String> {
    let from_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(PUBLIC_KEY_CONFIG))
        .and_then(|v| String::from_utf8(v.0.clone()).ok());
    let from_string_data = || {
        secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(PUBLIC_KEY_CONFIG))
            .cloned()
    };
    from_data
        .or_else(from_string_data)
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// Externally reachable address and port of the gateway Service
///
/// Annotations win over discovered values. The address comes from the first
/// load balancer ingress, then from `spec.externalIPs`. The port is the
/// NodePort for NodePort services and the service port otherwise.
pub fn endpoint_from_service(svc: &Service) -> Option<(String, u16)> {
    let annotations = svc.metadata.annotations.as_ref();
    let spec = svc.spec.as_ref()?;

    let ip = annotations
        .and_then(|a| a.get(ENDPOINT_IP_ANNOTATION))
        .cloned()
        .or_else(|| {
            svc.status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .and_then(|ingress| ingress.first())
                .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()))
        })
        .or_else(|| spec.external_ips.as_ref().and_then(|ips| ips.first().cloned()))?;

    let annotated_port = annotations
        .and_then(|a| a.get(ENDPOINT_PORT_ANNOTATION))
        .and_then(|p| p.parse::<u16>().ok());
    let port = match annotated_port {
        Some(port) => port,
        None => {
            let ports = spec.ports.as_ref()?;
            let port = ports
                .iter()
                .find(|p| p.name.as_deref() == Some(GATEWAY_PORT_NAME))
                .or_else(|| ports.first())?;
            let value = if spec.type_.as_deref() == Some("NodePort") {
                port.node_port?
            } else {
                port.port
            };
            u16::try_from(value).ok()?
        }
    };
    Some((ip, port))
}

/// Reconcile the tunnel key Secret
#[instrument(skip(secret, ctx), fields(secret = %secret.name_any()))]
pub async fn reconcile_key_secret(secret: Arc<Secret>, ctx: Arc<NetworkContext>) -> Result<Action> {
    let key = public_key_from_secret(&secret).ok_or_else(|| {
        Error::not_ready(
            format!("Secret/{}", secret.name_any()),
            "public key not published yet",
        )
    })?;
    if ctx.params.snapshot().await.public_key.as_deref() != Some(key.as_str()) {
        info!("Tunnel public key loaded");
        ctx.params.set_public_key(key).await;
    }
    ctx.gate.mark(GateSource::TunnelKeys);
    ctx.backoff.reset(&backoff_key(secret.as_ref()));
    Ok(Action::await_change())
}

/// Reconcile the gateway Service
#[instrument(skip(svc, ctx), fields(service = %svc.name_any()))]
pub async fn reconcile_gateway_service(svc: Arc<Service>, ctx: Arc<NetworkContext>) -> Result<Action> {
    let Some((ip, port)) = endpoint_from_service(&svc) else {
        debug!("Gateway Service has no external address yet");
        return Err(Error::not_ready(
            format!("Service/{}", svc.name_any()),
            "no external address assigned",
        ));
    };
    let current = ctx.params.snapshot().await;
    if current.endpoint_ip.as_deref() != Some(ip.as_str()) || current.endpoint_port != Some(port) {
        info!(endpoint_ip = %ip, endpoint_port = port, "Gateway endpoint discovered");
        ctx.params.set_endpoint(ip, port).await;
    }
    ctx.gate.mark(GateSource::GatewayService);
    ctx.backoff.reset(&backoff_key(svc.as_ref()));
    Ok(Action::await_change())
}

/// Error policy shared by the Secret and Service watches
pub fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<NetworkContext>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let delay = ctx.backoff.next(&backoff_key(obj.as_ref()));
    warn!(
        error = %error,
        kind = %K::kind(&()),
        name = %obj.name_any(),
        retry_in = ?delay,
        "local parameter source not usable"
    );
    Action::requeue(delay.min(Duration::from_secs(30)))
}
