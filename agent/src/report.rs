use ginepro::LoadBalancedChannel;
use protos::bmc::gateway::v1 as gateway_protos;
use protos::bmc::gateway::v1::gateway_client::GatewayClient;
use tokio::sync::watch;
use tokio::time::Duration;
use tonic::Request;

use crate::discovery::Discovery;
use crate::store::ServerStore;

/// How this agent introduces itself to its gateway.
#[derive(Clone, Debug)]
pub struct ReportIdentity {
    pub agent_id: String,
    pub datacenter_id: String,
    /// Endpoint the gateway dials back on, as ADDRESS:PORT.
    pub advertise_endpoint: String,
    pub gateway_token: Option<String>,
}

/// Run discovery cycles forever, refreshing the local store and reporting
/// the batch upward after each one. Report failures are logged and retried
/// on the next cycle; the registration converges as long as the gateway
/// comes back.
pub async fn run_discovery_loop(
    discovery: Discovery,
    store: ServerStore,
    gateway: GatewayClient<LoadBalancedChannel>,
    identity: ReportIdentity,
    interval: Duration,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        let servers = discovery.run_cycle().await;
        store.replace_all(servers.clone());

        let report = gateway_protos::AgentReport {
            agent_id: identity.agent_id.clone(),
            agent_endpoint: identity.advertise_endpoint.clone(),
            datacenter_id: identity.datacenter_id.clone(),
            servers: servers.into_iter().map(Into::into).collect(),
        };
        let mut request = Request::new(report);
        if let Some(token) = &identity.gateway_token {
            match format!("Bearer {token}").parse() {
                Ok(value) => {
                    request.metadata_mut().insert("authorization", value);
                }
                Err(_) => log::error!("gateway token is not a valid header value"),
            }
        }

        match gateway.clone().report_available_endpoints(request).await {
            Ok(ack) => {
                log::info!(
                    "gateway accepted {} endpoint(s) from {}",
                    ack.get_ref().accepted,
                    identity.agent_id
                );
            }
            Err(status) => {
                metrics::increment_counter!("bmc_agent_report_failures_total");
                log::warn!("endpoint report failed: {status}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                log::info!("stopping discovery loop");
                return;
            }
        }
    }
}
