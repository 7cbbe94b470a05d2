#![deny(warnings)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bmc::{BmcExecutor, IpmiDriver};
use clap::{Arg, Command};
use hyper::server::conn::AddrIncoming;
use protos::bmc::gateway::v1::gateway_client::GatewayClient;
use rpc_util::backend::{construct_channel, BackendConfig};
use rpc_util::hyper::AddrIncomingWithStream;
use rpc_util::infra::setup_infra_endpoints;
use rpc_util::logging::setup_logging;
use rpc_util::seal::SealingKey;

use agent::report::ReportIdentity;
use agent::{AgentApi, Config, Discovery, ServerStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("agent_server")
        .arg(
            Arg::new("config")
                .short('c')
                .required(true)
                .value_name("FILE"),
        )
        .get_matches();

    let config = {
        let filename = matches.get_one::<String>("config").unwrap();
        let config_content = tokio::fs::read_to_string(&filename)
            .await
            .map_err(|err| format!("Failed to read config from {}: {}", &filename, err))?;
        let mut config = Config::from_str(&config_content)?;
        config.apply_env_overrides();
        config
    };

    setup_logging("agent_server");
    log::info!(
        "agent {} starting for datacenter {}",
        config.agent.id,
        config.agent.datacenter_id
    );

    let sealing_key = match &config.agent.security.encryption_key {
        Some(encoded) => Some(SealingKey::from_base64(encoded)?),
        None => {
            log::warn!("no fleet encryption key configured; sealed token context will be ignored");
            None
        }
    };

    let store = ServerStore::new();
    let executor = BmcExecutor::with_ipmi_driver(IpmiDriver::new(
        config.agent.bmc_operations.ipmitool_path.clone(),
        Duration::from_secs(config.agent.bmc_operations.ipmi_timeout_secs),
    ));
    let sessions = executor.session_tracker().clone();
    let api = AgentApi::new(
        store.clone(),
        executor,
        sealing_key,
        config.agent.bmc_operations.ipmitool_path.clone(),
    );

    let discovery = Discovery::new(&config.agent, config.static_hosts.hosts.clone())?;
    let gateway_channel = construct_channel(BackendConfig::from_address(
        config.agent.gateway_endpoint.clone(),
    ))
    .await?;
    let gateway_client = GatewayClient::new(gateway_channel);

    let shutdown_receiver = setup_infra_endpoints(config.infra.clone().unwrap_or_default(), || {})
        .expect("setup infra endpoints");

    if let Some(port) = config.agent.http_port {
        agent::http::spawn(port, store.clone());
    }

    tokio::spawn(agent::report::run_discovery_loop(
        discovery,
        store,
        gateway_client,
        ReportIdentity {
            agent_id: config.agent.id.clone(),
            datacenter_id: config.agent.datacenter_id.clone(),
            advertise_endpoint: config.agent.advertise_endpoint.clone(),
            gateway_token: config.agent.gateway_token.clone(),
        },
        Duration::from_secs(config.agent.bmc_discovery.interval_secs),
        shutdown_receiver.clone(),
    ));

    let address: SocketAddr = config.agent.listen_address.parse()?;
    let incoming = AddrIncoming::bind(&address).expect("failed to bind port");
    log::info!("Serving agent on {address}");

    let mut shutdown_receiver = shutdown_receiver;
    api.serve_with_incoming_shutdown(
        AddrIncomingWithStream(incoming),
        async move { while shutdown_receiver.changed().await.is_ok() {} },
        config.grpc,
    )
    .await?;

    // Leave no sessions behind on the BMCs we talked to.
    sessions.close_all().await;

    Ok(())
}
