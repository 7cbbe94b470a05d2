#![deny(warnings)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::{Arg, Command};
use hyper::server::conn::AddrIncoming;
use protos::bmc::manager::v1::manager_client::ManagerClient;
use rpc_util::auth::octet_jwk_set;
use rpc_util::backend::construct_channel;
use rpc_util::hyper::AddrIncomingWithStream;
use rpc_util::infra::setup_infra_endpoints;
use rpc_util::logging::setup_logging;

use gateway::{GatewayApi, GatewayIdentity};

pub mod config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("gateway_server")
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
        config::Config::from_str(&config_content)?
    };

    setup_logging("gateway_server");

    let manager_channel = construct_channel(config.manager).await?;
    let api = GatewayApi::new(
        GatewayIdentity {
            gateway_id: config.gateway_id.clone(),
            region: config.region.clone(),
            public_endpoint: config.public_endpoint.clone(),
            fleet_token: config.fleet_token.clone(),
            agent_token: config.agent_token.clone(),
        },
        octet_jwk_set(&config.auth.key_id, config.auth.secret.as_bytes()),
        ManagerClient::new(manager_channel),
        Duration::from_secs(config.session_ttl_secs),
    );

    // Agents re-register us on every report; this just makes the gateway
    // visible upstream before the first report lands.
    if let Err(status) = api.register_upstream().await {
        log::warn!("initial gateway registration failed: {status}");
    } else {
        log::info!("registered gateway {} upstream", config.gateway_id);
    }

    let address: SocketAddr = config.listen_address.parse()?;
    let incoming = AddrIncoming::bind(&address).expect("failed to bind port");
    log::info!("Serving gateway on {address}");

    let mut shutdown_receiver = {
        let api = api.clone();
        setup_infra_endpoints(config.infra.unwrap_or_default(), move || {
            api.update_gauges();
        })
        .expect("setup infra endpoints")
    };

    api.serve_with_incoming_shutdown(
        AddrIncomingWithStream(incoming),
        async move { while shutdown_receiver.changed().await.is_ok() {} },
        config.grpc,
    )
    .await?;

    Ok(())
}
