#![deny(warnings)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Arg, Command};
use hyper::server::conn::AddrIncoming;
use rpc_util::auth::FleetToken;
use rpc_util::hyper::AddrIncomingWithStream;
use rpc_util::infra::setup_infra_endpoints;
use rpc_util::logging::setup_logging;
use rpc_util::seal::SealingKey;

use manager::repository::MemoryRepository;
use manager::{ManagerApi, TokenIssuer};

pub mod config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("manager_server")
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

    setup_logging("manager_server");

    let sealing_key = match &config.auth.sealing_key {
        Some(encoded) => Some(SealingKey::from_base64(encoded)?),
        None => {
            log::warn!("no sealing key configured; server tokens will not carry credentials");
            None
        }
    };
    let issuer = TokenIssuer::new(
        config.auth.key_id.clone(),
        config.auth.secret.clone().into_bytes(),
        sealing_key,
    );

    let fleet_tokens = config
        .fleet_tokens
        .into_iter()
        .map(|(token, entry)| (FleetToken::new(token), entry))
        .collect();

    let repository = Arc::new(MemoryRepository::new());
    let api = ManagerApi::new(repository, issuer, fleet_tokens);

    for customer in &config.bootstrap_customers {
        let created = api
            .bootstrap_customer(&customer.email, &customer.password, customer.is_admin)
            .await
            .map_err(|err| format!("failed to bootstrap {}: {err}", customer.email))?;
        log::info!("bootstrap customer {} ({})", created.email, created.id);
    }

    let address: SocketAddr = config.listen_address.parse()?;
    let incoming = AddrIncoming::bind(&address).expect("failed to bind port");
    log::info!("Serving manager on {address}");

    let mut shutdown_receiver = setup_infra_endpoints(config.infra.unwrap_or_default(), || {})
        .expect("setup infra endpoints");

    api.serve_with_incoming_shutdown(
        AddrIncomingWithStream(incoming),
        async move { while shutdown_receiver.changed().await.is_ok() {} },
        config.grpc,
    )
    .await?;

    Ok(())
}
