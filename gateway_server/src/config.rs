use std::str::FromStr;

use rpc_util::backend::BackendConfig;
use rpc_util::infra::{GrpcConfig, InfraConfig};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct AuthConfig {
    /// Key id and HS256 secret validating manager-minted server tokens.
    pub key_id: String,
    pub secret: String,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// IP address on which to listen for connections.
    pub listen_address: String,

    pub gateway_id: String,
    pub region: String,
    /// The endpoint tenants reach this gateway on; registered upstream and
    /// baked into session URLs.
    pub public_endpoint: String,

    /// Static token authenticating this gateway to the manager.
    pub fleet_token: String,
    /// Shared token agents must present on endpoint reports, if set.
    #[serde(default)]
    pub agent_token: Option<String>,

    pub auth: AuthConfig,

    /// Configuration for the connection to the manager.
    pub manager: BackendConfig,

    /// Console session TTL in seconds.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Admin endpoints configuration.
    pub infra: Option<InfraConfig>,

    /// gRPC configuration.
    pub grpc: Option<GrpcConfig>,
}

fn default_session_ttl_secs() -> u64 {
    3600
}

impl FromStr for Config {
    type Err = String;

    fn from_str(raw_config: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }
}
