use std::collections::HashMap;
use std::str::FromStr;

use rpc_util::auth::FleetTokenEntry;
use rpc_util::infra::{GrpcConfig, InfraConfig};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct AuthConfig {
    /// Key id stamped into minted JWTs.
    pub key_id: String,
    /// HS256 signing secret, shared with gateways for validation.
    pub secret: String,
    /// Base64 fleet sealing key (32 bytes), shared with agents only.
    #[serde(default)]
    pub sealing_key: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct BootstrapCustomer {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// IP address on which to listen for connections.
    pub listen_address: String,

    pub auth: AuthConfig,

    /// Static fleet tokens for gateways, keyed by the token string.
    #[serde(default)]
    pub fleet_tokens: HashMap<String, FleetTokenEntry>,

    /// Customers created at startup if they do not exist yet. Intended for
    /// dev and test environments.
    #[serde(default)]
    pub bootstrap_customers: Vec<BootstrapCustomer>,

    /// Admin endpoints configuration.
    pub infra: Option<InfraConfig>,

    /// gRPC configuration.
    pub grpc: Option<GrpcConfig>,
}

impl FromStr for Config {
    type Err = String;

    fn from_str(raw_config: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }
}
