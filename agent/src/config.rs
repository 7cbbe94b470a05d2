use std::collections::HashMap;
use std::str::FromStr;

use model::{ControlEndpoint, SolEndpoint, VncEndpoint};
use rpc_util::infra::{GrpcConfig, InfraConfig};
use serde::Deserialize;

#[derive(Deserialize, Debug, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Deserialize, Debug, Default)]
pub struct DiscoveryConfig {
    /// Whether subnet scanning runs at all; static hosts load regardless.
    #[serde(default)]
    pub enabled: bool,
    /// CIDR subnets to scan. Empty means auto-detect from local interfaces.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Credentials assumed for endpoints found by scanning.
    #[serde(default)]
    pub default_username: String,
    #[serde(default)]
    pub default_password: String,
    /// Seconds between discovery/report cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    300
}

#[derive(Deserialize, Debug, Default)]
pub struct OperationsConfig {
    /// Path to the ipmitool binary.
    #[serde(default = "default_ipmitool_path")]
    pub ipmitool_path: String,
    /// Per-call IPMI timeout in seconds.
    #[serde(default = "default_ipmi_timeout_secs")]
    pub ipmi_timeout_secs: u64,
}

fn default_ipmitool_path() -> String {
    "ipmitool".to_owned()
}

fn default_ipmi_timeout_secs() -> u64 {
    10
}

#[derive(Deserialize, Debug, Default)]
pub struct SecurityConfig {
    /// Base64 fleet sealing key; AGENT_ENCRYPTION_KEY overrides.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct AgentSection {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub datacenter_id: String,
    #[serde(default)]
    pub region: String,
    /// ADDRESS:PORT of the regional gateway; AGENT_GATEWAY_ENDPOINT overrides.
    pub gateway_endpoint: String,
    /// Endpoint the gateway should dial back on, as ADDRESS:PORT.
    pub advertise_endpoint: String,
    /// gRPC listen address.
    pub listen_address: String,
    /// Port for the agent's plain HTTP endpoints (/health, /api/v1/bmcs).
    #[serde(default)]
    pub http_port: Option<u16>,
    /// Shared token presented to the gateway on reports, if it requires one.
    #[serde(default)]
    pub gateway_token: Option<String>,
    #[serde(default)]
    pub bmc_discovery: DiscoveryConfig,
    #[serde(default)]
    pub bmc_operations: OperationsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

/// A host pinned in configuration rather than found by scanning.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct StaticHost {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer_id: String,
    pub control_endpoints: Vec<ControlEndpoint>,
    #[serde(default)]
    pub sol_endpoint: Option<SolEndpoint>,
    #[serde(default)]
    pub vnc_endpoint: Option<VncEndpoint>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct StaticSection {
    #[serde(default)]
    pub hosts: Vec<StaticHost>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    pub agent: AgentSection,
    /// Legacy section name kept for existing fleet configs.
    #[serde(default, rename = "static")]
    pub static_hosts: StaticSection,
    /// Admin endpoints configuration.
    #[serde(default)]
    pub infra: Option<InfraConfig>,
    /// gRPC configuration.
    #[serde(default)]
    pub grpc: Option<GrpcConfig>,
}

impl Config {
    /// Apply the environment overrides every deployment relies on.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("AGENT_GATEWAY_ENDPOINT") {
            self.agent.gateway_endpoint = endpoint;
        }
        if let Ok(datacenter_id) = std::env::var("AGENT_DATACENTER_ID") {
            self.agent.datacenter_id = datacenter_id;
        }
        if let Ok(id) = std::env::var("AGENT_ID") {
            self.agent.id = id;
        }
        if let Ok(key) = std::env::var("AGENT_ENCRYPTION_KEY") {
            self.agent.security.encryption_key = Some(key);
        }
    }
}

impl FromStr for Config {
    type Err = String;

    fn from_str(raw_config: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }
}
