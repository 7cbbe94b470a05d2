use std::fmt;

use serde::{Deserialize, Serialize};

use protos::bmc::v1 as common_protos;

/// How a server record entered the control plane.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    StaticConfig,
    NetworkScan,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMethod::StaticConfig => write!(f, "static_config"),
            DiscoveryMethod::NetworkScan => write!(f, "network_scan"),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryProtocol {
    pub primary: String,
    #[serde(default)]
    pub console_type: String,
    #[serde(default)]
    pub vnc_transport: String,
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySecurity {
    pub tls_enabled: bool,
    pub tls_verify: bool,
    #[serde(default)]
    pub vnc_auth_type: String,
    #[serde(default)]
    pub vnc_password_length: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryNetwork {
    pub reachable: bool,
    pub ip_address: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryCapabilities {
    #[serde(default)]
    pub supported_features: Vec<String>,
    #[serde(default)]
    pub discovery_errors: Vec<String>,
}

/// Structured record attached to a Server at discovery time.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMetadata {
    pub discovery_method: DiscoveryMethod,
    /// The id of the agent which produced this record.
    pub discovery_source: String,
    pub protocol: DiscoveryProtocol,
    pub security: DiscoverySecurity,
    pub network: DiscoveryNetwork,
    pub capabilities: DiscoveryCapabilities,
    #[serde(default)]
    pub vendor: Option<String>,
}

impl From<DiscoveryMetadata> for common_protos::DiscoveryMetadata {
    fn from(m: DiscoveryMetadata) -> Self {
        common_protos::DiscoveryMetadata {
            discovery_method: m.discovery_method.to_string(),
            discovery_source: m.discovery_source,
            protocol: Some(common_protos::DiscoveryProtocol {
                primary: m.protocol.primary,
                console_type: m.protocol.console_type,
                vnc_transport: m.protocol.vnc_transport,
                fallback: m.protocol.fallback.unwrap_or_default(),
            }),
            security: Some(common_protos::DiscoverySecurity {
                tls_enabled: m.security.tls_enabled,
                tls_verify: m.security.tls_verify,
                vnc_auth_type: m.security.vnc_auth_type,
                vnc_password_length: m.security.vnc_password_length,
            }),
            network: Some(common_protos::DiscoveryNetwork {
                reachable: m.network.reachable,
                ip_address: m.network.ip_address,
            }),
            capabilities: Some(common_protos::DiscoveryCapabilities {
                supported_features: m.capabilities.supported_features,
                discovery_errors: m.capabilities.discovery_errors,
            }),
            vendor: m.vendor.unwrap_or_default(),
        }
    }
}

impl From<common_protos::DiscoveryMetadata> for DiscoveryMetadata {
    fn from(m: common_protos::DiscoveryMetadata) -> Self {
        let protocol = m.protocol.unwrap_or_default();
        let security = m.security.unwrap_or_default();
        let network = m.network.unwrap_or_default();
        let capabilities = m.capabilities.unwrap_or_default();
        DiscoveryMetadata {
            discovery_method: match m.discovery_method.as_str() {
                "network_scan" => DiscoveryMethod::NetworkScan,
                _ => DiscoveryMethod::StaticConfig,
            },
            discovery_source: m.discovery_source,
            protocol: DiscoveryProtocol {
                primary: protocol.primary,
                console_type: protocol.console_type,
                vnc_transport: protocol.vnc_transport,
                fallback: if protocol.fallback.is_empty() {
                    None
                } else {
                    Some(protocol.fallback)
                },
            },
            security: DiscoverySecurity {
                tls_enabled: security.tls_enabled,
                tls_verify: security.tls_verify,
                vnc_auth_type: security.vnc_auth_type,
                vnc_password_length: security.vnc_password_length,
            },
            network: DiscoveryNetwork {
                reachable: network.reachable,
                ip_address: network.ip_address,
            },
            capabilities: DiscoveryCapabilities {
                supported_features: capabilities.supported_features,
                discovery_errors: capabilities.discovery_errors,
            },
            vendor: if m.vendor.is_empty() {
                None
            } else {
                Some(m.vendor)
            },
        }
    }
}
