use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use protos::bmc::v1 as common_protos;

use crate::discovery::DiscoveryMetadata;
use crate::endpoint::{ControlEndpoint, EndpointType, SolEndpoint, VncEndpoint};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Configured,
    Discovered,
    Active,
    Unreachable,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Configured => write!(f, "configured"),
            ServerStatus::Discovered => write!(f, "discovered"),
            ServerStatus::Active => write!(f, "active"),
            ServerStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configured" => Ok(ServerStatus::Configured),
            "discovered" => Ok(ServerStatus::Discovered),
            "active" => Ok(ServerStatus::Active),
            "unreachable" => Ok(ServerStatus::Unreachable),
            other => Err(format!("unknown server status: {other}")),
        }
    }
}

/// A physical machine's BMC footprint as seen by the control plane.
///
/// The id is derived from `(datacenter_id, primary_bmc_endpoint)` so that
/// rediscovery of the same hardware is idempotent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub customer_id: String,
    pub datacenter_id: String,
    pub control_endpoints: Vec<ControlEndpoint>,
    pub primary_protocol: EndpointType,
    #[serde(default)]
    pub sol_endpoint: Option<SolEndpoint>,
    #[serde(default)]
    pub vnc_endpoint: Option<VncEndpoint>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub discovery_metadata: Option<DiscoveryMetadata>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Server {
    /// The endpoint used to control this server: the first control endpoint
    /// whose type matches `primary_protocol`, falling back to the first
    /// endpoint. Returns None when no control endpoints exist at all.
    pub fn primary_control_endpoint(&self) -> Option<&ControlEndpoint> {
        self.control_endpoints
            .iter()
            .find(|e| e.endpoint_type == self.primary_protocol)
            .or_else(|| self.control_endpoints.first())
    }

    /// Scrub credential material for tenant-facing responses.
    pub fn scrubbed(mut self) -> Server {
        for endpoint in &mut self.control_endpoints {
            endpoint.username.clear();
            endpoint.password.clear();
        }
        if let Some(sol) = self.sol_endpoint.as_mut() {
            sol.username.clear();
            sol.password.clear();
        }
        if let Some(vnc) = self.vnc_endpoint.as_mut() {
            vnc.password.clear();
        }
        self
    }
}

fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl From<Server> for common_protos::Server {
    fn from(s: Server) -> Self {
        common_protos::Server {
            id: s.id,
            customer_id: s.customer_id,
            datacenter_id: s.datacenter_id,
            control_endpoints: s
                .control_endpoints
                .into_iter()
                .map(common_protos::ControlEndpoint::from)
                .collect(),
            primary_protocol: common_protos::EndpointType::from(s.primary_protocol) as i32,
            sol_endpoint: s.sol_endpoint.map(common_protos::SolEndpoint::from),
            vnc_endpoint: s.vnc_endpoint.map(common_protos::VncEndpoint::from),
            features: s.features,
            status: s.status.to_string(),
            metadata: s.metadata,
            discovery_metadata: s
                .discovery_metadata
                .map(common_protos::DiscoveryMetadata::from),
            created_at: format_timestamp(s.created_at),
            updated_at: format_timestamp(s.updated_at),
        }
    }
}

impl TryFrom<common_protos::Server> for Server {
    type Error = String;

    fn try_from(s: common_protos::Server) -> Result<Self, Self::Error> {
        Ok(Server {
            primary_protocol: EndpointType::try_from(s.primary_protocol)?,
            control_endpoints: s
                .control_endpoints
                .into_iter()
                .map(ControlEndpoint::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            id: s.id,
            customer_id: s.customer_id,
            datacenter_id: s.datacenter_id,
            sol_endpoint: s.sol_endpoint.map(SolEndpoint::from),
            vnc_endpoint: s.vnc_endpoint.map(VncEndpoint::from),
            features: s.features,
            status: s.status.parse().unwrap_or_default(),
            metadata: s.metadata,
            discovery_metadata: s.discovery_metadata.map(DiscoveryMetadata::from),
            created_at: parse_timestamp(&s.created_at),
            updated_at: parse_timestamp(&s.updated_at),
        })
    }
}
