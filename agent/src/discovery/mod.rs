pub mod scan;

use std::collections::HashSet;

use ipnetwork::Ipv4Network;
use model::{
    generate_server_id, ControlEndpoint, DiscoveryCapabilities, DiscoveryMetadata,
    DiscoveryMethod, DiscoveryNetwork, DiscoveryProtocol, DiscoverySecurity, EndpointType,
    Server, ServerStatus, SolType, VncTransport,
};

use crate::config::{AgentSection, StaticHost};

use scan::ProbeHit;

/// Produces the full server list for this agent's datacenter in one cycle:
/// static hosts first, then (when enabled) a subnet sweep, deduplicated by
/// primary endpoint.
pub struct Discovery {
    agent_id: String,
    datacenter_id: String,
    scan_enabled: bool,
    subnets: Vec<Ipv4Network>,
    default_username: String,
    default_password: String,
    static_hosts: Vec<StaticHost>,
}

impl Discovery {
    pub fn new(agent: &AgentSection, static_hosts: Vec<StaticHost>) -> Result<Self, String> {
        let mut subnets = Vec::new();
        for raw in &agent.bmc_discovery.subnets {
            let subnet: Ipv4Network = raw
                .parse()
                .map_err(|err| format!("invalid subnet {raw}: {err}"))?;
            subnets.push(subnet);
        }
        Ok(Discovery {
            agent_id: agent.id.clone(),
            datacenter_id: agent.datacenter_id.clone(),
            scan_enabled: agent.bmc_discovery.enabled,
            subnets,
            default_username: agent.bmc_discovery.default_username.clone(),
            default_password: agent.bmc_discovery.default_password.clone(),
            static_hosts,
        })
    }

    /// One discovery cycle. Static hosts always load; the scan only runs if
    /// enabled, and its findings are dropped where they collide with a
    /// statically configured endpoint.
    pub async fn run_cycle(&self) -> Vec<Server> {
        let mut servers: Vec<Server> = self
            .static_hosts
            .iter()
            .map(|host| self.static_host_to_server(host))
            .collect();

        let static_endpoints: HashSet<String> = servers
            .iter()
            .filter_map(|s| s.primary_control_endpoint())
            .map(|e| e.endpoint.clone())
            .collect();

        if self.scan_enabled {
            let subnets = if self.subnets.is_empty() {
                scan::detect_local_subnets()
            } else {
                self.subnets.clone()
            };
            for subnet in subnets {
                let hits = scan::scan_subnet(subnet).await;
                self.merge_scan_results(&mut servers, &static_endpoints, hits);
            }
        }

        metrics::gauge!("bmc_agent_discovered_servers", servers.len() as f64, "datacenter" => self.datacenter_id.clone());
        log::info!(
            "discovery cycle produced {} server(s) for {}",
            servers.len(),
            self.datacenter_id
        );
        servers
    }

    /// Fold scan hits into the server list, dropping any hit whose endpoint
    /// is already pinned by static configuration.
    fn merge_scan_results(
        &self,
        servers: &mut Vec<Server>,
        static_endpoints: &HashSet<String>,
        hits: Vec<ProbeHit>,
    ) {
        for hit in hits {
            if static_endpoints.contains(&hit.endpoint()) {
                log::debug!(
                    "dropping scanned duplicate of static endpoint {}",
                    hit.endpoint()
                );
                continue;
            }
            servers.push(self.probe_hit_to_server(&hit));
        }
    }

    fn static_host_to_server(&self, host: &StaticHost) -> Server {
        let primary = host
            .control_endpoints
            .first()
            .cloned()
            .unwrap_or_default();
        let id = host
            .id
            .clone()
            .unwrap_or_else(|| generate_server_id(&self.datacenter_id, &primary.endpoint));

        let console_type = host
            .sol_endpoint
            .as_ref()
            .map(|s| match s.effective_type() {
                SolType::Ipmi => "ipmi_sol".to_owned(),
                SolType::RedfishSerial => "redfish_serial".to_owned(),
            })
            .unwrap_or_default();
        let vnc_transport = host
            .vnc_endpoint
            .as_ref()
            .map(|v| match v.effective_transport() {
                VncTransport::Native => "native".to_owned(),
                VncTransport::Websocket => "websocket".to_owned(),
            })
            .unwrap_or_default();

        Server {
            id,
            customer_id: host.customer_id.clone(),
            datacenter_id: self.datacenter_id.clone(),
            control_endpoints: host.control_endpoints.clone(),
            primary_protocol: primary.endpoint_type,
            sol_endpoint: host.sol_endpoint.clone(),
            vnc_endpoint: host.vnc_endpoint.clone(),
            features: host.features.clone(),
            status: ServerStatus::Configured,
            metadata: host.metadata.clone(),
            discovery_metadata: Some(DiscoveryMetadata {
                discovery_method: DiscoveryMethod::StaticConfig,
                discovery_source: self.agent_id.clone(),
                protocol: DiscoveryProtocol {
                    primary: primary.endpoint_type.to_string(),
                    console_type,
                    vnc_transport,
                    fallback: None,
                },
                security: DiscoverySecurity {
                    tls_enabled: primary.tls_enabled,
                    tls_verify: primary.tls_verify,
                    vnc_auth_type: host
                        .vnc_endpoint
                        .as_ref()
                        .map(|v| {
                            if v.password.is_empty() {
                                "none".to_owned()
                            } else {
                                "password".to_owned()
                            }
                        })
                        .unwrap_or_default(),
                    vnc_password_length: host
                        .vnc_endpoint
                        .as_ref()
                        .map(|v| v.password.len() as u32)
                        .unwrap_or(0),
                },
                network: DiscoveryNetwork {
                    // Static hosts are trusted as configured; reachability is
                    // established on first use, not at load time.
                    reachable: true,
                    ip_address: host_ip(&primary.endpoint),
                },
                capabilities: DiscoveryCapabilities {
                    supported_features: host.features.clone(),
                    discovery_errors: vec![],
                },
                vendor: None,
            }),
            created_at: None,
            updated_at: None,
        }
    }

    fn probe_hit_to_server(&self, hit: &ProbeHit) -> Server {
        let (endpoint_type, tls_enabled, features) = match hit {
            ProbeHit::Ipmi { .. } => (
                EndpointType::Ipmi,
                false,
                vec!["power".to_owned(), "console".to_owned()],
            ),
            ProbeHit::Redfish { tls, .. } => {
                (EndpointType::Redfish, *tls, vec!["power".to_owned()])
            }
        };
        let endpoint = ControlEndpoint {
            endpoint: hit.endpoint(),
            endpoint_type,
            username: self.default_username.clone(),
            password: self.default_password.clone(),
            tls_enabled,
            tls_verify: false,
            capabilities: features.clone(),
        };

        Server {
            id: generate_server_id(&self.datacenter_id, &endpoint.endpoint),
            customer_id: String::new(),
            datacenter_id: self.datacenter_id.clone(),
            primary_protocol: endpoint.endpoint_type,
            control_endpoints: vec![endpoint],
            sol_endpoint: None,
            vnc_endpoint: None,
            features: features.clone(),
            status: ServerStatus::Discovered,
            metadata: Default::default(),
            discovery_metadata: Some(DiscoveryMetadata {
                discovery_method: DiscoveryMethod::NetworkScan,
                discovery_source: self.agent_id.clone(),
                protocol: DiscoveryProtocol {
                    primary: endpoint_type.to_string(),
                    console_type: match endpoint_type {
                        EndpointType::Ipmi => "ipmi_sol".to_owned(),
                        EndpointType::Redfish => String::new(),
                    },
                    vnc_transport: String::new(),
                    fallback: None,
                },
                security: DiscoverySecurity {
                    tls_enabled,
                    tls_verify: false,
                    vnc_auth_type: String::new(),
                    vnc_password_length: 0,
                },
                network: DiscoveryNetwork {
                    reachable: true,
                    ip_address: hit.ip().to_string(),
                },
                capabilities: DiscoveryCapabilities {
                    supported_features: features,
                    discovery_errors: vec![],
                },
                vendor: None,
            }),
            created_at: None,
            updated_at: None,
        }
    }
}

fn host_ip(endpoint: &str) -> String {
    let stripped = endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("ipmi://");
    stripped
        .split_once(':')
        .map(|(host, _)| host)
        .unwrap_or(stripped)
        .trim_end_matches('/')
        .to_owned()
}

#[cfg(test)]
mod tests {
    use model::{DiscoveryMethod, EndpointType, ServerStatus};

    use crate::config::{AgentSection, Config, StaticHost};

    use super::Discovery;

    fn agent_section() -> AgentSection {
        let raw = r#"
agent:
  id: agent-dc-a
  datacenter_id: dc-a
  gateway_endpoint: gw:9443
  advertise_endpoint: 10.0.0.2:9444
  listen_address: 0.0.0.0:9444
"#;
        let config: Config = raw.parse().unwrap();
        config.agent
    }

    fn static_host(endpoint: &str) -> StaticHost {
        let raw = format!(
            r#"
control_endpoints:
  - endpoint: {endpoint}
    type: ipmi
    username: admin
    password: secret
"#
        );
        serde_yaml::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn static_hosts_become_configured_servers() {
        let discovery =
            Discovery::new(&agent_section(), vec![static_host("192.168.1.100:623")]).unwrap();
        let servers = discovery.run_cycle().await;
        assert_eq!(servers.len(), 1);
        let server = &servers[0];
        assert_eq!(server.status, ServerStatus::Configured);
        assert_eq!(server.primary_protocol, EndpointType::Ipmi);
        assert_eq!(
            server.id,
            model::generate_server_id("dc-a", "192.168.1.100:623")
        );
        let metadata = server.discovery_metadata.as_ref().unwrap();
        assert_eq!(metadata.discovery_method, DiscoveryMethod::StaticConfig);
        assert_eq!(metadata.discovery_source, "agent-dc-a");
        assert_eq!(metadata.network.ip_address, "192.168.1.100");
    }

    #[tokio::test]
    async fn ids_are_stable_across_cycles() {
        let discovery =
            Discovery::new(&agent_section(), vec![static_host("192.168.1.100:623")]).unwrap();
        let first = discovery.run_cycle().await;
        let second = discovery.run_cycle().await;
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn invalid_subnet_is_rejected() {
        let mut agent = agent_section();
        agent.bmc_discovery.subnets = vec!["not-a-subnet".to_owned()];
        assert!(Discovery::new(&agent, vec![]).is_err());
    }

    #[tokio::test]
    async fn scan_hits_matching_static_endpoints_are_dropped() {
        use std::collections::HashSet;
        use std::net::Ipv4Addr;

        use super::scan::ProbeHit;

        let discovery =
            Discovery::new(&agent_section(), vec![static_host("192.168.1.100:623")]).unwrap();
        let mut servers = discovery.run_cycle().await;
        let static_endpoints: HashSet<String> =
            ["192.168.1.100:623".to_owned()].into_iter().collect();

        let hits = vec![
            // Re-finds the statically configured host; must not duplicate it.
            ProbeHit::Ipmi {
                ip: Ipv4Addr::new(192, 168, 1, 100),
            },
            ProbeHit::Ipmi {
                ip: Ipv4Addr::new(192, 168, 1, 101),
            },
        ];
        discovery.merge_scan_results(&mut servers, &static_endpoints, hits);

        assert_eq!(servers.len(), 2);
        let configured = &servers[0];
        assert_eq!(configured.status, ServerStatus::Configured);
        assert_eq!(
            configured.primary_control_endpoint().unwrap().endpoint,
            "192.168.1.100:623"
        );
        let discovered = &servers[1];
        assert_eq!(discovered.status, ServerStatus::Discovered);
        assert_eq!(
            discovered.primary_control_endpoint().unwrap().endpoint,
            "192.168.1.101:623"
        );
    }
}
