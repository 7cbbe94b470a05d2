use ginepro::LoadBalancedChannel;
use serde::Deserialize;

/// A gRPC backend reachable at ADDRESS:PORT, e.g. the manager as seen from a
/// gateway, or an agent as seen from its gateway.
#[derive(Clone, Deserialize, Debug)]
pub struct BackendConfig {
    /// ADDRESS:PORT of this backend.
    pub address: String,

    /// Number of concurrent connections to maintain to this backend.
    #[serde(default = "default_connections")]
    pub connections: usize,
}

fn default_connections() -> usize {
    1
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            address: String::new(),
            connections: default_connections(),
        }
    }
}

impl BackendConfig {
    pub fn from_address(address: impl Into<String>) -> Self {
        BackendConfig {
            address: address.into(),
            connections: default_connections(),
        }
    }
}

pub async fn construct_channel(config: BackendConfig) -> Result<LoadBalancedChannel, String> {
    // Tolerate addresses copied out of client configs with a scheme prefix.
    let address = config
        .address
        .trim_start_matches("http://")
        .trim_start_matches("grpc://");
    let (hostname, port_str) = match address.split_once(':') {
        Some((h, p)) => (h, p),
        None => return Err("Expected NAME:PORT".to_owned()),
    };
    if hostname.is_empty() || port_str.is_empty() {
        return Err("Expected NAME:PORT".to_owned());
    }
    let port: u16 = match port_str.parse() {
        Ok(p) => p,
        Err(_) => return Err("Unable to parse port".into()),
    };
    let service_definition = match ginepro::ServiceDefinition::from_parts(hostname, port) {
        Ok(sd) => sd,
        Err(err) => {
            return Err(format!(
                "failed to initialize ginepro ServiceDefinition: {err}"
            ))
        }
    };

    ginepro::LoadBalancedChannel::builder(service_definition)
        .channel()
        .await
        .map_err(|err| format!("failed to initialize channel: {err}"))
}
