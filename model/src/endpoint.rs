use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use protos::bmc::v1 as common_protos;

/// The protocol spoken by a BMC control endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    #[default]
    Ipmi,
    Redfish,
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointType::Ipmi => write!(f, "ipmi"),
            EndpointType::Redfish => write!(f, "redfish"),
        }
    }
}

impl FromStr for EndpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipmi" => Ok(EndpointType::Ipmi),
            "redfish" => Ok(EndpointType::Redfish),
            other => Err(format!("unknown endpoint type: {other}")),
        }
    }
}

impl From<EndpointType> for common_protos::EndpointType {
    fn from(t: EndpointType) -> Self {
        match t {
            EndpointType::Ipmi => common_protos::EndpointType::Ipmi,
            EndpointType::Redfish => common_protos::EndpointType::Redfish,
        }
    }
}

impl TryFrom<i32> for EndpointType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match common_protos::EndpointType::from_i32(value) {
            Some(common_protos::EndpointType::Ipmi) => Ok(EndpointType::Ipmi),
            Some(common_protos::EndpointType::Redfish) => Ok(EndpointType::Redfish),
            _ => Err(format!("unknown endpoint type value: {value}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<PowerState> for common_protos::PowerState {
    fn from(s: PowerState) -> Self {
        match s {
            PowerState::On => common_protos::PowerState::On,
            PowerState::Off => common_protos::PowerState::Off,
            PowerState::Unknown => common_protos::PowerState::Unknown,
        }
    }
}

impl From<i32> for PowerState {
    fn from(value: i32) -> Self {
        match common_protos::PowerState::from_i32(value) {
            Some(common_protos::PowerState::On) => PowerState::On,
            Some(common_protos::PowerState::Off) => PowerState::Off,
            _ => PowerState::Unknown,
        }
    }
}

/// A BMC control endpoint with its credentials. Credentials stay on the
/// agent -> manager registration path and inside sealed token context; they
/// are scrubbed from tenant-facing responses.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ControlEndpoint {
    pub endpoint: String,
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_verify: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl From<ControlEndpoint> for common_protos::ControlEndpoint {
    fn from(e: ControlEndpoint) -> Self {
        common_protos::ControlEndpoint {
            endpoint: e.endpoint,
            r#type: common_protos::EndpointType::from(e.endpoint_type) as i32,
            username: e.username,
            password: e.password,
            tls_enabled: e.tls_enabled,
            tls_verify: e.tls_verify,
            capabilities: e.capabilities,
        }
    }
}

impl TryFrom<common_protos::ControlEndpoint> for ControlEndpoint {
    type Error = String;

    fn try_from(e: common_protos::ControlEndpoint) -> Result<Self, Self::Error> {
        Ok(ControlEndpoint {
            endpoint_type: EndpointType::try_from(e.r#type)?,
            endpoint: e.endpoint,
            username: e.username,
            password: e.password,
            tls_enabled: e.tls_enabled,
            tls_verify: e.tls_verify,
            capabilities: e.capabilities,
        })
    }
}

/// Username/password material sealed into server tokens.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BmcCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolType {
    #[default]
    Ipmi,
    RedfishSerial,
}

impl SolType {
    /// Infer the SOL flavor from an endpoint's URL shape. An explicit type
    /// always wins over inference.
    pub fn infer(endpoint: &str, explicit: Option<SolType>) -> SolType {
        if let Some(t) = explicit {
            return t;
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            SolType::RedfishSerial
        } else {
            // `ipmi://host` or bare `host:port`.
            SolType::Ipmi
        }
    }
}

impl From<SolType> for common_protos::SolType {
    fn from(t: SolType) -> Self {
        match t {
            SolType::Ipmi => common_protos::SolType::Ipmi,
            SolType::RedfishSerial => common_protos::SolType::RedfishSerial,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SolEndpoint {
    pub endpoint: String,
    #[serde(rename = "type", default)]
    pub sol_type: Option<SolType>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl SolEndpoint {
    pub fn effective_type(&self) -> SolType {
        SolType::infer(&self.endpoint, self.sol_type)
    }
}

impl From<SolEndpoint> for common_protos::SolEndpoint {
    fn from(e: SolEndpoint) -> Self {
        let effective = e.effective_type();
        common_protos::SolEndpoint {
            endpoint: e.endpoint,
            r#type: common_protos::SolType::from(effective) as i32,
            username: e.username,
            password: e.password,
        }
    }
}

impl From<common_protos::SolEndpoint> for SolEndpoint {
    fn from(e: common_protos::SolEndpoint) -> Self {
        let sol_type = match common_protos::SolType::from_i32(e.r#type) {
            Some(common_protos::SolType::Ipmi) => Some(SolType::Ipmi),
            Some(common_protos::SolType::RedfishSerial) => Some(SolType::RedfishSerial),
            _ => None,
        };
        SolEndpoint {
            endpoint: e.endpoint,
            sol_type,
            username: e.username,
            password: e.password,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VncTransport {
    #[default]
    Native,
    Websocket,
}

impl VncTransport {
    /// Same inference rule as SOL: `https?://` means a websocket proxy, a
    /// bare `host:port` means native RFB.
    pub fn infer(endpoint: &str, explicit: Option<VncTransport>) -> VncTransport {
        if let Some(t) = explicit {
            return t;
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            VncTransport::Websocket
        } else {
            VncTransport::Native
        }
    }
}

impl From<VncTransport> for common_protos::VncTransport {
    fn from(t: VncTransport) -> Self {
        match t {
            VncTransport::Native => common_protos::VncTransport::Native,
            VncTransport::Websocket => common_protos::VncTransport::Websocket,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct VncEndpoint {
    pub endpoint: String,
    #[serde(rename = "type", default)]
    pub transport: Option<VncTransport>,
    #[serde(default)]
    pub password: String,
}

impl VncEndpoint {
    pub fn effective_transport(&self) -> VncTransport {
        VncTransport::infer(&self.endpoint, self.transport)
    }
}

impl From<VncEndpoint> for common_protos::VncEndpoint {
    fn from(e: VncEndpoint) -> Self {
        let effective = e.effective_transport();
        common_protos::VncEndpoint {
            endpoint: e.endpoint,
            transport: common_protos::VncTransport::from(effective) as i32,
            password: e.password,
        }
    }
}

impl From<common_protos::VncEndpoint> for VncEndpoint {
    fn from(e: common_protos::VncEndpoint) -> Self {
        let transport = match common_protos::VncTransport::from_i32(e.transport) {
            Some(common_protos::VncTransport::Native) => Some(VncTransport::Native),
            Some(common_protos::VncTransport::Websocket) => Some(VncTransport::Websocket),
            _ => None,
        };
        VncEndpoint {
            endpoint: e.endpoint,
            transport,
            password: e.password,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SolType, VncTransport};

    #[test]
    fn sol_type_inference() {
        assert_eq!(
            SolType::infer("https://10.0.0.5/redfish/v1", None),
            SolType::RedfishSerial
        );
        assert_eq!(SolType::infer("ipmi://10.0.0.5", None), SolType::Ipmi);
        assert_eq!(SolType::infer("10.0.0.5:623", None), SolType::Ipmi);
        // Explicit type always wins.
        assert_eq!(
            SolType::infer("https://10.0.0.5", Some(SolType::Ipmi)),
            SolType::Ipmi
        );
    }

    #[test]
    fn vnc_transport_inference() {
        assert_eq!(
            VncTransport::infer("http://10.0.0.5:8080/vnc", None),
            VncTransport::Websocket
        );
        assert_eq!(VncTransport::infer("10.0.0.5:5900", None), VncTransport::Native);
        assert_eq!(
            VncTransport::infer("10.0.0.5:5900", Some(VncTransport::Websocket)),
            VncTransport::Websocket
        );
    }
}
