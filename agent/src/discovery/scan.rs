use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use futures::stream::{self, StreamExt};
use ipnetwork::Ipv4Network;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};

/// At most this many addresses are probed per subnet per cycle.
const MAX_ADDRESSES_PER_SUBNET: usize = 100;

const IPMI_PORT: u16 = 623;
const REDFISH_PORTS: &[u16] = &[443, 8443, 8080];

const IPMI_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const REDFISH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

const PROBE_CONCURRENCY: usize = 32;

/// RMCP ASF presence ping, the standard liveness probe for IPMI over UDP/623.
const ASF_PRESENCE_PING: [u8; 12] = [
    0x06, 0x00, 0xff, 0x06, // RMCP header, ASF class
    0x00, 0x00, 0x11, 0xbe, // ASF IANA enterprise number
    0x80, 0x00, 0x00, 0x00, // presence ping, tag 0, no data
];

/// What a probe sweep found at one address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeHit {
    Ipmi {
        ip: Ipv4Addr,
    },
    Redfish {
        ip: Ipv4Addr,
        port: u16,
        tls: bool,
    },
}

impl ProbeHit {
    pub fn endpoint(&self) -> String {
        match self {
            ProbeHit::Ipmi { ip } => format!("{ip}:{IPMI_PORT}"),
            ProbeHit::Redfish { ip, port: 443, .. } => format!("https://{ip}"),
            ProbeHit::Redfish { ip, port, tls: true } => format!("https://{ip}:{port}"),
            ProbeHit::Redfish { ip, port, tls: false } => format!("http://{ip}:{port}"),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        match self {
            ProbeHit::Ipmi { ip } => *ip,
            ProbeHit::Redfish { ip, .. } => *ip,
        }
    }
}

/// Sweep one subnet: each candidate IPv4 gets an IPMI probe and, failing
/// that, a Redfish probe; the first positive response wins per IP.
pub async fn scan_subnet(subnet: Ipv4Network) -> Vec<ProbeHit> {
    let candidates: Vec<Ipv4Addr> = subnet
        .iter()
        .filter(|ip| {
            let last = ip.octets()[3];
            (1..=254).contains(&last)
        })
        .take(MAX_ADDRESSES_PER_SUBNET)
        .collect();

    log::debug!("scanning {} addresses in {subnet}", candidates.len());
    stream::iter(candidates)
        .map(probe_address)
        .buffer_unordered(PROBE_CONCURRENCY)
        .filter_map(futures::future::ready)
        .collect()
        .await
}

async fn probe_address(ip: Ipv4Addr) -> Option<ProbeHit> {
    if probe_ipmi(ip).await {
        return Some(ProbeHit::Ipmi { ip });
    }
    probe_redfish(ip).await
}

/// Send an ASF presence ping and wait briefly for any reply.
async fn probe_ipmi(ip: Ipv4Addr) -> bool {
    let target = SocketAddr::new(IpAddr::V4(ip), IPMI_PORT);
    let probe = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.send_to(&ASF_PRESENCE_PING, target).await.ok()?;
        let mut buf = [0u8; 64];
        socket.recv_from(&mut buf).await.ok()?;
        Some(())
    };
    timeout(IPMI_PROBE_TIMEOUT, probe).await.ok().flatten().is_some()
}

/// Try the common Redfish ports in order; first connect wins.
async fn probe_redfish(ip: Ipv4Addr) -> Option<ProbeHit> {
    for &port in REDFISH_PORTS {
        let target = SocketAddr::new(IpAddr::V4(ip), port);
        if timeout(REDFISH_PROBE_TIMEOUT, TcpStream::connect(target))
            .await
            .ok()
            .and_then(|r| r.ok())
            .is_some()
        {
            return Some(ProbeHit::Redfish {
                ip,
                port,
                tls: port != 8080,
            });
        }
    }
    None
}

/// Figure out which subnets to scan when none are configured: every up
/// RFC1918 IPv4 interface contributes its /24, with common defaults as the
/// last resort.
pub fn detect_local_subnets() -> Vec<Ipv4Network> {
    let mut subnets = Vec::new();
    if let Ok(interfaces) = local_ip_address::list_afinet_netifas() {
        for (name, addr) in interfaces {
            let IpAddr::V4(ip) = addr else { continue };
            if ip.is_loopback() || !ip.is_private() {
                continue;
            }
            let octets = ip.octets();
            let base = Ipv4Addr::new(octets[0], octets[1], octets[2], 0);
            match Ipv4Network::new(base, 24) {
                Ok(subnet) if !subnets.contains(&subnet) => {
                    log::debug!("interface {name} contributes subnet {subnet}");
                    subnets.push(subnet);
                }
                _ => {}
            }
        }
    }
    if subnets.is_empty() {
        subnets = default_subnets();
    }
    subnets
}

fn default_subnets() -> Vec<Ipv4Network> {
    ["192.168.1.0/24", "192.168.0.0/24", "10.0.0.0/24"]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}
