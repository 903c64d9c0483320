//! Transport candidates
//!
//! Candidate types and RFC 8445 priorities. Sessions gather host candidates
//! from the façade (or interface enumeration), mapped candidates from UPnP
//! and relay candidates from the relay token.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::facade::{PortProtocol, UpnpProvider};
use crate::token::RelayServer;

// ============================================================================
// Constants (RFC 8445 Section 5.1.2.1)
// ============================================================================

const HOST_TYPE_PREF: u32 = 126;
const PRFLX_TYPE_PREF: u32 = 110;
const SRFLX_TYPE_PREF: u32 = 100;
const RELAY_TYPE_PREF: u32 = 0;

/// IPv4 slightly ahead of IPv6
const IPV4_LOCAL_PREF: u32 = 65535;
const IPV6_LOCAL_PREF: u32 = 65534;

/// Single component: one link per session
const COMPONENT_ID: u32 = 1;

// ============================================================================
// Candidate Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Public mapping (UPnP port mapping)
    Srflx,
    /// Learned from an unexpected source during checks
    Prflx,
    /// Relay server address from the token
    Relay,
}

impl CandidateType {
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => HOST_TYPE_PREF,
            CandidateType::Srflx => SRFLX_TYPE_PREF,
            CandidateType::Prflx => PRFLX_TYPE_PREF,
            CandidateType::Relay => RELAY_TYPE_PREF,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Candidate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
    pub address: SocketAddr,
    pub priority: u32,
    /// Base address a mapped or relayed candidate was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_address: Option<SocketAddr>,
}

impl Candidate {
    pub fn new(candidate_type: CandidateType, address: SocketAddr, related_address: Option<SocketAddr>) -> Self {
        let priority = calculate_priority(
            candidate_type.type_preference(),
            local_preference(&address),
            COMPONENT_ID,
        );
        Self {
            candidate_type,
            address,
            priority,
            related_address,
        }
    }

    pub fn host(address: SocketAddr) -> Self {
        Self::new(CandidateType::Host, address, None)
    }

    pub fn mapped(public_address: SocketAddr, base: SocketAddr) -> Self {
        Self::new(CandidateType::Srflx, public_address, Some(base))
    }

    pub fn peer_reflexive(address: SocketAddr) -> Self {
        Self::new(CandidateType::Prflx, address, None)
    }

    pub fn relay(relay_address: SocketAddr, base: SocketAddr) -> Self {
        Self::new(CandidateType::Relay, relay_address, Some(base))
    }

    pub fn is_relay(&self) -> bool {
        self.candidate_type == CandidateType::Relay
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} prio {}", self.candidate_type, self.address, self.priority)
    }
}

// ============================================================================
// Priority
// ============================================================================

/// `(2^24 * type_pref) + (2^8 * local_pref) + (256 - component_id)`
pub fn calculate_priority(type_pref: u32, local_pref: u32, component_id: u32) -> u32 {
    let type_pref = type_pref.min(126);
    let local_pref = local_pref.min(65535);
    let component_id = component_id.clamp(1, 256);
    (type_pref << 24) | (local_pref << 8) | (256 - component_id)
}

fn local_preference(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(_) => IPV4_LOCAL_PREF,
        IpAddr::V6(_) => IPV6_LOCAL_PREF,
    }
}

pub fn sort_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}

// ============================================================================
// Gathering
// ============================================================================

/// Host candidates on `port` for the addresses reported by the façade
///
/// IPv6 addresses are skipped: the session socket is bound to IPv4. When the
/// façade reports nothing the interfaces are enumerated, loopback excluded.
pub fn gather_host_candidates(reported: &[IpAddr], port: u16) -> Vec<Candidate> {
    let addrs: Vec<SocketAddr> = if reported.is_empty() {
        enumerate_local_addresses(port)
    } else {
        reported
            .iter()
            .filter(|ip| ip.is_ipv4() && !ip.is_unspecified())
            .map(|ip| SocketAddr::new(*ip, port))
            .collect()
    };
    let mut candidates: Vec<Candidate> = addrs.into_iter().map(Candidate::host).collect();
    candidates.dedup_by(|a, b| a.address == b.address);
    candidates
}

/// Mapped candidates from the UPnP gateway for `local_port`
///
/// Uses a fresh mapping when the gateway grants one, plus any existing
/// UDP mappings already pointing at the port.
pub fn gather_upnp_candidates(upnp: &dyn UpnpProvider, base: SocketAddr) -> Vec<Candidate> {
    let mut out = Vec::new();
    if let Some((ip, port)) = upnp.alloc_port(PortProtocol::Udp, base.port()) {
        out.push(Candidate::mapped(SocketAddr::new(ip, port), base));
    }
    for mapping in upnp.request_port_list() {
        if mapping.protocol != PortProtocol::Udp || mapping.internal_port != base.port() {
            continue;
        }
        if let Ok(ip) = mapping.remote_host.parse::<IpAddr>() {
            let addr = SocketAddr::new(ip, mapping.external_port);
            if !out.iter().any(|c: &Candidate| c.address == addr) {
                out.push(Candidate::mapped(addr, base));
            }
        }
    }
    out
}

/// Relay candidates for servers given by IP literal
pub fn gather_relay_candidates(servers: &[RelayServer], base: SocketAddr) -> Vec<Candidate> {
    servers
        .iter()
        .filter_map(|s| s.socket_addr())
        .filter(|addr| addr.is_ipv4())
        .map(|addr| Candidate::relay(addr, base))
        .collect()
}

// ============================================================================
// Interface Enumeration
// ============================================================================

/// Non-loopback IPv4 interface addresses, via getifaddrs
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                let sin = ifa.ifa_addr as *const libc::sockaddr_in;
                let ip = Ipv4Addr::from((*sin).sin_addr.s_addr.to_ne_bytes());
                if !ip.is_loopback() {
                    addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                }
            }
            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(_port: u16) -> Vec<SocketAddr> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtcError;
    use crate::facade::PortMapping;

    #[test]
    fn test_type_ordering() {
        let host = Candidate::host("10.0.0.1:5000".parse().unwrap());
        let prflx = Candidate::peer_reflexive("10.0.0.1:5000".parse().unwrap());
        let srflx = Candidate::mapped("1.2.3.4:6000".parse().unwrap(), host.address);
        let relay = Candidate::relay("5.6.7.8:3478".parse().unwrap(), host.address);
        assert!(host.priority > prflx.priority);
        assert!(prflx.priority > srflx.priority);
        assert!(srflx.priority > relay.priority);
    }

    #[test]
    fn test_calculate_priority() {
        assert_eq!(calculate_priority(126, 65535, 1), (126 << 24) | (65535 << 8) | 255);
        assert_eq!(calculate_priority(200, 70000, 0), calculate_priority(126, 65535, 1));
    }

    #[test]
    fn test_gather_host_from_reported() {
        let reported: Vec<IpAddr> = vec![
            "127.0.0.1".parse().unwrap(),
            "192.168.1.20".parse().unwrap(),
            "::1".parse().unwrap(),
            "0.0.0.0".parse().unwrap(),
        ];
        let cands = gather_host_candidates(&reported, 4000);
        assert_eq!(cands.len(), 2);
        assert!(cands.iter().all(|c| c.address.port() == 4000));
        assert_eq!(cands[0].address, "127.0.0.1:4000".parse().unwrap());
    }

    #[test]
    fn test_candidate_serde() {
        let c = Candidate::relay("5.6.7.8:3478".parse().unwrap(), "10.0.0.1:1".parse().unwrap());
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"type\":\"relay\""));
        let back: Candidate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    struct Gateway;

    impl UpnpProvider for Gateway {
        fn alloc_port(&self, _p: PortProtocol, local_port: u16) -> Option<(IpAddr, u16)> {
            Some(("203.0.113.7".parse().unwrap(), local_port + 1))
        }
        fn release_port(&self, _p: PortProtocol, _local_port: u16) {}
        fn bind_result(&self, _p: PortProtocol, _local_port: u16, _e: Option<RtcError>) {}
        fn request_port_list(&self) -> Vec<PortMapping> {
            vec![PortMapping {
                protocol: PortProtocol::Udp,
                external_port: 7000,
                remote_host: "203.0.113.7".into(),
                internal_port: 5000,
                internal_client: "192.168.1.20".into(),
                route_level: 1,
                index: 0,
            }]
        }
    }

    #[test]
    fn test_gather_upnp() {
        let base: SocketAddr = "192.168.1.20:5000".parse().unwrap();
        let cands = gather_upnp_candidates(&Gateway, base);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].address, "203.0.113.7:5001".parse().unwrap());
        assert!(cands.iter().all(|c| c.candidate_type == CandidateType::Srflx));
        assert_eq!(cands[1].related_address, Some(base));
    }

    #[test]
    fn test_gather_relay_skips_hostnames() {
        let servers = vec![
            "turn:1.2.3.4:9991?transport=udp".parse().unwrap(),
            "turn:relay.example.com:3478".parse().unwrap(),
        ];
        let cands = gather_relay_candidates(&servers, "10.0.0.1:1".parse().unwrap());
        assert_eq!(cands.len(), 1);
        assert!(cands[0].is_relay());
    }
}
