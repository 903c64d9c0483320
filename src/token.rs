//! Relay token
//!
//! TURN-style credentials issued by the cloud service:
//!
//! ```json
//! {"username":"..","password":"..","ttl":86400,
//!  "uris":["turn:1.2.3.4:9991?transport=udp"]}
//! ```
//!
//! The HTTP token API may wrap the object in a `p2pConfig` field; both forms
//! are accepted.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RtcError;
use crate::misc;

/// Default relay port when a URI omits it
const DEFAULT_RELAY_PORT: u16 = 3478;

/// Relay credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayToken {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub uris: Vec<String>,
}

#[derive(Deserialize)]
struct Wrapped {
    #[serde(rename = "p2pConfig")]
    p2p_config: RelayToken,
}

impl RelayToken {
    pub fn parse(json: &str) -> Result<Self, RtcError> {
        let value: serde_json::Value = serde_json::from_str(json.trim()).map_err(|e| {
            log::warn!("Token is not JSON: {}", e);
            RtcError::InvalidToken
        })?;
        let token = if value.get("p2pConfig").is_some() {
            serde_json::from_value::<Wrapped>(value).map(|w| w.p2p_config)
        } else {
            serde_json::from_value::<RelayToken>(value)
        }
        .map_err(|e| {
            log::warn!("Malformed token: {}", e);
            RtcError::InvalidToken
        })?;
        Ok(token)
    }

    /// Relay servers that parsed; malformed URIs are skipped with a warning
    pub fn relay_servers(&self) -> Vec<RelayServer> {
        self.uris
            .iter()
            .filter_map(|uri| match uri.parse::<RelayServer>() {
                Ok(server) => Some(server),
                Err(e) => {
                    log::warn!("Skipping relay uri '{}': {}", uri, e);
                    None
                }
            })
            .collect()
    }
}

// ============================================================================
// Relay URIs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayScheme {
    Turn,
    Turns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTransport {
    Udp,
    Tcp,
}

/// One `turn:` / `turns:` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServer {
    pub scheme: RelayScheme,
    pub host: String,
    pub port: u16,
    pub transport: RelayTransport,
}

impl RelayServer {
    /// Socket address when the host is a literal IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriError(String);

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid relay uri: {}", self.0)
    }
}

impl std::error::Error for UriError {}

impl FromStr for RelayServer {
    type Err = UriError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| UriError("missing scheme".to_string()))?;
        let scheme = if misc::eq_ignore_case(scheme, "turn") {
            RelayScheme::Turn
        } else if misc::eq_ignore_case(scheme, "turns") {
            RelayScheme::Turns
        } else {
            return Err(UriError(format!("unsupported scheme '{}'", scheme)));
        };

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        let mut transport = match scheme {
            RelayScheme::Turn => RelayTransport::Udp,
            RelayScheme::Turns => RelayTransport::Tcp,
        };
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some(("transport", value)) = pair.split_once('=') {
                    transport = match value.to_ascii_lowercase().as_str() {
                        "udp" => RelayTransport::Udp,
                        "tcp" => RelayTransport::Tcp,
                        other => return Err(UriError(format!("unknown transport '{}'", other))),
                    };
                }
            }
        }

        // [v6]:port, host:port or bare host
        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, tail) = v6
                .split_once(']')
                .ok_or_else(|| UriError("unterminated ipv6 literal".to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| UriError(format!("bad port '{}'", p)))?,
                None => DEFAULT_RELAY_PORT,
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, p)) => {
                    let port = p.parse().map_err(|_| UriError(format!("bad port '{}'", p)))?;
                    (host.to_string(), port)
                }
                None => (authority.to_string(), DEFAULT_RELAY_PORT),
            }
        };
        if host.is_empty() {
            return Err(UriError("empty host".to_string()));
        }

        Ok(RelayServer {
            scheme,
            host,
            port,
            transport,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token() {
        let token = RelayToken::parse(
            r#"{"username":"u1","password":"p1","ttl":600,"uris":["turn:1.2.3.4:9991?transport=udp"]}"#,
        )
        .unwrap();
        assert_eq!(token.username, "u1");
        assert_eq!(token.ttl, 600);
        let servers = token.relay_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].socket_addr(), Some("1.2.3.4:9991".parse().unwrap()));
        assert_eq!(servers[0].transport, RelayTransport::Udp);
    }

    #[test]
    fn test_parse_wrapped_token() {
        let token =
            RelayToken::parse(r#"{"p2pConfig":{"username":"u","password":"p","uris":[]}}"#).unwrap();
        assert_eq!(token.password, "p");
        assert_eq!(token.ttl, 0);
    }

    #[test]
    fn test_parse_invalid_token() {
        assert_eq!(RelayToken::parse("not json"), Err(RtcError::InvalidToken));
        assert_eq!(RelayToken::parse(r#"{"ttl":5}"#), Err(RtcError::InvalidToken));
    }

    #[test]
    fn test_relay_uri_forms() {
        let s: RelayServer = "turns:relay.example.com".parse().unwrap();
        assert_eq!(s.scheme, RelayScheme::Turns);
        assert_eq!(s.port, DEFAULT_RELAY_PORT);
        assert_eq!(s.transport, RelayTransport::Tcp);
        assert_eq!(s.socket_addr(), None);

        let s: RelayServer = "turn:[::1]:5000?transport=tcp".parse().unwrap();
        assert_eq!(s.host, "::1");
        assert_eq!(s.transport, RelayTransport::Tcp);
        assert_eq!(s.socket_addr(), Some("[::1]:5000".parse().unwrap()));

        assert!("stun:1.2.3.4:3478".parse::<RelayServer>().is_err());
        assert!("turn:1.2.3.4:notaport".parse::<RelayServer>().is_err());
    }

    #[test]
    fn test_malformed_uris_skipped() {
        let token = RelayToken {
            uris: vec!["bogus".into(), "turn:10.0.0.1:3478".into()],
            ..Default::default()
        };
        assert_eq!(token.relay_servers().len(), 1);
    }
}
