//! Address resolution and peer identification.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use serde::Serialize;
use socket2::{Domain, SockAddr};
use tracing::debug;

use crate::config::{AddressFamily, TransportConfig};
use crate::error::{Result, TransportError};

/// A resolved socket address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Endpoint {
    /// IPv4 or IPv6 address.
    Inet(SocketAddr),
    /// Unix-domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Socket domain matching this address.
    pub fn domain(&self) -> Domain {
        match self {
            Endpoint::Inet(SocketAddr::V4(_)) => Domain::IPV4,
            Endpoint::Inet(SocketAddr::V6(_)) => Domain::IPV6,
            Endpoint::Unix(_) => Domain::UNIX,
        }
    }

    /// Address in the form the socket calls take.
    pub fn to_sock_addr(&self) -> Result<SockAddr> {
        match self {
            Endpoint::Inet(addr) => Ok(SockAddr::from(*addr)),
            Endpoint::Unix(path) => SockAddr::unix(path).map_err(Into::into),
        }
    }

    /// True for TCP endpoints.
    pub fn is_inet(&self) -> bool {
        matches!(self, Endpoint::Inet(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet(addr) => write!(f, "{addr}"),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Printable identity of one side of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    /// Address, once known.
    pub endpoint: Option<Endpoint>,
    /// `ip:port` or socket path.
    pub identifier: String,
}

impl PeerInfo {
    /// Identity for a resolved endpoint.
    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            identifier: endpoint.to_string(),
            endpoint: Some(endpoint),
        }
    }

    /// Identity for an address reported by the kernel. Unix peers are often
    /// unnamed, in which case `fallback` names them.
    pub fn from_sock_addr(addr: &SockAddr, fallback: Option<&PathBuf>) -> Self {
        match addr.as_socket() {
            Some(sa) => Self::from_endpoint(Endpoint::Inet(sa)),
            None => match fallback {
                Some(path) => Self::from_endpoint(Endpoint::Unix(path.clone())),
                None => Self {
                    endpoint: None,
                    identifier: "<unix>".to_string(),
                },
            },
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

fn resolve_host(host: &str, port: u16, family: AddressFamily) -> Result<SocketAddr> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::AddressResolution {
            addr: format!("{host}:{port}"),
            reason: e.to_string(),
        })?;
    let mut chosen = None;
    for addr in addrs {
        let matches = match family {
            AddressFamily::Inet => addr.is_ipv4(),
            AddressFamily::Inet6 => addr.is_ipv6(),
            AddressFamily::Unix => false,
        };
        if matches {
            chosen = Some(addr);
            break;
        }
    }
    let addr = chosen.ok_or_else(|| TransportError::AddressResolution {
        addr: format!("{host}:{port}"),
        reason: format!("no {family:?} address"),
    })?;
    debug!(host, port, resolved = %addr, "resolved address");
    Ok(addr)
}

/// Address to connect to.
pub fn resolve_remote(config: &TransportConfig) -> Result<Endpoint> {
    match config.address_family {
        AddressFamily::Unix => config
            .socket
            .connect_path
            .clone()
            .map(Endpoint::Unix)
            .ok_or(TransportError::MissingOption {
                key: "transport.socket.connect-path".to_string(),
            }),
        family => {
            let host = config
                .remote_host
                .as_deref()
                .ok_or(TransportError::MissingOption {
                    key: "remote-host".to_string(),
                })?;
            Ok(Endpoint::Inet(resolve_host(host, config.remote_port(), family)?))
        }
    }
}

/// Address to listen on. Without a bind address TCP listeners use the
/// wildcard address of the configured family.
pub fn resolve_listen(config: &TransportConfig) -> Result<Endpoint> {
    match config.address_family {
        AddressFamily::Unix => config
            .socket
            .listen_path
            .clone()
            .map(Endpoint::Unix)
            .ok_or(TransportError::MissingOption {
                key: "transport.socket.listen-path".to_string(),
            }),
        family => {
            let host = match (&config.socket.bind_address, family) {
                (Some(h), _) => h.as_str(),
                (None, AddressFamily::Inet6) => "::",
                (None, _) => "0.0.0.0",
            };
            Ok(Endpoint::Inet(resolve_host(host, config.listen_port(), family)?))
        }
    }
}

/// Local address a client binds before connecting, if one is configured.
pub fn resolve_client_bind(config: &TransportConfig) -> Result<Option<Endpoint>> {
    match (&config.socket.bind_address, config.address_family) {
        (Some(host), family @ (AddressFamily::Inet | AddressFamily::Inet6)) => {
            Ok(Some(Endpoint::Inet(resolve_host(host, 0, family)?)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_remote_inet() {
        let cfg = TransportConfig {
            remote_host: Some("127.0.0.1".into()),
            remote_port: Some(4000),
            ..Default::default()
        };
        let ep = resolve_remote(&cfg).unwrap();
        assert_eq!(ep, Endpoint::Inet("127.0.0.1:4000".parse().unwrap()));
        assert_eq!(ep.domain(), Domain::IPV4);
        assert_eq!(PeerInfo::from_endpoint(ep).identifier, "127.0.0.1:4000");
    }

    #[test]
    fn test_resolve_remote_requires_host() {
        let cfg = TransportConfig::default();
        assert!(matches!(
            resolve_remote(&cfg),
            Err(TransportError::MissingOption { .. })
        ));
    }

    #[test]
    fn test_family_filter() {
        let cfg = TransportConfig {
            remote_host: Some("127.0.0.1".into()),
            address_family: AddressFamily::Inet6,
            ..Default::default()
        };
        assert!(matches!(
            resolve_remote(&cfg),
            Err(TransportError::AddressResolution { .. })
        ));
    }

    #[test]
    fn test_listen_defaults_to_wildcard() {
        let cfg = TransportConfig::default();
        let ep = resolve_listen(&cfg).unwrap();
        assert_eq!(ep, Endpoint::Inet("0.0.0.0:24007".parse().unwrap()));
        assert!(resolve_client_bind(&cfg).unwrap().is_none());
    }

    #[test]
    fn test_unix_endpoints() {
        let mut cfg = TransportConfig {
            address_family: AddressFamily::Unix,
            ..Default::default()
        };
        assert!(resolve_listen(&cfg).is_err());
        cfg.socket.listen_path = Some(PathBuf::from("/tmp/stackfs.sock"));
        cfg.socket.connect_path = Some(PathBuf::from("/tmp/stackfs.sock"));
        let ep = resolve_listen(&cfg).unwrap();
        assert_eq!(ep.domain(), Domain::UNIX);
        assert_eq!(ep.to_string(), "/tmp/stackfs.sock");
        assert!(ep.to_sock_addr().is_ok());
        assert_eq!(resolve_remote(&cfg).unwrap(), ep);
    }
}
