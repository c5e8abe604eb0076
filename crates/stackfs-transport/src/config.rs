//! Transport configuration.
//!
//! The surrounding system hands each transport a flat map of option strings.
//! [`TransportConfig::from_options`] turns that map into typed settings; the
//! typed structs can also be built directly or loaded through serde.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TransportError};

/// Default port for the socket transport.
pub const DEFAULT_SOCKET_PORT: u16 = 24007;

/// Default port for the RDMA transport's control channel.
pub const DEFAULT_RDMA_PORT: u16 = 24008;

/// Carrier selected by the `transport-type` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP or Unix-domain stream sockets.
    #[default]
    Socket,
    /// Queue pairs over a verbs fabric.
    Rdma,
}

impl TransportKind {
    /// Port used when none is configured.
    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Socket => DEFAULT_SOCKET_PORT,
            TransportKind::Rdma => DEFAULT_RDMA_PORT,
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "socket" | "tcp" => Ok(TransportKind::Socket),
            "rdma" | "ib-verbs" => Ok(TransportKind::Rdma),
            other => Err(invalid(
                "transport-type",
                other,
                "expected socket, tcp, rdma or ib-verbs",
            )),
        }
    }
}

/// Address family selected by `transport.address-family`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4.
    #[default]
    Inet,
    /// IPv6.
    Inet6,
    /// Unix-domain stream sockets.
    Unix,
}

impl FromStr for AddressFamily {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inet" => Ok(AddressFamily::Inet),
            "inet6" => Ok(AddressFamily::Inet6),
            "unix" => Ok(AddressFamily::Unix),
            other => Err(invalid(
                "transport.address-family",
                other,
                "expected inet, inet6 or unix",
            )),
        }
    }
}

/// Path MTU for RDMA queue pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PathMtu {
    /// 256 bytes.
    Mtu256,
    /// 512 bytes.
    Mtu512,
    /// 1024 bytes.
    Mtu1024,
    /// 2048 bytes.
    #[default]
    Mtu2048,
    /// 4096 bytes.
    Mtu4096,
}

impl PathMtu {
    /// MTU for a byte count, if it is one the fabric supports.
    pub fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            256 => Some(PathMtu::Mtu256),
            512 => Some(PathMtu::Mtu512),
            1024 => Some(PathMtu::Mtu1024),
            2048 => Some(PathMtu::Mtu2048),
            4096 => Some(PathMtu::Mtu4096),
            _ => None,
        }
    }

    /// Size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            PathMtu::Mtu256 => 256,
            PathMtu::Mtu512 => 512,
            PathMtu::Mtu1024 => 1024,
            PathMtu::Mtu2048 => 2048,
            PathMtu::Mtu4096 => 4096,
        }
    }
}

/// Stream socket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOptions {
    /// Local address to bind before connecting or listening.
    pub bind_address: Option<String>,
    /// Listen port; defaults to the transport's default port.
    pub listen_port: Option<u16>,
    /// Unix-domain listen path.
    pub listen_path: Option<PathBuf>,
    /// Unix-domain connect path.
    pub connect_path: Option<PathBuf>,
    /// Pending-connection backlog for `listen`.
    pub listen_backlog: i32,
    /// Disable Nagle's algorithm on TCP connections.
    pub nodelay: bool,
    /// Enable `SO_KEEPALIVE`.
    pub keepalive: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            bind_address: None,
            listen_port: None,
            listen_path: None,
            connect_path: None,
            listen_backlog: 10,
            nodelay: true,
            keepalive: false,
        }
    }
}

/// RDMA settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaOptions {
    /// Device to use; the first device found when unset.
    pub device_name: Option<String>,
    /// Physical port on the device.
    pub port: u8,
    /// Outstanding sends allowed per queue pair.
    pub send_count: usize,
    /// Receive buffers posted per device.
    pub recv_count: usize,
    /// Largest frame this side will send.
    pub send_size: usize,
    /// Largest frame this side can receive.
    pub recv_size: usize,
    /// Path MTU for queue-pair transitions.
    pub mtu: PathMtu,
}

impl Default for RdmaOptions {
    fn default() -> Self {
        Self {
            device_name: None,
            port: 1,
            send_count: 16,
            recv_count: 16,
            send_size: 1024 * 1024,
            recv_size: 1024 * 1024,
            mtu: PathMtu::Mtu2048,
        }
    }
}

/// Complete transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Carrier.
    pub kind: TransportKind,
    /// Host to connect to.
    pub remote_host: Option<String>,
    /// Port to connect to; defaults to the carrier's default port.
    pub remote_port: Option<u16>,
    /// Address family for resolution and socket creation.
    pub address_family: AddressFamily,
    /// Put descriptors in non-blocking mode.
    pub non_blocking: bool,
    /// Socket settings.
    pub socket: SocketOptions,
    /// RDMA settings.
    pub rdma: RdmaOptions,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Socket,
            remote_host: None,
            remote_port: None,
            address_family: AddressFamily::Inet,
            non_blocking: true,
            socket: SocketOptions::default(),
            rdma: RdmaOptions::default(),
        }
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> TransportError {
    TransportError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parses a boolean option value the way volume files spell them.
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "yes" | "true" | "enable" | "1" => Ok(true),
        "off" | "no" | "false" | "disable" | "0" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, value, "expected a number"))
}

impl TransportConfig {
    /// Builds a configuration from raw option strings. Unknown keys are ignored.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self> {
        let get = |keys: &[&str]| -> Option<(String, String)> {
            keys.iter()
                .find_map(|k| options.get(*k).map(|v| (k.to_string(), v.clone())))
        };
        let mut cfg = TransportConfig::default();

        if let Some((_, v)) = get(&["transport-type"]) {
            cfg.kind = v.parse()?;
        }
        if let Some((_, v)) = get(&["remote-host"]) {
            cfg.remote_host = Some(v);
        }
        if let Some((k, v)) = get(&[
            "remote-port",
            "transport.remote-port",
            "transport.socket.remote-port",
            "transport.rdma.remote-port",
        ]) {
            cfg.remote_port = Some(parse_num(&k, &v)?);
        }
        if let Some((_, v)) = get(&["transport.address-family"]) {
            cfg.address_family = v.parse()?;
        }
        if let Some((k, v)) = get(&["non-blocking-io"]) {
            cfg.non_blocking = parse_bool(&k, &v)?;
        }

        if let Some((_, v)) =
            get(&["transport.socket.bind-address", "transport.rdma.bind-address"])
        {
            cfg.socket.bind_address = Some(v);
        }
        if let Some((k, v)) = get(&["transport.socket.listen-port", "transport.rdma.listen-port"])
        {
            cfg.socket.listen_port = Some(parse_num(&k, &v)?);
        }
        if let Some((_, v)) = get(&["transport.socket.listen-path", "transport.rdma.listen-path"])
        {
            cfg.socket.listen_path = Some(PathBuf::from(v));
        }
        if let Some((_, v)) =
            get(&["transport.socket.connect-path", "transport.rdma.connect-path"])
        {
            cfg.socket.connect_path = Some(PathBuf::from(v));
        }
        if let Some((k, v)) = get(&["transport.socket.listen-backlog"]) {
            cfg.socket.listen_backlog = parse_num(&k, &v)?;
        }
        if let Some((k, v)) = get(&["transport.socket.nodelay"]) {
            cfg.socket.nodelay = parse_bool(&k, &v)?;
        }
        if let Some((k, v)) = get(&["transport.socket.keepalive"]) {
            cfg.socket.keepalive = parse_bool(&k, &v)?;
        }

        if let Some((_, v)) = get(&["transport.rdma.device-name", "ib-verbs-device-name"]) {
            cfg.rdma.device_name = Some(v);
        }
        if let Some((k, v)) = get(&["transport.rdma.port", "ib-verbs-port"]) {
            let port: u8 = parse_num(&k, &v)?;
            if port == 0 {
                return Err(invalid(&k, &v, "ports are numbered from 1"));
            }
            cfg.rdma.port = port;
        }
        if let Some((k, v)) = get(&[
            "transport.rdma.work-request-send-count",
            "ib-verbs-work-request-send-count",
        ]) {
            cfg.rdma.send_count = positive(&k, &v)?;
        }
        if let Some((k, v)) = get(&[
            "transport.rdma.work-request-recv-count",
            "ib-verbs-work-request-recv-count",
        ]) {
            cfg.rdma.recv_count = positive(&k, &v)?;
        }
        if let Some((k, v)) = get(&[
            "transport.rdma.work-request-send-size",
            "ib-verbs-work-request-send-size",
        ]) {
            cfg.rdma.send_size = positive(&k, &v)?;
        }
        if let Some((k, v)) = get(&[
            "transport.rdma.work-request-recv-size",
            "ib-verbs-work-request-recv-size",
        ]) {
            cfg.rdma.recv_size = positive(&k, &v)?;
        }
        if let Some((k, v)) = get(&["transport.rdma.mtu", "ib-verbs-mtu"]) {
            let bytes: u32 = parse_num(&k, &v)?;
            cfg.rdma.mtu = match PathMtu::from_bytes(bytes) {
                Some(mtu) => mtu,
                None => {
                    warn!(mtu = bytes, "unsupported RDMA path MTU, using 2048");
                    PathMtu::Mtu2048
                }
            };
        }
        Ok(cfg)
    }

    /// Port to connect to.
    pub fn remote_port(&self) -> u16 {
        self.remote_port.unwrap_or(self.kind.default_port())
    }

    /// Port to listen on.
    pub fn listen_port(&self) -> u16 {
        self.socket.listen_port.unwrap_or(self.kind.default_port())
    }
}

fn positive(key: &str, value: &str) -> Result<usize> {
    let n: usize = parse_num(key, value)?;
    if n == 0 {
        return Err(invalid(key, value, "must be greater than zero"));
    }
    Ok(n)
}
