//! Broker address parsing and resolution
//!
//! Accepts `host`, `host:port` and URL forms (`tcp://`, `mqtt://`, `ssl://`,
//! `tls://`, `mqtts://`). A missing port defaults to 1883, or 8883 for the
//! TLS schemes.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use url::{Host, Url};

use crate::error::{ConfigError, ConnectError};

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// A parsed broker address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    host: String,
    port: u16,
    tls: bool,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Parse one configured server entry
    pub fn parse(server: &str) -> Result<Self, ConfigError> {
        let trimmed = server.trim();
        let invalid = |reason: &str| ConfigError::InvalidServer {
            server: server.to_string(),
            reason: reason.to_string(),
        };

        let (url, tls) = if let Some((scheme, _)) = trimmed.split_once("://") {
            let tls = match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" => false,
                "ssl" | "tls" | "mqtts" => true,
                _ => return Err(invalid("unsupported scheme")),
            };
            (Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?, tls)
        } else {
            let url = Url::parse(&format!("tcp://{}", trimmed)).map_err(|e| invalid(&e.to_string()))?;
            (url, false)
        };

        if !matches!(url.path(), "" | "/") || url.query().is_some() {
            return Err(invalid("unexpected path or query"));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(invalid("missing host")),
        };

        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Self { host, port, tls })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the scheme asked for TLS
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Copy of this address with TLS forced on
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Resolve the host name into socket addresses
    pub fn resolve(&self) -> Result<ResolvedServer, ConnectError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConnectError::AddressInvalid {
                server: self.to_string(),
                reason: e.to_string(),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ConnectError::AddressInvalid {
                server: self.to_string(),
                reason: "no addresses found".to_string(),
            });
        }

        Ok(ResolvedServer {
            address: self.clone(),
            socket_addrs: addrs,
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// A server address together with the socket addresses it resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedServer {
    pub address: ServerAddress,
    pub socket_addrs: Vec<SocketAddr>,
}
