//! Connection configuration
//!
//! `ClientConfig` is built once, validated, and handed to
//! `ConnectionManager::connect`. It is a plain value: cloning it is how the
//! manager keeps its own copy for reconnection.

use std::path::PathBuf;
use std::time::Duration;

use crate::address::ServerAddress;
use crate::error::ConfigError;

/// Backoff policy for automatic reconnection
///
/// The first attempt after a drop runs immediately; attempt `n > 1` waits
/// `initial_backoff * 2^(n-2)`, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Default: 500 milliseconds
    pub initial_backoff: Duration,
    /// Default: 30 seconds
    pub max_backoff: Duration,
    /// `None` retries until the client is closed
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt - 2);
        self.initial_backoff
            .checked_mul(multiplier)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempt > max)
    }
}

/// Clean-session flag used when the supervisor re-establishes a dropped session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionResumption {
    /// Reuse the configured `clean_session` flag
    #[default]
    Configured,
    /// Always start a fresh broker session
    ForceClean,
    /// Always ask the broker to resume the previous session
    Resume,
}

impl SessionResumption {
    pub fn clean_session(self, configured: bool) -> bool {
        match self {
            SessionResumption::Configured => configured,
            SessionResumption::ForceClean => true,
            SessionResumption::Resume => false,
        }
    }
}

/// How the configured server list is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Failover {
    /// Try each server in order until one accepts the connection
    #[default]
    InOrder,
    /// Only ever use the first server
    FirstOnly,
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ordered broker addresses
    pub servers: Vec<String>,
    pub user: String,
    pub password: String,
    pub clean_session: bool,
    /// Must be non-empty for QoS > 0 subscriptions
    pub client_id: String,
    /// Bound for connect, acknowledgments and close
    /// Default: 5 seconds
    pub timeout: Duration,
    pub ca_root_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_cert_key_path: Option<PathBuf>,
    /// Heartbeat interval and liveness probe period
    /// Default: 30 seconds
    pub keep_alive: Duration,
    pub reconnect: ReconnectPolicy,
    pub reconnect_session: SessionResumption,
    pub failover: Failover,
    /// Soft bound of the delivery queue
    /// Default: unbounded
    pub event_capacity: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            user: String::new(),
            password: String::new(),
            clean_session: true,
            client_id: String::new(),
            timeout: Duration::from_secs(5),
            ca_root_path: None,
            client_cert_path: None,
            client_cert_key_path: None,
            keep_alive: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            reconnect_session: SessionResumption::default(),
            failover: Failover::default(),
            event_capacity: None,
        }
    }
}

impl ClientConfig {
    /// Build and validate a config from the required parameters
    pub fn new(
        servers: Vec<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        clean_session: bool,
        client_id: impl Into<String>,
        timeout_ms: u64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            servers,
            user: user.into(),
            password: password.into(),
            clean_session,
            client_id: client_id.into(),
            timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Anonymous clean session against a broker on localhost
    pub fn local() -> Self {
        Self {
            servers: vec!["localhost:1883".to_string()],
            ..Default::default()
        }
    }

    /// Check every field; run again by `connect`
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_addresses()?;

        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        if self.client_id.starts_with(char::is_whitespace) {
            return Err(ConfigError::InvalidClientId);
        }

        if !self.keep_alive.is_zero() && self.keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::KeepAliveTooShort(self.keep_alive));
        }

        if self.client_cert_path.is_some() != self.client_cert_key_path.is_some() {
            return Err(ConfigError::IncompleteClientCertificate);
        }

        let policy = &self.reconnect;
        if policy.initial_backoff.is_zero() || policy.initial_backoff > policy.max_backoff {
            return Err(ConfigError::InvalidBackoff {
                initial: policy.initial_backoff,
                max: policy.max_backoff,
            });
        }

        if self.event_capacity == Some(0) {
            return Err(ConfigError::ZeroEventCapacity);
        }

        Ok(())
    }

    /// Parsed servers in the order connection attempts use them
    pub fn server_addresses(&self) -> Result<Vec<ServerAddress>, ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        let force_tls = self.ca_root_path.is_some();
        let mut addresses = Vec::with_capacity(self.servers.len());
        for (index, server) in self.servers.iter().enumerate() {
            if server.trim().is_empty() {
                return Err(ConfigError::EmptyServer { index });
            }
            let address = ServerAddress::parse(server)?;
            let tls = address.is_tls() || force_tls;
            addresses.push(address.with_tls(tls));
        }

        if self.failover == Failover::FirstOnly {
            addresses.truncate(1);
        }
        Ok(addresses)
    }

    /// Clean-session flag for an automatic reconnect
    pub fn reconnect_clean_session(&self) -> bool {
        self.reconnect_session.clean_session(self.clean_session)
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_servers(mut self, servers: Vec<String>) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ca_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_root_path = Some(path.into());
        self
    }

    pub fn with_client_certificate(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_cert_key_path = Some(key_path.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_reconnect_session(mut self, resumption: SessionResumption) -> Self {
        self.reconnect_session = resumption;
        self
    }

    pub fn with_failover(mut self, failover: Failover) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }
}
