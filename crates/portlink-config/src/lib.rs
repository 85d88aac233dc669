//! Shared configuration types for portlink links and backends.
//!
//! A link is one listening endpoint plus its ordered backend pool; the
//! persisted configuration is a JSON array of [`LinkConfig`] records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors, rejected before any socket is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bind address is empty")]
    EmptyBindAddress,

    #[error("link has no backends")]
    NoBackends,

    #[error("backend address is empty")]
    EmptyBackendAddress,

    #[error("backend address {0:?} has no port")]
    MissingBackendPort(String),

    #[error("backend {0:?} has weight 0 (weighted round robin needs weight >= 1)")]
    ZeroWeight(String),
}

/// Address family used when resolving bind and dial addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolFamily {
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tcp4")]
    Tcp4,
    #[serde(rename = "tcp6")]
    Tcp6,
}

impl ProtocolFamily {
    /// Whether a resolved address belongs to this family.
    pub fn matches(&self, addr: &std::net::SocketAddr) -> bool {
        match self {
            ProtocolFamily::Tcp => true,
            ProtocolFamily::Tcp4 => addr.is_ipv4(),
            ProtocolFamily::Tcp6 => addr.is_ipv6(),
        }
    }
}

/// TLS mode of one hop. `Null` leaves the hop as plain TCP; the other
/// modes set the minimum negotiable protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsMode {
    #[default]
    #[serde(rename = "NULL")]
    Null,
    #[serde(rename = "TLS1.2")]
    Tls12,
    #[serde(rename = "TLS1.3")]
    Tls13,
}

impl TlsMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsMode::Null)
    }
}

/// Backend selection policy, chosen per link at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BalanceMode {
    #[default]
    Random,
    RoundRobin,
    #[serde(rename = "WeightRoundRobin")]
    WeightedRoundRobin,
    AddressHash,
    MainStandby,
}

impl std::fmt::Display for BalanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BalanceMode::Random => "Random",
            BalanceMode::RoundRobin => "RoundRobin",
            BalanceMode::WeightedRoundRobin => "WeightRoundRobin",
            BalanceMode::AddressHash => "AddressHash",
            BalanceMode::MainStandby => "MainStandby",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ProtocolFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ProtocolFamily::Tcp),
            "tcp4" => Ok(ProtocolFamily::Tcp4),
            "tcp6" => Ok(ProtocolFamily::Tcp6),
            other => Err(format!("unknown protocol family {other:?}")),
        }
    }
}

impl std::str::FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NULL" => Ok(TlsMode::Null),
            "TLS1.2" => Ok(TlsMode::Tls12),
            "TLS1.3" => Ok(TlsMode::Tls13),
            other => Err(format!("unknown TLS mode {other:?}")),
        }
    }
}

impl std::str::FromStr for BalanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Random" => Ok(BalanceMode::Random),
            "RoundRobin" => Ok(BalanceMode::RoundRobin),
            "WeightRoundRobin" => Ok(BalanceMode::WeightedRoundRobin),
            "AddressHash" => Ok(BalanceMode::AddressHash),
            "MainStandby" => Ok(BalanceMode::MainStandby),
            other => Err(format!("unknown load balance mode {other:?}")),
        }
    }
}

/// One upstream target. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Dial address, `host:port`.
    pub address: String,
    /// Address family for dialing.
    #[serde(default)]
    pub protocol: ProtocolFamily,
    /// TLS origination toward this backend.
    #[serde(default)]
    pub tls: TlsMode,
    /// Dial timeout in seconds; 0 blocks until connect succeeds or fails.
    #[serde(default)]
    pub dial_timeout_secs: u64,
    /// Relative weight for the weighted round-robin policy.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Standby member of a main/standby pool.
    #[serde(default)]
    pub standby: bool,
}

fn default_weight() -> u32 {
    1
}

impl BackendConfig {
    /// Host portion of the backend address, used as the SNI name when
    /// originating TLS. Handles `host:port`, `[v6]:port` and bare hosts.
    pub fn host(&self) -> &str {
        host_of(&self.address)
    }
}

/// One proxy listener: bind endpoint, hop TLS modes, balance policy, and
/// the ordered backend pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub bind_address: String,
    pub bind_port: u16,
    #[serde(default)]
    pub protocol: ProtocolFamily,
    /// Client-facing TLS termination.
    #[serde(default)]
    pub tls: TlsMode,
    #[serde(default)]
    pub mode: BalanceMode,
    pub backends: Vec<BackendConfig>,
}

impl LinkConfig {
    /// The `address:port` string identifying this link across the registry.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::EmptyBindAddress);
        }
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        for backend in &self.backends {
            if backend.address.trim().is_empty() {
                return Err(ConfigError::EmptyBackendAddress);
            }
            if backend.host() == backend.address {
                return Err(ConfigError::MissingBackendPort(backend.address.clone()));
            }
            if self.mode == BalanceMode::WeightedRoundRobin && backend.weight == 0 {
                return Err(ConfigError::ZeroWeight(backend.address.clone()));
            }
        }
        Ok(())
    }
}

/// Strip the port from an `host:port` / `[v6]:port` address, returning the
/// input unchanged when no port is present.
pub fn host_of(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match address.rfind(':') {
        // More than one colon without brackets means a bare IPv6 address.
        Some(idx) if address[..idx].contains(':') => address,
        Some(idx) => &address[..idx],
        None => address,
    }
}
