//! Tunnel Configuration
//!
//! Provides the immutable [`TunnelConfig`] snapshot handed to the engine on
//! every start, plus loading from TOML or JSON files.
//!
//! Replacing a configuration always means a full restart: the virtual device
//! is re-created and every in-flight flow is invalidated.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Name of the endpoint group used when no group rule matches
pub const DEFAULT_GROUP: &str = "default";

/// Smallest MTU accepted for the virtual device (IPv4 minimum datagram size)
pub const MIN_MTU: u16 = 576;

/// Private, link-local and loopback ranges routed directly when `bypass_lan` is set
pub const LAN_RANGES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "::1/128",
    "fe80::/10",
    "fc00::/7",
];

/// Upstream proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// Unique endpoint name (used for health tracking and logs)
    pub name: String,
    /// Server address
    pub addr: SocketAddr,
    /// Endpoint group; flows target a group, endpoints in it are alternates
    #[serde(default = "default_group")]
    pub group: String,
}

impl ProxyEndpoint {
    /// Create an endpoint in the default group
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            group: DEFAULT_GROUP.to_string(),
        }
    }

    /// Move this endpoint into another group
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}

/// Routes destinations in `range` to a specific endpoint group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRule {
    pub range: IpNet,
    pub group: String,
}

/// Credentials and handshake parameters passed verbatim to the proxy transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    /// User identity (e.g. a UUID for VLESS/VMess style transports)
    #[serde(default)]
    pub user: String,
    /// Opaque transport-specific parameters
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Per-app capture policy mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppPolicyMode {
    /// No per-app selection
    #[default]
    Off,
    /// Only listed apps are tunneled
    Allow,
    /// Listed apps are blocked
    Deny,
}

/// Per-app allow/deny list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPolicy {
    #[serde(default)]
    pub mode: AppPolicyMode,
    #[serde(default)]
    pub apps: Vec<String>,
}

impl AppPolicy {
    /// Check if an app id is listed
    pub fn lists(&self, app: &str) -> bool {
        self.apps.iter().any(|a| a == app)
    }
}

/// Session establishment and multiplexing tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTuning {
    /// Handshake timeout (milliseconds)
    pub handshake_timeout_ms: u64,
    /// Handshake attempts per endpoint before it is marked unhealthy
    pub max_attempts: u32,
    /// First retry delay (milliseconds), doubled on each retry
    pub backoff_base_ms: u64,
    /// Retry delay ceiling (milliseconds)
    pub backoff_max_ms: u64,
    /// How long an unhealthy endpoint is skipped (seconds)
    pub cooldown_secs: u64,
    /// Flows multiplexed over a single session
    pub max_flows_per_session: usize,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            cooldown_secs: 30,
            max_flows_per_session: 256,
        }
    }
}

impl SessionTuning {
    /// Handshake timeout as a Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Unhealthy cooldown as a Duration
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

/// Complete tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Session name shown by the OS for the virtual interface
    pub session_name: String,
    /// Local virtual address
    pub address: IpNet,
    /// Virtual device MTU
    pub mtu: u16,
    /// DNS servers, in priority order
    pub dns: Vec<IpAddr>,
    /// Routes captured by the device
    pub routes: Vec<IpNet>,
    /// Add the private/loopback ranges to the bypass list
    pub bypass_lan: bool,
    /// Extra user bypass ranges
    pub bypass: Vec<IpNet>,
    /// Tunnel UDP through the proxy
    pub enable_udp: bool,
    /// Per-app selection
    pub app_policy: AppPolicy,
    /// Package id of the hosting app, always excluded from capture
    pub self_package: Option<String>,
    /// Upstream endpoints; empty means pure bypass mode
    pub endpoints: Vec<ProxyEndpoint>,
    /// Group used when no rule matches
    pub default_group: String,
    /// Destination-range to group rules, first match wins
    pub group_rules: Vec<GroupRule>,
    /// Transport credentials
    pub credentials: ProxyCredentials,
    /// Session tuning
    pub session: SessionTuning,
    /// Idle window after which a flow is reaped (seconds)
    pub flow_idle_timeout_secs: u64,
    /// Reap pass interval (seconds)
    pub reap_interval_secs: u64,
    /// Push a StatsSnapshot on the event feed this often (milliseconds)
    pub stats_interval_ms: Option<u64>,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            session_name: "vtun".to_string(),
            address: IpNet::new(IpAddr::V4(Ipv4Addr::new(10, 1, 10, 1)), 32)
                .unwrap_or_default(),
            mtu: 1500,
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
            routes: vec![IpNet::default()], // 0.0.0.0/0
            bypass_lan: true,
            bypass: Vec::new(),
            enable_udp: true,
            app_policy: AppPolicy::default(),
            self_package: None,
            endpoints: Vec::new(),
            default_group: default_group(),
            group_rules: Vec::new(),
            credentials: ProxyCredentials::default(),
            session: SessionTuning::default(),
            flow_idle_timeout_secs: 60,
            reap_interval_secs: 5,
            stats_interval_ms: Some(1_000),
        }
    }
}

impl TunnelConfig {
    /// Create a configuration proxying through the given endpoints
    pub fn with_endpoints(endpoints: Vec<ProxyEndpoint>) -> Self {
        Self {
            endpoints,
            ..Self::default()
        }
    }

    /// Is this a pure bypass configuration (no proxy at all)?
    pub fn is_pure_bypass(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Every range routed directly: LAN ranges (if enabled) plus user ranges
    pub fn bypass_ranges(&self) -> Vec<IpNet> {
        let mut ranges: Vec<IpNet> = Vec::new();
        if self.bypass_lan {
            ranges.extend(LAN_RANGES.iter().filter_map(|r| r.parse::<IpNet>().ok()));
        }
        for range in &self.bypass {
            if !ranges.contains(range) {
                ranges.push(*range);
            }
        }
        ranges
    }

    /// Endpoints belonging to a group, in configuration order
    pub fn endpoints_in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a ProxyEndpoint> + 'a {
        self.endpoints.iter().filter(move |e| e.group == group)
    }

    /// Idle time after which a flow is reaped
    pub fn flow_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_idle_timeout_secs)
    }

    /// Time between reap passes
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    /// Stats push cadence, `None` when disabled
    pub fn stats_interval(&self) -> Option<Duration> {
        self.stats_interval_ms.map(Duration::from_millis)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < MIN_MTU {
            return Err(ConfigError::MtuTooLow(self.mtu));
        }
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(ConfigError::InvalidEndpoint("empty name".into()));
            }
            if endpoint.addr.port() == 0 {
                return Err(ConfigError::InvalidEndpoint(format!("{}: port 0", endpoint.name)));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(ConfigError::DuplicateEndpoint(endpoint.name.clone()));
            }
        }

        if !self.is_pure_bypass() {
            let groups: HashSet<&str> = self.endpoints.iter().map(|e| e.group.as_str()).collect();
            if !groups.contains(self.default_group.as_str()) {
                return Err(ConfigError::UnknownGroup(self.default_group.clone()));
            }
            for rule in &self.group_rules {
                if !groups.contains(rule.group.as_str()) {
                    return Err(ConfigError::UnknownGroup(rule.group.clone()));
                }
            }
        }

        if self.app_policy.mode == AppPolicyMode::Allow && self.app_policy.apps.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }

        let s = &self.session;
        if s.max_attempts == 0 {
            return Err(ConfigError::InvalidSession("max_attempts must be at least 1".into()));
        }
        if s.max_flows_per_session == 0 {
            return Err(ConfigError::InvalidSession("max_flows_per_session must be at least 1".into()));
        }
        if s.handshake_timeout_ms == 0 {
            return Err(ConfigError::InvalidSession("handshake_timeout_ms must be positive".into()));
        }
        if self.flow_idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("flow_idle_timeout_secs"));
        }
        if self.stats_interval_ms == Some(0) {
            return Err(ConfigError::InvalidTimeout("stats_interval_ms"));
        }
        Ok(())
    }

    /// Load from a file, picking the format from the extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("MTU {0} is below the minimum of 576")]
    MtuTooLow(u16),

    #[error("No routes configured")]
    NoRoutes,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Duplicate endpoint name: {0}")]
    DuplicateEndpoint(String),

    #[error("Unknown endpoint group: {0}")]
    UnknownGroup(String),

    #[error("Allow-list app policy with no apps")]
    EmptyAllowList,

    #[error("Invalid session tuning: {0}")]
    InvalidSession(String),

    #[error("Invalid timeout: {0} must be positive")]
    InvalidTimeout(&'static str),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),
}
