//! Configuration data structures for Switchyard.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde‑friendly and carry defaults so that minimal configs remain concise.
//! Durations are written as humantime strings such as `"250ms"` or `"1h"`.
use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::core::balancer::{DEFAULT_BALANCER, DEFAULT_CLUSTER, NodeStatus};

/// Serde helpers for humantime durations.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Hide error details from generated responses
    #[serde(default)]
    pub production: bool,
    /// Largest request body accepted from clients
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub http_client: HttpClientConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub balancers: Vec<BalancerConfig>,
    #[serde(default)]
    pub cluster_manager: Option<ClusterManagerConfig>,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn balancer(&self, name: &str) -> Option<&BalancerConfig> {
        self.balancers.iter().find(|b| b.name == name)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            production: false,
            max_body_bytes: default_max_body_bytes(),
            http_client: HttpClientConfig::default(),
            rules: Vec::new(),
            balancers: Vec::new(),
            cluster_manager: None,
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn production(mut self, production: bool) -> Self {
        self.config.production = production;
        self
    }

    pub fn http_client(mut self, http_client: HttpClientConfig) -> Self {
        self.config.http_client = http_client;
        self
    }

    /// Append a rule; declaration order breaks specificity ties
    pub fn rule(mut self, rule: RuleConfig) -> Self {
        self.config.rules.push(rule);
        self
    }

    pub fn balancer(mut self, balancer: BalancerConfig) -> Self {
        self.config.balancers.push(balancer);
        self
    }

    pub fn cluster_manager(mut self, cluster_manager: ClusterManagerConfig) -> Self {
        self.config.cluster_manager = Some(cluster_manager);
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        if self.config.rules.is_empty() && self.config.cluster_manager.is_none() {
            return Err("At least one rule must be configured".to_string());
        }
        Ok(self.config)
    }
}

/// Outbound HTTP client behaviour shared by every rule.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Attempts per call, cycling over the destination list
    pub max_retries: u32,
    /// Pause between attempts when there is a single destination
    #[serde(with = "duration_str")]
    pub time_between_tries: Duration,
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Deadline for the response head after the request was written
    #[serde(with = "duration_str")]
    pub read_timeout: Duration,
    /// Idle lifetime of pooled connections unless the backend says otherwise
    #[serde(with = "duration_str")]
    pub keep_alive_timeout: Duration,
    /// Local address outbound sockets bind to
    pub local_addr: Option<IpAddr>,
    /// Upper bound on open backend connections; unbounded when absent
    pub max_connections: Option<usize>,
    pub proxy: Option<ProxyConfig>,
    pub authentication: Option<AuthConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            time_between_tries: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(4),
            local_addr: None,
            max_connections: None,
            proxy: None,
            authentication: None,
        }
    }
}

/// Upstream forward proxy every backend call goes through.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Basic credentials added to every backend request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// Outbound TLS settings of a rule.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutboundTlsConfig {
    /// Additional PEM bundle of trusted roots
    #[serde(default)]
    pub ca_file: Option<String>,
    /// Trust the platform's root store
    #[serde(default = "default_true")]
    pub native_roots: bool,
}

impl Default for OutboundTlsConfig {
    fn default() -> Self {
        Self {
            ca_file: None,
            native_roots: true,
        }
    }
}

/// A routing rule: which requests it matches and where they go.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RuleConfig {
    pub name: String,
    /// Exact host, `*.suffix` or `*`
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    /// Regular expression matched against the whole path
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Absolute URL, bare `host:port`, or `internal:<rule>`
    #[serde(default)]
    pub target: Option<String>,
    /// Load balancer resolving the destination instead of `target`
    #[serde(default)]
    pub balancer: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    /// Act as a forward proxy: the destination is the request's own URI
    #[serde(default)]
    pub forward_proxy: bool,
    #[serde(default = "default_true")]
    pub adjust_host_header: bool,
    #[serde(default)]
    pub fail_over_on_5xx: bool,
    #[serde(default = "default_true")]
    pub access_log: bool,
    #[serde(default)]
    pub tls: Option<OutboundTlsConfig>,
}

impl RuleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
            method: None,
            path: None,
            path_prefix: None,
            port: None,
            target: None,
            balancer: None,
            cluster: None,
            forward_proxy: false,
            adjust_host_header: true,
            fail_over_on_5xx: false,
            access_log: true,
            tls: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_balancer(mut self, balancer: impl Into<String>) -> Self {
        self.balancer = Some(balancer.into());
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// How a cluster picks nodes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    #[default]
    RoundRobin,
    ByThread {
        #[serde(default = "default_max_threads_per_endpoint")]
        max_threads_per_endpoint: usize,
        #[serde(default = "default_retry_time_on_busy", with = "duration_str")]
        retry_time_on_busy: Duration,
        /// Give up after this many waits; wait forever when absent
        #[serde(default)]
        max_busy_retries: Option<u32>,
    },
    WeightedRandom,
    /// Round-robin over nodes without recent faults while enough of them are
    /// flawless, otherwise a draw weighted by each node's recent success
    FaultMonitoring {
        #[serde(default = "default_min_flawless_ratio")]
        min_flawless_ratio: f64,
        /// Forget a node's faults after this long without a new one
        #[serde(default = "default_clear_faults_after", with = "duration_str")]
        clear_faults_after: Duration,
    },
}

fn default_min_flawless_ratio() -> f64 {
    0.5
}

fn default_clear_faults_after() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_threads_per_endpoint() -> usize {
    5
}

fn default_retry_time_on_busy() -> Duration {
    Duration::from_millis(1000)
}

/// Where sticky-session keys are read from.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionIdConfig {
    /// Text of the XML element `{namespace}local_name`
    Xml {
        #[serde(default)]
        namespace: Option<String>,
        local_name: String,
    },
    Header {
        name: String,
    },
    Cookie {
        name: String,
    },
}

/// Passive failure detection driven by the outcomes of backend calls.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FailureDetectionConfig {
    /// Consecutive 5xx answers after which a node is marked DOWN
    pub max_consecutive_5xx: u32,
    /// Put nodes marked DOWN back UP after this long; never when absent
    #[serde(with = "option_duration_str")]
    pub retry_after: Option<Duration>,
}

impl Default for FailureDetectionConfig {
    fn default() -> Self {
        Self {
            max_consecutive_5xx: 10,
            retry_after: None,
        }
    }
}

mod option_duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

fn default_balancer_name() -> String {
    DEFAULT_BALANCER.to_string()
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER.to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BalancerConfig {
    #[serde(default = "default_balancer_name")]
    pub name: String,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub session_id: Option<SessionIdConfig>,
    /// Idle timeout of sticky sessions; `0` keeps them forever
    #[serde(default = "default_session_timeout", with = "duration_str")]
    pub session_timeout: Duration,
    /// Append the other available nodes as failover destinations
    #[serde(default = "default_true")]
    pub fail_over: bool,
    #[serde(default)]
    pub failure_detection: Option<FailureDetectionConfig>,
}

impl BalancerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: StrategyConfig::default(),
            clusters: Vec::new(),
            session_id: None,
            session_timeout: default_session_timeout(),
            fail_over: true,
            failure_detection: None,
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.clusters.push(cluster);
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_session_id(mut self, session_id: SessionIdConfig) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BALANCER)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeConfig>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_node_status() -> NodeStatus {
    NodeStatus::Up
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_node_status")]
    pub status: NodeStatus,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
            secure: false,
            status: NodeStatus::Up,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

fn default_path_prefix() -> String {
    "/clustermanager".to_string()
}

/// The admin endpoint receiving up/down/takeout commands.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClusterManagerConfig {
    pub path_prefix: String,
    /// Only accept commands sent as an encrypted `data` parameter
    pub validate_signature: bool,
    /// Hex AES key (16, 24 or 32 bytes)
    pub key_hex: Option<String>,
    /// Shared secret for HMAC-SHA256 `signature` parameters
    pub hmac_secret: Option<String>,
    /// Reject commands older than this; `0` disables the check
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for ClusterManagerConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_path_prefix(),
            validate_signature: false,
            key_hex: None,
            hmac_secret: None,
            timeout: Duration::ZERO,
        }
    }
}
