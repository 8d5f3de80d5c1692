//! Load balancing: balancers own clusters, clusters own nodes.
//!
//! A [`BalancerRegistry`] maps balancer names to [`Balancer`]s. Admin
//! commands address nodes as `balancer/cluster/host:port`; unknown clusters
//! and nodes are created on demand, unknown balancers are rejected.
pub mod cluster;
pub mod command;
pub mod node;
pub mod session;
pub mod strategy;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use self::{
    cluster::{Cluster, DEFAULT_CLUSTER},
    command::{ClusterCommand, CommandKind},
    node::{Node, NodeLease, NodeStatus},
    session::SessionIdExtractor,
    strategy::{DispatchingStrategy, StrategyFactory},
};
use crate::config::StrategyConfig;

/// Name used when no balancer is given.
pub const DEFAULT_BALANCER: &str = "Default";

/// Sessions idle for longer than this are forgotten.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Errors raised while selecting nodes or applying node commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BalancerError {
    #[error("no available node in cluster '{0}'")]
    EmptyNodeList(String),

    #[error("all nodes of cluster '{cluster}' busy after {waits} waits")]
    Busy { cluster: String, waits: u32 },

    #[error("unknown balancer '{0}'")]
    UnknownBalancer(String),

    #[error("unknown cluster '{cluster}' in balancer '{balancer}'")]
    UnknownCluster { balancer: String, cluster: String },
}

/// Result type for balancer operations
pub type BalancerResult<T> = Result<T, BalancerError>;

/// A named set of clusters sharing a session policy.
pub struct Balancer {
    name: String,
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
    strategy: StrategyConfig,
    session_timeout: Duration,
    session_extractor: Option<Arc<dyn SessionIdExtractor>>,
}

impl Balancer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clusters: RwLock::new(HashMap::new()),
            strategy: StrategyConfig::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            session_extractor: None,
        }
    }

    /// Strategy used by clusters created on demand.
    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    /// Idle timeout of sticky sessions; zero keeps them forever.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_session_extractor(mut self, extractor: Arc<dyn SessionIdExtractor>) -> Self {
        self.session_extractor = Some(extractor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn session_extractor(&self) -> Option<&Arc<dyn SessionIdExtractor>> {
        self.session_extractor.as_ref()
    }

    pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// The named cluster, created with the balancer's strategy if missing.
    pub fn cluster_or_create(&self, name: &str) -> Arc<Cluster> {
        if let Some(cluster) = self.cluster(name) {
            return cluster;
        }
        let mut clusters = self.clusters.write().unwrap_or_else(PoisonError::into_inner);
        clusters
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(balancer = %self.name, cluster = name, "cluster created");
                Arc::new(Cluster::new(name).with_strategy(StrategyFactory::create(&self.strategy)))
            })
            .clone()
    }

    /// Register a preconfigured cluster, replacing one of the same name.
    pub fn add_cluster(&self, cluster: Cluster) -> Arc<Cluster> {
        let cluster = Arc::new(cluster);
        self.clusters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cluster.name().to_string(), cluster.clone());
        cluster
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        let mut clusters: Vec<_> = self
            .clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        clusters.sort_by(|a, b| a.name().cmp(b.name()));
        clusters
    }

    /// The only cluster when there is exactly one, otherwise `Default`.
    pub fn default_cluster_name(&self) -> String {
        let clusters = self.clusters.read().unwrap_or_else(PoisonError::into_inner);
        if clusters.len() == 1 {
            if let Some(name) = clusters.keys().next() {
                return name.clone();
            }
        }
        DEFAULT_CLUSTER.to_string()
    }

    pub fn set_status(&self, cluster: &str, host: &str, port: u16, status: NodeStatus) -> Option<NodeStatus> {
        self.cluster_or_create(cluster).set_status(host, port, status)
    }

    pub fn up(&self, cluster: &str, host: &str, port: u16) -> Option<NodeStatus> {
        self.set_status(cluster, host, port, NodeStatus::Up)
    }

    pub fn down(&self, cluster: &str, host: &str, port: u16) -> Option<NodeStatus> {
        self.set_status(cluster, host, port, NodeStatus::Down)
    }

    pub fn takeout(&self, cluster: &str, host: &str, port: u16) -> Option<NodeStatus> {
        self.set_status(cluster, host, port, NodeStatus::Takeout)
    }

    /// Pick a node for an exchange.
    ///
    /// A known session whose node is not DOWN stays on that node, even when
    /// it is taken out. Otherwise the cluster's strategy picks a node and the
    /// session, if any, is bound to it.
    pub async fn dispatch(&self, cluster: &str, session_id: Option<&str>) -> BalancerResult<NodeLease> {
        let cluster = self.cluster(cluster).ok_or_else(|| BalancerError::UnknownCluster {
            balancer: self.name.clone(),
            cluster: cluster.to_string(),
        })?;

        if let Some(id) = session_id {
            if let Some(node) = cluster.session_node(id, self.session_timeout).await {
                tracing::debug!(balancer = %self.name, session = id, node = %node, "sticky dispatch");
                return Ok(node.lease());
            }
        }

        let lease = cluster.dispatch().await?;
        if let Some(id) = session_id {
            cluster.bind_session(id, lease.node().clone()).await;
        }
        Ok(lease)
    }

    /// Bind a session first seen on a response to the node that served it.
    pub async fn bind_session(&self, cluster: &str, id: &str, node: Arc<Node>) {
        self.cluster_or_create(cluster).bind_session(id, node).await;
    }

    /// Drop expired sessions across all clusters.
    pub async fn cleanup_sessions(&self) -> usize {
        let mut removed = 0;
        for cluster in self.clusters() {
            removed += cluster.cleanup_sessions(self.session_timeout).await;
        }
        removed
    }
}

impl fmt::Debug for Balancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Balancer")
            .field("name", &self.name)
            .field("clusters", &self.clusters())
            .field("session_timeout", &self.session_timeout)
            .finish()
    }
}

/// All balancers of a gateway, by name.
#[derive(Debug, Default)]
pub struct BalancerRegistry {
    balancers: RwLock<HashMap<String, Arc<Balancer>>>,
}

impl BalancerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Balancer>> {
        self.balancers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn insert(&self, balancer: Balancer) -> Arc<Balancer> {
        let balancer = Arc::new(balancer);
        self.balancers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(balancer.name().to_string(), balancer.clone());
        balancer
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .balancers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.balancers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply an admin command. Returns the node's previous status.
    pub fn apply(&self, command: &ClusterCommand) -> BalancerResult<Option<NodeStatus>> {
        let balancer = self
            .get(&command.balancer)
            .ok_or_else(|| BalancerError::UnknownBalancer(command.balancer.clone()))?;
        Ok(balancer.set_status(
            &command.cluster,
            &command.host,
            command.port,
            command.kind.target_status(),
        ))
    }

    /// Periodically drop expired sessions until `shutdown` fires.
    pub fn spawn_session_cleaner(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let balancers: Vec<_> = registry
                            .balancers
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .values()
                            .cloned()
                            .collect();
                        for balancer in balancers {
                            let removed = balancer.cleanup_sessions().await;
                            if removed > 0 {
                                tracing::debug!(balancer = %balancer.name(), removed, "expired sessions dropped");
                            }
                        }
                    }
                }
            }
        })
    }
}
