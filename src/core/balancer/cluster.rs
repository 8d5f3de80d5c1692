use std::{
    fmt,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use scc::HashMap;

use crate::{
    core::balancer::{
        BalancerResult,
        node::{Node, NodeLease, NodeStatus},
        session::Session,
        strategy::{DispatchingStrategy, RoundRobinStrategy},
    },
    metrics::set_node_status,
};

/// Name used when no cluster is given.
pub const DEFAULT_CLUSTER: &str = "Default";

/// A named group of nodes sharing one dispatching strategy, plus the
/// session-to-node bindings made for it.
///
/// Nodes are only ever added or transitioned, never removed. Every change
/// bumps [`Cluster::generation`] so that strategies caching derived data
/// (weighted tables) know when to rebuild.
pub struct Cluster {
    name: String,
    nodes: RwLock<Vec<Arc<Node>>>,
    sessions: HashMap<String, Session>,
    generation: AtomicU64,
    strategy: Arc<dyn DispatchingStrategy>,
}

impl Cluster {
    /// A cluster dispatching round-robin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: RwLock::new(Vec::new()),
            sessions: HashMap::new(),
            generation: AtomicU64::new(0),
            strategy: RoundRobinStrategy::new().shared(),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn DispatchingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> &Arc<dyn DispatchingStrategy> {
        &self.strategy
    }

    /// Pick a node for a new exchange using the cluster's strategy.
    pub async fn dispatch(&self) -> BalancerResult<NodeLease> {
        self.strategy.dispatch(self).await
    }

    /// Other available nodes in failover order.
    pub fn failover_nodes(&self, primary: &Node) -> Vec<Arc<Node>> {
        self.strategy.failover_order(self, primary)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Snapshot of all nodes in insertion order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Nodes eligible for new dispatches (status UP).
    pub fn available_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|n| n.is_up())
            .cloned()
            .collect()
    }

    pub fn find_node(&self, host: &str, port: u16) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|n| n.is(host, port))
            .cloned()
    }

    /// Add a node unless one with the same host and port exists; returns the
    /// node held by the cluster.
    pub fn add_node(&self, node: Node) -> Arc<Node> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = nodes.iter().find(|n| n.is(node.host(), node.port())) {
            return existing.clone();
        }
        let node = Arc::new(node);
        nodes.push(node.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        set_node_status(&self.name, &node.to_string(), node.status());
        node
    }

    /// Transition a node, creating it when unknown. Returns the previous
    /// status (`None` for a new node).
    pub fn set_status(&self, host: &str, port: u16, status: NodeStatus) -> Option<NodeStatus> {
        let (node, previous) = match self.find_node(host, port) {
            Some(node) => {
                let previous = node.set_status(status);
                (node, Some(previous))
            }
            None => {
                let node = self.add_node(Node::new(host, port));
                node.set_status(status);
                (node, None)
            }
        };
        if previous != Some(status) {
            self.generation.fetch_add(1, Ordering::AcqRel);
            tracing::info!(
                cluster = %self.name,
                node = %node,
                from = ?previous,
                to = %status,
                "node status changed"
            );
        }
        set_node_status(&self.name, &node.to_string(), status);
        previous
    }

    pub fn up(&self, host: &str, port: u16) -> Option<NodeStatus> {
        self.set_status(host, port, NodeStatus::Up)
    }

    pub fn down(&self, host: &str, port: u16) -> Option<NodeStatus> {
        self.set_status(host, port, NodeStatus::Down)
    }

    pub fn takeout(&self, host: &str, port: u16) -> Option<NodeStatus> {
        self.set_status(host, port, NodeStatus::Takeout)
    }

    /// Node bound to `id`, if the binding exists, has not expired and the
    /// node is not DOWN. A TAKEOUT node keeps serving its sessions.
    pub async fn session_node(&self, id: &str, timeout: Duration) -> Option<Arc<Node>> {
        let mut expired = false;
        let node = match self.sessions.get_async(id).await {
            Some(mut entry) => {
                let session = entry.get_mut();
                if session.is_expired(timeout) {
                    expired = true;
                    None
                } else {
                    session.touch();
                    Some(session.node().clone())
                }
            }
            None => None,
        };
        if expired {
            self.sessions.remove_async(id).await;
            tracing::debug!(cluster = %self.name, session = id, "session expired");
        }
        node.filter(|n| !n.is_down())
    }

    /// Bind (or rebind) a session id to a node.
    pub async fn bind_session(&self, id: &str, node: Arc<Node>) {
        match self.sessions.entry_async(id.to_string()).await {
            scc::hash_map::Entry::Occupied(mut entry) => {
                *entry.get_mut() = Session::new(node);
            }
            scc::hash_map::Entry::Vacant(entry) => {
                entry.insert_entry(Session::new(node));
            }
        }
    }

    pub async fn remove_session(&self, id: &str) -> bool {
        self.sessions.remove_async(id).await.is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop every session idle for longer than `timeout`. Returns how many
    /// were removed.
    pub async fn cleanup_sessions(&self, timeout: Duration) -> usize {
        if timeout.is_zero() {
            return 0;
        }
        let mut removed = 0;
        self.sessions
            .retain_async(|_, session| {
                let keep = !session.is_expired(timeout);
                if !keep {
                    removed += 1;
                }
                keep
            })
            .await;
        removed
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("nodes", &self.nodes())
            .field("sessions", &self.sessions.len())
            .field("strategy", &self.strategy.name())
            .finish()
    }
}
