use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
};

use serde::{Deserialize, Serialize};

// Constants for node status to replace magic numbers
const NODE_STATUS_UP: u8 = 0;
const NODE_STATUS_DOWN: u8 = 1;
const NODE_STATUS_TAKEOUT: u8 = 2;

/// Health state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Up,
    Down,
    /// Draining: no new sessions, existing sticky sessions still served
    Takeout,
}

impl NodeStatus {
    fn to_u8(self) -> u8 {
        match self {
            NodeStatus::Up => NODE_STATUS_UP,
            NodeStatus::Down => NODE_STATUS_DOWN,
            NodeStatus::Takeout => NODE_STATUS_TAKEOUT,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            NODE_STATUS_UP => NodeStatus::Up,
            NODE_STATUS_TAKEOUT => NodeStatus::Takeout,
            _ => NodeStatus::Down,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Up => "up",
            NodeStatus::Down => "down",
            NodeStatus::Takeout => "takeout",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(NodeStatus::Up),
            "down" => Ok(NodeStatus::Down),
            "takeout" => Ok(NodeStatus::Takeout),
            other => Err(format!("unknown node status '{other}'")),
        }
    }
}

/// One backend endpoint of a cluster.
///
/// Status and counters are atomics so that every worker dispatching through
/// the cluster can read and update them without a lock.
#[derive(Debug)]
pub struct Node {
    host: String,
    port: u16,
    secure: bool,
    weight: f64,
    status: AtomicU8,
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
    /// Unix millis of the last transition to UP
    last_up: AtomicI64,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
            weight: 1.0,
            status: AtomicU8::new(NODE_STATUS_UP),
            in_flight: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
            last_up: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Talk TLS to this node.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn is(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Set the status and return the previous one.
    pub fn set_status(&self, status: NodeStatus) -> NodeStatus {
        let previous = NodeStatus::from_u8(self.status.swap(status.to_u8(), Ordering::AcqRel));
        if status == NodeStatus::Up && previous != NodeStatus::Up {
            self.last_up
                .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
        }
        previous
    }

    pub fn is_up(&self) -> bool {
        self.status() == NodeStatus::Up
    }

    pub fn is_down(&self) -> bool {
        self.status() == NodeStatus::Down
    }

    pub fn last_up_millis(&self) -> i64 {
        self.last_up.load(Ordering::Acquire)
    }

    /// Exchanges currently in flight on this node.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Total exchanges dispatched to this node.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// `scheme://host:port` of the node.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// URL the exchange is sent to when dispatched to this node.
    pub fn destination_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url(), path_and_query)
    }

    /// Occupy one in-flight slot regardless of capacity.
    pub fn lease(self: &Arc<Self>) -> NodeLease {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        NodeLease { node: self.clone() }
    }

    /// Occupy one in-flight slot if fewer than `max` are taken.
    pub fn try_lease(self: &Arc<Self>, max: usize) -> Option<NodeLease> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .ok()?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Some(NodeLease { node: self.clone() })
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// RAII guard for one in-flight exchange on a node; the slot is released on drop.
#[derive(Debug)]
pub struct NodeLease {
    node: Arc<Node>,
}

impl NodeLease {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.node.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        let node = Node::new("a", 80);
        assert!(node.is_up());
        assert_eq!(node.set_status(NodeStatus::Takeout), NodeStatus::Up);
        assert_eq!(node.status(), NodeStatus::Takeout);
        assert_eq!(node.set_status(NodeStatus::Down), NodeStatus::Takeout);
        assert!(node.is_down());
    }

    #[test]
    fn lease_tracks_in_flight() {
        let node = Arc::new(Node::new("a", 80));
        let first = node.lease();
        let second = node.lease();
        assert_eq!(node.in_flight(), 2);
        drop(first);
        assert_eq!(node.in_flight(), 1);
        drop(second);
        assert_eq!(node.in_flight(), 0);
        assert_eq!(node.dispatched(), 2);
    }

    #[test]
    fn try_lease_respects_capacity() {
        let node = Arc::new(Node::new("a", 80));
        let held = node.try_lease(1).unwrap();
        assert!(node.try_lease(1).is_none());
        drop(held);
        assert!(node.try_lease(1).is_some());
    }

    #[test]
    fn destination_url() {
        let node = Node::new("10.0.0.1", 8080);
        assert_eq!(node.destination_url("/a?b=1"), "http://10.0.0.1:8080/a?b=1");
        let node = Node::new("secure", 443).with_secure(true);
        assert_eq!(node.base_url(), "https://secure:443");
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("TakeOut".parse::<NodeStatus>().unwrap(), NodeStatus::Takeout);
        assert!("sideways".parse::<NodeStatus>().is_err());
    }
}
