use std::{
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rand::Rng;

use crate::{
    config::StrategyConfig,
    core::{
        balancer::{
            BalancerError, BalancerResult,
            cluster::Cluster,
            node::{Node, NodeLease},
        },
        exchange::Attempt,
    },
};

/// Trait defining the interface for node dispatching strategies
#[async_trait]
pub trait DispatchingStrategy: Send + Sync + std::fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    /// Pick a node for a new exchange and occupy an in-flight slot on it.
    async fn dispatch(&self, cluster: &Cluster) -> BalancerResult<NodeLease>;

    /// Available nodes other than `primary`, in the order failover should
    /// try them.
    fn failover_order(&self, cluster: &Cluster, primary: &Node) -> Vec<Arc<Node>> {
        cluster
            .available_nodes()
            .into_iter()
            .filter(|n| !std::ptr::eq(n.as_ref(), primary))
            .collect()
    }

    /// Feedback from one delivery attempt that went to `node`.
    async fn record_attempt(&self, _node: &Node, _attempt: &Attempt) {}

    /// Create a new instance of this strategy as a shared trait object
    fn shared(self) -> Arc<dyn DispatchingStrategy>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// Rotating cursor over the currently UP nodes.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchingStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    async fn dispatch(&self, cluster: &Cluster) -> BalancerResult<NodeLease> {
        let nodes = cluster.available_nodes();
        if nodes.is_empty() {
            return Err(BalancerError::EmptyNodeList(cluster.name().to_string()));
        }
        let count = self.cursor.fetch_add(1, Ordering::SeqCst);
        Ok(nodes[count % nodes.len()].lease())
    }
}

/// Bounded concurrency per node. When every UP node is at capacity the
/// caller waits `retry_time_on_busy` and looks again instead of failing.
#[derive(Debug)]
pub struct ByThreadStrategy {
    max_threads_per_endpoint: usize,
    retry_time_on_busy: Duration,
    max_busy_retries: Option<u32>,
}

impl Default for ByThreadStrategy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(1000))
    }
}

impl ByThreadStrategy {
    pub fn new(max_threads_per_endpoint: usize, retry_time_on_busy: Duration) -> Self {
        Self {
            max_threads_per_endpoint,
            retry_time_on_busy,
            max_busy_retries: None,
        }
    }

    /// Give up with [`BalancerError::Busy`] after this many waits.
    pub fn with_max_busy_retries(mut self, retries: Option<u32>) -> Self {
        self.max_busy_retries = retries;
        self
    }
}

#[async_trait]
impl DispatchingStrategy for ByThreadStrategy {
    fn name(&self) -> &'static str {
        "by_thread"
    }

    async fn dispatch(&self, cluster: &Cluster) -> BalancerResult<NodeLease> {
        let mut waits = 0u32;
        loop {
            let nodes = cluster.available_nodes();
            if nodes.is_empty() {
                return Err(BalancerError::EmptyNodeList(cluster.name().to_string()));
            }
            if let Some(lease) = nodes
                .iter()
                .find_map(|n| n.try_lease(self.max_threads_per_endpoint))
            {
                return Ok(lease);
            }

            if self.max_busy_retries.is_some_and(|max| waits >= max) {
                return Err(BalancerError::Busy {
                    cluster: cluster.name().to_string(),
                    waits,
                });
            }
            waits += 1;
            tracing::debug!(
                cluster = cluster.name(),
                waits,
                "all nodes busy, waiting {:?}",
                self.retry_time_on_busy
            );
            tokio::time::sleep(self.retry_time_on_busy).await;
        }
    }
}

/// Cumulative-weight table for O(log n) weighted draws.
///
/// Items with a non-positive or non-finite weight are never drawn. The table
/// is immutable once built, so concurrent draws need no locking.
#[derive(Debug, Clone)]
pub struct WeightedSelector<T> {
    items: Vec<T>,
    weights: Vec<f64>,
    cumulative: Vec<f64>,
}

impl<T> WeightedSelector<T> {
    pub fn new(entries: impl IntoIterator<Item = (T, f64)>) -> Self {
        let mut items = Vec::new();
        let mut weights = Vec::new();
        let mut cumulative = Vec::new();
        let mut total = 0.0;
        for (item, weight) in entries {
            if !(weight.is_finite() && weight > 0.0) {
                continue;
            }
            total += weight;
            items.push(item);
            weights.push(weight);
            cumulative.push(total);
        }
        Self {
            items,
            weights,
            cumulative,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    /// Draw one item with probability proportional to its weight.
    pub fn pick<R: Rng>(&self, rng: &mut R) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let point = rng.random::<f64>() * self.total_weight();
        let index = self.cumulative.partition_point(|&c| c <= point);
        self.items.get(index.min(self.items.len() - 1))
    }

    /// All items by descending weight; equal weights keep insertion order.
    pub fn ranked(&self) -> Vec<&T> {
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        order.sort_by(|&a, &b| self.weights[b].total_cmp(&self.weights[a]));
        order.into_iter().map(|i| &self.items[i]).collect()
    }
}

type NodeTable = (u64, Arc<WeightedSelector<Arc<Node>>>);

/// Draws UP nodes with probability proportional to their weight. The
/// table is rebuilt only when the cluster's membership or states change.
#[derive(Debug, Default)]
pub struct WeightedRandomStrategy {
    table: RwLock<Option<NodeTable>>,
}

impl WeightedRandomStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, cluster: &Cluster) -> Arc<WeightedSelector<Arc<Node>>> {
        let generation = cluster.generation();
        if let Some((cached, table)) = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            if *cached == generation {
                return table.clone();
            }
        }

        let table = Arc::new(WeightedSelector::new(
            cluster
                .available_nodes()
                .into_iter()
                .map(|n| {
                    let weight = n.weight();
                    (n, weight)
                }),
        ));
        *self.table.write().unwrap_or_else(PoisonError::into_inner) =
            Some((generation, table.clone()));
        table
    }
}

#[async_trait]
impl DispatchingStrategy for WeightedRandomStrategy {
    fn name(&self) -> &'static str {
        "weighted_random"
    }

    async fn dispatch(&self, cluster: &Cluster) -> BalancerResult<NodeLease> {
        let table = self.table(cluster);
        let node = table
            .pick(&mut rand::rng())
            .ok_or_else(|| BalancerError::EmptyNodeList(cluster.name().to_string()))?;
        Ok(node.lease())
    }

    fn failover_order(&self, cluster: &Cluster, primary: &Node) -> Vec<Arc<Node>> {
        self.table(cluster)
            .ranked()
            .into_iter()
            .filter(|n| !std::ptr::eq(n.as_ref(), primary))
            .cloned()
            .collect()
    }
}

/// Smallest score a faulty node is drawn with, so that a long run of
/// failures never removes it from the draw entirely.
const MIN_FAULT_SCORE: f64 = 0.0001;

/// Recent faults of one node. The score halves with every failure and
/// doubles with every success; back at 1.0 the node is flawless again.
#[derive(Debug, Clone, Copy)]
struct FaultProfile {
    score: f64,
    last_failure: Instant,
}

impl FaultProfile {
    fn first_failure(now: Instant) -> Self {
        Self {
            score: 0.5,
            last_failure: now,
        }
    }

    fn fail(&mut self, now: Instant) {
        self.score /= 2.0;
        self.last_failure = now;
    }

    /// True once the node has fully recovered.
    fn succeed(&mut self) -> bool {
        self.score = (self.score * 2.0).min(1.0);
        self.score >= 1.0
    }
}

/// Steers traffic away from nodes that recently failed.
///
/// Every attempt reported through [`DispatchingStrategy::record_attempt`]
/// updates the node's fault profile: connection errors and 5xx answers count
/// as faults, anything else as a success. While at least
/// `min_flawless_ratio` of the UP nodes have no faults, dispatch rotates
/// over those nodes only. Otherwise all UP nodes are drawn with probability
/// proportional to their score. Profiles without a new fault for
/// `clear_faults_after` are dropped.
#[derive(Debug)]
pub struct FaultMonitoringStrategy {
    min_flawless_ratio: f64,
    clear_faults_after: Duration,
    profiles: scc::HashMap<String, FaultProfile>,
    cursor: AtomicUsize,
}

impl Default for FaultMonitoringStrategy {
    fn default() -> Self {
        Self::new(0.5, Duration::from_secs(5 * 60))
    }
}

impl FaultMonitoringStrategy {
    pub fn new(min_flawless_ratio: f64, clear_faults_after: Duration) -> Self {
        Self {
            min_flawless_ratio,
            clear_faults_after,
            profiles: scc::HashMap::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Recent success score of `node`, 1.0 when it has no faults on record.
    pub fn score(&self, node: &Node) -> f64 {
        self.profiles
            .read_sync(&node.to_string(), |_, profile| profile.score)
            .unwrap_or(1.0)
    }

    async fn forget_quiet_nodes(&self) {
        if self.profiles.is_empty() {
            return;
        }
        let clear_after = self.clear_faults_after;
        self.profiles
            .retain_async(|node, profile| {
                let keep = profile.last_failure.elapsed() < clear_after;
                if !keep {
                    tracing::debug!(%node, "fault history cleared");
                }
                keep
            })
            .await;
    }

    fn choose<R: Rng>(&self, nodes: &[Arc<Node>], rng: &mut R) -> Option<Arc<Node>> {
        if nodes.len() <= 1 {
            return nodes.first().cloned();
        }
        let scores: Vec<f64> = nodes.iter().map(|n| self.score(n)).collect();
        let flawless: Vec<&Arc<Node>> = nodes
            .iter()
            .zip(&scores)
            .filter(|(_, score)| **score >= 1.0)
            .map(|(node, _)| node)
            .collect();

        if !flawless.is_empty()
            && flawless.len() as f64 / nodes.len() as f64 >= self.min_flawless_ratio
        {
            let count = self.cursor.fetch_add(1, Ordering::SeqCst);
            return Some(flawless[count % flawless.len()].clone());
        }

        tracing::trace!(nodes = nodes.len(), flawless = flawless.len(), "drawing by success score");
        WeightedSelector::new(
            nodes
                .iter()
                .cloned()
                .zip(scores.into_iter().map(|score| score.max(MIN_FAULT_SCORE))),
        )
        .pick(rng)
        .cloned()
    }
}

#[async_trait]
impl DispatchingStrategy for FaultMonitoringStrategy {
    fn name(&self) -> &'static str {
        "fault_monitoring"
    }

    async fn dispatch(&self, cluster: &Cluster) -> BalancerResult<NodeLease> {
        self.forget_quiet_nodes().await;
        let nodes = cluster.available_nodes();
        let node = self
            .choose(&nodes, &mut rand::rng())
            .ok_or_else(|| BalancerError::EmptyNodeList(cluster.name().to_string()))?;
        Ok(node.lease())
    }

    /// Nodes with the best recent record first.
    fn failover_order(&self, cluster: &Cluster, primary: &Node) -> Vec<Arc<Node>> {
        let mut ranked: Vec<(Arc<Node>, f64)> = cluster
            .available_nodes()
            .into_iter()
            .filter(|n| !std::ptr::eq(n.as_ref(), primary))
            .map(|n| {
                let score = self.score(&n);
                (n, score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.into_iter().map(|(node, _)| node).collect()
    }

    async fn record_attempt(&self, node: &Node, attempt: &Attempt) {
        let faulty =
            attempt.error.is_some() || attempt.status.is_some_and(|s| s.is_server_error());
        let key = node.to_string();
        match self.profiles.entry_async(key).await {
            scc::hash_map::Entry::Occupied(mut entry) => {
                if faulty {
                    entry.get_mut().fail(Instant::now());
                } else if entry.get_mut().succeed() {
                    let (key, _) = entry.remove_entry();
                    tracing::debug!(node = %key, "node recovered");
                }
            }
            scc::hash_map::Entry::Vacant(entry) => {
                if faulty {
                    tracing::debug!(node = %entry.key(), "fault history started");
                    entry.insert_entry(FaultProfile::first_failure(Instant::now()));
                }
            }
        }
    }
}

/// Factory for creating dispatching strategies from configuration
pub struct StrategyFactory;

impl StrategyFactory {
    pub fn create(config: &StrategyConfig) -> Arc<dyn DispatchingStrategy> {
        match config {
            StrategyConfig::RoundRobin => RoundRobinStrategy::new().shared(),
            StrategyConfig::ByThread {
                max_threads_per_endpoint,
                retry_time_on_busy,
                max_busy_retries,
            } => ByThreadStrategy::new(*max_threads_per_endpoint, *retry_time_on_busy)
                .with_max_busy_retries(*max_busy_retries)
                .shared(),
            StrategyConfig::WeightedRandom => WeightedRandomStrategy::new().shared(),
            StrategyConfig::FaultMonitoring {
                min_flawless_ratio,
                clear_faults_after,
            } => FaultMonitoringStrategy::new(*min_flawless_ratio, *clear_faults_after).shared(),
        }
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn cluster(nodes: &[(&str, f64)]) -> Cluster {
        let cluster = Cluster::new("test");
        for (host, weight) in nodes {
            cluster.add_node(Node::new(*host, 80).with_weight(*weight));
        }
        cluster
    }

    #[tokio::test]
    async fn round_robin_alternates() {
        let cluster = cluster(&[("a", 1.0), ("b", 1.0)]);
        let strategy = RoundRobinStrategy::new();
        let mut picked = Vec::new();
        for _ in 0..4 {
            let lease = strategy.dispatch(&cluster).await.unwrap();
            picked.push(lease.node().host().to_string());
        }
        assert_eq!(picked, ["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn round_robin_skips_down_nodes() {
        let cluster = cluster(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        cluster.down("b", 80);
        let strategy = RoundRobinStrategy::new();
        for _ in 0..6 {
            let lease = strategy.dispatch(&cluster).await.unwrap();
            assert_ne!(lease.node().host(), "b");
        }
    }

    #[tokio::test]
    async fn empty_cluster_is_an_error() {
        let cluster = cluster(&[("a", 1.0)]);
        cluster.takeout("a", 80);
        let err = RoundRobinStrategy::new()
            .dispatch(&cluster)
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::EmptyNodeList(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn by_thread_blocks_until_slot_frees() {
        let cluster = Arc::new(cluster(&[("only", 1.0)]));
        let strategy = Arc::new(ByThreadStrategy::new(1, Duration::from_millis(20)));

        let first = strategy.dispatch(&cluster).await.unwrap();

        let (c, s) = (cluster.clone(), strategy.clone());
        let waiter = tokio::spawn(async move { s.dispatch(&c).await.map(|l| l.node().port()) });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "second dispatch should still wait");

        drop(first);
        let port = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter finished")
            .unwrap()
            .unwrap();
        assert_eq!(port, 80);
    }

    #[tokio::test]
    async fn by_thread_gives_up_after_configured_waits() {
        let cluster = cluster(&[("only", 1.0)]);
        let strategy = ByThreadStrategy::new(1, Duration::from_millis(1))
            .with_max_busy_retries(Some(2));
        let _held = strategy.dispatch(&cluster).await.unwrap();
        let err = strategy.dispatch(&cluster).await.unwrap_err();
        assert!(matches!(err, BalancerError::Busy { waits: 2, .. }));
    }

    #[test]
    fn weighted_draws_follow_weights() {
        let selector = WeightedSelector::new([("foo", 1.0), ("bar", 0.1)]);
        let mut rng = StdRng::seed_from_u64(7);
        let (mut foo, mut bar) = (0u32, 0u32);
        for _ in 0..1000 {
            match *selector.pick(&mut rng).unwrap() {
                "foo" => foo += 1,
                _ => bar += 1,
            }
        }
        assert!(bar > 0);
        let ratio = foo as f64 / bar as f64;
        assert!((5.0..20.0).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn weighted_selector_ranks_and_skips_zero_weights() {
        let selector = WeightedSelector::new([("low", 0.5), ("none", 0.0), ("high", 3.0), ("mid", 1.0)]);
        assert_eq!(selector.len(), 3);
        assert_eq!(selector.ranked(), [&"high", &"mid", &"low"]);
        assert!((selector.total_weight() - 4.5).abs() < f64::EPSILON);
        assert!(WeightedSelector::<u8>::new([]).pick(&mut rand::rng()).is_none());
    }

    #[tokio::test]
    async fn weighted_strategy_follows_cluster_changes() {
        let cluster = cluster(&[("heavy", 10.0), ("light", 1.0)]);
        let strategy = WeightedRandomStrategy::new();
        let primary = strategy.dispatch(&cluster).await.unwrap();
        let order = strategy.failover_order(&cluster, primary.node());
        assert_eq!(order.len(), 1);

        cluster.down("heavy", 80);
        for _ in 0..20 {
            let lease = strategy.dispatch(&cluster).await.unwrap();
            assert_eq!(lease.node().host(), "light");
        }
    }

    fn fault(destination: &str) -> Attempt {
        Attempt {
            destination: destination.to_string(),
            status: None,
            error: Some("connection refused".to_string()),
        }
    }

    fn answer(destination: &str, status: StatusCode) -> Attempt {
        Attempt {
            destination: destination.to_string(),
            status: Some(status),
            error: None,
        }
    }

    async fn fail(strategy: &FaultMonitoringStrategy, cluster: &Cluster, host: &str, times: usize) {
        let node = cluster.find_node(host, 80).unwrap();
        for _ in 0..times {
            strategy.record_attempt(&node, &fault("http://node/")).await;
        }
    }

    #[tokio::test]
    async fn fault_monitoring_skips_a_failing_node() {
        let cluster = cluster(&[("a", 1.0), ("b", 1.0), ("c", 1.0), ("d", 1.0)]);
        let strategy = FaultMonitoringStrategy::default();
        fail(&strategy, &cluster, "c", 1).await;

        let mut picked = Vec::new();
        for _ in 0..6 {
            let lease = strategy.dispatch(&cluster).await.unwrap();
            picked.push(lease.node().host().to_string());
        }
        assert_eq!(picked, ["a", "b", "d", "a", "b", "d"]);

        let c = cluster.find_node("c", 80).unwrap();
        let a = cluster.find_node("a", 80).unwrap();
        let order: Vec<String> = strategy
            .failover_order(&cluster, &a)
            .iter()
            .map(|n| n.host().to_string())
            .collect();
        assert_eq!(order, ["b", "d", "c"]);
        assert!((strategy.score(&c) - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn fault_monitoring_draws_by_score_when_most_nodes_fail() {
        let cluster = cluster(&[("a", 1.0), ("b", 1.0), ("c", 1.0), ("d", 1.0)]);
        let strategy = FaultMonitoringStrategy::default();
        for host in ["b", "c", "d"] {
            fail(&strategy, &cluster, host, 3).await;
        }

        let nodes = cluster.available_nodes();
        let mut rng = StdRng::seed_from_u64(11);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..1000 {
            let node = strategy.choose(&nodes, &mut rng).unwrap();
            *counts.entry(node.host().to_string()).or_insert(0u32) += 1;
        }

        // a scores 1.0 and the others 0.125 each, so a takes about 73%
        let a = counts.get("a").copied().unwrap_or(0);
        assert!((600..850).contains(&a), "a was picked {a} times");
        for host in ["b", "c", "d"] {
            let n = counts.get(host).copied().unwrap_or(0);
            assert!(n > 0 && n < 200, "{host} was picked {n} times");
        }
    }

    #[tokio::test]
    async fn fault_monitoring_forgets_recovered_and_quiet_nodes() {
        let cluster = cluster(&[("a", 1.0), ("b", 1.0)]);
        let strategy = FaultMonitoringStrategy::new(0.5, Duration::from_millis(30));
        let a = cluster.find_node("a", 80).unwrap();
        let b = cluster.find_node("b", 80).unwrap();

        strategy.record_attempt(&a, &answer("http://a/", StatusCode::BAD_GATEWAY)).await;
        assert!(strategy.score(&a) < 1.0);
        strategy.record_attempt(&a, &answer("http://a/", StatusCode::OK)).await;
        assert_eq!(strategy.score(&a), 1.0);

        fail(&strategy, &cluster, "b", 2).await;
        assert!((strategy.score(&b) - 0.25).abs() < f64::EPSILON);
        tokio::time::sleep(Duration::from_millis(60)).await;
        strategy.dispatch(&cluster).await.unwrap();
        assert_eq!(strategy.score(&b), 1.0);
    }
}
