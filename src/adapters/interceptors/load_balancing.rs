//! Node selection for rules that target a balancer instead of a fixed URL.
//!
//! The request phase picks a node (sticky when the request carries a known
//! session id), holds a [`NodeLease`] on the exchange and lists the other
//! available nodes behind it for failover. The response phase binds any
//! session id to the node that answered, feeds the attempts to the passive
//! failure detector and the cluster's strategy, and releases the lease.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use http::StatusCode;

use crate::{
    config::FailureDetectionConfig,
    core::{
        balancer::{Balancer, BalancerError, Cluster, Node, NodeLease, NodeStatus},
        destination::Destination,
        exchange::{Attempt, Exchange},
        interceptor::{Interceptor, Outcome},
        problem::problem_response,
    },
};

/// Property holding the [`NodeLease`] of the dispatched node.
pub const NODE_LEASE_PROPERTY: &str = "switchyard.node_lease";

/// Property holding the session id read from the request.
pub const SESSION_ID_PROPERTY: &str = "switchyard.session_id";

pub struct LoadBalancingInterceptor {
    balancer: Arc<Balancer>,
    cluster: String,
    fail_over: bool,
    detector: Option<FailureDetector>,
    production: bool,
}

impl LoadBalancingInterceptor {
    pub fn new(balancer: Arc<Balancer>, cluster: impl Into<String>) -> Self {
        Self {
            balancer,
            cluster: cluster.into(),
            fail_over: true,
            detector: None,
            production: false,
        }
    }

    /// List the other available nodes as failover destinations.
    pub fn with_fail_over(mut self, fail_over: bool) -> Self {
        self.fail_over = fail_over;
        self
    }

    pub fn with_failure_detection(mut self, config: FailureDetectionConfig) -> Self {
        self.detector = Some(FailureDetector::new(config));
        self
    }

    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    fn reject(&self, exc: &mut Exchange, error: &BalancerError) -> Outcome {
        let status = match error {
            BalancerError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(balancer = %self.balancer.name(), cluster = %self.cluster, %error, "no node dispatched");
        exc.set_response(problem_response(
            status,
            status.canonical_reason().unwrap_or("Error"),
            Some(&error.to_string()),
            self.production,
        ));
        Outcome::Abort
    }

    /// A message the extractor cannot read carries no session id.
    fn lookup_session(&self, found: eyre::Result<Option<String>>, phase: &str) -> Option<String> {
        found.unwrap_or_else(|error| {
            tracing::warn!(balancer = %self.balancer.name(), phase, %error, "session id unreadable");
            None
        })
    }

    /// Node of the cluster the exchange was finally delivered to.
    fn answering_node(&self, exc: &Exchange) -> Option<Arc<Node>> {
        let destination = exc.destinations().first()?;
        let cluster = self.balancer.cluster(&self.cluster)?;
        node_for(&cluster, destination)
    }

    /// Report every attempt to the cluster's strategy.
    async fn report_attempts(&self, attempts: &[Attempt]) {
        let Some(cluster) = self.balancer.cluster(&self.cluster) else {
            return;
        };
        for attempt in attempts {
            if let Some(node) = node_for(&cluster, &attempt.destination) {
                cluster.strategy().record_attempt(&node, attempt).await;
            }
        }
    }
}

/// Cluster node a destination URL points at.
fn node_for(cluster: &Cluster, destination: &str) -> Option<Arc<Node>> {
    let Ok(Destination::Absolute(target)) = Destination::parse(destination) else {
        return None;
    };
    cluster
        .find_node(target.bare_host(), target.port)
        .or_else(|| cluster.find_node(&target.host, target.port))
}

#[async_trait]
impl Interceptor for LoadBalancingInterceptor {
    fn name(&self) -> &str {
        "load-balancing"
    }

    async fn handle_request(&self, exc: &mut Exchange) -> eyre::Result<Outcome> {
        let session_id = match self.balancer.session_extractor() {
            Some(extractor) => self.lookup_session(extractor.session_id(exc.request()), "request"),
            None => None,
        };

        let lease = match self
            .balancer
            .dispatch(&self.cluster, session_id.as_deref())
            .await
        {
            Ok(lease) => lease,
            Err(error) => return Ok(self.reject(exc, &error)),
        };

        let path_and_query = exc
            .request()
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let mut destinations = vec![lease.node().destination_url(&path_and_query)];
        if self.fail_over {
            if let Some(cluster) = self.balancer.cluster(&self.cluster) {
                destinations.extend(
                    cluster
                        .failover_nodes(lease.node())
                        .iter()
                        .map(|node| node.destination_url(&path_and_query)),
                );
            }
        }

        tracing::debug!(
            balancer = %self.balancer.name(),
            cluster = %self.cluster,
            node = %lease.node(),
            session = session_id.as_deref().unwrap_or("-"),
            candidates = destinations.len(),
            "dispatched"
        );
        exc.set_destinations(destinations);
        exc.properties_mut().insert(NODE_LEASE_PROPERTY, lease);
        if let Some(id) = session_id {
            exc.properties_mut().insert(SESSION_ID_PROPERTY, id);
        }
        Ok(Outcome::Continue)
    }

    async fn handle_response(&self, exc: &mut Exchange) -> eyre::Result<Outcome> {
        let Some(lease) = exc.properties_mut().remove::<NodeLease>(NODE_LEASE_PROPERTY) else {
            return Ok(Outcome::Continue);
        };

        if let Some(detector) = &self.detector {
            detector
                .observe(&self.balancer, &self.cluster, exc.attempts())
                .await;
        }
        self.report_attempts(exc.attempts()).await;

        if !exc.is_aborted() {
            let from_response = match (self.balancer.session_extractor(), exc.response()) {
                (Some(extractor), Some(response)) => {
                    self.lookup_session(extractor.session_id(response), "response")
                }
                _ => None,
            };
            let session_id = from_response
                .or_else(|| exc.properties_mut().remove::<String>(SESSION_ID_PROPERTY));
            if let Some(id) = session_id {
                let node = self
                    .answering_node(exc)
                    .unwrap_or_else(|| lease.node().clone());
                self.balancer.bind_session(&self.cluster, &id, node).await;
            }
        }

        drop(lease);
        Ok(Outcome::Continue)
    }
}

impl std::fmt::Debug for LoadBalancingInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancingInterceptor")
            .field("balancer", &self.balancer.name())
            .field("cluster", &self.cluster)
            .field("fail_over", &self.fail_over)
            .finish()
    }
}

/// Marks nodes DOWN from what the HTTP client saw: any connection-level
/// failure, or a run of server errors longer than the configured limit.
#[derive(Debug)]
pub struct FailureDetector {
    max_consecutive_5xx: u32,
    retry_after: Option<Duration>,
    consecutive_5xx: scc::HashMap<String, u32>,
}

impl FailureDetector {
    pub fn new(config: FailureDetectionConfig) -> Self {
        Self {
            max_consecutive_5xx: config.max_consecutive_5xx,
            retry_after: config.retry_after,
            consecutive_5xx: scc::HashMap::new(),
        }
    }

    /// Apply the attempts of one exchange. Returns the nodes marked DOWN.
    pub async fn observe(
        &self,
        balancer: &Arc<Balancer>,
        cluster: &str,
        attempts: &[Attempt],
    ) -> Vec<String> {
        let Some(nodes) = balancer.cluster(cluster) else {
            return Vec::new();
        };
        let mut marked = Vec::new();

        for attempt in attempts {
            let Some(node) = node_for(&nodes, &attempt.destination) else {
                continue;
            };
            let key = node.to_string();

            let failed = match (attempt.status, &attempt.error) {
                (_, Some(error)) => {
                    tracing::info!(%cluster, node = %key, %error, "node failed, marking down");
                    self.consecutive_5xx.remove_async(&key).await;
                    true
                }
                (Some(status), None) if status.is_server_error() => {
                    let count = self.increment(&key).await;
                    if count > self.max_consecutive_5xx {
                        tracing::info!(%cluster, node = %key, count, "too many server errors, marking down");
                        self.consecutive_5xx.remove_async(&key).await;
                        true
                    } else {
                        false
                    }
                }
                _ => {
                    self.consecutive_5xx.remove_async(&key).await;
                    false
                }
            };

            if failed && !node.is_down() {
                nodes.down(node.host(), node.port());
                self.schedule_retry(balancer.clone(), cluster.to_string(), node.clone());
                marked.push(key);
            }
        }
        marked
    }

    async fn increment(&self, key: &str) -> u32 {
        match self.consecutive_5xx.entry_async(key.to_string()).await {
            scc::hash_map::Entry::Occupied(mut entry) => {
                *entry.get_mut() += 1;
                *entry.get()
            }
            scc::hash_map::Entry::Vacant(entry) => {
                entry.insert_entry(1);
                1
            }
        }
    }

    fn schedule_retry(&self, balancer: Arc<Balancer>, cluster: String, node: Arc<Node>) {
        let Some(delay) = self.retry_after else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if node.status() == NodeStatus::Down {
                tracing::info!(%cluster, node = %node, "retrying node after failure");
                balancer.up(&cluster, node.host(), node.port());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{Request, Response, header};

    use super::*;
    use crate::{
        config::StrategyConfig,
        core::balancer::{
            StrategyFactory,
            session::{HeaderExtractor, XmlElementExtractor},
        },
    };

    fn balancer(nodes: &[(&str, u16)]) -> Arc<Balancer> {
        let balancer = Balancer::new("Default")
            .with_session_extractor(Arc::new(HeaderExtractor::new(
                header::HeaderName::from_static("x-session"),
            )));
        let cluster = Cluster::new("Default");
        for (host, port) in nodes {
            cluster.add_node(Node::new(*host, *port));
        }
        balancer.add_cluster(cluster);
        Arc::new(balancer)
    }

    fn exchange(session: Option<&str>) -> Exchange {
        let mut builder = Request::builder().uri("/api?x=1");
        if let Some(session) = session {
            builder = builder.header("x-session", session);
        }
        Exchange::new(builder.body(Bytes::new()).unwrap())
    }

    #[tokio::test]
    async fn dispatch_lists_failover_nodes() {
        let lb = LoadBalancingInterceptor::new(balancer(&[("a", 1), ("b", 2)]), "Default");
        let mut exc = exchange(None);
        assert_eq!(lb.handle_request(&mut exc).await.unwrap(), Outcome::Continue);
        assert_eq!(exc.destinations().len(), 2);
        assert!(exc.destinations()[0].ends_with("/api?x=1"));
        assert!(exc.properties().contains(NODE_LEASE_PROPERTY));

        let lb = lb.with_fail_over(false);
        let mut exc = exchange(None);
        lb.handle_request(&mut exc).await.unwrap();
        assert_eq!(exc.destinations().len(), 1);
    }

    #[tokio::test]
    async fn empty_cluster_aborts_with_500() {
        let lb = LoadBalancingInterceptor::new(balancer(&[]), "Default");
        let mut exc = exchange(None);
        assert_eq!(lb.handle_request(&mut exc).await.unwrap(), Outcome::Abort);
        assert_eq!(
            exc.response().unwrap().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn response_binds_session_and_releases_lease() {
        let balancer = balancer(&[("a", 1), ("b", 2)]);
        let lb = LoadBalancingInterceptor::new(balancer.clone(), "Default");

        let mut exc = exchange(None);
        lb.handle_request(&mut exc).await.unwrap();
        let chosen = exc.destinations()[0].clone();
        exc.set_destinations(vec![chosen.clone()]);
        exc.set_response(
            Response::builder()
                .header("x-session", "s-1")
                .body(Bytes::new())
                .unwrap(),
        );
        lb.handle_response(&mut exc).await.unwrap();
        assert!(!exc.properties().contains(NODE_LEASE_PROPERTY));

        let cluster = balancer.cluster("Default").unwrap();
        assert!(cluster.nodes().iter().all(|n| n.in_flight() == 0));

        for _ in 0..4 {
            let mut exc = exchange(Some("s-1"));
            lb.handle_request(&mut exc).await.unwrap();
            assert_eq!(exc.destinations()[0], chosen);
        }
    }

    fn xml_balancer() -> Arc<Balancer> {
        let balancer = Balancer::new("Default").with_session_extractor(Arc::new(
            XmlElementExtractor::new(Some("urn:session".to_string()), "id"),
        ));
        let cluster = Cluster::new("Default");
        cluster.add_node(Node::new("a", 1));
        balancer.add_cluster(cluster);
        Arc::new(balancer)
    }

    #[tokio::test]
    async fn malformed_xml_does_not_replace_the_backend_answer() {
        let lb = LoadBalancingInterceptor::new(xml_balancer(), "Default");
        let mut exc = Exchange::new(
            Request::builder()
                .method("POST")
                .uri("/soap")
                .header(header::CONTENT_TYPE, "text/xml")
                .body(Bytes::from_static(b"<a><b></a>"))
                .unwrap(),
        );
        assert_eq!(lb.handle_request(&mut exc).await.unwrap(), Outcome::Continue);
        assert!(!exc.properties().contains(SESSION_ID_PROPERTY));

        exc.set_response(
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/xml")
                .body(Bytes::from_static(b"<a><b></a>"))
                .unwrap(),
        );
        assert_eq!(lb.handle_response(&mut exc).await.unwrap(), Outcome::Continue);

        let response = exc.response().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"<a><b></a>");
        let cluster = lb.balancer().cluster("Default").unwrap();
        assert_eq!(cluster.session_count(), 0);
        assert!(cluster.nodes().iter().all(|n| n.in_flight() == 0));
    }

    #[tokio::test]
    async fn failed_attempts_steer_fault_monitoring_dispatch() {
        let balancer = Balancer::new("Default");
        let cluster = Cluster::new("Default").with_strategy(StrategyFactory::create(
            &StrategyConfig::FaultMonitoring {
                min_flawless_ratio: 0.5,
                clear_faults_after: Duration::from_secs(60),
            },
        ));
        for port in 1..=4 {
            cluster.add_node(Node::new("n", port));
        }
        balancer.add_cluster(cluster);
        let lb = LoadBalancingInterceptor::new(Arc::new(balancer), "Default");

        let mut exc = exchange(None);
        lb.handle_request(&mut exc).await.unwrap();
        exc.record_attempt(Attempt {
            destination: "http://n:3/api?x=1".into(),
            status: None,
            error: Some("connection refused".into()),
        });
        exc.record_attempt(Attempt {
            destination: "http://n:4/api?x=1".into(),
            status: Some(StatusCode::OK),
            error: None,
        });
        exc.set_destinations(vec!["http://n:4/api?x=1".into()]);
        exc.set_response(Response::new(Bytes::new()));
        lb.handle_response(&mut exc).await.unwrap();

        for _ in 0..9 {
            let mut exc = exchange(None);
            lb.handle_request(&mut exc).await.unwrap();
            assert!(!exc.destinations()[0].starts_with("http://n:3/"));
            assert!(exc.destinations().last().unwrap().starts_with("http://n:3/"));
            lb.handle_response(&mut exc).await.unwrap();
        }
    }

    #[tokio::test]
    async fn connection_errors_mark_nodes_down() {
        let balancer = balancer(&[("a", 1), ("b", 2)]);
        let detector = FailureDetector::new(FailureDetectionConfig {
            max_consecutive_5xx: 1,
            retry_after: None,
        });
        let attempts = vec![
            Attempt {
                destination: "http://a:1/x".into(),
                status: None,
                error: Some("connection refused".into()),
            },
            Attempt {
                destination: "http://b:2/x".into(),
                status: Some(StatusCode::BAD_GATEWAY),
                error: None,
            },
        ];
        let marked = detector.observe(&balancer, "Default", &attempts).await;
        assert_eq!(marked, vec!["a:1"]);

        let marked = detector.observe(&balancer, "Default", &attempts[1..]).await;
        assert_eq!(marked, vec!["b:2"]);
        let cluster = balancer.cluster("Default").unwrap();
        assert!(cluster.nodes().iter().all(|n| n.is_down()));
    }

    #[tokio::test]
    async fn successes_reset_the_error_count() {
        let balancer = balancer(&[("a", 1)]);
        let detector = FailureDetector::new(FailureDetectionConfig {
            max_consecutive_5xx: 1,
            retry_after: None,
        });
        let attempt = |status| Attempt {
            destination: "http://a:1/".into(),
            status: Some(status),
            error: None,
        };
        detector
            .observe(&balancer, "Default", &[attempt(StatusCode::INTERNAL_SERVER_ERROR)])
            .await;
        detector.observe(&balancer, "Default", &[attempt(StatusCode::OK)]).await;
        let marked = detector
            .observe(&balancer, "Default", &[attempt(StatusCode::INTERNAL_SERVER_ERROR)])
            .await;
        assert!(marked.is_empty());
        assert!(balancer.cluster("Default").unwrap().nodes()[0].is_up());
    }

    #[tokio::test]
    async fn retry_after_brings_nodes_back() {
        let balancer = balancer(&[("a", 1)]);
        let detector = FailureDetector::new(FailureDetectionConfig {
            max_consecutive_5xx: 10,
            retry_after: Some(Duration::from_millis(20)),
        });
        let failed = Attempt {
            destination: "http://a:1/".into(),
            status: None,
            error: Some("reset".into()),
        };
        detector.observe(&balancer, "Default", &[failed]).await;
        let node = balancer.cluster("Default").unwrap().nodes()[0].clone();
        assert!(node.is_down());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(node.is_up());
    }
}
