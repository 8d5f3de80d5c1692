mod common;

use std::time::Duration;

use http::StatusCode;
use switchyard::{
    bootstrap::build_gateway,
    config::{
        BalancerConfig, ClusterConfig, FailureDetectionConfig, HttpClientConfig, NodeConfig,
        RuleConfig, ServerConfig,
    },
    core::balancer::NodeStatus,
};

fn client_config() -> HttpClientConfig {
    HttpClientConfig {
        time_between_tries: Duration::from_millis(10),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_node_fails_over_to_the_next() {
    let dead = common::closed_port().await;
    let live = common::backend("live").await;

    let config = ServerConfig::builder()
        .http_client(client_config())
        .rule(RuleConfig::new("api").with_path_prefix("/api").with_balancer("Default"))
        .balancer(BalancerConfig::new("Default").with_cluster(ClusterConfig::new(
            "Default",
            vec![
                NodeConfig::new("127.0.0.1", dead.port()),
                NodeConfig::new("127.0.0.1", live.port()),
            ],
        )))
        .build()
        .unwrap();
    let gateway = build_gateway(&config).unwrap();

    // Round robin puts the dead node first on every other request
    for _ in 0..4 {
        let (status, body) = common::get(&gateway.handler, "/api/items?page=1", &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "live GET /api/items?page=1");
    }

    // Without failure detection the node keeps its state
    let cluster = gateway.balancers.get("Default").unwrap().cluster("Default").unwrap();
    assert_eq!(
        cluster.find_node("127.0.0.1", dead.port()).map(|n| n.status()),
        Some(NodeStatus::Up)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_detection_marks_refused_nodes_down() {
    let dead = common::closed_port().await;
    let live = common::backend("live").await;

    let mut balancer = BalancerConfig::new("Default").with_cluster(ClusterConfig::new(
        "Default",
        vec![
            NodeConfig::new("127.0.0.1", dead.port()),
            NodeConfig::new("127.0.0.1", live.port()),
        ],
    ));
    balancer.failure_detection = Some(FailureDetectionConfig::default());

    let config = ServerConfig::builder()
        .http_client(client_config())
        .rule(RuleConfig::new("api").with_balancer("Default"))
        .balancer(balancer)
        .build()
        .unwrap();
    let gateway = build_gateway(&config).unwrap();

    for _ in 0..2 {
        let (status, _) = common::get(&gateway.handler, "/", &[]).await;
        assert_eq!(status, StatusCode::OK);
    }

    let cluster = gateway.balancers.get("Default").unwrap().cluster("Default").unwrap();
    assert_eq!(
        cluster.find_node("127.0.0.1", dead.port()).map(|n| n.status()),
        Some(NodeStatus::Down)
    );
    assert_eq!(cluster.available_nodes().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn fail_over_on_5xx_skips_failing_backends() {
    let broken = common::backend_with_status("broken", StatusCode::SERVICE_UNAVAILABLE).await;
    let live = common::backend("live").await;

    let mut rule = RuleConfig::new("api").with_balancer("Default");
    rule.fail_over_on_5xx = true;
    let config = ServerConfig::builder()
        .http_client(client_config())
        .rule(rule)
        .balancer(BalancerConfig::new("Default").with_cluster(ClusterConfig::new(
            "Default",
            vec![
                NodeConfig::new("127.0.0.1", broken.port()),
                NodeConfig::new("127.0.0.1", live.port()),
            ],
        )))
        .build()
        .unwrap();
    let gateway = build_gateway(&config).unwrap();

    for _ in 0..4 {
        let (status, body) = common::get(&gateway.handler, "/x", &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "live GET /x");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_answer_502() {
    let dead = common::closed_port().await;

    let config = ServerConfig::builder()
        .http_client(HttpClientConfig {
            max_retries: 2,
            ..client_config()
        })
        .rule(RuleConfig::new("api").with_target(format!("http://{dead}")))
        .build()
        .unwrap();
    let gateway = build_gateway(&config).unwrap();

    let (status, body) = common::get(&gateway.handler, "/", &[]).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("\"status\":502"));
}
