//! Builds the runtime object graph from a [`ServerConfig`].
//!
//! Everything is wired by hand: one connection pool, one HTTP client, one
//! balancer registry and one rule registry, shared through `Arc`s.
use std::sync::Arc;

use eyre::{Result, WrapErr, eyre};
use http::{HeaderName, Method};
use regex::Regex;

use crate::{
    adapters::{
        ConnectionManager, HttpClientAdapter, HttpHandler, PoolConfig,
        interceptors::{
            AccessLogInterceptor, ClusterNotificationInterceptor, DispatchingInterceptor,
            LoadBalancingInterceptor,
        },
        tls::tls_context,
    },
    config::{BalancerConfig, ClusterManagerConfig, RuleConfig, ServerConfig, SessionIdConfig},
    core::{
        GatewayService, Interceptor, InterceptorChain,
        balancer::{
            Balancer, BalancerRegistry, Cluster, Node, NodeStatus, SessionIdExtractor,
            StrategyFactory,
            session::{CookieExtractor, HeaderExtractor, XmlElementExtractor},
        },
        rule::{PathMatcher, Rule, RuleKey, RuleRegistry},
    },
};

/// Name of the rule serving the cluster manager endpoint.
pub const CLUSTER_MANAGER_RULE: &str = "cluster-manager";

/// The assembled gateway.
pub struct Gateway {
    pub handler: Arc<HttpHandler>,
    pub service: GatewayService,
    pub balancers: Arc<BalancerRegistry>,
    pub pool: Arc<ConnectionManager>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("rules", &self.service.rules().len())
            .field("balancers", &self.balancers.names())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Assemble the gateway. The config is expected to be validated.
pub fn build_gateway(config: &ServerConfig) -> Result<Gateway> {
    let pool = Arc::new(ConnectionManager::new(PoolConfig::from(&config.http_client)));
    let client = HttpClientAdapter::new(config.http_client.clone(), pool.clone());

    let balancers = Arc::new(BalancerRegistry::new());
    for balancer in &config.balancers {
        balancers.insert(build_balancer(balancer)?);
    }

    let mut rules = Vec::with_capacity(config.rules.len() + 1);
    for rule in &config.rules {
        rules.push(
            build_rule(rule, config, &balancers)
                .wrap_err_with(|| format!("Failed to build rule '{}'", rule.name))?,
        );
    }
    if let Some(cluster_manager) = &config.cluster_manager {
        rules.push(build_cluster_manager_rule(cluster_manager, config, &balancers)?);
    }

    let registry = Arc::new(RuleRegistry::new(rules));
    tracing::info!(
        rules = registry.len(),
        balancers = balancers.len(),
        "gateway assembled"
    );

    let service =
        GatewayService::new(registry, Arc::new(client)).with_production(config.production);
    let handler = Arc::new(
        HttpHandler::new(service.clone())
            .with_max_body_bytes(config.max_body_bytes)
            .with_production(config.production),
    );

    Ok(Gateway {
        handler,
        service,
        balancers,
        pool,
    })
}

fn build_balancer(config: &BalancerConfig) -> Result<Balancer> {
    let mut balancer = Balancer::new(&config.name)
        .with_strategy(config.strategy.clone())
        .with_session_timeout(config.session_timeout);
    if let Some(session_id) = &config.session_id {
        balancer = balancer.with_session_extractor(session_extractor(session_id)?);
    }

    for cluster_config in &config.clusters {
        let cluster = balancer.add_cluster(
            Cluster::new(&cluster_config.name).with_strategy(StrategyFactory::create(&config.strategy)),
        );
        for node in &cluster_config.nodes {
            cluster.add_node(
                Node::new(&node.host, node.port)
                    .with_weight(node.weight)
                    .with_secure(node.secure),
            );
            if node.status != NodeStatus::Up {
                cluster.set_status(&node.host, node.port, node.status);
            }
        }
        tracing::debug!(
            balancer = %config.name,
            cluster = %cluster_config.name,
            nodes = cluster_config.nodes.len(),
            "cluster configured"
        );
    }
    Ok(balancer)
}

fn session_extractor(config: &SessionIdConfig) -> Result<Arc<dyn SessionIdExtractor>> {
    Ok(match config {
        SessionIdConfig::Xml {
            namespace,
            local_name,
        } => Arc::new(XmlElementExtractor::new(namespace.clone(), local_name.clone())),
        SessionIdConfig::Header { name } => Arc::new(HeaderExtractor::new(
            HeaderName::try_from(name.as_str())
                .wrap_err_with(|| format!("Invalid session header name '{name}'"))?,
        )),
        SessionIdConfig::Cookie { name } => Arc::new(CookieExtractor::new(name.clone())),
    })
}

fn rule_key(config: &RuleConfig) -> Result<RuleKey> {
    let host = config.host.clone().filter(|h| h != "*");
    let method = config
        .method
        .as_deref()
        .map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()))
        .transpose()
        .wrap_err("Invalid method")?;
    let path = match (&config.path, &config.path_prefix) {
        (Some(pattern), _) => PathMatcher::Regex(
            Regex::new(&format!("^(?:{pattern})$"))
                .wrap_err_with(|| format!("Invalid path pattern '{pattern}'"))?,
        ),
        (None, Some(prefix)) => PathMatcher::Prefix(prefix.clone()),
        (None, None) => PathMatcher::Any,
    };
    Ok(RuleKey {
        host,
        method,
        path,
        port: config.port,
    })
}

fn build_rule(config: &RuleConfig, server: &ServerConfig, balancers: &BalancerRegistry) -> Result<Rule> {
    let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();
    if config.access_log {
        interceptors.push(Arc::new(AccessLogInterceptor::new()));
    }

    if let Some(name) = &config.balancer {
        let balancer = balancers
            .get(name)
            .ok_or_else(|| eyre!("unknown balancer '{name}'"))?;
        let cluster = config
            .cluster
            .clone()
            .unwrap_or_else(|| balancer.default_cluster_name());
        let mut interceptor = LoadBalancingInterceptor::new(balancer, cluster)
            .with_production(server.production);
        if let Some(balancer_config) = server.balancer(name) {
            interceptor = interceptor.with_fail_over(balancer_config.fail_over);
            if let Some(detection) = &balancer_config.failure_detection {
                interceptor = interceptor.with_failure_detection(detection.clone());
            }
        }
        interceptors.push(Arc::new(interceptor));
    } else if config.forward_proxy {
        interceptors.push(Arc::new(DispatchingInterceptor::forward_proxy()));
    } else if let Some(target) = &config.target {
        interceptors.push(Arc::new(DispatchingInterceptor::new(target.clone())));
    }

    let chain = InterceptorChain::new(interceptors).with_production(server.production);
    let mut rule = Rule::new(&config.name, rule_key(config)?, chain)
        .with_adjust_host_header(config.adjust_host_header)
        .with_fail_over_on_5xx(config.fail_over_on_5xx);
    if let Some(target) = &config.target {
        rule = rule.with_target(target.clone());
    }
    if let Some(tls) = &config.tls {
        rule = rule.with_tls(tls_context(format!("rule:{}", config.name), tls)?);
    }
    Ok(rule)
}

fn build_cluster_manager_rule(
    config: &ClusterManagerConfig,
    server: &ServerConfig,
    balancers: &Arc<BalancerRegistry>,
) -> Result<Rule> {
    let interceptor = ClusterNotificationInterceptor::from_config(balancers.clone(), config)?
        .with_production(server.production);
    let chain = InterceptorChain::new(vec![
        Arc::new(AccessLogInterceptor::new()),
        Arc::new(interceptor),
    ])
    .with_production(server.production);
    let key = RuleKey {
        path: PathMatcher::Prefix(format!("{}/", config.path_prefix.trim_end_matches('/'))),
        ..Default::default()
    };
    Ok(Rule::new(CLUSTER_MANAGER_RULE, key, chain))
}
