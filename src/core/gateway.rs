//! Core gateway orchestration service.
//!
//! The `GatewayService` owns the rule registry and the outbound HTTP client.
//! For every exchange it:
//! * finds the most specific matching rule
//! * runs that rule's interceptor chain
//! * delivers the request, either to another rule (`internal:<name>`) or
//!   through the HTTP client
//!
//! Everything it needs is handed in at construction; there is no global
//! router to look up.
use std::sync::Arc;

use async_trait::async_trait;
use eyre::eyre;
use http::StatusCode;

use crate::{
    core::{
        chain::Dispatcher,
        destination::Destination,
        exchange::Exchange,
        interceptor::Outcome,
        problem::problem_response,
        rule::{Rule, RuleRegistry},
    },
    ports::http_client::HttpClient,
};

/// Property holding how many internal hops an exchange has taken.
pub const ROUTING_DEPTH_PROPERTY: &str = "switchyard.routing_depth";

/// Internal routing deeper than this is treated as a loop.
pub const MAX_ROUTING_DEPTH: usize = 10;

/// Central orchestrator for routing and delivery. Cheap to clone.
#[derive(Clone)]
pub struct GatewayService {
    rules: Arc<RuleRegistry>,
    http_client: Arc<dyn HttpClient>,
    production: bool,
}

impl GatewayService {
    pub fn new(rules: Arc<RuleRegistry>, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            rules,
            http_client,
            production: false,
        }
    }

    /// Hide error details in generated responses.
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    /// Most specific rule for the exchange's original host, method and path.
    pub fn find_rule(&self, exc: &Exchange) -> Option<Arc<Rule>> {
        self.rules.find(
            exc.original_host(),
            exc.request().method(),
            exc.original_uri().path(),
        )
    }

    /// Route and run an exchange. Without a matching rule a 404 is attached
    /// and `Return` is reported.
    pub async fn process(&self, exc: &mut Exchange) -> Outcome {
        let rule = match exc.rule().cloned().or_else(|| self.find_rule(exc)) {
            Some(rule) => rule,
            None => {
                tracing::debug!(
                    host = exc.original_host().unwrap_or("-"),
                    path = exc.original_uri().path(),
                    "no rule matches"
                );
                exc.set_response(problem_response(
                    StatusCode::NOT_FOUND,
                    "Not Found",
                    Some("No rule matches this request."),
                    self.production,
                ));
                return Outcome::Return;
            }
        };
        exc.set_rule(rule.clone());
        rule.chain().run(exc, self).await
    }

    async fn route_internally(&self, exc: &mut Exchange, name: &str) -> eyre::Result<Outcome> {
        let depth = exc
            .properties()
            .get::<usize>(ROUTING_DEPTH_PROPERTY)
            .copied()
            .unwrap_or(0);
        if depth >= MAX_ROUTING_DEPTH {
            return Err(eyre!(
                "internal routing exceeded {MAX_ROUTING_DEPTH} hops at rule '{name}'"
            ));
        }
        let rule = self
            .rules
            .by_name(name)
            .ok_or_else(|| eyre!("internal destination names unknown rule '{name}'"))?;

        tracing::debug!(rule = name, depth, "routing internally");
        exc.properties_mut().insert(ROUTING_DEPTH_PROPERTY, depth + 1);
        exc.destinations_mut().clear();
        exc.set_rule(rule.clone());
        Ok(rule.chain().run(exc, self).await)
    }
}

#[async_trait]
impl Dispatcher for GatewayService {
    async fn dispatch(&self, exc: &mut Exchange) -> eyre::Result<Outcome> {
        let internal = match exc.destinations().first() {
            Some(first) => match Destination::parse(first) {
                Ok(Destination::Internal(name)) => Some(name),
                _ => None,
            },
            None => None,
        };
        match internal {
            Some(name) => self.route_internally(exc, &name).await,
            None => {
                self.http_client.call(exc).await?;
                Ok(Outcome::Continue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http::{Method, Request, Response};

    use super::*;
    use crate::{
        core::{
            chain::InterceptorChain,
            interceptor::Interceptor,
            rule::{PathMatcher, RuleKey},
        },
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    #[derive(Default)]
    struct EchoClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for EchoClient {
        async fn call(&self, exc: &mut Exchange) -> HttpClientResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let destination = exc
                .destinations()
                .first()
                .cloned()
                .ok_or(HttpClientError::EmptyDestinations)?;
            exc.set_response(
                Response::builder()
                    .status(200)
                    .body(Bytes::from(destination))
                    .unwrap(),
            );
            Ok(())
        }
    }

    struct SetDestination(&'static str);

    #[async_trait]
    impl Interceptor for SetDestination {
        fn name(&self) -> &str {
            "set-destination"
        }

        async fn handle_request(&self, exc: &mut Exchange) -> eyre::Result<Outcome> {
            exc.set_destinations(vec![self.0.to_string()]);
            Ok(Outcome::Continue)
        }
    }

    fn rule(name: &str, prefix: &str, destination: &'static str) -> Rule {
        let key = RuleKey {
            path: PathMatcher::Prefix(prefix.to_string()),
            ..Default::default()
        };
        Rule::new(
            name,
            key,
            InterceptorChain::new(vec![Arc::new(SetDestination(destination))]),
        )
    }

    fn exchange(path: &str) -> Exchange {
        Exchange::new(
            Request::builder()
                .method(Method::GET)
                .uri(path)
                .header("host", "gateway.local")
                .body(Bytes::new())
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn routes_to_most_specific_rule() {
        let client = Arc::new(EchoClient::default());
        let rules = RuleRegistry::new(vec![
            rule("root", "/", "http://root:1/"),
            rule("api", "/api", "http://api:2/"),
        ]);
        let gateway = GatewayService::new(Arc::new(rules), client.clone());

        let mut exc = exchange("/api/users");
        assert_eq!(gateway.process(&mut exc).await, Outcome::Continue);
        assert_eq!(exc.rule().unwrap().name(), "api");
        assert_eq!(exc.response().unwrap().body().as_ref(), b"http://api:2/");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_rule_is_404() {
        let gateway = GatewayService::new(
            Arc::new(RuleRegistry::new(vec![rule("api", "/api", "http://api:2/")])),
            Arc::new(EchoClient::default()),
        );
        let mut exc = exchange("/other");
        assert_eq!(gateway.process(&mut exc).await, Outcome::Return);
        assert_eq!(exc.response().unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn internal_destinations_run_the_named_rule() {
        let client = Arc::new(EchoClient::default());
        let rules = RuleRegistry::new(vec![
            rule("front", "/", "internal:back"),
            rule("back", "/never-matched", "http://back:3/"),
        ]);
        let gateway = GatewayService::new(Arc::new(rules), client.clone());

        let mut exc = exchange("/x");
        gateway.process(&mut exc).await;
        assert_eq!(exc.response().unwrap().body().as_ref(), b"http://back:3/");
        assert_eq!(exc.rule().unwrap().name(), "back");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn routing_loops_are_cut_off() {
        let client = Arc::new(EchoClient::default());
        let rules = RuleRegistry::new(vec![rule("loop", "/", "internal:loop")]);
        let gateway = GatewayService::new(Arc::new(rules), client.clone());

        let mut exc = exchange("/x");
        gateway.process(&mut exc).await;
        assert!(exc.is_aborted());
        assert_eq!(
            exc.response().unwrap().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    struct Refuse;

    #[async_trait]
    impl Interceptor for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        async fn handle_request(&self, exc: &mut Exchange) -> eyre::Result<Outcome> {
            exc.set_response(
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(Bytes::from_static(b"no nodes"))
                    .unwrap(),
            );
            Ok(Outcome::Abort)
        }
    }

    #[tokio::test]
    async fn aborts_of_internal_rules_reach_the_outer_chain() {
        let client = Arc::new(EchoClient::default());
        let back = Rule::new(
            "back",
            RuleKey {
                path: PathMatcher::Prefix("/never-matched".to_string()),
                ..Default::default()
            },
            InterceptorChain::new(vec![Arc::new(Refuse)]),
        );
        let rules = RuleRegistry::new(vec![rule("front", "/", "internal:back"), back]);
        let gateway = GatewayService::new(Arc::new(rules), client.clone());

        let mut exc = exchange("/x");
        assert_eq!(gateway.process(&mut exc).await, Outcome::Abort);
        assert!(exc.is_aborted());
        let response = exc.response().unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body().as_ref(), b"no nodes");
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
