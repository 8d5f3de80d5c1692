//! Admin endpoint changing node states: `<prefix>/up`, `<prefix>/down` and
//! `<prefix>/takeout`, parameters in the query string.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use eyre::WrapErr;
use http::{Response, StatusCode};

use crate::{
    config::ClusterManagerConfig,
    core::{
        balancer::{
            BalancerError, BalancerRegistry, CommandKind,
            command::{CommandCipher, CommandSigner, CommandVerifier},
        },
        exchange::Exchange,
        interceptor::{Interceptor, Outcome},
        problem::problem_response,
    },
    metrics,
};

pub const DEFAULT_PATH_PREFIX: &str = "/clustermanager";

pub struct ClusterNotificationInterceptor {
    registry: Arc<BalancerRegistry>,
    path_prefix: String,
    verifier: CommandVerifier,
    production: bool,
}

impl ClusterNotificationInterceptor {
    pub fn new(registry: Arc<BalancerRegistry>) -> Self {
        Self {
            registry,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            verifier: CommandVerifier::new(),
            production: false,
        }
    }

    /// Build from the cluster manager section, wiring key, secret and timeout.
    pub fn from_config(registry: Arc<BalancerRegistry>, config: &ClusterManagerConfig) -> eyre::Result<Self> {
        let mut verifier = CommandVerifier::new()
            .require_encryption(config.validate_signature)
            .with_timeout(config.timeout);
        if let Some(key) = &config.key_hex {
            let cipher = CommandCipher::from_hex(key).wrap_err("Invalid cluster manager key")?;
            verifier = verifier.with_cipher(cipher);
        }
        if let Some(secret) = &config.hmac_secret {
            let signer = CommandSigner::new(secret).wrap_err("Invalid cluster manager HMAC secret")?;
            verifier = verifier.with_signer(signer);
        }
        Ok(Self::new(registry)
            .with_path_prefix(config.path_prefix.clone())
            .with_verifier(verifier))
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_verifier(mut self, verifier: CommandVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    fn problem(&self, status: StatusCode, detail: &str) -> Response<Bytes> {
        problem_response(
            status,
            status.canonical_reason().unwrap_or("Error"),
            Some(detail),
            self.production,
        )
    }
}

#[async_trait]
impl Interceptor for ClusterNotificationInterceptor {
    fn name(&self) -> &str {
        "cluster-notification"
    }

    async fn handle_request(&self, exc: &mut Exchange) -> eyre::Result<Outcome> {
        let uri = exc.request().uri().clone();
        let Some(command) = uri
            .path()
            .strip_prefix(self.path_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Ok(Outcome::Continue);
        };

        let kind = match command.parse::<CommandKind>() {
            Ok(kind) => kind,
            Err(error) => {
                exc.set_response(self.problem(StatusCode::NOT_FOUND, &error.to_string()));
                return Ok(Outcome::Return);
            }
        };

        let command = match self.verifier.verify(kind, uri.query().unwrap_or("")) {
            Ok(command) => command,
            Err(error) => {
                tracing::warn!(command = %kind, %error, "rejected cluster command");
                metrics::increment_cluster_command(kind.as_str(), "rejected");
                exc.set_response(self.problem(error.status_code(), &error.to_string()));
                return Ok(Outcome::Return);
            }
        };

        match self.registry.apply(&command) {
            Ok(previous) => {
                tracing::info!(
                    command = %kind,
                    balancer = %command.balancer,
                    cluster = %command.cluster,
                    node = %format!("{}:{}", command.host, command.port),
                    previous = ?previous,
                    "applied cluster command"
                );
                metrics::increment_cluster_command(kind.as_str(), "applied");
                let mut response = Response::new(Bytes::new());
                *response.status_mut() = StatusCode::NO_CONTENT;
                exc.set_response(response);
            }
            Err(error @ BalancerError::UnknownBalancer(_)) => {
                tracing::warn!(command = %kind, %error, "rejected cluster command");
                metrics::increment_cluster_command(kind.as_str(), "rejected");
                exc.set_response(self.problem(StatusCode::NOT_FOUND, &error.to_string()));
            }
            Err(error) => return Err(error).wrap_err("Failed to apply cluster command"),
        }
        Ok(Outcome::Return)
    }
}

impl std::fmt::Debug for ClusterNotificationInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNotificationInterceptor")
            .field("path_prefix", &self.path_prefix)
            .field("verifier", &self.verifier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use http::Request;

    use super::*;
    use crate::core::balancer::{
        Balancer, ClusterCommand, NodeStatus,
        command::CommandCipher,
    };

    const KEY: &str = "000102030405060708090a0b0c0d0e0f";

    fn registry() -> Arc<BalancerRegistry> {
        let registry = BalancerRegistry::new();
        registry.insert(Balancer::new("Default"));
        Arc::new(registry)
    }

    fn exchange(uri: &str) -> Exchange {
        Exchange::new(Request::builder().uri(uri).body(Bytes::new()).unwrap())
    }

    async fn run(interceptor: &ClusterNotificationInterceptor, uri: &str) -> (Outcome, StatusCode) {
        let mut exc = exchange(uri);
        let outcome = interceptor.handle_request(&mut exc).await.unwrap();
        let status = exc.response().map(|r| r.status()).unwrap_or(StatusCode::OK);
        (outcome, status)
    }

    fn status_of(registry: &BalancerRegistry, host: &str, port: u16) -> Option<NodeStatus> {
        registry
            .get("Default")?
            .cluster("Default")?
            .find_node(host, port)
            .map(|n| n.status())
    }

    #[tokio::test]
    async fn plain_commands_change_node_state() {
        let registry = registry();
        let interceptor = ClusterNotificationInterceptor::new(registry.clone());

        let (outcome, status) = run(&interceptor, "/clustermanager/up?host=node1&port=3000").await;
        assert_eq!((outcome, status), (Outcome::Return, StatusCode::NO_CONTENT));
        assert_eq!(status_of(&registry, "node1", 3000), Some(NodeStatus::Up));

        run(&interceptor, "/clustermanager/takeout?host=node1&port=3000").await;
        assert_eq!(status_of(&registry, "node1", 3000), Some(NodeStatus::Takeout));

        run(&interceptor, "/clustermanager/down?host=node1&port=3000").await;
        assert_eq!(status_of(&registry, "node1", 3000), Some(NodeStatus::Down));
    }

    #[tokio::test]
    async fn other_paths_pass_through() {
        let interceptor = ClusterNotificationInterceptor::new(registry());
        let (outcome, _) = run(&interceptor, "/api/up?host=a&port=1").await;
        assert_eq!(outcome, Outcome::Continue);
        let (outcome, status) = run(&interceptor, "/clustermanager/restart?host=a").await;
        assert_eq!((outcome, status), (Outcome::Return, StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn malformed_and_unknown_balancer() {
        let interceptor = ClusterNotificationInterceptor::new(registry());
        let (_, status) = run(&interceptor, "/clustermanager/up?port=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (_, status) = run(&interceptor, "/clustermanager/up?host=a&port=1&balancer=nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn encryption_required_rejects_plain_commands() {
        let registry = registry();
        let interceptor = ClusterNotificationInterceptor::from_config(
            registry.clone(),
            &ClusterManagerConfig {
                validate_signature: true,
                key_hex: Some(KEY.to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let (_, status) = run(&interceptor, "/clustermanager/down?host=a&port=1").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(status_of(&registry, "a", 1), None);

        let cipher = CommandCipher::from_hex(KEY).unwrap();
        let command = ClusterCommand::new(CommandKind::Down, "a", 1).with_nonce("n-1");
        let data = cipher.encrypt(&command.to_query()).unwrap();
        let uri = format!("/clustermanager/down?data={}", urlencoding::encode(&data));

        let (_, status) = run(&interceptor, &uri).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(status_of(&registry, "a", 1), Some(NodeStatus::Down));

        let (_, status) = run(&interceptor, &uri).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
