use async_trait::async_trait;
use eyre::eyre;
use http::{Method, header};

use crate::core::{
    destination::{Destination, combine_with_request},
    exchange::Exchange,
    interceptor::{Interceptor, Outcome},
};

/// Where a rule without a load balancer sends its requests.
#[derive(Debug, Clone)]
enum DispatchMode {
    Target(String),
    ForwardProxy,
}

/// Fills the exchange's destinations from the rule's target, or from the
/// request itself for forward proxy rules.
#[derive(Debug, Clone)]
pub struct DispatchingInterceptor {
    mode: DispatchMode,
}

impl DispatchingInterceptor {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            mode: DispatchMode::Target(target.into()),
        }
    }

    pub fn forward_proxy() -> Self {
        Self {
            mode: DispatchMode::ForwardProxy,
        }
    }

    fn target_destination(target: &str, exc: &Exchange) -> eyre::Result<String> {
        match Destination::parse(target)? {
            Destination::Absolute(_) => {
                let path_and_query = exc
                    .request()
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                Ok(combine_with_request(target, path_and_query))
            }
            Destination::Authority { .. } | Destination::Internal(_) => Ok(target.to_string()),
        }
    }

    fn proxied_destination(exc: &Exchange) -> eyre::Result<String> {
        let request = exc.request();
        let uri = request.uri();
        if request.method() == Method::CONNECT {
            return uri
                .authority()
                .map(|authority| authority.to_string())
                .ok_or_else(|| eyre!("CONNECT request without authority"));
        }
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Ok(uri.to_string());
        }
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| eyre!("proxy request without absolute URI or Host header"))?;
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        Ok(format!("http://{host}{path_and_query}"))
    }
}

#[async_trait]
impl Interceptor for DispatchingInterceptor {
    fn name(&self) -> &str {
        "dispatching"
    }

    async fn handle_request(&self, exc: &mut Exchange) -> eyre::Result<Outcome> {
        let destination = match &self.mode {
            DispatchMode::Target(target) => Self::target_destination(target, exc)?,
            DispatchMode::ForwardProxy => Self::proxied_destination(exc)?,
        };
        tracing::trace!(%destination, "dispatching");
        exc.set_destinations(vec![destination]);
        Ok(Outcome::Continue)
    }
}
