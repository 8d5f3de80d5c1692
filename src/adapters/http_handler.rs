use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Router,
    body::{Body as AxumBody, to_bytes},
    extract::{ConnectInfo, Request},
    http::StatusCode,
    response::Response,
};
use bytes::Bytes;
use hyper::Method;
use tracing::Instrument;

use crate::{
    core::{
        GatewayService,
        exchange::{Exchange, InboundConnection},
        problem::{internal_error, problem_response},
    },
    tracing_setup::create_request_span,
};

/// Default cap on buffered request bodies.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Inbound side of the gateway: turns an axum request into an [`Exchange`],
/// hands it to the [`GatewayService`] and writes back whatever response the
/// chain left on it.
#[derive(Clone)]
pub struct HttpHandler {
    gateway: GatewayService,
    max_body_bytes: usize,
    production: bool,
}

impl HttpHandler {
    pub fn new(gateway: GatewayService) -> Self {
        Self {
            gateway,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            production: false,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn gateway(&self) -> &GatewayService {
        &self.gateway
    }

    /// Router sending every request, whatever its path or method, through
    /// the gateway. Serve it with `into_make_service_with_connect_info`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let handler = self.clone();
                async move { handler.handle_request(req, Some(client_addr)).await }
            },
        )
    }

    /// Run one request through the gateway.
    pub async fn handle_request(&self, mut req: Request, client_addr: Option<SocketAddr>) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = create_request_span(req.method().as_str(), req.uri().path(), &request_id);
        let started = Instant::now();

        async move {
            let mut inbound = InboundConnection::new(client_addr);
            if req.method() == Method::CONNECT {
                inbound = inbound.with_upgrade(hyper::upgrade::on(&mut req));
            }

            let (parts, body) = req.into_parts();
            let body = match to_bytes(body, self.max_body_bytes).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::info!(error = %e, limit = self.max_body_bytes, "request body rejected");
                    return self.finish(
                        problem_response(
                            StatusCode::PAYLOAD_TOO_LARGE,
                            "Payload Too Large",
                            Some(&e.to_string()),
                            self.production,
                        ),
                        started,
                    );
                }
            };

            let mut exc = Exchange::new(hyper::Request::from_parts(parts, body)).with_inbound(inbound);
            let outcome = self.gateway.process(&mut exc).await;
            if let Some(rule) = exc.rule() {
                tracing::Span::current().record("rule", rule.name());
            }
            tracing::debug!(?outcome, aborted = exc.is_aborted(), "exchange finished");

            let response = exc
                .take_response()
                .unwrap_or_else(|| internal_error(Some("no response was produced"), self.production));
            self.finish(response, started)
        }
        .instrument(span)
        .await
    }

    fn finish(&self, response: hyper::Response<Bytes>, started: Instant) -> Response {
        let span = tracing::Span::current();
        span.record("http.status_code", response.status().as_u16());
        span.record("duration_ms", started.elapsed().as_millis() as u64);
        response.map(AxumBody::from)
    }
}
