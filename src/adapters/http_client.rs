use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri, Version, header};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    adapters::{
        connection::{PoolKey, ProxyEndpoint, strip_hop_by_hop, wants_close},
        connection_manager::{ConnectionManager, PoolConfig, classify_io},
        interceptors::access_log::masked_headers,
        tls::DEFAULT_TLS_CONTEXT,
    },
    config::HttpClientConfig,
    core::{
        destination::Destination,
        exchange::{Attempt, Exchange},
        rule::TlsContext,
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    tracing_setup::create_backend_span,
};

/// Where one attempt goes, resolved from a destination string.
#[derive(Debug, Clone)]
struct ResolvedTarget {
    /// Host for DNS and SNI
    host: String,
    /// Host as written in a `Host` header (IPv6 in brackets)
    host_header: String,
    port: u16,
    secure: bool,
    path_and_query: String,
}

impl ResolvedTarget {
    fn resolve(destination: &str, request_uri: &Uri) -> HttpClientResult<Self> {
        match Destination::parse(destination) {
            Ok(Destination::Absolute(target)) => Ok(Self {
                host: target.bare_host().to_string(),
                host_header: target.host.clone(),
                port: target.port,
                secure: target.secure,
                path_and_query: target.path_and_query().to_string(),
            }),
            Ok(Destination::Authority { host, port }) => Ok(Self {
                host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                host_header: host,
                port,
                secure: false,
                path_and_query: request_uri
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_else(|| "/".to_string()),
            }),
            _ => Err(HttpClientError::InvalidDestination(destination.to_string())),
        }
    }

    fn default_port(&self) -> u16 {
        if self.secure { 443 } else { 80 }
    }

    /// `Host` header value; the scheme's default port is omitted.
    fn host_value(&self) -> String {
        if self.port == self.default_port() {
            self.host_header.clone()
        } else {
            format!("{}:{}", self.host_header, self.port)
        }
    }

    fn absolute_uri(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}{}", self.host_value(), self.path_and_query)
    }

    fn label(&self) -> String {
        format!("{}:{}", self.host_header, self.port)
    }
}

/// Metrics label for a destination: `host:port`, never the path.
fn backend_label(destination: &str, request_uri: &Uri) -> String {
    ResolvedTarget::resolve(destination, request_uri)
        .map(|target| target.label())
        .unwrap_or_else(|_| "invalid".to_string())
}

/// Delivers exchanges over pooled HTTP/1.1 connections, cycling through the
/// exchange's destinations until one answers or the retries are used up.
///
/// Per attempt:
/// * resolve the destination and the pool key (bind address, TLS, proxy)
/// * rebuild the outbound request from the buffered inbound one
/// * send it and read the whole response within the read timeout
///
/// `CONNECT` requests open a tunnel instead and answer with a synthetic 200.
pub struct HttpClientAdapter {
    config: HttpClientConfig,
    pool: Arc<ConnectionManager>,
    proxy: Option<ProxyEndpoint>,
    authorization: Option<HeaderValue>,
}

impl HttpClientAdapter {
    pub fn new(config: HttpClientConfig, pool: Arc<ConnectionManager>) -> Self {
        let proxy = config.proxy.as_ref().map(|proxy| ProxyEndpoint {
            host: proxy.host.clone(),
            port: proxy.port,
            authorization: proxy
                .username
                .as_deref()
                .map(|user| basic_credentials(user, proxy.password.as_deref().unwrap_or(""))),
        });
        let authorization = config
            .authentication
            .as_ref()
            .and_then(|auth| {
                HeaderValue::from_str(&basic_credentials(&auth.username, &auth.password)).ok()
            });
        Self {
            config,
            pool,
            proxy,
            authorization,
        }
    }

    /// Client with its own connection pool sized from `config`.
    pub fn with_own_pool(config: HttpClientConfig) -> Self {
        let pool = Arc::new(ConnectionManager::new(PoolConfig::from(&config)));
        Self::new(config, pool)
    }

    pub fn pool(&self) -> &Arc<ConnectionManager> {
        &self.pool
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    fn pool_key(&self, target: &ResolvedTarget, tls: Option<&TlsContext>) -> PoolKey {
        let tls_id = target.secure.then(|| {
            tls.map(|context| context.id.clone())
                .unwrap_or_else(|| DEFAULT_TLS_CONTEXT.to_string())
        });
        PoolKey::new(target.host.clone(), target.port)
            .with_local_addr(self.config.local_addr)
            .with_tls(tls_id)
            .with_proxy(self.proxy.clone())
    }

    async fn deliver(&self, exc: &mut Exchange, destinations: Vec<String>) -> HttpClientResult<()> {
        let n = destinations.len();
        let max_attempts = self.config.max_retries.max(1) as usize;
        let tls = exc.rule().and_then(|rule| rule.tls().cloned());
        let adjust_host = exc.rule().is_none_or(|rule| rule.adjust_host_header());
        let fail_over_on_5xx = exc.rule().is_some_and(|rule| rule.fail_over_on_5xx());
        let mut last_error = None;

        for counter in 0..max_attempts {
            let destination = &destinations[counter % n];
            if counter > 0 {
                metrics::increment_backend_retries();
                if n == 1 {
                    tokio::time::sleep(self.config.time_between_tries).await;
                }
            }
            tracing::debug!(attempt = counter + 1, %destination, "try #{} to {}", counter + 1, destination);
            let backend = backend_label(destination, exc.request().uri());

            match self.attempt(exc, destination, tls.as_ref(), adjust_host).await {
                Ok(response) => {
                    let status = response.status();
                    exc.record_attempt(Attempt {
                        destination: destination.clone(),
                        status: Some(status),
                        error: None,
                    });
                    if fail_over_on_5xx && status.is_server_error() && counter + 1 < max_attempts {
                        metrics::increment_backend_attempt(&backend, "server_error");
                        tracing::info!(%destination, status = status.as_u16(), "server error, failing over");
                        continue;
                    }
                    metrics::increment_backend_attempt(&backend, "success");
                    tracing::Span::current().record("attempts", counter + 1);
                    tracing::Span::current().record("http.status_code", status.as_u16());
                    exc.set_response(response);
                    exc.set_destinations(vec![destination.clone()]);
                    return Ok(());
                }
                Err(error) => {
                    exc.record_attempt(Attempt {
                        destination: destination.clone(),
                        status: None,
                        error: Some(error.to_string()),
                    });
                    metrics::increment_backend_attempt(&backend, "error");
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    match &error {
                        HttpClientError::ConnectionRefused(_)
                        | HttpClientError::ConnectionReset(_)
                        | HttpClientError::ConnectionAborted(_)
                        | HttpClientError::TruncatedStatusLine(_) => {
                            tracing::info!(%destination, %error, "attempt failed");
                        }
                        HttpClientError::UnknownHost(host) => {
                            tracing::warn!(%destination, host, "unknown host");
                            if n < 2 {
                                return Err(error);
                            }
                        }
                        _ => {
                            let request = exc.request();
                            tracing::debug!(
                                %destination,
                                %error,
                                method = %request.method(),
                                uri = %request.uri(),
                                headers = ?masked_headers(request.headers()),
                                "attempt failed"
                            );
                        }
                    }
                    last_error = Some(error);
                }
            }
        }

        tracing::Span::current().record("attempts", max_attempts);
        Err(last_error.unwrap_or(HttpClientError::EmptyDestinations))
    }

    async fn attempt(
        &self,
        exc: &mut Exchange,
        destination: &str,
        tls: Option<&TlsContext>,
        adjust_host: bool,
    ) -> HttpClientResult<Response<Bytes>> {
        let target = ResolvedTarget::resolve(destination, exc.request().uri())?;
        let key = self.pool_key(&target, tls);
        let request = self.outbound_request(exc, &target, &key, adjust_host)?;
        let keep_alive = request.version() == Version::HTTP_11 && !wants_close(request.headers());
        let label = target.label();

        let mut connection = self
            .pool
            .acquire(&key, tls.map(|context| context.config.clone()))
            .await?;
        let _timer = metrics::BackendRequestTimer::new(&label, request.method().as_str());

        exc.mark_request_sent();
        let response = timeout(self.config.read_timeout, connection.send(request))
            .await
            .map_err(|_| HttpClientError::Timeout {
                target: label.clone(),
                after: self.config.read_timeout,
            })?
            .map_err(|e| classify_hyper(e, &label))?;

        let (mut parts, body) = response.into_parts();
        let body = timeout(self.config.read_timeout, body.collect())
            .await
            .map_err(|_| HttpClientError::Timeout {
                target: label.clone(),
                after: self.config.read_timeout,
            })?
            .map_err(|e| classify_hyper(e, &label))?
            .to_bytes();
        exc.mark_response_received();

        let reusable = keep_alive && parts.version == Version::HTTP_11 && !wants_close(&parts.headers);
        connection.complete_exchange(&parts.headers);
        self.pool.release(connection, reusable);

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::CONTENT_LENGTH);
        Ok(Response::from_parts(parts, body))
    }

    fn outbound_request(
        &self,
        exc: &Exchange,
        target: &ResolvedTarget,
        key: &PoolKey,
        adjust_host: bool,
    ) -> HttpClientResult<Request<Full<Bytes>>> {
        let source = exc.request();
        let uri = if key.sends_absolute_form() {
            target.absolute_uri()
        } else {
            target.path_and_query.clone()
        };
        let uri: Uri = uri
            .parse()
            .map_err(|_| HttpClientError::InvalidDestination(target.absolute_uri()))?;
        let version = if source.version() == Version::HTTP_10 {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };

        let mut headers = source.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        if adjust_host || !headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&target.host_value())
                .map_err(|_| HttpClientError::InvalidDestination(target.absolute_uri()))?;
            headers.insert(header::HOST, host);
        }
        if let Some(authorization) = &self.authorization {
            headers.insert(header::AUTHORIZATION, authorization.clone());
        }
        if key.sends_absolute_form() {
            if let Some(credentials) = key
                .proxy
                .as_ref()
                .and_then(|proxy| proxy.authorization.as_deref())
                .and_then(|value| HeaderValue::from_str(value).ok())
            {
                headers.insert(header::PROXY_AUTHORIZATION, credentials);
            }
        }
        if let Some(remote) = exc.inbound().remote_addr {
            let forwarded = match headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{existing}, {}", remote.ip()),
                None => remote.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert("x-forwarded-for", value);
            }
        }
        if version == Version::HTTP_10 {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        let mut request = Request::new(Full::new(source.body().clone()));
        *request.method_mut() = source.method().clone();
        *request.uri_mut() = uri;
        *request.version_mut() = version;
        *request.headers_mut() = headers;
        Ok(request)
    }

    /// Connect to the CONNECT target and splice it with the upgraded inbound
    /// connection once the synthetic 200 has been written.
    async fn open_tunnel(&self, exc: &mut Exchange, destination: &str) -> HttpClientResult<()> {
        let (host, port) = match Destination::parse(destination) {
            Ok(Destination::Authority { host, port }) => (host, port),
            Ok(Destination::Absolute(target)) => (target.bare_host().to_string(), target.port),
            _ => return Err(HttpClientError::InvalidDestination(destination.to_string())),
        };
        let upgrade = exc.inbound_mut().take_upgrade().ok_or_else(|| {
            HttpClientError::TunnelUnavailable("inbound connection cannot be upgraded".to_string())
        })?;

        let key = PoolKey::new(host, port)
            .with_local_addr(self.config.local_addr)
            .with_proxy(self.proxy.clone());
        exc.mark_request_sent();
        let mut backend = match self.pool.open_tunnel(&key).await {
            Ok(stream) => stream,
            Err(error) => {
                exc.record_attempt(Attempt {
                    destination: destination.to_string(),
                    status: None,
                    error: Some(error.to_string()),
                });
                return Err(error);
            }
        };
        exc.mark_response_received();

        let shutdown = self.pool.shutdown_token();
        let label = key.to_string();
        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::debug!(target = %label, error = %e, "inbound upgrade failed");
                    return;
                }
            };
            let mut client = TokioIo::new(upgraded);
            tokio::select! {
                result = tokio::io::copy_bidirectional(&mut client, &mut backend) => match result {
                    Ok((sent, received)) => {
                        tracing::debug!(target = %label, sent, received, "tunnel closed");
                    }
                    Err(e) => tracing::debug!(target = %label, error = %e, "tunnel closed with error"),
                },
                _ = shutdown.cancelled() => {
                    tracing::debug!(target = %label, "tunnel closed by shutdown");
                }
            }
        });

        exc.record_attempt(Attempt {
            destination: destination.to_string(),
            status: Some(StatusCode::OK),
            error: None,
        });
        exc.set_response(Response::new(Bytes::new()));
        exc.set_destinations(vec![destination.to_string()]);
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn call(&self, exc: &mut Exchange) -> HttpClientResult<()> {
        let destinations = exc.destinations().to_vec();
        let Some(first) = destinations.first().cloned() else {
            return Err(HttpClientError::EmptyDestinations);
        };
        if exc.request().method() == Method::CONNECT {
            return self.open_tunnel(exc, &first).await;
        }

        let span = create_backend_span(exc.request().method().as_str(), destinations.len());
        self.deliver(exc, destinations).instrument(span).await
    }
}

fn basic_credentials(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

/// Map a hyper error to the delivery error taxonomy.
fn classify_hyper(error: hyper::Error, target: &str) -> HttpClientError {
    if error.is_incomplete_message() {
        return HttpClientError::TruncatedStatusLine(target.to_string());
    }
    if error.is_timeout() {
        return HttpClientError::Timeout {
            target: target.to_string(),
            after: Duration::ZERO,
        };
    }
    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            return classify_io(io::Error::new(io_error.kind(), io_error.to_string()), target);
        }
        source = cause.source();
    }
    if error.is_canceled() || error.is_closed() {
        return HttpClientError::ConnectionAborted(target.to_string());
    }
    HttpClientError::Protocol {
        target: target.to_string(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::config::{AuthConfig, ProxyConfig};

    fn request(uri: &str) -> Exchange {
        Exchange::new(
            Request::builder()
                .uri(uri)
                .header(header::HOST, "gateway.local")
                .header(header::CONNECTION, "keep-alive")
                .header("x-forwarded-for", "10.0.0.1")
                .body(Bytes::from_static(b"payload"))
                .unwrap(),
        )
        .with_inbound(crate::core::exchange::InboundConnection::new(Some(
            "192.168.1.7:5000".parse::<SocketAddr>().unwrap(),
        )))
    }

    fn target(destination: &str) -> ResolvedTarget {
        ResolvedTarget::resolve(destination, &Uri::from_static("/orig?q=1")).unwrap()
    }

    #[test]
    fn resolves_destinations() {
        let t = target("https://api.example.com/v1");
        assert!(t.secure);
        assert_eq!(t.port, 443);
        assert_eq!(t.host_value(), "api.example.com");

        let t = target("backend:8080");
        assert_eq!(t.path_and_query, "/orig?q=1");
        assert_eq!(t.host_value(), "backend:8080");

        let t = target("http://[::1]:81/x");
        assert_eq!(t.host, "::1");
        assert_eq!(t.host_value(), "[::1]:81");

        assert!(matches!(
            ResolvedTarget::resolve("internal:auth", &Uri::from_static("/")),
            Err(HttpClientError::InvalidDestination(_))
        ));
    }

    #[test]
    fn backend_labels_drop_path_and_query() {
        let uri = Uri::from_static("/orig?q=1");
        let first = backend_label("http://node1:3000/api/items?page=1", &uri);
        let second = backend_label("http://node1:3000/api/orders/42?sort=desc", &uri);
        assert_eq!(first, "node1:3000");
        assert_eq!(first, second);
        assert_eq!(backend_label("https://api.example.com/v1", &uri), "api.example.com:443");
        assert_eq!(backend_label("backend:8080", &uri), "backend:8080");
        assert_eq!(backend_label("internal:auth", &uri), "invalid");
    }

    #[test]
    fn outbound_request_is_origin_form_with_adjusted_host() {
        let client = HttpClientAdapter::with_own_pool(HttpClientConfig::default());
        let exc = request("/orders?id=1");
        let t = target("http://backend:9000/orders?id=1");
        let key = client.pool_key(&t, None);
        let out = client.outbound_request(&exc, &t, &key, true).unwrap();

        assert_eq!(out.uri(), "/orders?id=1");
        assert_eq!(out.headers()[header::HOST], "backend:9000");
        assert!(!out.headers().contains_key(header::CONNECTION));
        assert_eq!(out.headers()["x-forwarded-for"], "10.0.0.1, 192.168.1.7");

        let kept = client.outbound_request(&exc, &t, &key, false).unwrap();
        assert_eq!(kept.headers()[header::HOST], "gateway.local");
    }

    #[test]
    fn proxied_requests_use_absolute_form_and_credentials() {
        let client = HttpClientAdapter::with_own_pool(HttpClientConfig {
            proxy: Some(ProxyConfig {
                host: "proxy".into(),
                port: 3128,
                username: Some("user".into()),
                password: Some("secret".into()),
            }),
            authentication: Some(AuthConfig {
                username: "svc".into(),
                password: "pw".into(),
            }),
            ..Default::default()
        });
        let exc = request("/a");
        let t = target("http://backend/a");
        let key = client.pool_key(&t, None);
        assert_eq!(key.connect_target(), ("proxy", 3128));

        let out = client.outbound_request(&exc, &t, &key, true).unwrap();
        assert_eq!(out.uri(), "http://backend/a");
        assert_eq!(
            out.headers()[header::PROXY_AUTHORIZATION],
            basic_credentials("user", "secret").as_str()
        );
        assert_eq!(
            out.headers()[header::AUTHORIZATION],
            basic_credentials("svc", "pw").as_str()
        );
    }

    #[test]
    fn tls_targets_get_a_tls_pool_key() {
        let client = HttpClientAdapter::with_own_pool(HttpClientConfig::default());
        let key = client.pool_key(&target("https://secure.example.com"), None);
        assert_eq!(key.tls.as_deref(), Some(DEFAULT_TLS_CONTEXT));
        let key = client.pool_key(&target("http://plain.example.com"), None);
        assert!(key.tls.is_none());
    }

    #[tokio::test]
    async fn empty_destinations_fail_immediately() {
        let client = HttpClientAdapter::with_own_pool(HttpClientConfig::default());
        let mut exc = request("/");
        assert!(matches!(
            client.call(&mut exc).await,
            Err(HttpClientError::EmptyDestinations)
        ));
        assert!(exc.attempts().is_empty());
    }

    #[tokio::test]
    async fn unknown_single_host_aborts_early() {
        let client = HttpClientAdapter::with_own_pool(HttpClientConfig {
            time_between_tries: Duration::from_millis(1),
            ..Default::default()
        });
        let mut exc = request("/");
        exc.set_destinations(vec!["http://does-not-exist.invalid:1/".to_string()]);
        let err = client.call(&mut exc).await.unwrap_err();
        assert!(matches!(err, HttpClientError::UnknownHost(_)), "{err:?}");
        assert_eq!(exc.attempts().len(), 1);
    }

    #[tokio::test]
    async fn connect_without_upgrade_is_rejected() {
        let client = HttpClientAdapter::with_own_pool(HttpClientConfig::default());
        let mut exc = Exchange::new(
            Request::builder()
                .method(Method::CONNECT)
                .uri("example.com:443")
                .body(Bytes::new())
                .unwrap(),
        );
        exc.set_destinations(vec!["example.com:443".to_string()]);
        assert!(matches!(
            client.call(&mut exc).await,
            Err(HttpClientError::TunnelUnavailable(_))
        ));
    }
}
