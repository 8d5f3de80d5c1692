//! Outbound sockets and the HTTP/1 connections pooled on top of them.
use std::{
    fmt,
    io,
    net::IpAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, Request, Response, header};
use http_body_util::Full;
use hyper::{body::Incoming, client::conn::http1::SendRequest};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    sync::OwnedSemaphorePermit,
    task::JoinHandle,
};
use tokio_rustls::client::TlsStream;

use crate::metrics;

/// Idle connections are considered dead this long before the backend's
/// keep-alive timeout would close them.
pub const KEEP_ALIVE_SLIPPAGE: Duration = Duration::from_millis(400);

/// A forward proxy that connections are opened through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    /// Value of `Proxy-Authorization`, if the proxy needs credentials
    pub authorization: Option<String>,
}

/// Identity of a pooled connection. Connections are only reused for the
/// exact same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub local_addr: Option<IpAddr>,
    /// Id of the TLS context; `None` for plain connections
    pub tls: Option<String>,
    pub proxy: Option<ProxyEndpoint>,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_addr: None,
            tls: None,
            proxy: None,
        }
    }

    pub fn with_local_addr(mut self, local_addr: Option<IpAddr>) -> Self {
        self.local_addr = local_addr;
        self
    }

    pub fn with_tls(mut self, tls: Option<String>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyEndpoint>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Where the TCP connection actually goes.
    pub fn connect_target(&self) -> (&str, u16) {
        match &self.proxy {
            Some(proxy) => (&proxy.host, proxy.port),
            None => (&self.host, self.port),
        }
    }

    /// Plain requests through a proxy use absolute-form URIs; TLS targets
    /// are tunnelled and look direct.
    pub fn sends_absolute_form(&self) -> bool {
        self.proxy.is_some() && !self.is_tls()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.is_tls() { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}:{}", proxy.host, proxy.port)?;
        }
        Ok(())
    }
}

/// A connected socket, plain or TLS.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Keep-alive limits announced by a backend (`Keep-Alive: timeout=5, max=100`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepAlive {
    pub timeout: Option<Duration>,
    pub max: Option<u32>,
}

impl KeepAlive {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut keep_alive = KeepAlive::default();
        let Some(value) = headers
            .get("keep-alive")
            .and_then(|v| v.to_str().ok())
        else {
            return keep_alive;
        };
        for param in value.split(',') {
            let Some((name, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "timeout" => keep_alive.timeout = value.parse().ok().map(Duration::from_secs),
                "max" => keep_alive.max = value.parse().ok(),
                _ => {}
            }
        }
        keep_alive
    }
}

/// Whether a message asks for the connection to be closed afterwards.
pub fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// Headers that describe a single hop and are never forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Remove hop-by-hop headers, including those listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

/// An HTTP/1 connection owned by the pool or by exactly one in-flight call.
///
/// Dropping it closes the socket.
pub struct Connection {
    id: u64,
    key: PoolKey,
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
    keep_alive: Duration,
    max_exchanges: Option<u32>,
    served: u32,
    last_use: Instant,
    open: Arc<AtomicUsize>,
    _slot: Option<OwnedSemaphorePermit>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        key: PoolKey,
        sender: SendRequest<Full<Bytes>>,
        driver: JoinHandle<()>,
        keep_alive: Duration,
        open: Arc<AtomicUsize>,
        slot: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let count = open.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_open_connections(count);
        Self {
            id,
            key,
            sender,
            driver,
            keep_alive,
            max_exchanges: None,
            served: 0,
            last_use: Instant::now(),
            open,
            _slot: slot,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Exchanges completed on this connection.
    pub fn served(&self) -> u32 {
        self.served
    }

    /// Send one request and wait for the response head.
    pub async fn send(&mut self, request: Request<Full<Bytes>>) -> hyper::Result<Response<Incoming>> {
        self.sender.ready().await?;
        self.sender.send_request(request).await
    }

    /// Apply the backend's keep-alive announcement and count the exchange.
    pub fn complete_exchange(&mut self, response_headers: &HeaderMap) {
        let announced = KeepAlive::from_headers(response_headers);
        if let Some(timeout) = announced.timeout {
            self.keep_alive = timeout;
        }
        if announced.max.is_some() {
            self.max_exchanges = announced.max;
        }
        self.served += 1;
        self.last_use = Instant::now();
    }

    /// When the idle connection must no longer be handed out.
    pub fn death_time(&self) -> Instant {
        self.last_use + self.keep_alive.saturating_sub(KEEP_ALIVE_SLIPPAGE)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.death_time()
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_exchanges.is_some_and(|max| self.served >= max)
    }

    /// Usable for another exchange: socket open, limits not reached.
    pub fn is_reusable(&self, now: Instant) -> bool {
        !self.sender.is_closed() && !self.is_exhausted() && !self.is_expired(now)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
        let count = self.open.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics::set_open_connections(count);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("served", &self.served)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn keep_alive_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5, max=100"));
        let keep_alive = KeepAlive::from_headers(&headers);
        assert_eq!(keep_alive.timeout, Some(Duration::from_secs(5)));
        assert_eq!(keep_alive.max, Some(100));

        headers.insert("keep-alive", HeaderValue::from_static("max=x, other=1"));
        assert_eq!(KeepAlive::from_headers(&headers), KeepAlive::default());
    }

    #[test]
    fn connection_close_is_detected() {
        let mut headers = HeaderMap::new();
        assert!(!wants_close(&headers));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Close"));
        assert!(wants_close(&headers));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn pool_key_routes_through_proxy() {
        let proxy = ProxyEndpoint {
            host: "proxy".into(),
            port: 3128,
            authorization: None,
        };
        let plain = PoolKey::new("backend", 80).with_proxy(Some(proxy.clone()));
        assert_eq!(plain.connect_target(), ("proxy", 3128));
        assert!(plain.sends_absolute_form());

        let tls = PoolKey::new("backend", 443)
            .with_tls(Some("default".into()))
            .with_proxy(Some(proxy));
        assert!(!tls.sends_absolute_form());
        assert_eq!(tls.to_string(), "https://backend:443 via proxy:3128");
        assert_ne!(plain, tls);
    }
}
