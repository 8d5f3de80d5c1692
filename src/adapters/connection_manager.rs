//! Pool of reusable outbound connections.
//!
//! `acquire` hands out an idle connection for the exact [`PoolKey`] or opens
//! a new one; `release` either parks it again or closes it. A connection is
//! never shared by two calls at once. `shutdown_all` closes everything,
//! including connections currently lent out, and is safe to call while other
//! tasks acquire and release.
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use hyper_util::rt::TokioIo;
use once_cell::sync::OnceCell;
use rustls::{ClientConfig, pki_types::ServerName};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream, lookup_host},
    sync::Semaphore,
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{
        connection::{Connection, PoolKey, Stream},
        tls,
    },
    config::HttpClientConfig,
    ports::http_client::{HttpClientError, HttpClientResult},
};

/// Largest CONNECT response head accepted from a proxy.
const MAX_PROXY_RESPONSE_HEAD: usize = 16 * 1024;

/// Pool limits and timeouts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub connect_timeout: Duration,
    /// Idle lifetime unless the backend announces its own
    pub keep_alive_timeout: Duration,
    /// Upper bound on open connections; unbounded when `None`
    pub max_connections: Option<usize>,
}

impl From<&HttpClientConfig> for PoolConfig {
    fn from(config: &HttpClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            keep_alive_timeout: config.keep_alive_timeout,
            max_connections: config.max_connections,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(4),
            max_connections: None,
        }
    }
}

pub struct ConnectionManager {
    config: PoolConfig,
    idle: Mutex<HashMap<PoolKey, Vec<Connection>>>,
    limiter: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    open: Arc<AtomicUsize>,
    next_id: AtomicU64,
    default_tls: OnceCell<Arc<ClientConfig>>,
}

impl ConnectionManager {
    pub fn new(config: PoolConfig) -> Self {
        let limiter = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
            limiter,
            shutdown: CancellationToken::new(),
            open: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            default_tls: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Cancelled once [`ConnectionManager::shutdown_all`] ran.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Connections currently open, idle or lent out.
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// An idle connection for `key`, or a freshly opened one.
    ///
    /// `tls` overrides the platform-root TLS configuration used for TLS keys.
    pub async fn acquire(
        &self,
        key: &PoolKey,
        tls: Option<Arc<ClientConfig>>,
    ) -> HttpClientResult<Connection> {
        if self.is_shut_down() {
            return Err(HttpClientError::PoolShutdown);
        }
        if let Some(connection) = self.take_idle(key) {
            tracing::trace!(connection = connection.id(), %key, "reusing pooled connection");
            return Ok(connection);
        }

        let slot = match &self.limiter {
            Some(limiter) => {
                let permit = timeout(self.config.connect_timeout, limiter.clone().acquire_owned())
                    .await
                    .map_err(|_| HttpClientError::PoolExhausted(key.to_string()))?
                    .map_err(|_| HttpClientError::PoolShutdown)?;
                Some(permit)
            }
            None => None,
        };

        let stream = self.connect(key, tls).await?;
        let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| HttpClientError::Protocol {
                target: key.to_string(),
                message: e.to_string(),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let driver = tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        tracing::debug!(connection = id, error = %e, "connection closed with error");
                    }
                }
                _ = token.cancelled() => {
                    tracing::trace!(connection = id, "connection closed by shutdown");
                }
            }
        });

        tracing::debug!(connection = id, %key, "opened connection");
        Ok(Connection::new(
            id,
            key.clone(),
            sender,
            driver,
            self.config.keep_alive_timeout,
            self.open.clone(),
            slot,
        ))
    }

    /// Return a connection after use. Non-reusable connections are closed.
    pub fn release(&self, connection: Connection, reusable: bool) {
        if !reusable || self.is_shut_down() || !connection.is_reusable(Instant::now()) {
            tracing::trace!(connection = connection.id(), "closing connection");
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.entry(connection.key().clone())
            .or_default()
            .push(connection);
    }

    fn take_idle(&self, key: &PoolKey) -> Option<Connection> {
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let parked = idle.get_mut(key)?;
        let mut found = None;
        while let Some(connection) = parked.pop() {
            if connection.is_reusable(now) {
                found = Some(connection);
                break;
            }
        }
        if parked.is_empty() {
            idle.remove(key);
        }
        found
    }

    /// Close every idle connection past its death time. Returns how many
    /// were closed.
    pub fn close_expired(&self) -> usize {
        let now = Instant::now();
        let mut closed = 0;
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.retain(|_, parked| {
            let before = parked.len();
            parked.retain(|c| c.is_reusable(now));
            closed += before - parked.len();
            !parked.is_empty()
        });
        closed
    }

    /// Sweep expired connections every two keep-alive periods until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let period = (self.config.keep_alive_timeout * 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = manager.close_expired();
                        if closed > 0 {
                            tracing::debug!(closed, "closed expired connections");
                        }
                    }
                }
            }
        })
    }

    /// Close every pooled and in-flight connection. Later `acquire` calls
    /// fail with [`HttpClientError::PoolShutdown`].
    pub fn shutdown_all(&self) {
        self.shutdown.cancel();
        let drained: Vec<Connection> = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .flat_map(|(_, parked)| parked)
            .collect();
        tracing::info!(idle = drained.len(), "connection manager shut down");
        if let Some(limiter) = &self.limiter {
            limiter.close();
        }
    }

    /// Raw stream to the key's target for a CONNECT tunnel. Never pooled;
    /// through a proxy a tunnel is requested from the proxy first.
    pub async fn open_tunnel(&self, key: &PoolKey) -> HttpClientResult<TcpStream> {
        if self.is_shut_down() {
            return Err(HttpClientError::PoolShutdown);
        }
        let (host, port) = key.connect_target();
        let tcp = self.connect_tcp(host, port, key).await?;
        match &key.proxy {
            Some(proxy) => {
                self.open_proxy_tunnel(tcp, key, proxy.authorization.as_deref())
                    .await
            }
            None => Ok(tcp),
        }
    }

    async fn connect(&self, key: &PoolKey, tls: Option<Arc<ClientConfig>>) -> HttpClientResult<Stream> {
        let (host, port) = key.connect_target();
        let tcp = self.connect_tcp(host, port, key).await?;

        let tcp = match &key.proxy {
            Some(proxy) if key.is_tls() => {
                self.open_proxy_tunnel(tcp, key, proxy.authorization.as_deref())
                    .await?
            }
            _ => tcp,
        };

        if !key.is_tls() {
            return Ok(Stream::Plain(tcp));
        }

        let config = match tls {
            Some(config) => config,
            None => self.default_tls()?,
        };
        let server_name = ServerName::try_from(key.host.clone()).map_err(|e| HttpClientError::Tls {
            target: key.to_string(),
            message: e.to_string(),
        })?;
        let handshake = TlsConnector::from(config).connect(server_name, tcp);
        let stream = timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| HttpClientError::Timeout {
                target: key.to_string(),
                after: self.config.connect_timeout,
            })?
            .map_err(|e| HttpClientError::Tls {
                target: key.to_string(),
                message: e.to_string(),
            })?;
        Ok(Stream::Tls(Box::new(stream)))
    }

    fn default_tls(&self) -> HttpClientResult<Arc<ClientConfig>> {
        self.default_tls
            .get_or_try_init(|| tls::client_config(None, true))
            .cloned()
            .map_err(|e| HttpClientError::Tls {
                target: "default TLS context".to_string(),
                message: format!("{e:#}"),
            })
    }

    async fn connect_tcp(&self, host: &str, port: u16, key: &PoolKey) -> HttpClientResult<TcpStream> {
        let target = format!("{host}:{port}");
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|_| HttpClientError::UnknownHost(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(HttpClientError::UnknownHost(host.to_string()));
        }

        let mut last_error = None;
        for addr in addrs {
            if key.local_addr.is_some_and(|local| local.is_ipv4() != addr.is_ipv4()) {
                continue;
            }
            match timeout(self.config.connect_timeout, self.connect_addr(addr, key)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Ok(Err(e)) => last_error = Some(classify_io(e, &target)),
                Err(_) => {
                    last_error = Some(HttpClientError::Timeout {
                        target: target.clone(),
                        after: self.config.connect_timeout,
                    })
                }
            }
        }
        Err(last_error.unwrap_or(HttpClientError::UnknownHost(host.to_string())))
    }

    async fn connect_addr(&self, addr: SocketAddr, key: &PoolKey) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = key.local_addr {
            socket.bind(SocketAddr::new(local, 0))?;
        }
        socket.connect(addr).await
    }

    /// Ask an HTTP proxy for a tunnel to the key's target.
    async fn open_proxy_tunnel(
        &self,
        mut tcp: TcpStream,
        key: &PoolKey,
        authorization: Option<&str>,
    ) -> HttpClientResult<TcpStream> {
        let authority = format!("{}:{}", key.host, key.port);
        let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(authorization) = authorization {
            head.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
        }
        head.push_str("\r\n");

        let io_error = |e: io::Error| classify_io(e, &authority);
        tcp.write_all(head.as_bytes()).await.map_err(io_error)?;

        let mut response = Vec::with_capacity(256);
        let mut buf = [0u8; 512];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            if response.len() > MAX_PROXY_RESPONSE_HEAD {
                return Err(HttpClientError::Protocol {
                    target: key.to_string(),
                    message: "proxy response head too large".to_string(),
                });
            }
            let read = timeout(self.config.connect_timeout, tcp.read(&mut buf))
                .await
                .map_err(|_| HttpClientError::Timeout {
                    target: key.to_string(),
                    after: self.config.connect_timeout,
                })?
                .map_err(io_error)?;
            if read == 0 {
                return Err(HttpClientError::TruncatedStatusLine(key.to_string()));
            }
            response.extend_from_slice(&buf[..read]);
        }

        let status_line = String::from_utf8_lossy(&response);
        let status = status_line
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok());
        match status {
            Some(code) if (200..300).contains(&code) => Ok(tcp),
            Some(code) => Err(HttpClientError::Protocol {
                target: key.to_string(),
                message: format!("proxy refused tunnel with status {code}"),
            }),
            None => Err(HttpClientError::TruncatedStatusLine(key.to_string())),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("open", &self.open_count())
            .field("idle", &self.idle_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Map a socket error to the delivery error taxonomy.
pub fn classify_io(error: io::Error, target: &str) -> HttpClientError {
    let target = target.to_string();
    match error.kind() {
        io::ErrorKind::ConnectionRefused => HttpClientError::ConnectionRefused(target),
        io::ErrorKind::ConnectionReset => HttpClientError::ConnectionReset(target),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
            HttpClientError::ConnectionAborted(target)
        }
        io::ErrorKind::UnexpectedEof => HttpClientError::TruncatedStatusLine(target),
        _ => HttpClientError::Io {
            target,
            source: error,
        },
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{Request, Response};
    use http_body_util::Full;
    use hyper::{server::conn::http1, service::service_fn};
    use tokio::net::TcpListener;

    use super::*;

    /// A keep-alive backend answering every request with "ok".
    async fn backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<hyper::body::Incoming>| async {
                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(b"ok"))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn key(addr: SocketAddr) -> PoolKey {
        PoolKey::new(addr.ip().to_string(), addr.port())
    }

    async fn roundtrip(connection: &mut Connection) {
        let request = Request::builder()
            .uri("/")
            .header("host", "test")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = connection.send(request).await.unwrap();
        let headers = response.headers().clone();
        http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap();
        connection.complete_exchange(&headers);
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let addr = backend().await;
        let manager = ConnectionManager::new(PoolConfig::default());

        let mut first = manager.acquire(&key(addr), None).await.unwrap();
        roundtrip(&mut first).await;
        let id = first.id();
        manager.release(first, true);
        assert_eq!(manager.idle_count(), 1);

        let mut second = manager.acquire(&key(addr), None).await.unwrap();
        assert_eq!(second.id(), id);
        roundtrip(&mut second).await;
        assert_eq!(second.served(), 2);
        manager.release(second, false);
        assert_eq!(manager.idle_count(), 0);
        assert_eq!(manager.open_count(), 0);
    }

    #[tokio::test]
    async fn expired_connections_are_swept() {
        let addr = backend().await;
        let manager = ConnectionManager::new(PoolConfig {
            keep_alive_timeout: Duration::from_millis(450),
            ..Default::default()
        });
        let mut connection = manager.acquire(&key(addr), None).await.unwrap();
        roundtrip(&mut connection).await;
        manager.release(connection, true);
        assert_eq!(manager.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.close_expired(), 1);
        assert_eq!(manager.idle_count(), 0);
    }

    #[tokio::test]
    async fn refused_connections_are_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = ConnectionManager::new(PoolConfig::default());
        let err = manager.acquire(&key(addr), None).await.unwrap_err();
        assert!(matches!(err, HttpClientError::ConnectionRefused(_)), "{err:?}");
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let addr = backend().await;
        let manager = ConnectionManager::new(PoolConfig::default());
        let mut connection = manager.acquire(&key(addr), None).await.unwrap();
        roundtrip(&mut connection).await;
        manager.release(connection, true);

        manager.shutdown_all();
        assert_eq!(manager.idle_count(), 0);
        assert_eq!(manager.open_count(), 0);
        assert!(matches!(
            manager.acquire(&key(addr), None).await,
            Err(HttpClientError::PoolShutdown)
        ));
    }

    #[tokio::test]
    async fn bounded_pool_fails_when_exhausted() {
        let addr = backend().await;
        let manager = ConnectionManager::new(PoolConfig {
            connect_timeout: Duration::from_millis(50),
            max_connections: Some(1),
            ..Default::default()
        });
        let held = manager.acquire(&key(addr), None).await.unwrap();
        let err = manager.acquire(&key(addr), None).await.unwrap_err();
        assert!(matches!(err, HttpClientError::PoolExhausted(_)));
        drop(held);
        assert!(manager.acquire(&key(addr), None).await.is_ok());
    }
}
