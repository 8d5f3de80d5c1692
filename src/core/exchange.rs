//! The mutable record of one request/response cycle.
//!
//! An [`Exchange`] is created by the inbound handler once a request has been
//! fully read, travels through the interceptor chain of the matched rule and
//! is dropped after the response has been written back. Nothing in here does
//! I/O; adapters fill in the pieces they own (response, timings, attempts).
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Request, Response, StatusCode, Uri, header};
use hyper::upgrade::OnUpgrade;

use crate::core::rule::Rule;

/// Property key under which the chain stores an error raised by a handler.
pub const ERROR_PROPERTY: &str = "switchyard.error";

/// Uniform read access to requests and responses, used by session-id
/// extractors and logging.
pub trait Message {
    fn headers(&self) -> &HeaderMap;
    fn body(&self) -> &Bytes;

    /// The `Content-Type` header, if present and valid ASCII.
    fn content_type(&self) -> Option<&str> {
        self.headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    fn is_xml(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("xml"))
    }
}

impl Message for Request<Bytes> {
    fn headers(&self) -> &HeaderMap {
        Request::headers(self)
    }

    fn body(&self) -> &Bytes {
        Request::body(self)
    }
}

impl Message for Response<Bytes> {
    fn headers(&self) -> &HeaderMap {
        Response::headers(self)
    }

    fn body(&self) -> &Bytes {
        Response::body(self)
    }
}

/// Exchange-scoped key/value store used by interceptors to hand data to
/// each other.
#[derive(Default)]
pub struct Properties {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Properties {
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Typed lookup; `None` when the key is absent or holds another type.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    /// Remove and return a value. A value of a different type is left in place.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.values.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        self.values
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// The inbound side of an exchange: who sent it and, for `CONNECT`, the
/// pending upgrade of the client connection.
#[derive(Debug, Default)]
pub struct InboundConnection {
    pub remote_addr: Option<SocketAddr>,
    upgrade: Option<OnUpgrade>,
}

impl InboundConnection {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            upgrade: None,
        }
    }

    pub fn with_upgrade(mut self, upgrade: OnUpgrade) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// Take the upgrade handle; only the first caller gets it.
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }
}

/// Outcome of one delivery attempt against a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub destination: String,
    pub status: Option<StatusCode>,
    pub error: Option<String>,
}

/// One request/response cycle flowing through the pipeline.
pub struct Exchange {
    original_uri: Uri,
    original_host: Option<String>,
    request: Request<Bytes>,
    response: Option<Response<Bytes>>,
    destinations: Vec<String>,
    properties: Properties,
    rule: Option<Arc<Rule>>,
    inbound: InboundConnection,
    created_at: DateTime<Utc>,
    started: Instant,
    time_request_sent: Option<Instant>,
    time_response_received: Option<Instant>,
    attempts: Vec<Attempt>,
    aborted: bool,
}

impl Exchange {
    /// Wrap a fully read request. The URI and `Host` header are captured
    /// before any interceptor gets a chance to rewrite them.
    pub fn new(request: Request<Bytes>) -> Self {
        let original_uri = request.uri().clone();
        let original_host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| request.uri().authority().map(|a| a.to_string()));

        Self {
            original_uri,
            original_host,
            request,
            response: None,
            destinations: Vec::new(),
            properties: Properties::default(),
            rule: None,
            inbound: InboundConnection::default(),
            created_at: Utc::now(),
            started: Instant::now(),
            time_request_sent: None,
            time_response_received: None,
            attempts: Vec::new(),
            aborted: false,
        }
    }

    pub fn with_inbound(mut self, inbound: InboundConnection) -> Self {
        self.inbound = inbound;
        self
    }

    pub fn with_rule(mut self, rule: Arc<Rule>) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn original_uri(&self) -> &Uri {
        &self.original_uri
    }

    /// Host header as received, including any port.
    pub fn original_host(&self) -> Option<&str> {
        self.original_host.as_deref()
    }

    /// Host part of the original `Host` header.
    pub fn original_hostname(&self) -> Option<&str> {
        self.original_host.as_deref().map(|h| split_host_port(h).0)
    }

    /// Port of the original `Host` header, if it carried one.
    pub fn original_port(&self) -> Option<u16> {
        self.original_host
            .as_deref()
            .and_then(|h| split_host_port(h).1)
    }

    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Bytes> {
        &mut self.request
    }

    pub fn response(&self) -> Option<&Response<Bytes>> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response<Bytes>> {
        self.response.as_mut()
    }

    pub fn set_response(&mut self, response: Response<Bytes>) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<Response<Bytes>> {
        self.response.take()
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    pub fn destinations_mut(&mut self) -> &mut Vec<String> {
        &mut self.destinations
    }

    pub fn set_destinations(&mut self, destinations: Vec<String>) {
        self.destinations = destinations;
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// The error raised by a handler earlier in the chain, if any.
    pub fn error(&self) -> Option<&eyre::Report> {
        self.properties.get::<eyre::Report>(ERROR_PROPERTY)
    }

    pub fn rule(&self) -> Option<&Arc<Rule>> {
        self.rule.as_ref()
    }

    pub fn set_rule(&mut self, rule: Arc<Rule>) {
        self.rule = Some(rule);
    }

    pub fn inbound(&self) -> &InboundConnection {
        &self.inbound
    }

    pub fn inbound_mut(&mut self) -> &mut InboundConnection {
        &mut self.inbound
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time spent since the exchange was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn time_request_sent(&self) -> Option<Instant> {
        self.time_request_sent
    }

    pub fn time_response_received(&self) -> Option<Instant> {
        self.time_response_received
    }

    pub fn mark_request_sent(&mut self) {
        self.time_request_sent = Some(Instant::now());
    }

    pub fn mark_response_received(&mut self) {
        self.time_response_received = Some(Instant::now());
    }

    /// Backend round trip of the last delivery, when both marks are set.
    pub fn backend_latency(&self) -> Option<Duration> {
        match (self.time_request_sent, self.time_response_received) {
            (Some(sent), Some(received)) => Some(received.saturating_duration_since(sent)),
            _ => None,
        }
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn record_attempt(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("original_host", &self.original_host)
            .field("destinations", &self.destinations)
            .field("status", &self.response.as_ref().map(|r| r.status()))
            .field("rule", &self.rule.as_ref().map(|r| r.name()))
            .field("properties", &self.properties)
            .field("aborted", &self.aborted)
            .finish()
    }
}

/// Split `host[:port]`, keeping bracketed IPv6 literals intact.
pub fn split_host_port(value: &str) -> (&str, Option<u16>) {
    if let Some(rest) = value.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &value[..end + 2];
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (value, None);
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (value, None),
        },
        _ => (value, None),
    }
}
