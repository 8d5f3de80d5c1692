//! Access logging and request metrics, emitted once the response is known.
use async_trait::async_trait;
use http::{HeaderMap, header};

use crate::{
    core::{
        exchange::Exchange,
        interceptor::{Interceptor, Outcome},
    },
    metrics,
};

/// Headers whose values never appear in logs.
const SENSITIVE_HEADERS: [&str; 4] = [
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
];

const MASK: &str = "***";

/// Header name/value pairs safe for logging.
pub fn masked_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                MASK.to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}

/// Logs one line per exchange in the response phase and records the
/// inbound request metrics. Runs for generated error responses too.
#[derive(Debug, Default)]
pub struct AccessLogInterceptor {
    log_headers: bool,
}

impl AccessLogInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include (masked) request headers in the log line.
    pub fn with_headers(mut self, log_headers: bool) -> Self {
        self.log_headers = log_headers;
        self
    }
}

#[async_trait]
impl Interceptor for AccessLogInterceptor {
    fn name(&self) -> &str {
        "access-log"
    }

    async fn handle_response(&self, exc: &mut Exchange) -> eyre::Result<Outcome> {
        let rule = exc.rule().map(|r| r.name().to_string()).unwrap_or_default();
        let method = exc.request().method().as_str().to_string();
        let status = exc.response().map(|r| r.status().as_u16()).unwrap_or(0);
        let elapsed = exc.elapsed();

        metrics::increment_request_total(&rule, &method, status);
        metrics::record_request_duration(&rule, &method, elapsed);

        let request = exc.request();
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        let remote = exc
            .inbound()
            .remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "-".to_string());
        let destination = exc.destinations().first().map(String::as_str).unwrap_or("-");
        let backend_ms = exc.backend_latency().map(|d| d.as_millis() as u64);

        if self.log_headers {
            tracing::info!(
                target: "switchyard::access",
                %remote,
                %method,
                uri = %exc.original_uri(),
                host = exc.original_host().unwrap_or("-"),
                %rule,
                %destination,
                status,
                attempts = exc.attempts().len(),
                duration_ms = elapsed.as_millis() as u64,
                backend_ms,
                user_agent,
                headers = ?masked_headers(request.headers()),
                aborted = exc.is_aborted(),
                "request completed"
            );
        } else {
            tracing::info!(
                target: "switchyard::access",
                %remote,
                %method,
                uri = %exc.original_uri(),
                host = exc.original_host().unwrap_or("-"),
                %rule,
                %destination,
                status,
                attempts = exc.attempts().len(),
                duration_ms = elapsed.as_millis() as u64,
                backend_ms,
                user_agent,
                aborted = exc.is_aborted(),
                "request completed"
            );
        }
        Ok(Outcome::Continue)
    }
}
