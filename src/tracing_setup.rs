use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human readable, multi-line
    Pretty,
}

/// Initialize structured logging. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(format: LogFormat, default_level: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .wrap_err_with(|| format!("Invalid log level: {default_level}"))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let registry = Registry::default().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(fmt_layer.json().with_current_span(false).with_span_list(true))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt_layer.pretty().with_ansi(true)).try_init(),
    }
    .wrap_err("Failed to install tracing subscriber")?;

    tracing::debug!(?format, "Switchyard logging initialized");
    Ok(())
}

/// Create a request-scoped tracing span
pub fn create_request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        rule = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a span around one logical backend call (all attempts)
pub fn create_backend_span(method: &str, destinations: usize) -> tracing::Span {
    tracing::debug_span!(
        "backend_call",
        http.method = method,
        destinations,
        attempts = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
    )
}
