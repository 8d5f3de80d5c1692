//! Switchyard - an HTTP reverse proxy core.
//!
//! Switchyard routes every inbound request through a chain of interceptors
//! selected by a matching rule, then delivers it to a backend with pooled
//! connections and failover across candidate destinations. Rules can target a
//! fixed URL, another rule, or a load balancer that spreads exchanges over the
//! nodes of a cluster.
//!
//! # Features
//! - Interceptor chains with request and response phases (`Continue`, `Return`, `Abort`)
//! - HTTP/1.x client with keep-alive pooling, retries and failover, upstream proxies and TLS
//! - Round-robin, by-thread and weighted-random load balancing with sticky sessions
//! - Node states (`UP`, `DOWN`, `TAKEOUT`) changed through an authenticated admin endpoint
//! - Passive failure detection from backend answers
//! - Structured tracing via `tracing` and metrics through the `metrics` facade
//! - Graceful shutdown that drains requests and closes pooled connections
//!
//! # Quick Example
//! ```no_run
//! use switchyard::{bootstrap::build_gateway, config::loader::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("config.yaml").await?;
//! let gateway = build_gateway(&config)?;
//! let app = gateway.handler.clone().router();
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! routing, exchange handling and load balancing inside `core`, free of socket I/O.
//! `bootstrap` wires a validated configuration into a running object graph.
//!
//! # Error Handling
//! Library errors are `thiserror` enums (`HttpClientError`, `BalancerError`, `CommandError`,
//! `ValidationError`). Interceptors and the application return `eyre::Result<T>` with
//! `WrapErr` context attached.
//!
//! # Concurrency & Data Structures
//! Node states and counters are atomics; session maps use `scc::HashMap` so lookups on the
//! hot path do not serialize behind one lock.
// Re-export public modules with explicit visibility controls
pub mod bootstrap;
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{ConnectionManager, HttpClientAdapter, HttpHandler},
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
