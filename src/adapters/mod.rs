pub mod connection;
pub mod connection_manager;
pub mod http_client;
pub mod http_handler;
pub mod interceptors;
pub mod notification_client;
pub mod tls;

/// Re-export commonly used types from adapters
pub use connection_manager::{ConnectionManager, PoolConfig};
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use notification_client::NotificationClient;
