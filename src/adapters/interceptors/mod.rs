//! Built-in interceptors assembled into rule chains by the bootstrap.
pub mod access_log;
pub mod cluster_notification;
pub mod dispatching;
pub mod load_balancing;

pub use access_log::AccessLogInterceptor;
pub use cluster_notification::ClusterNotificationInterceptor;
pub use dispatching::DispatchingInterceptor;
pub use load_balancing::{FailureDetector, LoadBalancingInterceptor};
