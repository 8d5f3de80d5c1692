pub mod balancer;
pub mod chain;
pub mod destination;
pub mod exchange;
pub mod gateway;
pub mod interceptor;
pub mod problem;
pub mod rule;

pub use chain::{Dispatcher, InterceptorChain};
pub use exchange::Exchange;
pub use gateway::GatewayService;
pub use interceptor::{Interceptor, Outcome};
