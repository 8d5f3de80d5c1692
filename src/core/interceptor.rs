//! The handler contract every pluggable module implements.
use async_trait::async_trait;

use crate::core::exchange::Exchange;

/// Control-flow signal returned by each interceptor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Proceed to the next interceptor, or to the backend call after the last one.
    Continue,
    /// Stop now; a response is attached and no backend is contacted.
    Return,
    /// Stop now because of an error; an error response is attached.
    Abort,
}

/// A request/response handler registered into a rule's chain.
///
/// Both phases default to [`Outcome::Continue`], so an interceptor only
/// implements the side it cares about. Handlers must not keep references to
/// the exchange beyond the call.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;

    async fn handle_request(&self, _exc: &mut Exchange) -> eyre::Result<Outcome> {
        Ok(Outcome::Continue)
    }

    async fn handle_response(&self, _exc: &mut Exchange) -> eyre::Result<Outcome> {
        Ok(Outcome::Continue)
    }
}
