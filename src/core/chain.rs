//! Outcome-driven execution of an ordered interceptor list.
//!
//! Request handlers run in registration order until one of them returns
//! [`Outcome::Return`] or [`Outcome::Abort`] (or attaches a response). If all
//! of them continue, the [`Dispatcher`] delivers the request. The response
//! walk then runs in reverse, starting at the interceptor where the request
//! walk stopped, so every handler that saw the request also sees the response.
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;

use crate::{
    core::{
        exchange::{ERROR_PROPERTY, Exchange},
        interceptor::{Interceptor, Outcome},
        problem::{internal_error, problem_response},
    },
    ports::http_client::HttpClientError,
};

/// The step that runs once every request handler has continued.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver the request and attach the response to the exchange.
    /// `Abort` means a response is attached but delivery did not succeed,
    /// as when an internally routed rule aborted.
    async fn dispatch(&self, exc: &mut Exchange) -> eyre::Result<Outcome>;
}

/// Ordered interceptors of one rule.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
    production: bool,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors,
            production: false,
        }
    }

    /// Hide error detail in generated responses.
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run both phases over `exc`. Returns the request-phase outcome, or
    /// `Abort` if delivery or a response handler failed.
    pub async fn run(&self, exc: &mut Exchange, dispatcher: &dyn Dispatcher) -> Outcome {
        let (mut outcome, walk_len) = self.run_request_phase(exc).await;

        if outcome == Outcome::Continue {
            match dispatcher.dispatch(exc).await {
                Ok(Outcome::Abort) => {
                    exc.mark_aborted();
                    outcome = Outcome::Abort;
                }
                Ok(_) => {}
                Err(err) => {
                    let status = err
                        .downcast_ref::<HttpClientError>()
                        .map(HttpClientError::status_code)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    tracing::warn!(error = %err, status = status.as_u16(), "delivery failed");
                    let title = status.canonical_reason().unwrap_or("Error");
                    let detail = format!("{err:#}");
                    exc.set_response(problem_response(
                        status,
                        title,
                        Some(&detail),
                        self.production,
                    ));
                    exc.properties_mut().insert(ERROR_PROPERTY, err);
                    exc.mark_aborted();
                    outcome = Outcome::Abort;
                }
            }
        }

        if !exc.has_response() {
            exc.set_response(internal_error(
                Some("no response was produced"),
                self.production,
            ));
        }

        if self.run_response_phase(exc, walk_len).await == Outcome::Abort {
            outcome = Outcome::Abort;
        }
        outcome
    }

    /// Returns the outcome plus how many interceptors the response walk covers.
    async fn run_request_phase(&self, exc: &mut Exchange) -> (Outcome, usize) {
        for (index, interceptor) in self.interceptors.iter().enumerate() {
            let outcome = match interceptor.handle_request(exc).await {
                Ok(Outcome::Continue) if exc.has_response() => Outcome::Return,
                Ok(outcome) => outcome,
                Err(err) => self.handler_failed(exc, interceptor.name(), err),
            };
            tracing::trace!(interceptor = interceptor.name(), ?outcome, "request phase");

            match outcome {
                Outcome::Continue => continue,
                Outcome::Abort => {
                    exc.mark_aborted();
                    return (outcome, index + 1);
                }
                Outcome::Return => return (outcome, index + 1),
            }
        }
        (Outcome::Continue, self.interceptors.len())
    }

    async fn run_response_phase(&self, exc: &mut Exchange, walk_len: usize) -> Outcome {
        for interceptor in self.interceptors[..walk_len].iter().rev() {
            let outcome = match interceptor.handle_response(exc).await {
                Ok(outcome) => outcome,
                Err(err) => self.handler_failed(exc, interceptor.name(), err),
            };
            tracing::trace!(interceptor = interceptor.name(), ?outcome, "response phase");

            if outcome == Outcome::Abort {
                exc.mark_aborted();
                return Outcome::Abort;
            }
        }
        Outcome::Continue
    }

    fn handler_failed(&self, exc: &mut Exchange, name: &str, err: eyre::Report) -> Outcome {
        tracing::error!(interceptor = name, error = ?err, "interceptor failed");
        let detail = format!("{name}: {err}");
        exc.set_response(internal_error(Some(&detail), self.production));
        exc.properties_mut().insert(ERROR_PROPERTY, err);
        Outcome::Abort
    }
}
