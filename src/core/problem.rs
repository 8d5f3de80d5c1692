//! Generated error responses.
//!
//! Whenever the gateway has to answer on its own (handler failure, exhausted
//! retries, missing route) it produces a small JSON problem document so that
//! clients get a consistent shape regardless of where the failure happened.
use bytes::Bytes;
use http::{Response, StatusCode, header};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ProblemDetails<'a> {
    title: &'a str,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

/// Build a problem response. `detail` is dropped when `production` is set so
/// internal error text never leaks to clients.
pub fn problem_response(
    status: StatusCode,
    title: &str,
    detail: Option<&str>,
    production: bool,
) -> Response<Bytes> {
    let problem = ProblemDetails {
        title,
        status: status.as_u16(),
        detail: if production { None } else { detail },
    };
    let body = serde_json::to_vec(&problem).unwrap_or_default();

    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/problem+json"),
    );
    response
}

/// Plain 500 used when a chain stops without attaching a response.
pub fn internal_error(detail: Option<&str>, production: bool) -> Response<Bytes> {
    problem_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error",
        detail,
        production,
    )
}
