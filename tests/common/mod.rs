#![allow(dead_code)]
use std::net::SocketAddr;

use axum::body::Body;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use switchyard::{HttpHandler, bootstrap::Gateway};
use tokio::net::TcpListener;

/// A keep-alive backend answering `"<name> <method> <path?query>"`. The
/// Host and X-Forwarded-For it saw come back as `x-seen-host` and
/// `x-seen-forwarded-for`.
pub async fn backend(name: &'static str) -> SocketAddr {
    backend_with_status(name, StatusCode::OK).await
}

pub async fn backend_with_status(name: &'static str, status: StatusCode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                    let body = format!(
                        "{name} {} {}",
                        req.method(),
                        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
                    );
                    let mut response = Response::builder().status(status);
                    for (seen, header) in [
                        ("x-seen-host", "host"),
                        ("x-seen-forwarded-for", "x-forwarded-for"),
                    ] {
                        if let Some(value) = req.headers().get(header) {
                            response = response.header(seen, value.clone());
                        }
                    }
                    Ok::<_, hyper::Error>(response.body(Full::new(Bytes::from(body))).unwrap())
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Serve the gateway on a loopback port.
pub async fn serve(gateway: &Gateway) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = gateway
        .handler
        .clone()
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Run a GET through the handler without a socket in between.
pub async fn get(handler: &HttpHandler, uri: &str, headers: &[(&str, &str)]) -> (StatusCode, String) {
    let mut request = Request::builder().uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let response = handler
        .handle_request(request.body(Body::empty()).unwrap(), Some(([127, 0, 0, 1], 50000).into()))
        .await;
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}
