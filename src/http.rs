//! HTTP front end (HF): the `/tun` upgrade gate, the `/trace` diagnostic
//! endpoint, and the 404/500 fallbacks around them.
//!
//! The per-connection `service_fn` + `http1::Builder::serve_connection`
//! shape follows the same raw `hyper`/`hyper_util` server loop used
//! elsewhere for plain HTTP proxying; `.with_upgrades()` is required here
//! (unlike plain CONNECT handling) so the WebSocket upgrade future can
//! complete after the response is sent.

use crate::manager::TunnelManager;
use crate::tunnel::transport::websocket;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{error, warn};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

fn empty_body() -> BoxBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

fn text_body(text: impl Into<Bytes>) -> BoxBody {
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

const TRACE_PATH: &str = "/trace";

const REQUEST_NODES: &str = "Request-Nodes";
const REQUEST_NODES_TIMESTAMPS: &str = "Request-Nodes-Timestamps";
const USER_TIMESTAMP: &str = "User-Timestamp";
const SERVER_TIMESTAMP: &str = "Server-Timestamp";

/// Routes one HTTP request: upgrade on `tun_path`, trace headers on
/// `/trace`, 404 otherwise. Never returns `Err`; handlers here don't panic.
pub async fn route(manager: Arc<TunnelManager>, tun_path: Arc<str>, mut req: Request<Incoming>) -> Result<Response<BoxBody>, Infallible> {
    if req.uri().path() == &*tun_path {
        return Ok(handle_tun(manager, &mut req));
    }
    match req.uri().path() {
        TRACE_PATH => Ok(handle_trace(&req)),
        _ => Ok(Response::builder().status(StatusCode::NOT_FOUND).body(empty_body()).unwrap()),
    }
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
        && req
            .headers()
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false)
}

fn handle_tun(manager: Arc<TunnelManager>, req: &mut Request<Incoming>) -> Response<BoxBody> {
    if !is_websocket_upgrade(req) {
        return Response::builder()
            .status(StatusCode::UPGRADE_REQUIRED)
            .body(text_body(Bytes::from_static(b"Expected Upgrade: websocket")))
            .unwrap();
    }

    match websocket::upgrade(req) {
        Ok((response, fut)) => {
            tokio::spawn(async move {
                match fut.await {
                    Ok(ws) => {
                        manager.accept(ws);
                    }
                    Err(err) => error!("websocket upgrade future failed: {err}"),
                }
            });
            response.map(|empty| empty.map_err(|never| match never {}).boxed())
        }
        Err(err) => {
            warn!("websocket upgrade rejected: {err}");
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(text_body(Bytes::from(err.to_string())))
                .unwrap()
        }
    }
}

fn handle_trace(req: &Request<Incoming>) -> Response<BoxBody> {
    let now = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();

    let mut builder = Response::builder().status(StatusCode::OK);
    for name in [REQUEST_NODES, REQUEST_NODES_TIMESTAMPS, USER_TIMESTAMP] {
        if let Some(value) = req.headers().get(name) {
            builder = builder.header(header_name(name), value.clone());
        }
    }
    let server_ts = HeaderValue::from_str(&now).unwrap_or_else(|_| HeaderValue::from_static(""));
    builder = builder.header(header_name(SERVER_TIMESTAMP), server_ts);

    builder.body(empty_body()).unwrap()
}

fn header_name(name: &str) -> HeaderName {
    HeaderName::from_bytes(name.as_bytes()).expect("fixed header name set is always valid")
}
