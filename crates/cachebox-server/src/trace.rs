//! Request-id middleware for the mirror surface.
//!
//! Every inbound request gets a request id attached to:
//! - request extensions (for handlers, as [`RequestId`])
//! - the response `X-Request-ID` header
//!
//! If the client (containerd sends one) already carries an `X-Request-ID`
//! header it is reused, otherwise a new UUID v4 is generated. The remote
//! address is captured here as well so handlers get both from extensions
//! without reaching for task-local state.

use axum::extract::connect_info::ConnectInfo;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;

/// Header name for request-id propagation.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id stored in request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Client address stored in request extensions; `unknown` when the
/// transport has none (e.g. in-process tests).
#[derive(Debug, Clone)]
pub struct RemoteAddr(pub String);

/// Axum middleware that attaches a request id and remote address.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string());

    tracing::debug!(
        request_id = %request_id,
        addr = %remote_addr,
        method = %request.method(),
        uri = %request.uri(),
        "request"
    );

    request.extensions_mut().insert(RequestId(request_id.clone()));
    request.extensions_mut().insert(RemoteAddr(remote_addr));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}
