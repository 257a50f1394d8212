//! Mirror surface router.
//!
//! Exactly the OCI distribution mirror subset containerd speaks:
//!
//! - `GET /` — identification page
//! - `GET /metrics` — Prometheus exposition
//! - `GET|HEAD /v2/{repo}/manifests/{ref}?ns=<registry>`
//! - `GET|HEAD /v2/{repo}/blobs/{ref}?ns=<registry>`
//!
//! Repository names may contain slashes, so the `/v2/` surface is matched
//! with a wildcard route and validated against the distribution
//! image-name pattern here.

use crate::engine::{CacheEngine, RequestContext, SERVICE_NAME};
use crate::error::ServeError;
use crate::trace::{self, RemoteAddr, RequestId};
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::header::HeaderValue;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Extension, Router};
use cachebox_model::{ObjectIdentifier, ObjectKind, REPOSITORY_PATTERN};
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

const X_PROXIED_BY: HeaderName = HeaderName::from_static("x-proxied-by");
const X_PROXIED_FOR: HeaderName = HeaderName::from_static("x-proxied-for");

static ROUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^({REPOSITORY_PATTERN})/(manifests|blobs)/([^/]+)$"
    ))
    .expect("route pattern compiles")
});

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Cache-or-proxy engine.
    pub engine: Arc<CacheEngine>,
}

/// Creates the mirror router with all endpoints.
#[must_use]
pub fn create_router(engine: Arc<CacheEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics_endpoint))
        .route("/v2/{*path}", any(handle_v2))
        .layer(axum::middleware::from_fn(trace::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(concat!(
        "<h1>cachebox</h1>\n",
        "<a href=\"/metrics\">/metrics</a> - prometheus metrics<br/>\n",
    ))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.engine.metrics().gather_and_encode() {
        Ok(text) => (
            [("content-type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct MirrorQuery {
    /// Upstream registry host, appended by the containerd mirror config.
    ns: Option<String>,
}

/// Rewrites well-known registry aliases to the host actually serving the
/// v2 API.
fn normalize_registry(ns: &str) -> &str {
    match ns {
        "docker.io" => "registry-1.docker.io",
        other => other,
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_v2(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<MirrorQuery>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(RemoteAddr(remote_addr)): Extension<RemoteAddr>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(caps) = ROUTE_RE.captures(&path) else {
        return ServeError::NotFound.into_response();
    };
    let repository = caps.get(1).map_or("", |m| m.as_str());
    let kind = match caps.get(2).map_or("", |m| m.as_str()) {
        "manifests" => ObjectKind::Manifest,
        _ => ObjectKind::Blob,
    };
    let reference = caps.get(3).map_or("", |m| m.as_str());

    let ctx = RequestContext {
        request_id,
        method: method.to_string(),
        uri: uri.to_string(),
        remote_addr,
    };

    let Some(ns) = query.ns.filter(|ns| !ns.is_empty()) else {
        warn!(
            method = %ctx.method,
            uri = %ctx.uri,
            request_id = %ctx.request_id,
            "request had no `ns` query string, not sure what registry this is for"
        );
        return ServeError::BadRequest(format!(
            "No `ns` query string found (are you using containerd?): \
             I don't know what registry to ask for {repository}"
        ))
        .into_response();
    };

    let is_head = if method == Method::HEAD {
        true
    } else if method == Method::GET {
        false
    } else {
        warn!(
            method = %ctx.method,
            uri = %ctx.uri,
            request_id = %ctx.request_id,
            "method is not supported"
        );
        return ServeError::BadRequest(String::new()).into_response();
    };

    let object = ObjectIdentifier {
        registry: normalize_registry(&ns).to_string(),
        repository: repository.to_string(),
        reference: reference.to_string(),
        kind,
    };

    let mut response = match state
        .engine
        .get_object(&object, is_head, &headers, &ctx)
        .await
    {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };

    response
        .headers_mut()
        .insert(X_PROXIED_BY, HeaderValue::from_static(SERVICE_NAME));
    if let Ok(value) = HeaderValue::from_str(&object.registry) {
        response.headers_mut().insert(X_PROXIED_FOR, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_pattern_matches_mirror_paths() {
        assert!(ROUTE_RE.is_match("prom/node-exporter/manifests/v1.5.0"));
        assert!(ROUTE_RE.is_match("somebody/prom/node-exporter/manifests/v1.5.0"));
        assert!(ROUTE_RE.is_match("node-exporter/manifests/v1.5.0"));
        assert!(ROUTE_RE.is_match("library/alpine/blobs/sha256:abc123"));

        assert!(!ROUTE_RE.is_match("prom/node-exporter/manifests"));
        assert!(!ROUTE_RE.is_match("prom/node-exporter/tags/list"));
        assert!(!ROUTE_RE.is_match("Upper/Case/manifests/v1"));
    }

    #[test]
    fn route_pattern_captures_parts() {
        let caps = ROUTE_RE
            .captures("somebody/prom/node-exporter/manifests/v1.5.0")
            .unwrap();
        assert_eq!(&caps[1], "somebody/prom/node-exporter");
        assert_eq!(&caps[2], "manifests");
        assert_eq!(&caps[3], "v1.5.0");
    }

    #[test]
    fn docker_io_alias_is_rewritten() {
        assert_eq!(normalize_registry("docker.io"), "registry-1.docker.io");
        assert_eq!(normalize_registry("quay.io"), "quay.io");
        assert_eq!(normalize_registry("registry.k8s.io"), "registry.k8s.io");
    }
}
