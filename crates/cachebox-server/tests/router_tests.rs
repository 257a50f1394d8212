//! Router contract tests for the mirror surface.
//!
//! These exercise the HTTP contract without any upstream: routing, the
//! mandatory `ns` parameter, method policy, request-id propagation and
//! serving a pre-seeded cache entry.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use cachebox_model::{ObjectIdentifier, ObjectKind};
use cachebox_server::{create_router, CacheEngine, CacheMetrics, SkipPolicy};
use cachebox_storage::FileStore;
use cachebox_upstream::UpstreamClient;
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const MANIFEST_BODY: &[u8] = br#"{"schemaVersion":2,"manifests":[]}"#;
const MANIFEST_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const MANIFEST_DIGEST: &str =
    "sha256:41891b95aca23018ba65b320ff3ce10a98ee3cb39261f02fd74867c68414e814";

fn test_engine(cache_dir: &Path) -> Arc<CacheEngine> {
    let store = FileStore::new(cache_dir.to_path_buf()).expect("create store");
    Arc::new(CacheEngine::new(
        Arc::new(store),
        UpstreamClient::new().expect("create client"),
        HashMap::new(),
        SkipPolicy {
            skip_tags: Some(regex::Regex::new("latest").unwrap()),
            ..SkipPolicy::default()
        },
        CacheMetrics::new(),
    ))
}

fn test_app() -> (Router, Arc<CacheEngine>, TempDir) {
    let tmp = TempDir::new().expect("create temp dir");
    let engine = test_engine(tmp.path());
    (create_router(Arc::clone(&engine)), engine, tmp)
}

/// Seeds a committed cache entry directly on disk.
fn seed_manifest(cache_dir: &Path, object: &ObjectIdentifier, body: &[u8]) {
    let payload = cache_dir.join(object.storage_key());
    std::fs::create_dir_all(payload.parent().unwrap()).unwrap();
    std::fs::write(&payload, body).unwrap();
    std::fs::write(
        format!("{}.json", payload.display()),
        format!(
            r#"{{"registry":"{}","repository":"{}","ref":"{}","kind":"manifest","contentType":"{MANIFEST_TYPE}","dockerContentDigest":"{MANIFEST_DIGEST}","cacheDate":"2024-05-01T00:00:00Z"}}"#,
            object.registry, object.repository, object.reference
        ),
    )
    .unwrap();
}

async fn send(app: &Router, request: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(request).await.expect("request")
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    send(
        app,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn index_page_identifies_the_service() {
    let (app, _engine, _tmp) = test_app();

    let response = get(&app, "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_bytes(response).await;
    assert!(String::from_utf8_lossy(&body).contains("cachebox"));
}

#[tokio::test]
async fn metrics_endpoint_exposes_cache_counters() {
    let (app, _engine, _tmp) = test_app();

    let response = get(&app, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_bytes(response).await;
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains(r#"cachebox_cache_total{result="hit"} 0"#));
    assert!(text.contains(r#"cachebox_cache_total{result="miss"} 0"#));
    assert!(text.contains(r#"cachebox_cache_total{result="skip"} 0"#));
}

#[tokio::test]
async fn missing_ns_is_rejected_with_the_repo_named() {
    let (app, engine, _tmp) = test_app();

    let response = get(&app, "/v2/prom/node-exporter/manifests/v1.5.0").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_bytes(response).await;
    assert!(String::from_utf8_lossy(&body).contains("prom/node-exporter"));

    // Rejected before dispatch: nothing counted.
    assert_eq!(engine.metrics().count("hit"), 0);
    assert_eq!(engine.metrics().count("miss"), 0);
    assert_eq!(engine.metrics().count("skip"), 0);
}

#[tokio::test]
async fn unsupported_methods_are_rejected() {
    let (app, _engine, _tmp) = test_app();

    for method in [Method::PUT, Method::POST, Method::DELETE] {
        let response = send(
            &app,
            Request::builder()
                .method(method.clone())
                .uri("/v2/library/alpine/manifests/3.19?ns=docker.io")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "method {method}");
    }
}

#[tokio::test]
async fn unmatched_v2_paths_are_not_found() {
    let (app, _engine, _tmp) = test_app();

    for uri in [
        "/v2/library/alpine/manifests?ns=docker.io",
        "/v2/library/alpine/tags/list?ns=docker.io",
        "/v2/Library/Alpine/manifests/3.19?ns=docker.io",
    ] {
        let response = get(&app, uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "uri {uri}");
    }
}

#[tokio::test]
async fn non_v2_paths_are_not_found() {
    let (app, _engine, _tmp) = test_app();
    let response = get(&app, "/v1/whatever").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn seeded_entry_is_served_from_cache() {
    let (app, engine, tmp) = test_app();
    let object = ObjectIdentifier {
        registry: "registry.k8s.io".to_string(),
        repository: "kube-scheduler".to_string(),
        reference: "v1.29.1".to_string(),
        kind: ObjectKind::Manifest,
    };
    seed_manifest(tmp.path(), &object, MANIFEST_BODY);

    let response = get(
        &app,
        "/v2/kube-scheduler/manifests/v1.29.1?ns=registry.k8s.io",
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers().clone();
    assert_eq!(headers.get("x-proxied-by").unwrap(), "cachebox");
    assert_eq!(headers.get("x-proxied-for").unwrap(), "registry.k8s.io");
    assert_eq!(
        headers.get("content-length").unwrap(),
        &MANIFEST_BODY.len().to_string()
    );
    assert_eq!(headers.get("content-type").unwrap(), MANIFEST_TYPE);
    assert_eq!(headers.get("docker-content-digest").unwrap(), MANIFEST_DIGEST);
    assert!(headers.contains_key("x-proxy-date"));
    assert!(headers.contains_key("age"));
    assert!(headers.contains_key("x-request-id"));

    assert_eq!(body_bytes(response).await, MANIFEST_BODY);
    assert_eq!(engine.metrics().count("hit"), 1);
}

#[tokio::test]
async fn head_on_seeded_entry_has_no_body() {
    let (app, _engine, tmp) = test_app();
    let object = ObjectIdentifier {
        registry: "registry.k8s.io".to_string(),
        repository: "kube-scheduler".to_string(),
        reference: "v1.29.1".to_string(),
        kind: ObjectKind::Manifest,
    };
    seed_manifest(tmp.path(), &object, MANIFEST_BODY);

    let response = send(
        &app,
        Request::builder()
            .method(Method::HEAD)
            .uri("/v2/kube-scheduler/manifests/v1.29.1?ns=registry.k8s.io")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-length").unwrap(),
        &MANIFEST_BODY.len().to_string()
    );
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn client_request_id_is_echoed() {
    let (app, _engine, _tmp) = test_app();

    let response = send(
        &app,
        Request::builder()
            .uri("/")
            .header("x-request-id", "containerd-42")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.headers().get("x-request-id").unwrap(), "containerd-42");
}

#[tokio::test]
async fn generated_request_id_is_attached() {
    let (app, _engine, _tmp) = test_app();

    let response = get(&app, "/").await;
    let id = response.headers().get("x-request-id").unwrap();
    assert!(!id.to_str().unwrap().is_empty());
}
