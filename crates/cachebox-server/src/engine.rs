//! Cache-or-proxy engine.
//!
//! For every mirror request the engine either serves the object from the
//! store or fetches it from the named upstream, streaming the body to the
//! client while teeing it into the store and a SHA-256 hasher. The entry
//! is committed only after the body has been fully consumed and the
//! digest (when one is known) has checked out; any read error, sink
//! error, client disconnect or digest mismatch aborts the write and
//! leaves no partial object behind.

use crate::error::{Result, ServeError};
use crate::metrics::CacheMetrics;
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use bytes::Bytes;
use cachebox_model::{ObjectIdentifier, ObjectKind};
use cachebox_storage::{ObjectStore, ObjectWriter, StoredObject};
use cachebox_upstream::{copy_headers, request_with_creds, Credentials, UpstreamClient};
use chrono::Utc;
use futures::{Stream, StreamExt};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

/// Service name advertised in `X-Proxied-By`.
pub const SERVICE_NAME: &str = "cachebox";

const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
const X_PROXY_DATE: HeaderName = HeaderName::from_static("x-proxy-date");

/// When manifests bypass the cache.
///
/// Blobs never skip: the client either wants them or not, and they are
/// content-addressed anyway.
pub struct SkipPolicy {
    /// Cache manifests at all.
    pub cache_manifests: bool,
    /// Manifest refs matching this regex are never cached.
    pub skip_tags: Option<Regex>,
    /// Registries whose manifests are never cached.
    pub private_registries: HashSet<String>,
    /// Repositories whose manifests are never cached.
    pub skip_images: HashSet<String>,
}

impl Default for SkipPolicy {
    fn default() -> Self {
        Self {
            cache_manifests: true,
            skip_tags: None,
            private_registries: HashSet::new(),
            skip_images: HashSet::new(),
        }
    }
}

impl SkipPolicy {
    fn skip_reason(&self, object: &ObjectIdentifier) -> Option<&'static str> {
        if object.kind != ObjectKind::Manifest {
            return None;
        }
        let mut reason = None;
        if !self.cache_manifests {
            reason = Some("manifests cache disabled");
        }
        if let Some(skip_tags) = &self.skip_tags {
            if skip_tags.is_match(&object.reference) {
                reason = Some("tag match skip regex");
            }
        }
        if self.private_registries.contains(&object.registry) {
            reason = Some("private registry");
        }
        if self.skip_images.contains(&object.repository) {
            reason = Some("image on ignore list");
        }
        reason
    }
}

/// Per-request identity threaded explicitly through the engine.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request id from the `X-Request-ID` middleware.
    pub request_id: String,
    /// Client-facing HTTP method.
    pub method: String,
    /// Request URI as received.
    pub uri: String,
    /// Client address.
    pub remote_addr: String,
}

/// The cache-or-proxy engine shared by all request tasks.
pub struct CacheEngine {
    store: Arc<dyn ObjectStore>,
    upstream: UpstreamClient,
    credentials: HashMap<String, Credentials>,
    policy: SkipPolicy,
    metrics: CacheMetrics,
}

impl CacheEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        upstream: UpstreamClient,
        credentials: HashMap<String, Credentials>,
        policy: SkipPolicy,
        metrics: CacheMetrics,
    ) -> Self {
        Self {
            store,
            upstream,
            credentials,
            policy,
            metrics,
        }
    }

    /// Returns the shared counters.
    #[must_use]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Serves one mirror request: cache hit, or upstream fetch teed into
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns an error for cache I/O failures and upstream transport
    /// failures; upstream status codes are passed through, not errors.
    pub async fn get_object(
        &self,
        object: &ObjectIdentifier,
        is_head: bool,
        client_headers: &HeaderMap,
        ctx: &RequestContext,
    ) -> Result<Response> {
        let mut skip_reason = self.policy.skip_reason(object);

        let mut upstream_headers = HeaderMap::new();
        copy_headers(&mut upstream_headers, client_headers);
        upstream_headers.remove(header::HOST);

        let mut writer = None;
        if skip_reason.is_none() {
            let lookup = self.store.lookup(object).await.map_err(|e| {
                error!(request_id = %ctx.request_id, error = %e, "error getting from cache");
                ServeError::Cache(e.to_string())
            })?;
            if let Some(cached) = lookup.cached {
                return self.serve_hit(object, cached.as_ref(), is_head, ctx).await;
            }
            writer = Some(lookup.writer);
            // Cache raw full-range bodies; some clients dislike re-served
            // zstd/gzip, and a ranged body must never be committed.
            upstream_headers.remove(header::ACCEPT_ENCODING);
            upstream_headers.remove(header::RANGE);
        }

        let url = format!(
            "{}/v2/{}/{}/{}",
            upstream_base_url(&object.registry),
            object.repository,
            object.kind.path_segment(),
            object.reference
        );

        let creds = self.credentials.get(&object.registry);
        let upstream = request_with_creds(
            &self.upstream,
            &url,
            &mut upstream_headers,
            creds,
            &object.registry,
        )
        .await
        .map_err(|e| {
            error!(request_id = %ctx.request_id, error = %e, "error proxying request");
            ServeError::Upstream(e.to_string())
        })?;

        let status = upstream.status();
        debug!(request_id = %ctx.request_id, status = status.as_u16(), "upstream response");

        // Non-2xx is forwarded verbatim but never cached; this covers
        // 404s and 401s asking the client to authenticate itself.
        if !status.is_success() {
            skip_reason = Some("non-2xx upstream response");
            if let Some(mut writer) = writer.take() {
                writer.abort().await;
            }
        }

        let outcome = if skip_reason.is_none() {
            self.metrics.miss();
            "miss"
        } else {
            self.metrics.skip();
            "skip"
        };

        let mut response_headers = HeaderMap::new();
        copy_headers(&mut response_headers, upstream.headers());
        response_headers.remove(header::TRANSFER_ENCODING);
        response_headers.remove(header::CONNECTION);

        let commit = CommitInfo {
            content_type: header_str(upstream.headers(), header::CONTENT_TYPE).to_string(),
            docker_content_digest: header_str(upstream.headers(), DOCKER_CONTENT_DIGEST)
                .to_lowercase(),
            fallback_ref: object.reference.clone(),
        };
        let completion = CompletionLog {
            ctx: ctx.clone(),
            object: object.clone(),
            outcome,
            status: status.as_u16(),
            reason: skip_reason,
        };

        let hasher = writer.is_some().then(Sha256::new);
        let echo = (writer.is_some() && object.kind == ObjectKind::Manifest).then(Vec::new);

        let (body, client) = if is_head {
            (Body::empty(), None)
        } else {
            let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(1);
            (Body::from_stream(ReceiverStream::new(rx)), Some(tx))
        };

        tokio::spawn(pump_upstream(
            upstream.bytes_stream().boxed(),
            writer,
            hasher,
            echo,
            client,
            commit,
            completion,
        ));

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    async fn serve_hit(
        &self,
        object: &ObjectIdentifier,
        cached: &dyn StoredObject,
        is_head: bool,
        ctx: &RequestContext,
    ) -> Result<Response> {
        let meta = cached.metadata().clone();
        self.metrics.hit();
        info!(
            method = %ctx.method,
            uri = %ctx.uri,
            addr = %ctx.remote_addr,
            request_id = %ctx.request_id,
            kind = %object.kind,
            registry = %object.registry,
            repository = %object.repository,
            reference = %object.reference,
            outcome = "hit",
            size = meta.size_bytes,
            content_type = %meta.content_type,
            cache_date = %meta.cache_date,
            "served from cache"
        );

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&meta.cache_date.to_rfc3339()) {
            headers.insert(X_PROXY_DATE, value);
        }
        let age = (Utc::now() - meta.cache_date).num_seconds().max(0);
        if let Ok(value) = HeaderValue::from_str(&age.to_string()) {
            headers.insert(header::AGE, value);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes));
        if let Ok(value) = HeaderValue::from_str(&meta.content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if !meta.docker_content_digest.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&meta.docker_content_digest) {
                headers.insert(DOCKER_CONTENT_DIGEST, value);
            }
        }

        let body = if is_head {
            Body::empty()
        } else {
            let reader = cached.open().await.map_err(|e| {
                error!(request_id = %ctx.request_id, error = %e, "error reading body from cache");
                ServeError::Cache(e.to_string())
            })?;
            Body::from_stream(ReaderStream::new(reader))
        };

        let mut response = Response::new(body);
        *response.headers_mut() = headers;
        Ok(response)
    }
}

struct CommitInfo {
    content_type: String,
    /// Lowercased upstream `Docker-Content-Digest`; may be empty.
    docker_content_digest: String,
    /// Used for verification when the upstream sent no digest header.
    fallback_ref: String,
}

struct CompletionLog {
    ctx: RequestContext,
    object: ObjectIdentifier,
    outcome: &'static str,
    status: u16,
    reason: Option<&'static str>,
}

impl CompletionLog {
    fn emit(&self) {
        info!(
            method = %self.ctx.method,
            uri = %self.ctx.uri,
            addr = %self.ctx.remote_addr,
            request_id = %self.ctx.request_id,
            kind = %self.object.kind,
            registry = %self.object.registry,
            repository = %self.object.repository,
            reference = %self.object.reference,
            outcome = self.outcome,
            status = self.status,
            reason = self.reason.unwrap_or(""),
            "served from upstream"
        );
    }
}

/// Streams the upstream body into every sink in order: store writer,
/// hasher, manifest echo buffer, client channel. The first failure on any
/// sink aborts the store write; completion verifies the digest and
/// commits.
async fn pump_upstream<S>(
    mut body: S,
    mut writer: Option<Box<dyn ObjectWriter>>,
    mut hasher: Option<Sha256>,
    mut echo: Option<Vec<u8>>,
    client: Option<mpsc::Sender<std::io::Result<Bytes>>>,
    commit: CommitInfo,
    completion: CompletionLog,
) where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin + Send,
{
    while let Some(next) = body.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(
                    request_id = %completion.ctx.request_id,
                    error = %e,
                    "error while reading upstream response body"
                );
                abort(&mut writer).await;
                if let Some(client) = &client {
                    let _ = client.send(Err(std::io::Error::other(e))).await;
                }
                return;
            }
        };

        if let Some(w) = writer.as_mut() {
            if let Err(e) = w.write(&chunk).await {
                error!(
                    request_id = %completion.ctx.request_id,
                    error = %e,
                    "error writing to cache"
                );
                abort(&mut writer).await;
                if let Some(client) = &client {
                    let _ = client.send(Err(std::io::Error::other(e))).await;
                }
                return;
            }
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&chunk);
        }
        if let Some(echo) = echo.as_mut() {
            echo.extend_from_slice(&chunk);
        }
        if let Some(client) = &client {
            if client.send(Ok(chunk)).await.is_err() {
                debug!(
                    request_id = %completion.ctx.request_id,
                    "client disconnected mid-stream, aborting cache write"
                );
                abort(&mut writer).await;
                return;
            }
        }
    }

    if let Some(writer) = writer.take() {
        if let Some(echo) = &echo {
            debug!(
                request_id = %completion.ctx.request_id,
                manifest = %String::from_utf8_lossy(echo),
                "upstream returned manifest"
            );
        }

        let mut expected = commit.docker_content_digest.clone();
        if expected.is_empty() {
            expected = commit.fallback_ref.clone();
        }
        if expected.starts_with(cachebox_model::SHA256_PREFIX) {
            if let Some(hasher) = hasher.take() {
                let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
                if actual != expected {
                    error!(
                        request_id = %completion.ctx.request_id,
                        expected = %expected,
                        actual = %actual,
                        "digest mismatch"
                    );
                    let mut writer = Some(writer);
                    abort(&mut writer).await;
                    return;
                }
            }
        }

        if let Err(e) = writer
            .commit(&commit.content_type, &commit.docker_content_digest)
            .await
        {
            error!(
                request_id = %completion.ctx.request_id,
                error = %e,
                "error saving to cache"
            );
        }
    }

    completion.emit();
}

async fn abort(writer: &mut Option<Box<dyn ObjectWriter>>) {
    if let Some(mut writer) = writer.take() {
        writer.abort().await;
    }
}

/// Base URL for an upstream registry.
///
/// The `ns` value is a bare host in normal operation; a value that
/// carries its own scheme (plaintext lab registries, tests) is used
/// verbatim.
fn upstream_base_url(registry: &str) -> String {
    if registry.starts_with("http://") || registry.starts_with("https://") {
        registry.trim_end_matches('/').to_string()
    } else {
        format!("https://{registry}")
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(registry: &str, repository: &str, reference: &str) -> ObjectIdentifier {
        ObjectIdentifier {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference: reference.to_string(),
            kind: ObjectKind::Manifest,
        }
    }

    #[test]
    fn blobs_never_skip() {
        let policy = SkipPolicy {
            cache_manifests: false,
            skip_tags: Some(Regex::new(".*").unwrap()),
            private_registries: HashSet::from(["ghcr.io".to_string()]),
            skip_images: HashSet::from(["library/alpine".to_string()]),
        };
        let blob = ObjectIdentifier {
            registry: "ghcr.io".to_string(),
            repository: "library/alpine".to_string(),
            reference: "sha256:aa".to_string(),
            kind: ObjectKind::Blob,
        };
        assert_eq!(policy.skip_reason(&blob), None);
    }

    #[test]
    fn default_policy_caches_manifests() {
        let policy = SkipPolicy::default();
        assert_eq!(
            policy.skip_reason(&manifest("ghcr.io", "owner/app", "v1")),
            None
        );
    }

    #[test]
    fn manifests_cache_disabled() {
        let policy = SkipPolicy {
            cache_manifests: false,
            ..SkipPolicy::default()
        };
        assert_eq!(
            policy.skip_reason(&manifest("ghcr.io", "owner/app", "v1")),
            Some("manifests cache disabled")
        );
    }

    #[test]
    fn skip_tags_regex_matches() {
        let policy = SkipPolicy {
            skip_tags: Some(Regex::new("latest").unwrap()),
            ..SkipPolicy::default()
        };
        assert_eq!(
            policy.skip_reason(&manifest("ghcr.io", "owner/app", "latest")),
            Some("tag match skip regex")
        );
        assert_eq!(policy.skip_reason(&manifest("ghcr.io", "owner/app", "v1")), None);
    }

    #[test]
    fn private_registry_skips_manifest() {
        let policy = SkipPolicy {
            private_registries: HashSet::from(["registry.corp.example".to_string()]),
            ..SkipPolicy::default()
        };
        assert_eq!(
            policy.skip_reason(&manifest("registry.corp.example", "owner/app", "v1")),
            Some("private registry")
        );
    }

    #[test]
    fn ignored_image_skips_manifest() {
        let policy = SkipPolicy {
            skip_images: HashSet::from(["owner/app".to_string()]),
            ..SkipPolicy::default()
        };
        assert_eq!(
            policy.skip_reason(&manifest("ghcr.io", "owner/app", "v1")),
            Some("image on ignore list")
        );
    }

    #[test]
    fn upstream_base_urls() {
        assert_eq!(
            upstream_base_url("registry-1.docker.io"),
            "https://registry-1.docker.io"
        );
        assert_eq!(
            upstream_base_url("http://127.0.0.1:5000"),
            "http://127.0.0.1:5000"
        );
        assert_eq!(
            upstream_base_url("https://mirror.example/"),
            "https://mirror.example"
        );
    }
}
