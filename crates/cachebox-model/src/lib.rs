//! # cachebox-model
//!
//! Object identity for the registry cache.
//!
//! Everything a request is about is captured by an [`ObjectIdentifier`]:
//! which upstream registry, which repository, which tag or digest, and
//! whether it names a manifest or a blob. The identifier also derives the
//! on-disk storage key used by the cache backends.

use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Repository name pattern from the distribution reference grammar
/// (the `remoteName` production).
pub const REPOSITORY_PATTERN: &str =
    "[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*)*";

static REPOSITORY_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(&format!("^{REPOSITORY_PATTERN}$")).expect("repository pattern compiles")
});

/// Digest prefix used by every registry object this cache handles.
pub const SHA256_PREFIX: &str = "sha256:";

/// What kind of registry object a request names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// A manifest (tag- or digest-addressed JSON document).
    Manifest,
    /// A blob (always digest-addressed).
    Blob,
}

impl ObjectKind {
    /// URL path segment for this kind in the v2 API.
    #[must_use]
    pub const fn path_segment(self) -> &'static str {
        match self {
            Self::Manifest => "manifests",
            Self::Blob => "blobs",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Manifest => "manifest",
            Self::Blob => "blob",
        })
    }
}

/// Identity of a cacheable registry object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    /// Upstream registry host (after alias normalisation), e.g.
    /// `registry-1.docker.io`.
    pub registry: String,
    /// Repository path, e.g. `prom/node-exporter`. May contain more than
    /// one slash.
    pub repository: String,
    /// Tag or digest for manifests; always a digest for blobs.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Object kind. Authoritative: a manifest referenced by digest is
    /// still a manifest.
    pub kind: ObjectKind,
}

impl ObjectIdentifier {
    /// Derives the storage key for this object.
    ///
    /// Blobs are content-addressed and shared across registries:
    /// `blobs/<hex[0:2]>/<hex>`. Manifests are per-registry, because the
    /// same tag can name different content on different registries:
    /// `<registry>/<repository>/<ref>`.
    #[must_use]
    pub fn storage_key(&self) -> String {
        match self.kind {
            ObjectKind::Blob => {
                let hex = self
                    .reference
                    .strip_prefix(SHA256_PREFIX)
                    .unwrap_or(&self.reference);
                let shard = hex.get(..2).unwrap_or(hex);
                format!("blobs/{shard}/{hex}")
            }
            ObjectKind::Manifest => format!(
                "{}/{}/{}",
                sanitize_component(&self.registry),
                self.repository,
                sanitize_component(&self.reference)
            ),
        }
    }
}

impl std::fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {} {}",
            self.registry, self.repository, self.kind, self.reference
        )
    }
}

/// Returns whether `repository` matches the distribution image-name grammar.
#[must_use]
pub fn is_valid_repository(repository: &str) -> bool {
    REPOSITORY_RE.is_match(repository)
}

/// Makes an untrusted value safe to use as a single path component.
///
/// The repository is regex-validated at the router, but the registry comes
/// from the `ns` query parameter and the ref is opaque; neither may be
/// allowed to traverse out of the cache root.
fn sanitize_component(value: &str) -> String {
    let flat = value.replace(['/', '\\'], "_");
    match flat.as_str() {
        "" | "." | ".." => format!("_{flat}"),
        _ => flat,
    }
}
