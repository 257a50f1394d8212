//! # cachebox-storage
//!
//! Local object storage for the registry cache.
//!
//! The store keeps two files per cached object: the payload, verbatim as
//! received from the upstream, and a small JSON sidecar with the metadata
//! needed to serve it again (`<key>.json`). An object is present if and
//! only if both files exist and the sidecar parses; anything less is a
//! miss, which makes the two-step publication (rename payload, then write
//! sidecar) safe to interrupt at any point.

pub mod error;
pub mod file;

pub use error::{Result, StorageError};
pub use file::FileStore;

use async_trait::async_trait;
use cachebox_model::ObjectIdentifier;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;

/// Metadata describing a cached object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Upstream `Content-Type` at write time.
    pub content_type: String,
    /// Upstream `Docker-Content-Digest` at write time; may be empty.
    pub docker_content_digest: String,
    /// Wall-clock instant of commit.
    pub cache_date: DateTime<Utc>,
    /// Payload size in bytes.
    pub size_bytes: u64,
}

/// A cached object ready to be served.
#[async_trait]
pub trait StoredObject: Send + Sync {
    /// Metadata recorded at commit time.
    fn metadata(&self) -> &ObjectMeta;

    /// Opens the payload for streaming.
    async fn open(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// An in-progress write of one object.
///
/// The writer only touches a temporary file until [`ObjectWriter::commit`],
/// which publishes the payload with an atomic rename and then writes the
/// sidecar. [`ObjectWriter::abort`] (or dropping the writer) removes the
/// temporary file.
#[async_trait]
pub trait ObjectWriter: Send {
    /// Appends a chunk. The temporary file is created on the first call.
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Publishes the object. A writer that was never written to commits
    /// nothing and returns `Ok`.
    async fn commit(self: Box<Self>, content_type: &str, docker_content_digest: &str)
        -> Result<()>;

    /// Discards the temporary file, if any. Idempotent.
    async fn abort(&mut self);
}

/// Result of a cache lookup: a reader when the object is present, and in
/// every case a writer the caller may use to (re)populate the entry.
pub struct Lookup {
    /// Present iff payload and sidecar both exist and the sidecar parses.
    pub cached: Option<Box<dyn StoredObject>>,
    /// Writer for a miss; a hit caller simply drops it.
    pub writer: Box<dyn ObjectWriter>,
}

/// Storage engine contract.
///
/// The file backend lives in this crate; an object-storage backend (e.g.
/// S3) would implement the same three traits.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Looks up `object`, returning a reader on a hit plus a writer.
    ///
    /// # Errors
    ///
    /// Returns an error only when the existence check itself fails, not
    /// for absence.
    async fn lookup(&self, object: &ObjectIdentifier) -> Result<Lookup>;
}
