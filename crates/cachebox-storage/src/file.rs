//! Filesystem cache backend.
//!
//! Storage layout:
//! ```text
//! <cache-dir>/
//! ├── blobs/
//! │   └── ab/
//! │       ├── abcdef…            # blob payload, shared across registries
//! │       └── abcdef….json       # sidecar metadata
//! ├── registry-1.docker.io/
//! │   └── library/alpine/
//! │       ├── 3.19               # manifest payload
//! │       └── 3.19.json          # sidecar metadata
//! └── .tmp-<pid>-<seq>           # in-flight writes, renamed on commit
//! ```

use crate::error::Result;
use crate::{Lookup, ObjectMeta, ObjectStore, ObjectWriter, StoredObject};
use async_trait::async_trait;
use cachebox_model::ObjectIdentifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

/// Suffix of the sidecar file next to each payload.
const SIDECAR_SUFFIX: &str = ".json";

/// Sidecar record serialised next to each payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    #[serde(flatten)]
    object: ObjectIdentifier,
    content_type: String,
    docker_content_digest: String,
    cache_date: DateTime<Utc>,
}

/// File-backed object store rooted at a single cache directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_sidecar(path: &Path) -> Result<Option<Sidecar>> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(sidecar) => Ok(Some(sidecar)),
            Err(e) => {
                // Treated as absent: the next miss re-fetches and overwrites.
                warn!(path = %path.display(), error = %e, "unreadable cache sidecar, treating as miss");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn lookup(&self, object: &ObjectIdentifier) -> Result<Lookup> {
        let path = self.root.join(object.storage_key());
        let writer: Box<dyn ObjectWriter> =
            Box::new(FileWriter::new(self.root.clone(), path.clone(), object.clone()));

        let size_bytes = match fs::metadata(&path).await {
            Ok(stat) => stat.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Lookup {
                    cached: None,
                    writer,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let Some(sidecar) = Self::read_sidecar(&sidecar_path(&path)).await? else {
            return Ok(Lookup {
                cached: None,
                writer,
            });
        };

        let cached: Box<dyn StoredObject> = Box::new(FileObject {
            path,
            meta: ObjectMeta {
                content_type: sidecar.content_type,
                docker_content_digest: sidecar.docker_content_digest,
                cache_date: sidecar.cache_date,
                size_bytes,
            },
        });
        Ok(Lookup {
            cached: Some(cached),
            writer,
        })
    }
}

/// A present cache entry backed by a payload file.
struct FileObject {
    path: PathBuf,
    meta: ObjectMeta,
}

#[async_trait]
impl StoredObject for FileObject {
    fn metadata(&self) -> &ObjectMeta {
        &self.meta
    }

    async fn open(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writer that stages bytes in a temp file and publishes on commit.
struct FileWriter {
    root: PathBuf,
    target: PathBuf,
    object: ObjectIdentifier,
    temp: Option<(PathBuf, fs::File)>,
}

impl FileWriter {
    fn new(root: PathBuf, target: PathBuf, object: ObjectIdentifier) -> Self {
        Self {
            root,
            target,
            object,
            temp: None,
        }
    }

    fn temp_path(&self) -> PathBuf {
        // Unique per writer so concurrent misses for one key never collide.
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!(".tmp-{}-{seq}", std::process::id()))
    }
}

#[async_trait]
impl ObjectWriter for FileWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.temp.is_none() {
            let path = self.temp_path();
            let file = fs::File::create(&path).await?;
            self.temp = Some((path, file));
        }
        if let Some((_, file)) = self.temp.as_mut() {
            file.write_all(chunk).await?;
        }
        Ok(())
    }

    async fn commit(
        mut self: Box<Self>,
        content_type: &str,
        docker_content_digest: &str,
    ) -> Result<()> {
        let Some((temp_path, mut file)) = self.temp.take() else {
            return Ok(());
        };

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(parent) = self.target.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(e) = fs::rename(&temp_path, &self.target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        let sidecar = Sidecar {
            object: self.object.clone(),
            content_type: content_type.to_string(),
            docker_content_digest: docker_content_digest.to_string(),
            cache_date: Utc::now(),
        };
        let raw = serde_json::to_vec(&sidecar)?;
        fs::write(sidecar_path(&self.target), raw).await?;

        debug!(
            object = %self.object,
            path = %self.target.display(),
            "committed cache entry"
        );
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some((path, file)) = self.temp.take() {
            drop(file);
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove temp file");
            }
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Some((path, file)) = self.temp.take() {
            drop(file);
            let _ = std::fs::remove_file(&path);
        }
    }
}

fn sidecar_path(payload: &Path) -> PathBuf {
    let mut os = payload.as_os_str().to_os_string();
    os.push(SIDECAR_SUFFIX);
    PathBuf::from(os)
}
