//! On-disk content-addressed blob cache shared across reconciliations.
//!
//! Blobs are stored as `<dir>/<algorithm>/<hex>`; writes go through a
//! temporary file and an atomic rename so concurrent reconciliations never
//! observe a partial blob.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug)]
pub struct BlobCache {
    dir: PathBuf,
}

static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

// === impl BlobCache ===

impl BlobCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn get(&self, digest: &str) -> Option<Vec<u8>> {
        let path = self.path_for(digest)?;
        tokio::fs::read(&path).await.ok()
    }

    pub async fn put(&self, digest: &str, bytes: &[u8]) -> std::io::Result<()> {
        let path = self
            .path_for(digest)
            .ok_or_else(|| std::io::Error::other(format!("malformed digest {digest:?}")))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            WRITE_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    fn path_for(&self, digest: &str) -> Option<PathBuf> {
        let (algorithm, hex) = digest.split_once(':')?;
        if algorithm.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.dir.join(algorithm).join(hex))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
