//! On-disk tile cache.
//!
//! Tiles live at `<root>/<layer>/zoom_<z>/<x>/<y>.<ext>`. The cache is
//! unbounded and never evicts; directories are created on first write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::tile::TileKey;

/// Distinguishes temporary files of concurrent writers.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A directory of cached tile payloads.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Create a cache rooted at `root`. Nothing is touched on disk until the
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a tile payload.
    #[must_use]
    pub fn path_for(&self, layer: &str, key: TileKey, extension: &str) -> PathBuf {
        self.root
            .join(layer)
            .join(format!("zoom_{}", key.zoom))
            .join(key.x.to_string())
            .join(format!("{}.{extension}", key.y))
    }

    /// Read a cached payload synchronously. A missing file is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file exists but cannot be read.
    pub fn read(&self, layer: &str, key: TileKey, extension: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(layer, key, extension);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("disk cache read", &path, &e)),
        }
    }

    /// Write a payload, replacing any previous one.
    ///
    /// The data goes to a temporary sibling first and is renamed into place,
    /// so readers never observe a partial file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a directory or the file cannot be written.
    pub async fn write(
        &self,
        layer: &str,
        key: TileKey,
        extension: &str,
        data: &[u8],
    ) -> Result<()> {
        let path = self.path_for(layer, key, extension);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("disk cache create directory", parent, &e))?;
        }

        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("{extension}.tmp{seq}"));
        tokio::fs::write(&tmp_path, data)
            .await
            .map_err(|e| io_error("disk cache write", &tmp_path, &e))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(io_error("disk cache rename", &path, &e));
        }

        tracing::trace!(path = %path.display(), bytes = data.len(), "Cached to disk");
        Ok(())
    }
}

fn io_error(operation: &'static str, path: &Path, e: &std::io::Error) -> Error {
    Error::Io {
        operation,
        message: format!("{}: {e}", path.display()),
    }
}
