//! Durable line store for target lists, status snapshots and observations.
//!
//! The watcher only needs two operations: append lines to a named file
//! (optionally rewriting it) and read lines back. `FileStore` implements
//! them on the local filesystem under a root directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::{Error, Result};

/// Append-only line storage addressed by `(folder, file)`.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Append one line per entry to `folder/file`, creating both if absent.
    ///
    /// With `truncate_first` the existing content is discarded before writing.
    async fn append(
        &self,
        folder: &str,
        file: &str,
        lines: &[String],
        truncate_first: bool,
    ) -> Result<()>;

    /// Read all lines of `folder/file`. A missing file reads as empty.
    async fn read_lines(&self, folder: &str, file: &str) -> Result<Vec<String>>;
}

/// Filesystem-backed [`DurableStore`].
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the path of `folder/file` under the store root.
    pub fn path_of(&self, folder: &str, file: &str) -> PathBuf {
        self.root.join(folder).join(file)
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn append(
        &self,
        folder: &str,
        file: &str,
        lines: &[String],
        truncate_first: bool,
    ) -> Result<()> {
        let dir = self.root.join(folder);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::store("creating directory", &dir, e))?;

        let path = dir.join(file);
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true);
        if truncate_first {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }

        let mut handle = options
            .open(&path)
            .await
            .map_err(|e| Error::store("opening", &path, e))?;

        let mut buffer = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            buffer.push_str(line);
            buffer.push('\n');
        }

        handle
            .write_all(buffer.as_bytes())
            .await
            .map_err(|e| Error::store("writing", &path, e))?;
        handle
            .flush()
            .await
            .map_err(|e| Error::store("flushing", &path, e))?;

        trace!(path = %path.display(), lines = lines.len(), truncate_first, "Appended lines");
        Ok(())
    }

    async fn read_lines(&self, folder: &str, file: &str) -> Result<Vec<String>> {
        let path = self.path_of(folder, file);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content
                .lines()
                .map(|line| line.trim_end_matches('\r').to_string())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::store("reading", &path, e)),
        }
    }
}
