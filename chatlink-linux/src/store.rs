//! File store: where received files land, and how outbound files are read.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chatlink_core::DEFAULT_FILE_NAME;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// A local file loaded for sending.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub name: String,
    pub contents: Bytes,
}

/// Directory-backed store for received files.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `data` under the final component of `name`; an existing file is overwritten.
    pub async fn save(&self, name: &str, data: &[u8]) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(safe_file_name(name));
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Open a file for sending. Returns the handle and its length in bytes.
    pub async fn open_for_read(&self, path: &Path) -> io::Result<(File, u64)> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Read a whole file for fan-out to every peer.
    pub async fn load(&self, path: &Path) -> io::Result<OutboundFile> {
        let (mut file, size) = self.open_for_read(path).await?;
        let mut contents = Vec::with_capacity(size as usize);
        file.read_to_end(&mut contents).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
        Ok(OutboundFile {
            name,
            contents: Bytes::from(contents),
        })
    }
}

/// Names come off the wire: keep only the last path component.
fn safe_file_name(name: &str) -> String {
    let last = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("");
    match last {
        "" | "." | ".." => DEFAULT_FILE_NAME.to_string(),
        other => other.to_string(),
    }
}
