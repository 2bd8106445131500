//! Local filesystem storage backend.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ObjectWriter, StorageBackend};
use crate::error::{Result, SluiceError};

/// Suffix of in-flight writes; never returned by `list`.
const PARTIAL_SUFFIX: &str = ".partial";

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage backend.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of this backend.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SluiceError::InvalidFormat(format!(
                "storage key must be relative and stay inside the root: {key}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl StorageBackend for LocalStorage {
    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.key_to_path(key)?;
        let file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                SluiceError::NotFound(key.to_string())
            } else {
                SluiceError::Io(e)
            }
        })?;
        Ok(Box::new(file))
    }

    fn create(&self, key: &str) -> Result<Box<dyn ObjectWriter>> {
        let target = self.key_to_path(key)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut partial = target.clone().into_os_string();
        partial.push(format!(".{}.{seq}{PARTIAL_SUFFIX}", std::process::id()));
        let partial = PathBuf::from(partial);
        let file = File::create(&partial)?;
        Ok(Box::new(LocalObjectWriter {
            writer: Some(BufWriter::new(file)),
            partial,
            target,
        }))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        std::fs::remove_file(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                SluiceError::NotFound(key.to_string())
            } else {
                SluiceError::Io(e)
            }
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.key_to_path(key)?.is_file())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Walk the deepest directory implied by the prefix, then filter on the full prefix.
        let search_dir = match prefix.rfind('/') {
            Some(idx) => self.key_to_path(&prefix[..idx])?,
            None => self.root.clone(),
        };

        if !search_dir.exists() {
            return Ok(vec![]);
        }

        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&search_dir).follow_links(true) {
            let entry = entry.map_err(|e| SluiceError::Storage(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) && !key.ends_with(PARTIAL_SUFFIX) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

struct LocalObjectWriter {
    writer: Option<BufWriter<File>>,
    partial: PathBuf,
    target: PathBuf,
}

impl Write for LocalObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "writer already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl ObjectWriter for LocalObjectWriter {
    fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let file = writer
                .into_inner()
                .map_err(|e| SluiceError::Io(e.into_error()))?;
            file.sync_all()?;
        }
        std::fs::rename(&self.partial, &self.target)?;
        Ok(())
    }
}

impl Drop for LocalObjectWriter {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = std::fs::remove_file(&self.partial);
        }
    }
}
