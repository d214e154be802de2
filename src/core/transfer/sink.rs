//! Download sinks: where completed files and archives end up.

use crate::utils::atomic_write::atomic_write;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Consumes a completed `(bytes, name)` pair.
///
/// Called from the blocking pool, so implementations may do synchronous I/O.
pub trait DownloadSink: Send + Sync {
    /// Store the bytes and return where they went, if anywhere.
    fn deliver(&self, name: &str, bytes: &[u8]) -> Result<Option<PathBuf>>;

    /// Store the bytes under `name`, replacing an earlier delivery of the
    /// same name. Used for artifacts that are rebuilt, like the archive.
    fn replace(&self, name: &str, bytes: &[u8]) -> Result<Option<PathBuf>> {
        self.deliver(name, bytes)
    }
}

/// Writes downloads into a directory, never overwriting existing files.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DownloadSink for DirectorySink {
    fn deliver(&self, name: &str, bytes: &[u8]) -> Result<Option<PathBuf>> {
        let path = unique_path(&self.root.join(sanitize_file_name(name)));
        atomic_write(&path, bytes)?;
        Ok(Some(path))
    }

    fn replace(&self, name: &str, bytes: &[u8]) -> Result<Option<PathBuf>> {
        let path = self.root.join(sanitize_file_name(name));
        atomic_write(&path, bytes)?;
        Ok(Some(path))
    }
}

/// Reduce a peer-supplied name to one safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .last()
        .unwrap_or("");
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')'))
        .collect();
    let safe = safe.trim().trim_start_matches('.').to_string();
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe
    }
}

/// `name.ext`, then `name (1).ext`, `name (2).ext`, ... until one is free.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| path.with_file_name(format!("{stem} ({n}){ext}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}
