//! File sources for the sender and the chunking heuristics that depend on
//! them.

use crate::core::config::{CHUNK_SIZE_MAX, CHUNK_SIZE_TIERS};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// A file offered for sending: `(name, size, mime type, byte stream)`.
///
/// `open` may be called more than once; each call yields a fresh stream
/// from the beginning (once to hash, once to send).
#[async_trait]
pub trait FileSource: Send + Sync {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn mime_type(&self) -> &str;
    async fn open(&self) -> io::Result<ByteStream>;
}

/// In-memory file.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    mime_type: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let mime_type = guess_mime_type(&name).to_string();
        Self {
            name,
            mime_type,
            data: data.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

#[async_trait]
impl FileSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn open(&self) -> io::Result<ByteStream> {
        Ok(Box::new(io::Cursor::new(self.data.clone())))
    }
}

/// File on the local filesystem.
#[derive(Debug, Clone)]
pub struct DiskSource {
    path: PathBuf,
    name: String,
    size: u64,
    mime_type: String,
}

impl DiskSource {
    pub async fn from_path(path: &Path) -> io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = guess_mime_type(&name).to_string();
        Ok(Self {
            path: path.to_path_buf(),
            name,
            size: meta.len(),
            mime_type,
        })
    }
}

#[async_trait]
impl FileSource for DiskSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn open(&self) -> io::Result<ByteStream> {
        Ok(Box::new(tokio::fs::File::open(&self.path).await?))
    }
}

/// Chunk size for a file of `size` bytes.
pub fn chunk_size_for(size: u64) -> usize {
    CHUNK_SIZE_TIERS
        .iter()
        .find(|(ceiling, _)| size < *ceiling)
        .map(|(_, chunk)| *chunk)
        .unwrap_or(CHUNK_SIZE_MAX)
}

const TEXTUAL_EXTENSIONS: [&str; 9] = ["txt", "json", "xml", "html", "css", "js", "md", "csv", "log"];

/// Whether a file is worth compressing, judged from its name and type.
pub fn should_compress(name: &str, mime_type: &str) -> bool {
    let mime = mime_type.to_ascii_lowercase();
    if mime.starts_with("text/") || mime == "application/json" || mime == "application/xml" {
        return true;
    }
    extension_of(name)
        .map(|ext| TEXTUAL_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Best-effort mime type from a file name.
pub fn guess_mime_type(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("md") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Read up to `size` bytes, stopping early only at end of stream.
pub async fn read_chunk(reader: &mut ByteStream, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_tiers() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(chunk_size_for(0), 32 * 1024);
        assert_eq!(chunk_size_for(MIB - 1), 32 * 1024);
        assert_eq!(chunk_size_for(MIB), 64 * 1024);
        assert_eq!(chunk_size_for(10 * MIB - 1), 64 * 1024);
        assert_eq!(chunk_size_for(10 * MIB), 128 * 1024);
        assert_eq!(chunk_size_for(100 * MIB - 1), 128 * 1024);
        assert_eq!(chunk_size_for(100 * MIB), 256 * 1024);
        assert_eq!(chunk_size_for(u64::MAX), 256 * 1024);
    }

    #[test]
    fn test_should_compress() {
        assert!(should_compress("server.LOG", "application/octet-stream"));
        assert!(should_compress("data", "application/json"));
        assert!(should_compress("page", "text/html; charset=utf-8"));
        assert!(!should_compress("photo.jpg", "image/jpeg"));
        assert!(!should_compress("archive.zip", "application/zip"));
        assert!(!should_compress("noext", ""));
    }

    #[tokio::test]
    async fn test_read_chunk_splits_stream() {
        let src = MemorySource::new("a.bin", vec![1u8; 10]);
        let mut stream = src.open().await.unwrap();
        assert_eq!(read_chunk(&mut stream, 4).await.unwrap().len(), 4);
        assert_eq!(read_chunk(&mut stream, 4).await.unwrap().len(), 4);
        assert_eq!(read_chunk(&mut stream, 4).await.unwrap().len(), 2);
        assert!(read_chunk(&mut stream, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disk_source_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, b"a,b\n1,2\n").unwrap();

        let src = DiskSource::from_path(&path).await.unwrap();
        assert_eq!(src.name(), "report.csv");
        assert_eq!(src.size(), 8);
        assert_eq!(src.mime_type(), "text/csv");

        assert!(DiskSource::from_path(dir.path()).await.is_err());
    }
}
