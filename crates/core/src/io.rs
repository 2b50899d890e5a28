//! Byte sources and sinks
//!
//! A transfer task owns exactly one source (uploads) or sink (downloads) for
//! its whole run. Sinks release their resources on every exit path: `finish`
//! on success, `abandon` on failure or cancellation, and `Drop` as the
//! backstop if neither ran.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// Sequential reader feeding an upload
#[async_trait]
pub trait ByteSource: Send {
    /// Total payload length, if known up front
    fn total_len(&self) -> Option<u64>;

    /// Read up to `max_len` bytes; an empty buffer means end of stream.
    /// Every chunk except the last is exactly `max_len` bytes.
    async fn read_chunk(&mut self, max_len: usize) -> Result<Bytes>;
}

/// Sequential writer receiving a download
#[async_trait]
pub trait ByteSink: Send {
    /// Append a chunk
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Commit the written bytes; in-memory sinks hand back the payload
    async fn finish(&mut self) -> Result<Option<Bytes>>;

    /// Discard everything written so far
    async fn abandon(&mut self) -> Result<()>;
}

/// Upload source over an in-memory buffer
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    position: usize,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    fn total_len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn read_chunk(&mut self, max_len: usize) -> Result<Bytes> {
        let end = (self.position + max_len).min(self.data.len());
        let chunk = self.data.slice(self.position..end);
        self.position = end;
        Ok(chunk)
    }
}

/// Upload source over any async reader
pub struct ReaderSource<R> {
    reader: R,
    total: Option<u64>,
    consumed: u64,
}

impl<R: AsyncRead + Unpin + Send> ReaderSource<R> {
    /// Wrap a reader; `total` bounds the read and is checked at end of stream
    pub fn new(reader: R, total: Option<u64>) -> Self {
        Self {
            reader,
            total,
            consumed: 0,
        }
    }
}

impl ReaderSource<tokio::fs::File> {
    /// Open a regular file as an upload source
    pub async fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::InvalidPath(format!(
                "The file {} does not exist or is not a regular file",
                path.display()
            )));
        }
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(file, Some(metadata.len())))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for ReaderSource<R> {
    fn total_len(&self) -> Option<u64> {
        self.total
    }

    async fn read_chunk(&mut self, max_len: usize) -> Result<Bytes> {
        let want = match self.total {
            Some(total) => max_len.min((total - self.consumed) as usize),
            None => max_len,
        };

        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.consumed += filled as u64;

        if let Some(total) = self.total
            && filled < want
        {
            return Err(Error::General(format!(
                "Source ended after {} of {total} declared bytes",
                self.consumed
            )));
        }

        Ok(Bytes::from(buf))
    }
}

/// Download sink accumulating the payload in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: BytesMut,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size the buffer when the download length is known
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<Option<Bytes>> {
        Ok(Some(std::mem::take(&mut self.buf).freeze()))
    }

    async fn abandon(&mut self) -> Result<()> {
        self.buf.clear();
        Ok(())
    }
}

/// Download sink writing to `<dest>.part` and renaming on completion
#[derive(Debug)]
pub struct FileSink {
    destination: PathBuf,
    part_path: PathBuf,
    file: Option<tokio::fs::File>,
    settled: bool,
}

impl FileSink {
    /// Create the partial file next to `destination`
    pub async fn create(destination: impl Into<PathBuf>) -> Result<Self> {
        let destination = destination.into();
        let part_path = part_path_for(&destination);
        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&part_path).await?;
        Ok(Self {
            destination,
            part_path,
            file: Some(file),
            settled: false,
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }
}

fn part_path_for(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

#[async_trait]
impl ByteSink for FileSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::InvalidState("file sink already closed".into()))?;
        file.write_all(chunk).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<Option<Bytes>> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::InvalidState("file sink already closed".into()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&self.part_path, &self.destination).await?;
        self.settled = true;
        Ok(None)
    }

    async fn abandon(&mut self) -> Result<()> {
        self.file.take();
        self.settled = true;
        match tokio::fs::remove_file(&self.part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if !self.settled {
            self.file.take();
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_source_chunks() {
        let mut source = MemorySource::new(vec![7u8; 25]);
        assert_eq!(source.total_len(), Some(25));
        assert_eq!(source.read_chunk(10).await.unwrap().len(), 10);
        assert_eq!(source.read_chunk(10).await.unwrap().len(), 10);
        assert_eq!(source.read_chunk(10).await.unwrap().len(), 5);
        assert!(source.read_chunk(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reader_source_fills_chunks() {
        let data: Vec<u8> = (0..=255).collect();
        let mut source = ReaderSource::new(&data[..], None);
        assert_eq!(source.total_len(), None);
        let first = source.read_chunk(100).await.unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(first[99], 99);
        assert_eq!(source.read_chunk(100).await.unwrap().len(), 100);
        assert_eq!(source.read_chunk(100).await.unwrap().len(), 56);
        assert!(source.read_chunk(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reader_source_short_stream_errors() {
        let data = [1u8; 10];
        let mut source = ReaderSource::new(&data[..], Some(20));
        let result = source.read_chunk(64).await;
        assert!(matches!(result, Err(Error::General(_))));
    }

    #[tokio::test]
    async fn test_reader_source_stops_at_declared_length() {
        let data = [1u8; 30];
        let mut source = ReaderSource::new(&data[..], Some(12));
        assert_eq!(source.read_chunk(64).await.unwrap().len(), 12);
        assert!(source.read_chunk(64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_file_rejects_directory() {
        let dir = TempDir::new().unwrap();
        let result = ReaderSource::open_file(dir.path()).await;
        assert!(matches!(result, Err(Error::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_memory_sink_roundtrip() {
        let mut sink = MemorySink::new();
        sink.write_chunk(b"hello ").await.unwrap();
        sink.write_chunk(b"world").await.unwrap();
        let data = sink.finish().await.unwrap().unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn test_file_sink_renames_on_finish() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");

        let mut sink = FileSink::create(&dest).await.unwrap();
        let part = sink.part_path().to_path_buf();
        assert!(part.exists());
        sink.write_chunk(b"abc").await.unwrap();
        assert!(sink.finish().await.unwrap().is_none());

        assert!(!part.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_file_sink_abandon_removes_partial() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");

        let mut sink = FileSink::create(&dest).await.unwrap();
        let part = sink.part_path().to_path_buf();
        sink.write_chunk(b"abc").await.unwrap();
        sink.abandon().await.unwrap();

        assert!(!part.exists());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_file_sink_drop_removes_partial() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested/out.bin");

        let sink = FileSink::create(&dest).await.unwrap();
        let part = sink.part_path().to_path_buf();
        assert!(part.ends_with("out.bin.part"));
        drop(sink);

        assert!(!part.exists());
    }
}
