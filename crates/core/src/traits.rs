//! Backend trait definitions
//!
//! `ChunkTransport` is the contract the transfer engine drives: one network
//! operation per call, with errors classified as transient or permanent.
//! `ObjectStore` covers the metadata calls made by the request layer.
//! Both are implemented by the S3 adapter and can be mocked for testing.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::auth::Authorization;
use crate::error::Result;

/// Metadata for an object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object key
    pub key: String,

    /// Size in bytes
    pub size_bytes: u64,

    /// Human-readable size
    pub size_human: String,

    /// Last modified timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<jiff::Timestamp>,

    /// ETag (usually MD5 for single-part uploads)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// Content type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// User metadata attached at upload time
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ObjectInfo {
    /// Create a new ObjectInfo for a stored object
    pub fn file(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size_bytes: size,
            size_human: humansize::format_size(size, humansize::BINARY),
            last_modified: None,
            etag: None,
            content_type: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Metadata sent when opening an upload session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    /// MIME type of the payload
    pub content_type: Option<String>,

    /// Total payload length, when known up front
    pub content_length: Option<u64>,

    /// User metadata stored alongside the object
    pub user: BTreeMap<String, String>,
}

/// Backend-assigned handle for an open upload or download session
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    /// Session identifier (multipart upload id, or a local id for downloads)
    pub id: String,
    /// Space the session targets
    pub space: String,
    /// Object key the session targets
    pub key: String,
}

/// User metadata entry holding the number of parts of a split object
pub const PARTS_METADATA_KEY: &str = "number-of-parts";

/// Key of part `index` of an object stored split as `key.000`, `key.001`, ...
pub fn split_part_key(key: &str, index: u32) -> String {
    format!("{key}.{index:03}")
}

/// An opened download and its length, if the backend reported one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSession {
    pub session: SessionHandle,
    pub total_bytes: Option<u64>,
    /// User metadata of the object, when the backend probes it
    pub metadata: BTreeMap<String, String>,
}

/// Outcome of a single chunk read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRead {
    /// Bytes starting at the requested offset
    Data(Bytes),
    /// No bytes remain at the requested offset
    Eof,
}

/// One network operation at a time against the remote store
///
/// Implementations report transient failures as `Error::Network` and
/// permanent ones as `Auth`, `NotFound` or `QuotaExceeded`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Start an upload session for `key` in `space`
    async fn open_upload(
        &self,
        space: &str,
        key: &str,
        metadata: &UploadMetadata,
        auth: &Authorization,
    ) -> Result<SessionHandle>;

    /// Send the chunk that starts at `offset`
    ///
    /// Re-sending an offset that was already accepted must be harmless.
    async fn send_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        chunk: Bytes,
        auth: &Authorization,
    ) -> Result<()>;

    /// Commit the upload
    async fn finalize_upload(&self, session: &SessionHandle, auth: &Authorization) -> Result<()>;

    /// Discard the upload; best-effort
    async fn abort_upload(&self, session: &SessionHandle, auth: &Authorization) -> Result<()>;

    /// Start a download session, probing the object length
    async fn open_download(
        &self,
        space: &str,
        key: &str,
        auth: &Authorization,
    ) -> Result<DownloadSession>;

    /// Read up to `max_len` bytes starting at `offset`
    async fn receive_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        max_len: u64,
        auth: &Authorization,
    ) -> Result<ChunkRead>;
}

/// Metadata operations used by the request layer
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get object metadata
    async fn head_object(&self, space: &str, key: &str, auth: &Authorization)
    -> Result<ObjectInfo>;

    /// Check whether an object exists
    async fn object_exists(&self, space: &str, key: &str, auth: &Authorization) -> Result<bool> {
        match self.head_object(space, key, auth).await {
            Ok(_) => Ok(true),
            Err(crate::Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A complete storage backend
pub trait Backend: ChunkTransport + ObjectStore {}

impl<T: ChunkTransport + ObjectStore> Backend for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_info_file() {
        let info = ObjectInfo::file("dir/f.bin", 2048);
        assert_eq!(info.key, "dir/f.bin");
        assert_eq!(info.size_bytes, 2048);
        assert_eq!(info.size_human, "2 KiB");
        assert!(info.metadata.is_empty());
    }

    #[test]
    fn test_split_part_key() {
        assert_eq!(split_part_key("logs/run.bag", 0), "logs/run.bag.000");
        assert_eq!(split_part_key("k", 12), "k.012");
        assert_eq!(split_part_key("k", 1234), "k.1234");
    }

    #[test]
    fn test_object_info_serializes_without_empty_fields() {
        let info = ObjectInfo::file("a", 1);
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("etag").is_none());
        assert!(json.get("metadata").is_none());
        assert_eq!(json["size_bytes"], 1);
    }
}
