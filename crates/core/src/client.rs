//! Request layer: a client bound to a backend and its storage spaces
//!
//! `DataClient` checks access and input before anything is queued, so bad
//! requests fail at the call site instead of as a `Failed` transfer.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::auth::Authorization;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::{ByteSource, FileSink, MemorySource, ReaderSource};
use crate::path::{ObjectPath, normalize_key};
use crate::profile::Profile;
use crate::space::{Operation, Space};
use crate::traits::{Backend, ChunkTransport, ObjectInfo, UploadMetadata};
use crate::transfer::{
    DownloadRequest, TransferConfig, TransferEngine, TransferHandler, UploadRequest,
};

/// Everything a [`DataClient`] needs at construction
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transfer: TransferConfig,
    pub authorization: Authorization,
    /// Spaces that can be read without a token
    pub public_spaces: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            authorization: Authorization::Anonymous,
            public_spaces: vec!["public".to_string()],
        }
    }
}

impl ClientConfig {
    /// Build from the loaded configuration file and an optional token
    pub fn from_config(config: &Config, token: Option<String>) -> Self {
        Self {
            transfer: TransferConfig::from(&config.defaults),
            authorization: Authorization::from_token(token),
            public_spaces: config.defaults.public_spaces.clone(),
        }
    }

    /// Build for one profile; its token and retry override take precedence
    /// over the file-wide defaults
    pub fn from_profile(config: &Config, profile: &Profile) -> Self {
        let retry = profile.retry_config(&config.defaults.retry);
        Self {
            transfer: TransferConfig::from(&config.defaults).with_retry(retry),
            authorization: Authorization::from_token(profile.token.clone()),
            public_spaces: config.defaults.public_spaces.clone(),
        }
    }

    pub fn with_authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = authorization;
        self
    }
}

struct ClientInner {
    backend: Arc<dyn Backend>,
    engine: TransferEngine,
    authorization: Authorization,
    public_spaces: Vec<String>,
}

/// Entry point for talking to a storage backend
#[derive(Clone)]
pub struct DataClient {
    inner: Arc<ClientInner>,
}

impl DataClient {
    /// Create a client; must be called from within a tokio runtime
    pub fn new(backend: Arc<dyn Backend>, config: ClientConfig) -> Result<Self> {
        let transport: Arc<dyn ChunkTransport> = backend.clone();
        let engine = TransferEngine::new(transport, config.transfer)?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                backend,
                engine,
                authorization: config.authorization,
                public_spaces: config.public_spaces,
            }),
        })
    }

    /// A handle to the space called `name`
    pub fn storage(&self, name: &str) -> Result<Storage> {
        let space = Space::resolve(name, &self.inner.public_spaces)?;
        Ok(Storage {
            client: self.inner.clone(),
            space,
        })
    }

    /// Metadata of the object at `path`, written `space/key`
    pub async fn head(&self, path: &str) -> Result<ObjectInfo> {
        let (storage, path) = self.locate(path)?;
        storage.head(&path.key).await
    }

    /// Download the object at `path`, written `space/key`, into memory
    pub fn download(&self, path: &str) -> Result<TransferHandler> {
        let (storage, path) = self.locate(path)?;
        storage.download(&path.key)
    }

    fn locate(&self, path: &str) -> Result<(Storage, ObjectPath)> {
        let path: ObjectPath = path.parse()?;
        if path.is_dir() {
            return Err(Error::InvalidPath(format!(
                "'{path}' names a space or prefix, not an object"
            )));
        }
        Ok((self.storage(&path.space)?, path))
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.inner.engine
    }

    pub fn authorization(&self) -> &Authorization {
        &self.inner.authorization
    }
}

impl std::fmt::Debug for DataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataClient")
            .field("authorization", &self.inner.authorization)
            .field("public_spaces", &self.inner.public_spaces)
            .finish_non_exhaustive()
    }
}

/// Operations on one storage space
#[derive(Clone)]
pub struct Storage {
    client: Arc<ClientInner>,
    space: Space,
}

impl Storage {
    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Fetch object metadata
    pub async fn head(&self, key: &str) -> Result<ObjectInfo> {
        self.check(Operation::Read, "head(...)")?;
        let key = normalize_key(key);
        self.client
            .backend
            .head_object(self.space.name(), &key, &self.client.authorization)
            .await
    }

    /// Whether an object exists under `key`
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.check(Operation::Read, "exists(...)")?;
        let key = normalize_key(key);
        self.client
            .backend
            .object_exists(self.space.name(), &key, &self.client.authorization)
            .await
    }

    /// Upload an in-memory buffer
    pub fn upload_bytes(&self, data: impl Into<Bytes>, key: &str) -> Result<TransferHandler> {
        self.check(Operation::Write, "upload(...)")?;
        let key = normalize_key(key);
        let metadata = metadata_for(Path::new(&key));
        Ok(self.start_upload(MemorySource::new(data), &key, metadata))
    }

    /// Upload a local file; the path must name an existing regular file
    pub async fn upload_file(&self, path: impl AsRef<Path>, key: &str) -> Result<TransferHandler> {
        self.check(Operation::Write, "upload(...)")?;
        let path = path.as_ref();
        let source = ReaderSource::open_file(path).await?;
        let key = normalize_key(key);
        Ok(self.start_upload(source, &key, metadata_for(path)))
    }

    /// Upload from an async reader; `length`, when given, must be exact
    pub fn upload_reader<R>(
        &self,
        reader: R,
        length: Option<u64>,
        key: &str,
    ) -> Result<TransferHandler>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.check(Operation::Write, "upload(...)")?;
        let key = normalize_key(key);
        let metadata = metadata_for(Path::new(&key));
        Ok(self.start_upload(ReaderSource::new(reader, length), &key, metadata))
    }

    /// Download into memory; read the payload with [`TransferHandler::data`].
    ///
    /// Objects stored in parts (`key.000`, `key.001`, ...) are joined.
    pub fn download(&self, key: &str) -> Result<TransferHandler> {
        self.check(Operation::Read, "download(...)")?;
        Ok(self.client.engine.download(self.download_request(key)))
    }

    /// Download into `destination`.
    ///
    /// An existing directory is always rejected; an existing file only
    /// unless `force` is set.
    pub async fn download_to_file(
        &self,
        key: &str,
        destination: impl AsRef<Path>,
        force: bool,
    ) -> Result<TransferHandler> {
        self.check(Operation::Read, "download(...)")?;
        let destination = destination.as_ref();
        match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.is_dir() => {
                return Err(Error::InvalidPath(format!(
                    "The path '{}' already exists and is a directory",
                    destination.display()
                )));
            }
            Ok(_) if !force => {
                return Err(Error::Conflict(format!(
                    "The destination file '{}' already exists; use force to overwrite it",
                    destination.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let sink = FileSink::create(destination).await?;
        let request = self.download_request(key).sink(sink);
        Ok(self.client.engine.download(request))
    }

    fn download_request(&self, key: &str) -> DownloadRequest {
        DownloadRequest::new(self.space.name(), key)
            .split_parts(true)
            .authorization(self.client.authorization.clone())
    }

    fn check(&self, op: Operation, resource: &str) -> Result<()> {
        self.space.check(op, &self.client.authorization, resource)
    }

    fn start_upload(
        &self,
        source: impl ByteSource + 'static,
        key: &str,
        metadata: UploadMetadata,
    ) -> TransferHandler {
        let request = UploadRequest::new(self.space.name(), key, source)
            .metadata(metadata)
            .authorization(self.client.authorization.clone());
        self.client.engine.upload(request)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("space", &self.space).finish()
    }
}

fn metadata_for(path: &Path) -> UploadMetadata {
    UploadMetadata {
        content_type: mime_guess::from_path(path).first().map(|m| m.to_string()),
        ..UploadMetadata::default()
    }
}
