//! Transfer engine: creates tasks, spawns them and hands out handlers

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use super::handler::TransferHandler;
use super::observer::ObserverList;
use super::registry::TransferRegistry;
use super::status::{Direction, TransferId};
use super::task::{Payload, TaskShared, TransferTask};
use crate::auth::Authorization;
use crate::config::{DEFAULT_CHUNK_SIZE, Defaults};
use crate::error::{Error, Result};
use crate::io::{ByteSink, ByteSource, MemorySink};
use crate::path::normalize_key;
use crate::profile::RetryConfig;
use crate::traits::{ChunkTransport, UploadMetadata};

/// Tunables applied to every transfer an engine starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes moved per network operation; the final chunk may be shorter
    pub chunk_size: u64,
    pub retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

impl From<&Defaults> for TransferConfig {
    fn from(defaults: &Defaults) -> Self {
        Self {
            chunk_size: defaults.chunk_size,
            retry: defaults.retry.clone(),
        }
    }
}

impl TransferConfig {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".into()));
        }
        if usize::try_from(self.chunk_size).is_err() {
            return Err(Error::Config(format!(
                "chunk_size {} does not fit in memory",
                self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Everything needed to start an upload
pub struct UploadRequest {
    space: String,
    key: String,
    source: Box<dyn ByteSource>,
    metadata: UploadMetadata,
    authorization: Authorization,
}

impl UploadRequest {
    pub fn new(
        space: impl Into<String>,
        key: impl AsRef<str>,
        source: impl ByteSource + 'static,
    ) -> Self {
        let source: Box<dyn ByteSource> = Box::new(source);
        let metadata = UploadMetadata {
            content_length: source.total_len(),
            ..UploadMetadata::default()
        };
        Self {
            space: space.into(),
            key: normalize_key(key.as_ref()),
            source,
            metadata,
            authorization: Authorization::Anonymous,
        }
    }

    /// Replace the metadata; the content length still follows the source
    pub fn metadata(mut self, metadata: UploadMetadata) -> Self {
        let content_length = self.source.total_len();
        self.metadata = UploadMetadata {
            content_length,
            ..metadata
        };
        self
    }

    pub fn authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = authorization;
        self
    }
}

/// Everything needed to start a download
pub struct DownloadRequest {
    space: String,
    key: String,
    sink: Box<dyn ByteSink>,
    authorization: Authorization,
    split_parts: bool,
}

impl DownloadRequest {
    /// Download into memory; the payload is available from
    /// [`TransferHandler::data`] once completed.
    pub fn new(space: impl Into<String>, key: impl AsRef<str>) -> Self {
        Self {
            space: space.into(),
            key: normalize_key(key.as_ref()),
            sink: Box::new(MemorySink::new()),
            authorization: Authorization::Anonymous,
            split_parts: false,
        }
    }

    pub fn sink(mut self, sink: impl ByteSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = authorization;
        self
    }

    /// When the key is missing, look for the object stored in parts
    /// (`key.000`, `key.001`, ...) and join them in order.
    pub fn split_parts(mut self, enabled: bool) -> Self {
        self.split_parts = enabled;
        self
    }
}

/// Starts transfers on a tokio runtime and keeps track of them
///
/// Starting a transfer never blocks: the engine spawns the task and returns
/// its handler straight away.
pub struct TransferEngine {
    transport: Arc<dyn ChunkTransport>,
    config: TransferConfig,
    runtime: Handle,
    registry: Arc<TransferRegistry>,
    next_id: AtomicU64,
}

impl TransferEngine {
    /// Create an engine bound to the runtime of the calling context
    pub fn new(transport: Arc<dyn ChunkTransport>, config: TransferConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::InvalidState(format!("Transfer engine needs a tokio runtime: {e}"))
        })?;
        Self::with_runtime(transport, config, runtime)
    }

    /// Create an engine that spawns its transfers on `runtime`
    pub fn with_runtime(
        transport: Arc<dyn ChunkTransport>,
        config: TransferConfig,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            config,
            runtime,
            registry: Arc::new(TransferRegistry::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }

    /// Start an upload and return its handler immediately
    pub fn upload(&self, request: UploadRequest) -> TransferHandler {
        let UploadRequest {
            space,
            key,
            source,
            metadata,
            authorization,
        } = request;
        let total = source.total_len();
        self.spawn(
            Direction::Upload,
            space,
            key,
            total,
            authorization,
            Payload::Upload { source, metadata },
        )
    }

    /// Start a download and return its handler immediately
    pub fn download(&self, request: DownloadRequest) -> TransferHandler {
        let DownloadRequest {
            space,
            key,
            sink,
            authorization,
            split_parts,
        } = request;
        self.spawn(
            Direction::Download,
            space,
            key,
            None,
            authorization,
            Payload::Download { sink, split_parts },
        )
    }

    fn spawn(
        &self,
        direction: Direction,
        space: String,
        key: String,
        total_bytes: Option<u64>,
        authorization: Authorization,
        payload: Payload,
    ) -> TransferHandler {
        let id = TransferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let observers = ObserverList::new(id.to_string(), self.runtime.clone());
        let shared = Arc::new(TaskShared::new(
            id,
            direction,
            space,
            key,
            total_bytes,
            observers,
        ));
        self.registry.insert(&shared);

        tracing::debug!(
            transfer = %id,
            %direction,
            space = %shared.space,
            key = %shared.key,
            total = ?total_bytes,
            "Transfer requested"
        );

        let task = TransferTask::new(
            shared.clone(),
            self.transport.clone(),
            authorization,
            self.config.clone(),
        );
        self.runtime.spawn(task.run(payload));

        TransferHandler::new(shared)
    }

    /// Cancel every live transfer and wait for them to settle.
    ///
    /// Returns true if all of them reached a terminal state before `timeout`.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        self.registry.cancel_all();
        let live = self.registry.live();
        let waits = live.iter().map(|shared| shared.terminal());
        let all = futures::future::join_all(waits);
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, all).await.is_ok(),
            None => {
                all.await;
                true
            }
        }
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
