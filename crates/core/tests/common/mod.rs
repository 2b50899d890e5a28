//! In-memory backend shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{Notify, mpsc, oneshot};

use stowage_core::transfer::{TransferEvent, TransferHandler, TransferStatus};
use stowage_core::{
    Authorization, ChunkRead, ChunkTransport, DownloadSession, Error, ObjectInfo, ObjectStore,
    PARTS_METADATA_KEY, Result, SessionHandle, UploadMetadata, split_part_key,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Call counters per transport operation
#[derive(Debug, Default)]
pub struct Calls {
    pub open_upload: AtomicUsize,
    pub send_chunk: AtomicUsize,
    pub finalize: AtomicUsize,
    pub abort: AtomicUsize,
    pub open_download: AtomicUsize,
    pub receive_chunk: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct OpenUpload {
    space: String,
    key: String,
    buffer: BytesMut,
    metadata: UploadMetadata,
}

struct Gate {
    at_call: usize,
    reached: Option<oneshot::Sender<()>>,
    release: Arc<Notify>,
}

/// Returned by [`FakeBackend::gate_send`]: the send is parked until released
pub struct GateHandle {
    pub reached: oneshot::Receiver<()>,
    pub release: Arc<Notify>,
}

/// A store keeping objects in memory, with failure injection
#[derive(Default)]
pub struct FakeBackend {
    objects: Mutex<HashMap<(String, String), (Bytes, UploadMetadata)>>,
    uploads: Mutex<HashMap<String, OpenUpload>>,
    next_session: AtomicU64,
    transient_failures: AtomicU32,
    hide_total: AtomicBool,
    gate: Mutex<Option<Gate>>,
    pub calls: Calls,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, space: &str, key: &str, data: impl Into<Bytes>) {
        self.objects.lock().unwrap().insert(
            (space.to_string(), key.to_string()),
            (data.into(), UploadMetadata::default()),
        );
    }

    /// Store `parts` as a split object: `key.000` carries the part count
    pub fn put_split(&self, space: &str, key: &str, parts: &[Vec<u8>]) {
        let mut objects = self.objects.lock().unwrap();
        for (index, part) in parts.iter().enumerate() {
            let mut metadata = UploadMetadata::default();
            if index == 0 {
                metadata
                    .user
                    .insert(PARTS_METADATA_KEY.to_string(), parts.len().to_string());
            }
            objects.insert(
                (space.to_string(), split_part_key(key, index as u32)),
                (Bytes::from(part.clone()), metadata),
            );
        }
    }

    pub fn get(&self, space: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(&(space.to_string(), key.to_string()))
            .map(|(data, _)| data.clone())
    }

    pub fn metadata(&self, space: &str, key: &str) -> Option<UploadMetadata> {
        self.objects
            .lock()
            .unwrap()
            .get(&(space.to_string(), key.to_string()))
            .map(|(_, meta)| meta.clone())
    }

    /// Fail the next `n` chunk calls with a network error
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Make `open_download` report an unknown length
    pub fn hide_total(&self) {
        self.hide_total.store(true, Ordering::SeqCst);
    }

    /// Park the `at_call`-th `send_chunk` (1-based) until released
    pub fn gate_send(&self, at_call: usize) -> GateHandle {
        let (tx, rx) = oneshot::channel();
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Gate {
            at_call,
            reached: Some(tx),
            release: release.clone(),
        });
        GateHandle {
            reached: rx,
            release,
        }
    }

    fn take_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn gate_for(&self, call: usize) -> Option<Arc<Notify>> {
        let mut gate = self.gate.lock().unwrap();
        let g = gate.as_mut()?;
        if g.at_call != call {
            return None;
        }
        if let Some(tx) = g.reached.take() {
            let _ = tx.send(());
        }
        Some(g.release.clone())
    }
}

#[async_trait]
impl ChunkTransport for FakeBackend {
    async fn open_upload(
        &self,
        space: &str,
        key: &str,
        metadata: &UploadMetadata,
        _auth: &Authorization,
    ) -> Result<SessionHandle> {
        self.calls.open_upload.fetch_add(1, Ordering::SeqCst);
        let id = format!("up-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().unwrap().insert(
            id.clone(),
            OpenUpload {
                space: space.to_string(),
                key: key.to_string(),
                buffer: BytesMut::new(),
                metadata: metadata.clone(),
            },
        );
        Ok(SessionHandle {
            id,
            space: space.to_string(),
            key: key.to_string(),
        })
    }

    async fn send_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        chunk: Bytes,
        _auth: &Authorization,
    ) -> Result<()> {
        let call = self.calls.send_chunk.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(release) = self.gate_for(call) {
            release.notified().await;
        }
        if self.take_failure() {
            return Err(Error::Network("connection reset".into()));
        }
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(&session.id)
            .ok_or_else(|| Error::NotFound(session.id.clone()))?;
        if offset as usize == upload.buffer.len() {
            upload.buffer.extend_from_slice(&chunk);
        }
        Ok(())
    }

    async fn finalize_upload(&self, session: &SessionHandle, _auth: &Authorization) -> Result<()> {
        self.calls.finalize.fetch_add(1, Ordering::SeqCst);
        let upload = self
            .uploads
            .lock()
            .unwrap()
            .remove(&session.id)
            .ok_or_else(|| Error::NotFound(session.id.clone()))?;
        self.objects.lock().unwrap().insert(
            (upload.space, upload.key),
            (upload.buffer.freeze(), upload.metadata),
        );
        Ok(())
    }

    async fn abort_upload(&self, session: &SessionHandle, _auth: &Authorization) -> Result<()> {
        self.calls.abort.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().unwrap().remove(&session.id);
        Ok(())
    }

    async fn open_download(
        &self,
        space: &str,
        key: &str,
        _auth: &Authorization,
    ) -> Result<DownloadSession> {
        self.calls.open_download.fetch_add(1, Ordering::SeqCst);
        let len = self
            .get(space, key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Error::NotFound(format!("{space}/{key}")))?;
        let metadata = self
            .metadata(space, key)
            .map(|meta| meta.user)
            .unwrap_or_default();
        Ok(DownloadSession {
            session: SessionHandle {
                id: format!("down-{}", self.next_session.fetch_add(1, Ordering::SeqCst)),
                space: space.to_string(),
                key: key.to_string(),
            },
            total_bytes: (!self.hide_total.load(Ordering::SeqCst)).then_some(len),
            metadata,
        })
    }

    async fn receive_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        max_len: u64,
        _auth: &Authorization,
    ) -> Result<ChunkRead> {
        self.calls.receive_chunk.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(Error::Network("read timed out".into()));
        }
        let data = self
            .get(&session.space, &session.key)
            .ok_or_else(|| Error::NotFound(session.key.clone()))?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(max_len as usize).min(data.len());
        if start == end {
            return Ok(ChunkRead::Eof);
        }
        Ok(ChunkRead::Data(data.slice(start..end)))
    }
}

#[async_trait]
impl ObjectStore for FakeBackend {
    async fn head_object(
        &self,
        space: &str,
        key: &str,
        _auth: &Authorization,
    ) -> Result<ObjectInfo> {
        let data = self
            .get(space, key)
            .ok_or_else(|| Error::NotFound(format!("{space}/{key}")))?;
        Ok(ObjectInfo::file(key, data.len() as u64))
    }
}

/// Forward every event of `handler` into a channel
pub fn collect_events(handler: &TransferHandler) -> mpsc::UnboundedReceiver<TransferEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    handler.register_callback(move |event| {
        let _ = tx.send(*event);
    });
    rx
}

/// Drain events until a terminal status arrives
pub async fn events_until_terminal(
    rx: &mut mpsc::UnboundedReceiver<TransferEvent>,
) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("observer channel closed");
        events.push(event);
        if matches!(event, TransferEvent::Status(status) if status.is_terminal()) {
            return events;
        }
    }
}

/// Poll until the handler reports `status`
pub async fn wait_for_status(handler: &TransferHandler, status: TransferStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.status() != status {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("timed out waiting for status");
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
