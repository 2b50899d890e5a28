//! The state machine driving one upload or download
//!
//! A `TransferTask` runs on its own spawned future and owns the byte source
//! or sink for its whole life. Everything readers may look at (status,
//! progress, error, payload) lives in one `watch` channel inside
//! [`TaskShared`]; the task is the only writer.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::TransferConfig;
use super::observer::{ObserverList, TransferEvent};
use super::progress::{ProgressTracker, TransferProgress};
use super::status::{Direction, TransferId, TransferStatus};
use crate::auth::Authorization;
use crate::error::{Error, Result};
use crate::io::{ByteSink, ByteSource};
use crate::traits::{
    ChunkRead, ChunkTransport, DownloadSession, PARTS_METADATA_KEY, SessionHandle, UploadMetadata,
    split_part_key,
};

/// Mutable task state, only ever replaced through the watch channel
#[derive(Debug, Clone)]
pub(crate) struct TaskState {
    pub(crate) status: TransferStatus,
    pub(crate) progress: TransferProgress,
    pub(crate) error: Option<Arc<Error>>,
    pub(crate) data: Option<Bytes>,
    pub(crate) retries: u32,
    pub(crate) started_at: Option<jiff::Timestamp>,
    pub(crate) finished_at: Option<jiff::Timestamp>,
}

impl TaskState {
    /// Mean throughput in bytes per second since the transfer started
    pub(crate) fn rate(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(jiff::Timestamp::now);
        let micros = end.as_microsecond() - started.as_microsecond();
        (micros > 0).then(|| self.progress.bytes_transferred as f64 * 1e6 / micros as f64)
    }
}

/// State shared between the worker and every reader
pub(crate) struct TaskShared {
    pub(crate) id: TransferId,
    pub(crate) direction: Direction,
    pub(crate) space: String,
    pub(crate) key: String,
    pub(crate) state: watch::Sender<TaskState>,
    pub(crate) observers: ObserverList,
    pub(crate) cancel: CancellationToken,
    pub(crate) paused: watch::Sender<bool>,
    terminal: (Mutex<bool>, Condvar),
}

impl TaskShared {
    pub(crate) fn new(
        id: TransferId,
        direction: Direction,
        space: String,
        key: String,
        total_bytes: Option<u64>,
        observers: ObserverList,
    ) -> Self {
        let (state, _) = watch::channel(TaskState {
            status: TransferStatus::Pending,
            progress: TransferProgress::new(0, total_bytes),
            error: None,
            data: None,
            retries: 0,
            started_at: None,
            finished_at: None,
        });
        let (paused, _) = watch::channel(false);
        Self {
            id,
            direction,
            space,
            key,
            state,
            observers,
            cancel: CancellationToken::new(),
            paused,
            terminal: (Mutex::new(false), Condvar::new()),
        }
    }

    pub(crate) fn status(&self) -> TransferStatus {
        self.state.borrow().status
    }

    /// Apply a status change if it is legal; announces it exactly once
    fn transition(&self, next: TransferStatus, fill: impl FnOnce(&mut TaskState)) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if !state.status.can_transition_to(next) {
                return false;
            }
            state.status = next;
            fill(state);
            true
        });
        if changed {
            if next.is_terminal() {
                self.mark_terminal();
            }
            self.observers.notify(TransferEvent::Status(next));
            if next.is_terminal() {
                self.observers.close();
            }
        }
        changed
    }

    fn mark_terminal(&self) {
        let (lock, cvar) = &self.terminal;
        let mut done = lock.lock().unwrap_or_else(|p| p.into_inner());
        *done = true;
        cvar.notify_all();
    }

    /// Resolve once the transfer is terminal
    pub(crate) async fn terminal(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if rx.borrow_and_update().status.is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolve once the pause flag is cleared
    async fn resumed(&self) {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Block the calling thread until a terminal state or the deadline
    pub(crate) fn wait_terminal_blocking(&self, timeout: Option<std::time::Duration>) {
        let (lock, cvar) = &self.terminal;
        let done = lock.lock().unwrap_or_else(|p| p.into_inner());
        let _guard = match timeout {
            Some(timeout) => cvar
                .wait_timeout_while(done, timeout, |done| !*done)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0),
            None => cvar
                .wait_while(done, |done| !*done)
                .unwrap_or_else(|p| p.into_inner()),
        };
    }
}

/// What the task moves
pub(crate) enum Payload {
    Upload {
        source: Box<dyn ByteSource>,
        metadata: UploadMetadata,
    },
    Download {
        sink: Box<dyn ByteSink>,
        /// Fall back to `key.000`, `key.001`, ... when `key` is missing
        split_parts: bool,
    },
}

pub(crate) struct TransferTask {
    shared: Arc<TaskShared>,
    transport: Arc<dyn ChunkTransport>,
    auth: Authorization,
    config: TransferConfig,
    tracker: ProgressTracker,
}

impl TransferTask {
    pub(crate) fn new(
        shared: Arc<TaskShared>,
        transport: Arc<dyn ChunkTransport>,
        auth: Authorization,
        config: TransferConfig,
    ) -> Self {
        let tracker = ProgressTracker::new(shared.state.borrow().progress.total_bytes);
        Self {
            shared,
            transport,
            auth,
            config,
            tracker,
        }
    }

    /// `Pending -> Running`
    pub(crate) fn start(&self) -> Result<()> {
        let started = self
            .shared
            .transition(TransferStatus::Running, |state| {
                state.started_at = Some(jiff::Timestamp::now());
            });
        if started {
            debug!(transfer = %self.shared.id, direction = %self.shared.direction, "Transfer started");
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{} cannot start from state {}",
                self.shared.id,
                self.shared.status()
            )))
        }
    }

    /// Drive the transfer to a terminal state
    pub(crate) async fn run(mut self, payload: Payload) {
        if let Err(e) = self.start() {
            warn!(transfer = %self.shared.id, error = %e, "Refusing to run transfer");
            return;
        }
        let outcome = guarded(self.drive(payload)).await;
        self.settle(outcome);
    }

    async fn drive(&mut self, payload: Payload) -> Result<Option<Bytes>> {
        match payload {
            Payload::Upload {
                mut source,
                metadata,
            } => self.run_upload(source.as_mut(), &metadata).await.map(|()| None),
            Payload::Download {
                mut sink,
                split_parts,
            } => {
                let result = guarded(self.run_download(sink.as_mut(), split_parts)).await;
                match result {
                    Ok(()) => guarded(sink.finish()).await,
                    Err(e) => {
                        if let Err(release) = guarded(sink.abandon()).await {
                            warn!(transfer = %self.shared.id, error = %release, "Failed to release download sink");
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    fn settle(&mut self, outcome: Result<Option<Bytes>>) {
        let id = self.shared.id;
        let now = jiff::Timestamp::now();
        let progress = self.tracker.snapshot();
        match outcome {
            Ok(data) => {
                if self.tracker.finish() {
                    self.shared
                        .observers
                        .notify(TransferEvent::Progress(progress));
                }
                self.shared.transition(TransferStatus::Completed, |state| {
                    state.progress = progress;
                    state.data = data;
                    state.finished_at = Some(now);
                });
                info!(
                    transfer = %id,
                    key = %self.shared.key,
                    bytes = progress.bytes_transferred,
                    "Transfer completed"
                );
            }
            Err(Error::Cancelled) => {
                self.shared.transition(TransferStatus::Cancelled, |state| {
                    state.finished_at = Some(now);
                });
                info!(
                    transfer = %id,
                    key = %self.shared.key,
                    bytes = progress.bytes_transferred,
                    "Transfer cancelled"
                );
            }
            Err(e) => {
                warn!(transfer = %id, key = %self.shared.key, error = %e, "Transfer failed");
                self.shared.transition(TransferStatus::Failed, |state| {
                    state.error = Some(Arc::new(e));
                    state.finished_at = Some(now);
                });
            }
        }
    }

    /// Cancellation and pause point between chunks
    async fn checkpoint(&self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let paused = *self.shared.paused.borrow();
        if paused {
            self.shared.transition(TransferStatus::Paused, |_| {});
            debug!(transfer = %self.shared.id, "Transfer paused");
            tokio::select! {
                _ = self.shared.cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.shared.resumed() => {}
            }
            self.shared.transition(TransferStatus::Running, |_| {});
            debug!(transfer = %self.shared.id, "Transfer resumed");
        }
        Ok(())
    }

    /// Run `op`, retrying transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.config.retry;
        let mut retry = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < policy.max_retries => {
                    let delay = policy.backoff(retry);
                    retry += 1;
                    self.shared.state.send_modify(|state| state.retries += 1);
                    warn!(
                        transfer = %self.shared.id,
                        op = op_name,
                        attempt = retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        _ = self.shared.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(Error::RetriesExhausted {
                        attempts: retry + 1,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Account for `len` more bytes and notify observers when due
    fn advance(&mut self, len: u64) {
        let due = self.tracker.update(len);
        let progress = self.publish();
        if due {
            self.shared
                .observers
                .notify(TransferEvent::Progress(progress));
        }
    }

    /// Copy the tracker snapshot into the shared state
    fn publish(&self) -> TransferProgress {
        let progress = self.tracker.snapshot();
        self.shared
            .state
            .send_modify(|state| state.progress = progress);
        progress
    }

    async fn run_upload(
        &mut self,
        source: &mut dyn ByteSource,
        metadata: &UploadMetadata,
    ) -> Result<()> {
        self.checkpoint().await?;

        let session = self
            .with_retry("open_upload", || {
                self.transport
                    .open_upload(&self.shared.space, &self.shared.key, metadata, &self.auth)
            })
            .await?;
        debug!(transfer = %self.shared.id, session = %session.id, "Upload session opened");

        let result = guarded(self.upload_chunks(source, &session)).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let abort = guarded(self.transport.abort_upload(&session, &self.auth)).await;
                if let Err(abort) = abort {
                    warn!(
                        transfer = %self.shared.id,
                        session = %session.id,
                        error = %abort,
                        "Failed to abort upload session"
                    );
                } else {
                    debug!(transfer = %self.shared.id, session = %session.id, "Upload session aborted");
                }
                Err(e)
            }
        }
    }

    async fn upload_chunks(
        &mut self,
        source: &mut dyn ByteSource,
        session: &SessionHandle,
    ) -> Result<()> {
        let chunk_size = self.config.chunk_size as usize;
        loop {
            self.checkpoint().await?;

            let chunk = source.read_chunk(chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            let offset = self.tracker.snapshot().bytes_transferred;
            let len = chunk.len() as u64;

            self.with_retry("send_chunk", || {
                self.transport
                    .send_chunk(session, offset, chunk.clone(), &self.auth)
            })
            .await?;
            debug!(transfer = %self.shared.id, offset, len, "Chunk sent");
            self.advance(len);
        }

        self.with_retry("finalize_upload", || {
            self.transport.finalize_upload(session, &self.auth)
        })
        .await?;
        self.tracker.reveal_total();
        Ok(())
    }

    async fn open(&self, key: &str) -> Result<DownloadSession> {
        self.with_retry("open_download", || {
            self.transport
                .open_download(&self.shared.space, key, &self.auth)
        })
        .await
    }

    /// Open the object, or every part of an object stored split in
    /// `key.000`, `key.001`, ... with the part count in the first part's
    /// metadata.
    async fn open_parts(&self, split_parts: bool) -> Result<Vec<DownloadSession>> {
        let key = &self.shared.key;
        let first = match self.open(key).await {
            Ok(opened) => return Ok(vec![opened]),
            Err(Error::NotFound(_)) if split_parts => {
                match self.open(&split_part_key(key, 0)).await {
                    Ok(opened) => opened,
                    Err(Error::NotFound(_)) => {
                        return Err(Error::NotFound(format!(
                            "Object '{key}' not found in {}",
                            self.shared.space
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let count = match first.metadata.get(PARTS_METADATA_KEY) {
            Some(value) => value.trim().parse::<u32>().map_err(|_| {
                Error::General(format!(
                    "Object '{key}' has an invalid part count '{value}'"
                ))
            })?,
            None => 1,
        };
        debug!(transfer = %self.shared.id, parts = count, "Object is stored in parts");

        let mut parts = Vec::with_capacity(count.max(1) as usize);
        parts.push(first);
        for index in 1..count {
            self.checkpoint().await?;
            parts.push(self.open(&split_part_key(key, index)).await?);
        }
        Ok(parts)
    }

    async fn run_download(&mut self, sink: &mut dyn ByteSink, split_parts: bool) -> Result<()> {
        self.checkpoint().await?;

        let parts = self.open_parts(split_parts).await?;
        let total: Option<u64> = parts.iter().map(|p| p.total_bytes).sum();
        debug!(
            transfer = %self.shared.id,
            session = %parts[0].session.id,
            parts = parts.len(),
            total = ?total,
            "Download session opened"
        );
        if total.is_some() {
            self.tracker.set_total(total);
        }
        self.tracker.set_parts(parts.len() as u32);
        self.publish();

        for (index, opened) in parts.iter().enumerate() {
            if index > 0 {
                self.tracker.set_part(index as u32 + 1);
                self.publish();
            }
            self.download_part(opened, sink).await?;
        }
        self.tracker.reveal_total();
        Ok(())
    }

    async fn download_part(
        &mut self,
        opened: &DownloadSession,
        sink: &mut dyn ByteSink,
    ) -> Result<()> {
        let chunk_size = self.config.chunk_size;
        let mut offset = 0u64;
        loop {
            self.checkpoint().await?;

            if let Some(total) = opened.total_bytes
                && offset >= total
            {
                break;
            }

            let read = self
                .with_retry("receive_chunk", || {
                    self.transport
                        .receive_chunk(&opened.session, offset, chunk_size, &self.auth)
                })
                .await?;

            match read {
                ChunkRead::Data(bytes) if !bytes.is_empty() => {
                    sink.write_chunk(&bytes).await?;
                    let len = bytes.len() as u64;
                    debug!(
                        transfer = %self.shared.id,
                        key = %opened.session.key,
                        offset,
                        len,
                        "Chunk received"
                    );
                    offset += len;
                    self.advance(len);
                }
                _ => break,
            }
        }

        if let Some(total) = opened.total_bytes
            && offset < total
        {
            return Err(Error::General(format!(
                "Object {}/{} ended after {offset} of {total} bytes",
                self.shared.space, opened.session.key
            )));
        }
        Ok(())
    }
}

// A task that is dropped without settling (a runtime shutting down, or a
// panic escaping the guards) must still leave readers a terminal status.
impl Drop for TransferTask {
    fn drop(&mut self) {
        if self.shared.status().is_terminal() {
            return;
        }
        warn!(transfer = %self.shared.id, "Transfer task stopped before settling");
        self.shared.transition(TransferStatus::Failed, |state| {
            state.error = Some(Arc::new(Error::General(
                "transfer task stopped before completion".into(),
            )));
            state.finished_at = Some(jiff::Timestamp::now());
        });
    }
}

/// Run `work`, turning a panic inside it into an error
async fn guarded<T>(work: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::General(format!(
            "transfer task panicked: {}",
            panic_message(&*panic)
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}
