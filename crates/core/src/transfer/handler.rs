//! Caller-facing handle for one transfer

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use super::observer::{Callback, CallbackToken, TransferEvent};
use super::progress::TransferProgress;
use super::status::{Direction, TransferId, TransferStatus};
use super::task::TaskShared;
use crate::error::{Error, Result};

/// Point-in-time view of a transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub direction: Direction,
    pub space: String,
    pub key: String,
    pub status: TransferStatus,
    pub progress: TransferProgress,
    pub retries: u32,
    /// Mean throughput in bytes per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<jiff::Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<jiff::Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferSnapshot {
    pub(crate) fn of(shared: &TaskShared) -> Self {
        let state = shared.state.borrow();
        Self {
            id: shared.id,
            direction: shared.direction,
            space: shared.space.clone(),
            key: shared.key.clone(),
            status: state.status,
            progress: state.progress,
            retries: state.retries,
            rate: state.rate(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            error: state.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Handle to a running or finished transfer
///
/// Returned as soon as the transfer is requested; the work itself runs on the
/// runtime. Reading from the handle never blocks except through `join`.
/// Dropping the handle does not stop the transfer; the task state is freed
/// once both the handle and the worker are gone.
pub struct TransferHandler {
    shared: Arc<TaskShared>,
}

impl TransferHandler {
    pub(crate) fn new(shared: Arc<TaskShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> TransferId {
        self.shared.id
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn space(&self) -> &str {
        &self.shared.space
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Current status
    pub fn status(&self) -> TransferStatus {
        self.shared.status()
    }

    /// Latest progress snapshot
    pub fn progress(&self) -> TransferProgress {
        self.shared.state.borrow().progress
    }

    /// Failure cause, once the transfer has `Failed`
    pub fn error(&self) -> Option<Arc<Error>> {
        self.shared.state.borrow().error.clone()
    }

    /// Number of transient failures retried so far
    pub fn retries(&self) -> u32 {
        self.shared.state.borrow().retries
    }

    /// Mean throughput in bytes per second, measured from the start to now
    /// or to the end of the transfer; `None` before it starts
    pub fn rate(&self) -> Option<f64> {
        self.shared.state.borrow().rate()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot::of(&self.shared)
    }

    /// Wait until the transfer is terminal or `timeout` elapses, then report
    /// the status. A timeout leaves the transfer running.
    pub async fn join(&self, timeout: Option<Duration>) -> TransferStatus {
        match timeout {
            Some(timeout) => {
                let _ = tokio::time::timeout(timeout, self.shared.terminal()).await;
            }
            None => self.shared.terminal().await,
        }
        self.status()
    }

    /// Blocking variant of [`join`](Self::join) for synchronous callers.
    ///
    /// Must not be called from inside the async runtime driving the transfer.
    pub fn join_blocking(&self, timeout: Option<Duration>) -> TransferStatus {
        self.shared.wait_terminal_blocking(timeout);
        self.status()
    }

    /// Downloaded payload, available once the download has `Completed`
    pub fn data(&self) -> Result<Bytes> {
        if self.shared.direction == Direction::Upload {
            return Err(Error::InvalidState(format!(
                "{} is an upload and has no payload",
                self.shared.id
            )));
        }
        let state = self.shared.state.borrow();
        if state.status != TransferStatus::Completed {
            return Err(Error::NotReady(format!(
                "{} is {}, not completed",
                self.shared.id, state.status
            )));
        }
        state.data.clone().ok_or_else(|| {
            Error::InvalidState(format!(
                "{} was written to a file; no in-memory payload",
                self.shared.id
            ))
        })
    }

    /// Request cancellation; takes effect at the next chunk boundary.
    /// Idempotent, and a no-op once the transfer is terminal.
    pub fn cancel(&self) {
        if self.status().is_terminal() || self.shared.cancel.is_cancelled() {
            return;
        }
        tracing::debug!(transfer = %self.shared.id, "Cancellation requested");
        self.shared.cancel.cancel();
    }

    /// Suspend at the next chunk boundary
    pub fn pause(&self) -> Result<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "{} is {status} and cannot be paused",
                self.shared.id
            )));
        }
        self.shared.paused.send_replace(true);
        Ok(())
    }

    /// Continue a paused transfer
    pub fn resume(&self) -> Result<()> {
        let status = self.status();
        if status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "{} is {status} and cannot be resumed",
                self.shared.id
            )));
        }
        self.shared.paused.send_replace(false);
        Ok(())
    }

    /// Register an observer for all future progress and status events.
    /// Past events are not replayed, so registering once the transfer is
    /// terminal has no effect.
    pub fn register_callback<F>(&self, callback: F) -> CallbackToken
    where
        F: Fn(&TransferEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        self.shared.observers.register(callback)
    }

    /// Remove an observer; returns false if the token is unknown
    pub fn unregister_callback(&self, token: CallbackToken) -> bool {
        self.shared.observers.unregister(token)
    }
}

impl std::fmt::Debug for TransferHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandler")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("key", &self.shared.key)
            .field("status", &self.status())
            .finish()
    }
}
