//! Engine-wide bookkeeping of live transfers
//!
//! The registry holds weak references only: it never keeps a finished
//! transfer's buffers alive once the caller drops its handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;

use super::progress::TransferProgress;
use super::status::{Direction, TransferId, TransferStatus};
use super::task::TaskShared;

/// One row of [`TransferRegistry::list`]
#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub id: TransferId,
    pub direction: Direction,
    pub space: String,
    pub key: String,
    pub status: TransferStatus,
    pub progress: TransferProgress,
}

#[derive(Default)]
pub struct TransferRegistry {
    entries: Mutex<HashMap<TransferId, Weak<TaskShared>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, shared: &Arc<TaskShared>) {
        self.lock().insert(shared.id, Arc::downgrade(shared));
    }

    pub(crate) fn live(&self) -> Vec<Arc<TaskShared>> {
        let mut entries = self.lock();
        entries.retain(|_, weak| weak.strong_count() > 0);
        let mut live: Vec<_> = entries.values().filter_map(Weak::upgrade).collect();
        live.sort_by_key(|shared| shared.id);
        live
    }

    /// Every transfer still referenced by a handle or a worker, oldest first
    pub fn list(&self) -> Vec<TransferSummary> {
        self.live()
            .iter()
            .map(|shared| {
                let state = shared.state.borrow();
                TransferSummary {
                    id: shared.id,
                    direction: shared.direction,
                    space: shared.space.clone(),
                    key: shared.key.clone(),
                    status: state.status,
                    progress: state.progress,
                }
            })
            .collect()
    }

    /// Number of transfers not yet in a terminal state
    pub fn active_count(&self) -> usize {
        self.live()
            .iter()
            .filter(|shared| !shared.status().is_terminal())
            .count()
    }

    /// Request cancellation of every non-terminal transfer; returns how many
    /// were signalled
    pub fn cancel_all(&self) -> usize {
        let mut signalled = 0;
        for shared in self.live() {
            if !shared.status().is_terminal() && !shared.cancel.is_cancelled() {
                shared.cancel.cancel();
                signalled += 1;
            }
        }
        if signalled > 0 {
            tracing::info!(count = signalled, "Cancelling active transfers");
        }
        signalled
    }

    /// Forget terminal transfers; returns how many entries were dropped
    pub fn prune(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, weak| {
            weak.upgrade()
                .is_some_and(|shared| !shared.status().is_terminal())
        });
        before - entries.len()
    }

    /// Forget one transfer; returns false if it was not registered
    pub fn remove(&self, id: TransferId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransferId, Weak<TaskShared>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for TransferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRegistry")
            .field("len", &self.len())
            .finish()
    }
}
