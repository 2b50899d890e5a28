//! Observer registration and fire-and-forget dispatch
//!
//! Every registered callback gets its own queue and dispatcher task, so the
//! transfer never waits on a callback and each observer sees events in the
//! order they were produced. The registration list is copied under its lock
//! and events are queued outside it. Once the transfer is terminal the list
//! is closed: senders drop, and each dispatcher exits after draining its queue.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::progress::TransferProgress;
use super::status::TransferStatus;

/// An update delivered to observers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferEvent {
    /// More bytes were transferred
    Progress(TransferProgress),
    /// The transfer entered a new state; each state is announced at most once
    Status(TransferStatus),
}

/// Caller-supplied observer
pub type Callback = Arc<dyn Fn(&TransferEvent) + Send + Sync>;

/// Token identifying a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(u64);

struct Registration {
    token: CallbackToken,
    tx: mpsc::UnboundedSender<TransferEvent>,
    active: Arc<AtomicBool>,
}

pub(crate) struct ObserverList {
    label: String,
    runtime: Handle,
    next_token: AtomicU64,
    registrations: Mutex<Registrations>,
}

#[derive(Default)]
struct Registrations {
    closed: bool,
    entries: Vec<Registration>,
}

impl ObserverList {
    pub(crate) fn new(label: String, runtime: Handle) -> Self {
        Self {
            label,
            runtime,
            next_token: AtomicU64::new(1),
            registrations: Mutex::new(Registrations::default()),
        }
    }

    /// Add an observer. After [`close`](Self::close) the callback is dropped
    /// straight away, since no event will follow.
    pub(crate) fn register(&self, callback: Callback) -> CallbackToken {
        let token = CallbackToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut registrations = self.lock();
        if registrations.closed {
            return token;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferEvent>();
        let active = Arc::new(AtomicBool::new(true));

        let still_active = active.clone();
        let label = self.label.clone();
        self.runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                if !still_active.load(Ordering::Acquire) {
                    break;
                }
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event)));
                if outcome.is_err() {
                    tracing::warn!(transfer = %label, ?event, "Observer callback panicked");
                }
            }
        });

        registrations.entries.push(Registration { token, tx, active });
        token
    }

    /// Remove a callback; queued but undelivered events are dropped
    pub(crate) fn unregister(&self, token: CallbackToken) -> bool {
        let mut registrations = self.lock();
        match registrations.entries.iter().position(|r| r.token == token) {
            Some(index) => {
                let registration = registrations.entries.remove(index);
                registration.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub(crate) fn notify(&self, event: TransferEvent) {
        let targets: Vec<_> = self.lock().entries.iter().map(|r| r.tx.clone()).collect();
        for tx in targets {
            // A closed queue means the observer was just removed.
            let _ = tx.send(event);
        }
    }

    /// Drop every registration; events already queued are still delivered
    pub(crate) fn close(&self) {
        let mut registrations = self.lock();
        registrations.closed = true;
        registrations.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registrations> {
        // Callbacks never run under this lock, so poisoning cannot leave it inconsistent.
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
