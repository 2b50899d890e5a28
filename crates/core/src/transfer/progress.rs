//! Progress snapshots and the accumulator that produces them

use std::fmt;

use serde::Serialize;

/// Immutable view of how far a transfer has come
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    /// Bytes moved so far; never decreases
    pub bytes_transferred: u64,
    /// Payload length, or `None` while it is unknown
    pub total_bytes: Option<u64>,
    /// Stored part currently moving (1-based)
    pub part: u32,
    /// Number of stored parts making up the object
    pub parts: u32,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new(0, None)
    }
}

impl TransferProgress {
    pub fn new(bytes_transferred: u64, total_bytes: Option<u64>) -> Self {
        Self {
            bytes_transferred,
            total_bytes,
            part: 1,
            parts: 1,
        }
    }

    /// Completion in percent, clamped to [0, 100]; `None` while the total is
    /// unknown. An empty payload counts as fully transferred.
    pub fn percentage(&self) -> Option<f64> {
        let total = self.total_bytes?;
        if total == 0 {
            return Some(100.0);
        }
        let pct = self.bytes_transferred as f64 / total as f64 * 100.0;
        Some(pct.clamp(0.0, 100.0))
    }

    /// Percentage rounded down to a whole number
    pub fn whole_percent(&self) -> Option<u8> {
        self.percentage().map(|p| p.floor() as u8)
    }
}

impl fmt::Display for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = humansize::format_size(self.bytes_transferred, humansize::BINARY);
        match (self.total_bytes, self.percentage()) {
            (Some(total), Some(pct)) => write!(
                f,
                "{done} / {} ({pct:.1}%)",
                humansize::format_size(total, humansize::BINARY)
            )?,
            _ => write!(f, "{done} / ?")?,
        }
        if self.parts > 1 {
            write!(f, " [part {}/{}]", self.part, self.parts)?;
        }
        Ok(())
    }
}

/// Accumulates transferred bytes and decides when observers should hear about it
///
/// Only the owning task mutates a tracker; everybody else sees copies of
/// [`TransferProgress`].
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    snapshot: TransferProgress,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    pub fn new(total_bytes: Option<u64>) -> Self {
        let snapshot = TransferProgress::new(0, total_bytes);
        Self {
            last_percent: snapshot.whole_percent().filter(|_| total_bytes != Some(0)),
            snapshot,
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> TransferProgress {
        self.snapshot
    }

    /// Set the total once a metadata probe reports it
    pub fn set_total(&mut self, total_bytes: Option<u64>) {
        self.snapshot.total_bytes = total_bytes;
    }

    /// Declare how many stored parts the payload spans
    pub fn set_parts(&mut self, parts: u32) {
        self.snapshot.parts = parts.max(1);
        self.snapshot.part = self.snapshot.part.min(self.snapshot.parts);
    }

    /// Move on to part `part` (1-based)
    pub fn set_part(&mut self, part: u32) {
        self.snapshot.part = part.clamp(1, self.snapshot.parts);
    }

    /// Record `delta` more bytes.
    ///
    /// Returns true when a notification is due: the whole percentage moved
    /// to a new value, or, with an unknown total, any bytes arrived.
    pub fn update(&mut self, delta: u64) -> bool {
        if delta == 0 {
            return false;
        }
        self.snapshot.bytes_transferred = self.snapshot.bytes_transferred.saturating_add(delta);

        match self.snapshot.whole_percent() {
            Some(pct) if self.last_percent != Some(pct) => {
                self.last_percent = Some(pct);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Pin the total to the bytes seen once end of stream is reached
    pub fn reveal_total(&mut self) {
        if self.snapshot.total_bytes.is_none() {
            self.snapshot.total_bytes = Some(self.snapshot.bytes_transferred);
            self.last_percent = Some(100);
        }
    }

    /// Close out a successful transfer.
    ///
    /// Returns true when observers have not yet been told about 100%, which
    /// happens for empty payloads with a known total.
    pub fn finish(&mut self) -> bool {
        if self.snapshot.total_bytes.is_none() || self.last_percent == Some(100) {
            return false;
        }
        self.last_percent = Some(100);
        self.snapshot.whole_percent() == Some(100)
    }
}
