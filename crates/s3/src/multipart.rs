//! Multipart upload bookkeeping
//!
//! Engine chunks rarely line up with S3 part limits, so chunks are gathered
//! into parts of at least [`MIN_PART_SIZE`] before they are sent. A part stays
//! queued until S3 acknowledges it, which lets a retried chunk re-send a part
//! that failed without buffering its bytes twice.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use stowage_core::{Error, Result};

/// Minimum part size: 5 MiB (S3 requirement, except for the last part)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum part size: 5 GiB
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts: 10,000 (S3 limit)
pub const MAX_PARTS: i32 = 10_000;

/// Part size to use for a requested chunk size
pub fn part_size_for(chunk_size: u64) -> u64 {
    chunk_size.clamp(MIN_PART_SIZE, MAX_PART_SIZE)
}

/// A part waiting for S3 to acknowledge it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPart {
    pub part_number: i32,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// State of one open multipart upload
#[derive(Debug)]
pub struct UploadState {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    part_size: usize,
    buffer: BytesMut,
    /// End offset of all bytes accepted so far
    accepted: u64,
    ready: VecDeque<PendingPart>,
    completed: Vec<CompletedPart>,
    next_part_number: i32,
    sealed: bool,
}

impl UploadState {
    pub fn new(
        upload_id: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        part_size: u64,
    ) -> Self {
        let part_size = usize::try_from(part_size).unwrap_or(usize::MAX);
        Self {
            upload_id: upload_id.into(),
            bucket: bucket.into(),
            key: key.into(),
            part_size,
            buffer: BytesMut::new(),
            accepted: 0,
            ready: VecDeque::new(),
            completed: Vec::new(),
            next_part_number: 1,
            sealed: false,
        }
    }

    /// Take in the chunk starting at `offset`.
    ///
    /// Bytes already accepted are ignored, so re-sending a chunk is harmless.
    /// A chunk that starts past the accepted end is rejected.
    pub fn accept(&mut self, offset: u64, chunk: &[u8]) -> Result<()> {
        if self.sealed {
            return Err(Error::InvalidState(format!(
                "Upload {} is already being completed",
                self.upload_id
            )));
        }
        if offset > self.accepted {
            return Err(Error::General(format!(
                "Chunk at offset {offset} leaves a gap after {} bytes",
                self.accepted
            )));
        }
        let already = usize::try_from(self.accepted - offset).unwrap_or(usize::MAX);
        if already >= chunk.len() {
            return Ok(());
        }
        let fresh = &chunk[already..];
        self.buffer.extend_from_slice(fresh);
        self.accepted += fresh.len() as u64;

        while self.buffer.len() >= self.part_size {
            let body = self.buffer.split_to(self.part_size).freeze();
            self.queue(body)?;
        }
        Ok(())
    }

    /// Queue whatever remains as the last part
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        // S3 needs at least one part, even for an empty object.
        if !self.buffer.is_empty() || self.next_part_number == 1 {
            let body = self.buffer.split().freeze();
            self.queue(body)?;
        }
        self.sealed = true;
        Ok(())
    }

    fn queue(&mut self, body: Bytes) -> Result<()> {
        if self.next_part_number > MAX_PARTS {
            return Err(Error::General(format!(
                "Upload {} exceeds {MAX_PARTS} parts; use a larger chunk size",
                self.upload_id
            )));
        }
        self.ready.push_back(PendingPart {
            part_number: self.next_part_number,
            body,
        });
        self.next_part_number += 1;
        Ok(())
    }

    /// Next part to send, if any
    pub fn next_ready(&self) -> Option<PendingPart> {
        self.ready.front().cloned()
    }

    /// Record S3's acknowledgement of `part_number`
    pub fn complete(&mut self, part_number: i32, etag: impl Into<String>) {
        if self
            .ready
            .front()
            .is_some_and(|part| part.part_number == part_number)
        {
            self.ready.pop_front();
            self.completed.push(CompletedPart {
                part_number,
                etag: etag.into(),
            });
        }
    }

    pub fn completed_parts(&self) -> &[CompletedPart] {
        &self.completed
    }

    pub fn accepted_bytes(&self) -> u64 {
        self.accepted
    }
}
