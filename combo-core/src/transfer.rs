//! Chunked firmware file transfer.
//!
//! A blob is sent as a sequence of "write file block" commands, each carrying
//! at most `chunk_size` bytes and an increasing block id. Every block is
//! acknowledged before the next one is sent.
//!
//! Some chip revisions answer the very first block with a stale-sequence
//! status. With the capability enabled, the transfer rewinds once to block 0
//! and starts over instead of failing.

use log::{debug, trace, warn};

use crate::blob::Blob;
use crate::protocol::hci::status;

/// Status the chip returns for an out-of-sequence block.
pub const STATUS_STALE_SEQUENCE: u8 = status::INVALID_PARAMETERS;

/// One block of a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Sequence id, starting at 0.
    pub id: u32,
    /// Block data.
    pub data: Vec<u8>,
}

/// Outcome of a block acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// Send this block next.
    Next(Chunk),
    /// The whole blob has been acknowledged.
    Complete,
    /// The chip rejected a block with this status.
    Failed(u8),
}

/// Transfer state for one blob.
#[derive(Debug)]
pub struct FirmwareTransfer {
    blob: Blob,
    chunk_size: usize,
    offset: usize,
    id: u32,
    eof: bool,
    resend_first_chunk: bool,
    retry_used: bool,
}

impl FirmwareTransfer {
    /// Start a transfer of `blob` in blocks of at most `chunk_size` bytes.
    ///
    /// `resend_first_chunk` enables the one-time rewind on a stale-sequence
    /// answer to block 0.
    pub fn new(blob: Blob, chunk_size: usize, resend_first_chunk: bool) -> Self {
        debug!(
            "Starting transfer of {} ({} bytes, {} byte blocks)",
            blob.name(),
            blob.len(),
            chunk_size
        );
        Self {
            blob,
            chunk_size: chunk_size.max(1),
            offset: 0,
            id: 0,
            eof: false,
            resend_first_chunk,
            retry_used: false,
        }
    }

    /// Produce the next block, or `None` once the blob is exhausted.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        if self.offset >= self.blob.len() {
            self.eof = true;
            return None;
        }

        let end = (self.offset + self.chunk_size).min(self.blob.len());
        let chunk = Chunk {
            id: self.id,
            data: self.blob.read(self.offset..end).to_vec(),
        };
        trace!(
            "{}: block {} [{}..{end})",
            self.blob.name(),
            chunk.id,
            self.offset
        );
        self.offset = end;
        self.id += 1;
        Some(chunk)
    }

    /// Handle the chip's answer to the block sent last.
    pub fn on_chunk_ack(&mut self, ack_status: u8) -> ChunkAck {
        if ack_status == status::SUCCESS {
            return match self.next_chunk() {
                Some(chunk) => ChunkAck::Next(chunk),
                None => {
                    debug!("{}: transfer complete", self.blob.name());
                    ChunkAck::Complete
                },
            };
        }

        if ack_status == STATUS_STALE_SEQUENCE
            && self.id == 1
            && self.resend_first_chunk
            && !self.retry_used
        {
            warn!(
                "{}: stale sequence on first block, resending block 0",
                self.blob.name()
            );
            self.retry_used = true;
            self.offset = 0;
            self.id = 0;
            self.eof = false;
            return match self.next_chunk() {
                Some(chunk) => ChunkAck::Next(chunk),
                None => ChunkAck::Complete,
            };
        }

        warn!(
            "{}: block {} rejected with status 0x{ack_status:02X}",
            self.blob.name(),
            self.id.saturating_sub(1)
        );
        ChunkAck::Failed(ack_status)
    }

    /// Name of the blob being transferred.
    pub fn blob_name(&self) -> &str {
        self.blob.name()
    }

    /// Bytes handed out so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Id the next block will carry.
    pub fn chunk_id(&self) -> u32 {
        self.id
    }

    /// Whether the blob has been exhausted.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Total blob size.
    pub fn total(&self) -> usize {
        self.blob.len()
    }
}
