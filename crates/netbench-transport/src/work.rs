//! Bookkeeping for non-blocking operations.

use netbench_types::PeerId;

use crate::buffer::Buffer;
use crate::error::OpKind;

/// One outstanding non-blocking send or receive.
///
/// `remaining` only ever shrinks; the item is done exactly when it reaches
/// zero, at which point the buffer is returned to the caller.
#[derive(Debug)]
pub struct PendingWorkItem {
    kind: OpKind,
    peer: PeerId,
    buffer: Buffer,
    requested: usize,
    remaining: usize,
}

impl PendingWorkItem {
    /// Track an operation over the first `requested` bytes of `buffer`.
    ///
    /// `requested` is clamped to the buffer length.
    pub fn new(kind: OpKind, peer: PeerId, buffer: Buffer, requested: usize) -> Self {
        let requested = requested.min(buffer.len());
        Self {
            kind,
            peer,
            buffer,
            requested,
            remaining: requested,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Bytes already transferred.
    pub fn transferred(&self) -> usize {
        self.requested - self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// The not-yet-sent part of the request.
    pub fn pending_bytes(&self) -> &[u8] {
        &self.buffer[self.transferred()..self.requested]
    }

    /// The not-yet-filled part of the request.
    pub fn pending_bytes_mut(&mut self) -> &mut [u8] {
        let start = self.transferred();
        &mut self.buffer[start..self.requested]
    }

    /// Record that `n` more bytes moved. Returns the new remaining count.
    pub fn advance(&mut self, n: usize) -> usize {
        debug_assert!(n <= self.remaining, "advance past the requested length");
        self.remaining -= n.min(self.remaining);
        self.remaining
    }

    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}
