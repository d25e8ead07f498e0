//! Buffers handed out by [`Transport::allocate`](crate::Transport::allocate).

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use netbench_types::AlignedMemory;

use crate::error::TransportError;

/// A page-aligned byte buffer owned by a benchmarking pattern.
///
/// Back-ends that register memory keep a second reference to the same block
/// in their device tables, so the bytes stay valid until both the buffer and
/// the registration are gone.
pub struct Buffer {
    memory: Arc<AlignedMemory>,
}

impl Buffer {
    /// Allocate an unregistered buffer of `len` zeroed bytes.
    pub fn new(len: usize) -> Result<Self, TransportError> {
        let memory = AlignedMemory::zeroed(len).ok_or(TransportError::Allocation { len })?;
        Ok(Self::from_memory(Arc::new(memory)))
    }

    /// Wrap an existing block, typically one that was just registered.
    pub fn from_memory(memory: Arc<AlignedMemory>) -> Self {
        Self { memory }
    }

    /// The shared block backing this buffer.
    pub fn memory(&self) -> &Arc<AlignedMemory> {
        &self.memory
    }

    /// Start address of the buffer.
    pub fn addr(&self) -> usize {
        self.memory.addr()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the block is live for as long as `self.memory` and spans `len` bytes.
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr(), self.memory.len()) }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above. `Buffer` is not `Clone`, so this is the only safe
        // handle to the bytes; device access happens only while a work request
        // on them is outstanding, during which the transport holds `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.memory.as_ptr(), self.memory.len()) }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}
