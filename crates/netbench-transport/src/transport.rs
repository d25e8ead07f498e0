use bitflags::bitflags;
use netbench_types::PeerId;

use crate::buffer::Buffer;
use crate::error::TransportError;

bitflags! {
    /// Properties a benchmarking pattern may rely on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Messages are delivered exactly once and in order.
        const RELIABLE = 1 << 0;
        /// Buffers must come from [`Transport::allocate`].
        const MEMORY_REGISTRATION_REQUIRED = 1 << 1;
        /// The receiver must post a receive before the sender's data arrives.
        const CHANNEL_SEMANTICS = 1 << 2;
    }
}

/// Identifies an outstanding non-blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkHandle(pub u64);

/// Progress of a non-blocking operation.
#[derive(Debug)]
pub enum PollResult {
    /// Still running with this many bytes left.
    InProgress(usize),
    /// Finished; the buffer is handed back to the caller.
    Done(Buffer),
}

impl PollResult {
    pub fn is_done(&self) -> bool {
        matches!(self, PollResult::Done(_))
    }
}

/// The contract every transport back-end implements.
///
/// One value of an implementing type is one endpoint in a group of `size()`
/// ranks. It is driven by a single thread; cross-peer concurrency comes from
/// holding one connection per peer, not from sharing the endpoint.
pub trait Transport: Send {
    /// Short back-end name used in logs and result files.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// This endpoint's rank.
    fn rank(&self) -> PeerId;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Allocate a buffer usable with this transport.
    ///
    /// Back-ends that require registration override this to register at
    /// allocation time.
    fn allocate(&mut self, len: usize) -> Result<Buffer, TransportError> {
        Buffer::new(len)
    }

    /// Send all of `buf` to `peer`, blocking until it has left.
    fn send(&mut self, peer: PeerId, buf: &[u8]) -> Result<usize, TransportError>;

    /// Receive into `buf` from `peer`, blocking until data has arrived.
    fn receive(&mut self, peer: PeerId, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Start sending the first `len` bytes of `buf` without waiting.
    fn post_send(
        &mut self,
        peer: PeerId,
        buf: Buffer,
        len: usize,
    ) -> Result<WorkHandle, TransportError>;

    /// Start receiving up to `len` bytes into `buf` without waiting.
    fn post_receive(
        &mut self,
        peer: PeerId,
        buf: Buffer,
        len: usize,
    ) -> Result<WorkHandle, TransportError>;

    /// Make progress on a posted operation.
    fn poll(&mut self, handle: WorkHandle) -> Result<PollResult, TransportError>;

    /// Switch socket-style blocking mode for traffic with `peer`.
    fn set_blocking(&mut self, peer: PeerId, enabled: bool) -> Result<(), TransportError>;

    /// Release connections and registrations. Safe to call more than once.
    fn shutdown(&mut self) {}
}

/// Validate that `peer` is a remote rank of a group of `size`.
pub fn check_peer(rank: PeerId, size: usize, peer: PeerId) -> Result<(), TransportError> {
    if peer.index() >= size || peer == rank {
        return Err(TransportError::InvalidPeer(peer));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_flags() {
        let caps = Capabilities::RELIABLE | Capabilities::CHANNEL_SEMANTICS;
        assert!(caps.contains(Capabilities::RELIABLE));
        assert!(!caps.contains(Capabilities::MEMORY_REGISTRATION_REQUIRED));
    }

    #[test]
    fn test_check_peer() {
        assert!(check_peer(PeerId(0), 2, PeerId(1)).is_ok());
        assert!(matches!(
            check_peer(PeerId(0), 2, PeerId(0)),
            Err(TransportError::InvalidPeer(PeerId(0)))
        ));
        assert!(check_peer(PeerId(0), 2, PeerId(2)).is_err());
    }
}
