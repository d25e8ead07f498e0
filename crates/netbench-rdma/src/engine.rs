//! The reliable-connection transport.
//!
//! Each blocking operation is one signaled work request covering the whole
//! buffer. The engine busy-polls the peer's completion queue for that request,
//! repairs the queue pair when the completion failed and reposts when the
//! status says the request may succeed on a second attempt.

use std::sync::Arc;

use netbench_transport::transport::check_peer;
use netbench_transport::{
    Buffer, Capabilities, Collective, OpKind, PollResult, StopFlag, Transport, TransportError,
    WorkHandle,
};
use netbench_types::{AlignedMemory, PeerId, WorkId};
use netbench_verbs::{CqHandle, RecvWr, SendWr, Verbs, WcStatus, WorkCompletion};

use crate::config::RcConfig;
use crate::connection::{ConnectionManager, RecoveryStats};
use crate::device::open_port;
use crate::memory::{MemoryDirectory, RegisteredRegion};

/// Polls spent reaping a flushed completion before giving up on it.
const FLUSH_POLL_LIMIT: u32 = 1 << 16;

/// A [`Transport`] over RC queue pairs, one per peer.
pub struct RcTransport<V: Verbs> {
    rank: PeerId,
    size: usize,
    config: RcConfig,
    device: Arc<V>,
    directory: MemoryDirectory<V>,
    connections: ConnectionManager<V>,
    next_wr: WorkId,
    stop: StopFlag,
    completions: Vec<WorkCompletion>,
    shut_down: bool,
}

impl<V: Verbs> RcTransport<V> {
    /// Open the configured port and connect to every rank of `collective`.
    pub fn new(
        device: Arc<V>,
        config: RcConfig,
        collective: &dyn Collective,
        stop: StopFlag,
    ) -> Result<Self, TransportError> {
        let port = open_port(&*device, &config)?;
        let rank = collective.rank();
        let size = collective.size();
        let mut connections =
            ConnectionManager::new(Arc::clone(&device), config.clone(), port, rank, size);
        if let Err(e) = connections.establish_all(collective) {
            connections.teardown_all();
            return Err(e);
        }
        tracing::info!(%rank, size, device = device.name(), "RC transport ready");
        Ok(Self {
            rank,
            size,
            directory: MemoryDirectory::new(Arc::clone(&device), config.probe_limit),
            config,
            device,
            connections,
            next_wr: WorkId(1),
            stop,
            completions: Vec::with_capacity(1),
            shut_down: false,
        })
    }

    pub fn device(&self) -> &Arc<V> {
        &self.device
    }

    pub fn connections(&self) -> &ConnectionManager<V> {
        &self.connections
    }

    pub fn directory(&self) -> &MemoryDirectory<V> {
        &self.directory
    }

    /// Recovery counters of the connection to `peer`.
    pub fn recovery_stats(&self, peer: PeerId) -> Option<RecoveryStats> {
        self.connections.record(peer).map(|r| r.stats)
    }

    fn region_for(
        &self,
        peer: PeerId,
        op: OpKind,
        addr: usize,
        len: usize,
    ) -> Result<(RegisteredRegion, u32), TransportError> {
        let length = u32::try_from(len).map_err(|_| TransportError::Post {
            peer,
            op,
            reason: format!("{len} bytes do not fit in one work request"),
        })?;
        Ok((self.directory.resolve(addr, len)?, length))
    }

    fn completion_queue(&self, peer: PeerId, op: OpKind) -> Result<CqHandle, TransportError> {
        let record = self.connections.connection(peer)?;
        Ok(match op {
            OpKind::Send => record.send_cq,
            OpKind::Receive => record.recv_cq,
        })
    }

    /// Poll `cq` once. Completions of other work requests are dropped.
    fn poll_for(
        &mut self,
        peer: PeerId,
        op: OpKind,
        cq: CqHandle,
        wr_id: WorkId,
    ) -> Result<Option<WorkCompletion>, TransportError> {
        self.completions.clear();
        self.device
            .poll_cq(cq, &mut self.completions, 1)
            .map_err(|e| TransportError::Connection {
                peer,
                reason: e.to_string(),
            })?;
        match self.completions.pop() {
            Some(wc) if wc.wr_id == wr_id.0 => Ok(Some(wc)),
            Some(wc) => {
                tracing::debug!(
                    %peer,
                    %op,
                    wr_id = wc.wr_id,
                    expected = wr_id.0,
                    status = %wc.status,
                    "skipping stale completion"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Busy-poll the completion queue of `op` towards `peer` until the
    /// completion of `wr_id` shows up.
    fn wait_completion(
        &mut self,
        peer: PeerId,
        op: OpKind,
        wr_id: WorkId,
    ) -> Result<WorkCompletion, TransportError> {
        let cq = self.completion_queue(peer, op)?;
        let mut spins: u64 = 0;
        loop {
            if self.stop.is_requested() {
                return self.abandon(peer, op, wr_id, TransportError::Interrupted);
            }
            if !self.config.may_spin(spins) {
                let err = TransportError::PollLimitExceeded { peer, op, spins };
                return self.abandon(peer, op, wr_id, err);
            }
            spins += 1;
            match self.poll_for(peer, op, cq, wr_id)? {
                Some(wc) => return Ok(wc),
                None => std::hint::spin_loop(),
            }
        }
    }

    /// Give up waiting for `wr_id`.
    ///
    /// The request still references the caller's buffer, so it is flushed
    /// out of the queue pair and its completion reaped before the queue pair
    /// is reset and `err` returned. A request that completed successfully
    /// before the flush took effect is returned as such.
    fn abandon(
        &mut self,
        peer: PeerId,
        op: OpKind,
        wr_id: WorkId,
        err: TransportError,
    ) -> Result<WorkCompletion, TransportError> {
        tracing::warn!(%peer, %op, wr_id = wr_id.0, error = %err, "abandoning work request");
        let cq = self.completion_queue(peer, op)?;
        self.connections.flush_outstanding(peer)?;
        let mut reaped = None;
        for _ in 0..FLUSH_POLL_LIMIT {
            if let Some(wc) = self.poll_for(peer, op, cq, wr_id)? {
                reaped = Some(wc);
                break;
            }
            std::hint::spin_loop();
        }
        // Leaving ERR through RESET discards the request if it was not reaped.
        self.connections.recover_from_fatal_error(peer)?;
        match reaped {
            Some(wc) if wc.status.is_success() => Ok(wc),
            Some(_) => Err(err),
            None => {
                tracing::error!(%peer, %op, wr_id = wr_id.0, "flushed completion never arrived");
                Err(err)
            }
        }
    }

    /// Repair the connection after a failed completion and decide whether the
    /// operation may be reposted.
    fn handle_failure(
        &mut self,
        peer: PeerId,
        op: OpKind,
        status: WcStatus,
        retries: &mut u32,
    ) -> Result<(), TransportError> {
        tracing::warn!(%peer, %op, %status, retries = *retries, "work request failed");
        self.connections.recover_after_fault(peer)?;
        let retryable = status.is_retryable();
        if !retryable || !self.config.may_retry(*retries) {
            return Err(TransportError::Completion {
                peer,
                op,
                status: status.to_string(),
                retryable,
            });
        }
        *retries += 1;
        Ok(())
    }

    /// Post one receive, absorbing transient busy errors with drain cycles.
    fn post_recv_wr(&mut self, peer: PeerId, wr: RecvWr) -> Result<(), TransportError> {
        let qp = self.connections.connection(peer)?.qp;
        let mut busy = 0;
        loop {
            match self.device.post_recv(qp, &wr) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    busy += 1;
                    if busy > self.config.recv_post_retries {
                        tracing::warn!(%peer, attempts = busy, "receive queue stays busy");
                        self.connections.drain_and_restore(peer)?;
                        busy = 0;
                    }
                }
                Err(e) => {
                    return Err(TransportError::Post {
                        peer,
                        op: OpKind::Receive,
                        reason: e.to_string(),
                    })
                }
            }
            if self.stop.is_requested() {
                return Err(TransportError::Interrupted);
            }
        }
    }
}

impl<V: Verbs> Transport for RcTransport<V> {
    fn name(&self) -> &'static str {
        "rc"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::RELIABLE
            | Capabilities::MEMORY_REGISTRATION_REQUIRED
            | Capabilities::CHANNEL_SEMANTICS
    }

    fn rank(&self) -> PeerId {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allocate(&mut self, len: usize) -> Result<Buffer, TransportError> {
        let memory = Arc::new(AlignedMemory::zeroed(len).ok_or(TransportError::Allocation { len })?);
        self.directory.register(&memory)?;
        Ok(Buffer::from_memory(memory))
    }

    fn send(&mut self, peer: PeerId, buf: &[u8]) -> Result<usize, TransportError> {
        check_peer(self.rank, self.size, peer)?;
        let addr = buf.as_ptr() as usize;
        let (region, length) = self.region_for(peer, OpKind::Send, addr, buf.len())?;
        let qp = self.connections.connection(peer)?.qp;
        let mut retries = 0;
        loop {
            let wr_id = self.next_wr.take_next();
            let wr = SendWr {
                wr_id: wr_id.0,
                sge: Some(region.sge(addr, length)),
                signaled: true,
            };
            self.device
                .post_send(qp, &wr)
                .map_err(|e| TransportError::Post {
                    peer,
                    op: OpKind::Send,
                    reason: e.to_string(),
                })?;
            let wc = self.wait_completion(peer, OpKind::Send, wr_id)?;
            if wc.status.is_success() {
                return Ok(buf.len());
            }
            self.handle_failure(peer, OpKind::Send, wc.status, &mut retries)?;
        }
    }

    fn receive(&mut self, peer: PeerId, buf: &mut [u8]) -> Result<usize, TransportError> {
        check_peer(self.rank, self.size, peer)?;
        let addr = buf.as_mut_ptr() as usize;
        let (region, length) = self.region_for(peer, OpKind::Receive, addr, buf.len())?;
        let mut retries = 0;
        loop {
            let wr_id = self.next_wr.take_next();
            let wr = RecvWr {
                wr_id: wr_id.0,
                sge: Some(region.sge(addr, length)),
            };
            self.post_recv_wr(peer, wr)?;
            let wc = self.wait_completion(peer, OpKind::Receive, wr_id)?;
            if wc.status.is_success() {
                return Ok(wc.byte_len as usize);
            }
            self.handle_failure(peer, OpKind::Receive, wc.status, &mut retries)?;
        }
    }

    fn post_send(
        &mut self,
        _peer: PeerId,
        _buf: Buffer,
        _len: usize,
    ) -> Result<WorkHandle, TransportError> {
        Err(TransportError::Unsupported("non-blocking send"))
    }

    fn post_receive(
        &mut self,
        _peer: PeerId,
        _buf: Buffer,
        _len: usize,
    ) -> Result<WorkHandle, TransportError> {
        Err(TransportError::Unsupported("non-blocking receive"))
    }

    fn poll(&mut self, _handle: WorkHandle) -> Result<PollResult, TransportError> {
        Err(TransportError::Unsupported("poll"))
    }

    fn set_blocking(&mut self, _peer: PeerId, _enabled: bool) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("set_blocking"))
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.connections.teardown_all();
        self.directory.deregister_all();
        tracing::info!(rank = %self.rank, "RC transport shut down");
    }
}

impl<V: Verbs> Drop for RcTransport<V> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
