//! In-process transport between ranks that share one address space.
//!
//! Traffic between a pair of ranks flows over an unbounded channel of
//! chunks no larger than `chunk_size`, mimicking the MTU-sized pieces a
//! datagram transport would move. The byte stream per pair is ordered and
//! lossless, so the transport is `RELIABLE`. A sender never waits for a
//! matching receive, so it does not have `CHANNEL_SEMANTICS`.

use std::collections::HashMap;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use netbench_types::PeerId;
use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::collective::mesh;
use crate::error::{OpKind, TransportError};
use crate::stop::StopFlag;
use crate::transport::{check_peer, Capabilities, PollResult, Transport, WorkHandle};
use crate::work::PendingWorkItem;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Largest piece moved per channel message.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    4096
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// A chunk that was only partly consumed by the last receive.
struct Leftover {
    data: Vec<u8>,
    offset: usize,
}

pub struct LoopbackTransport {
    rank: PeerId,
    chunk_size: usize,
    stop: StopFlag,
    outbox: Vec<Sender<Vec<u8>>>,
    inbox: Vec<Receiver<Vec<u8>>>,
    leftover: Vec<Option<Leftover>>,
    blocking: Vec<bool>,
    pending: HashMap<u64, PendingWorkItem>,
    next_handle: u64,
}

impl LoopbackTransport {
    /// Create the endpoints of a group of `size` ranks, indexed by rank.
    pub fn group(size: usize, config: &LoopbackConfig, stop: &StopFlag) -> Vec<LoopbackTransport> {
        let chunk_size = config.chunk_size.max(1);
        mesh(size)
            .into_iter()
            .enumerate()
            .map(|(rank, (outbox, inbox))| LoopbackTransport {
                rank: PeerId(rank as u32),
                chunk_size,
                stop: stop.clone(),
                outbox,
                inbox,
                leftover: (0..size).map(|_| None).collect(),
                blocking: vec![true; size],
                pending: HashMap::new(),
                next_handle: 0,
            })
            .collect()
    }

    fn disconnected(peer: PeerId) -> TransportError {
        TransportError::Connection {
            peer,
            reason: "peer endpoint dropped".into(),
        }
    }

    /// Push up to one chunk of `data` to `peer`; returns bytes pushed.
    fn push_chunk(&self, peer: PeerId, data: &[u8]) -> Result<usize, TransportError> {
        let n = data.len().min(self.chunk_size);
        if n == 0 {
            return Ok(0);
        }
        self.outbox[peer.index()]
            .send(data[..n].to_vec())
            .map_err(|_| Self::disconnected(peer))?;
        Ok(n)
    }

    /// Copy whatever has already arrived from `peer` into `dst` without
    /// waiting; returns bytes copied.
    fn pull_available(&mut self, peer: PeerId, dst: &mut [u8]) -> Result<usize, TransportError> {
        let slot = peer.index();
        let mut copied = 0;
        while copied < dst.len() {
            let chunk = match self.leftover[slot].take() {
                Some(chunk) => chunk,
                None => match self.inbox[slot].try_recv() {
                    Ok(data) => Leftover { data, offset: 0 },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if copied > 0 {
                            break;
                        }
                        return Err(Self::disconnected(peer));
                    }
                },
            };
            let available = &chunk.data[chunk.offset..];
            let n = available.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&available[..n]);
            copied += n;
            if chunk.offset + n < chunk.data.len() {
                self.leftover[slot] = Some(Leftover {
                    offset: chunk.offset + n,
                    data: chunk.data,
                });
            }
        }
        Ok(copied)
    }

    /// Advance one pending item by at most one step.
    fn progress(&mut self, item: &mut PendingWorkItem) -> Result<(), TransportError> {
        match item.kind() {
            OpKind::Send => {
                let n = self.push_chunk(item.peer(), item.pending_bytes())?;
                item.advance(n);
            }
            OpKind::Receive => {
                let peer = item.peer();
                let n = self.pull_available(peer, item.pending_bytes_mut())?;
                item.advance(n);
            }
        }
        Ok(())
    }

    fn post(
        &mut self,
        kind: OpKind,
        peer: PeerId,
        buf: Buffer,
        len: usize,
    ) -> Result<WorkHandle, TransportError> {
        check_peer(self.rank, self.size(), peer)?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.pending
            .insert(handle, PendingWorkItem::new(kind, peer, buf, len));
        Ok(WorkHandle(handle))
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::RELIABLE
    }

    fn rank(&self) -> PeerId {
        self.rank
    }

    fn size(&self) -> usize {
        self.outbox.len()
    }

    fn send(&mut self, peer: PeerId, buf: &[u8]) -> Result<usize, TransportError> {
        check_peer(self.rank, self.size(), peer)?;
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.push_chunk(peer, &buf[sent..])?;
        }
        Ok(sent)
    }

    fn receive(&mut self, peer: PeerId, buf: &mut [u8]) -> Result<usize, TransportError> {
        check_peer(self.rank, self.size(), peer)?;
        let mut received = self.pull_available(peer, buf)?;
        if !self.blocking[peer.index()] {
            return Ok(received);
        }
        while received < buf.len() {
            if self.stop.is_requested() {
                return Err(TransportError::Interrupted);
            }
            let n = self.pull_available(peer, &mut buf[received..])?;
            if n == 0 {
                std::hint::spin_loop();
            }
            received += n;
        }
        Ok(received)
    }

    fn post_send(
        &mut self,
        peer: PeerId,
        buf: Buffer,
        len: usize,
    ) -> Result<WorkHandle, TransportError> {
        self.post(OpKind::Send, peer, buf, len)
    }

    fn post_receive(
        &mut self,
        peer: PeerId,
        buf: Buffer,
        len: usize,
    ) -> Result<WorkHandle, TransportError> {
        self.post(OpKind::Receive, peer, buf, len)
    }

    fn poll(&mut self, handle: WorkHandle) -> Result<PollResult, TransportError> {
        let mut item = self
            .pending
            .remove(&handle.0)
            .ok_or(TransportError::UnknownHandle(handle.0))?;
        if let Err(e) = self.progress(&mut item) {
            tracing::debug!(handle = handle.0, error = %e, "dropping failed work item");
            return Err(e);
        }
        if item.is_done() {
            return Ok(PollResult::Done(item.into_buffer()));
        }
        let remaining = item.remaining();
        self.pending.insert(handle.0, item);
        Ok(PollResult::InProgress(remaining))
    }

    fn set_blocking(&mut self, peer: PeerId, enabled: bool) -> Result<(), TransportError> {
        check_peer(self.rank, self.size(), peer)?;
        self.blocking[peer.index()] = enabled;
        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                rank = %self.rank,
                outstanding = self.pending.len(),
                "shutting down loopback transport with pending work"
            );
            self.pending.clear();
        }
    }
}
