//! The out-of-band service used to bootstrap connections.
//!
//! Transports that need to exchange connection metadata (queue pair numbers,
//! link identifiers) before any data path exists do it through a
//! [`Collective`]. Real runs back it with the job launcher's communicator;
//! [`LocalCollective`] connects ranks that live in one process.

use crossbeam::channel::{self, Receiver, Sender};
use netbench_types::PeerId;

use crate::error::TransportError;

/// Blocking point-to-point exchange of small fixed-size messages plus a
/// barrier, addressed by rank.
pub trait Collective {
    fn rank(&self) -> PeerId;

    fn size(&self) -> usize;

    /// Send `data` to `peer`.
    fn send_to(&self, peer: PeerId, data: &[u8]) -> Result<(), TransportError>;

    /// Receive exactly `buf.len()` bytes from `peer`.
    fn recv_from(&self, peer: PeerId, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Wait until every rank has called `barrier`.
    fn barrier(&self) -> Result<(), TransportError>;
}

/// Build a full mesh of unbounded channels for `size` ranks.
///
/// Entry `r` holds rank `r`'s senders indexed by destination and its
/// receivers indexed by source.
pub(crate) fn mesh<T>(size: usize) -> Vec<(Vec<Sender<T>>, Vec<Receiver<T>>)> {
    let mut receivers: Vec<Vec<Option<Receiver<T>>>> =
        (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
    let mut senders = Vec::with_capacity(size);
    for from in 0..size {
        let mut row = Vec::with_capacity(size);
        for to_row in receivers.iter_mut() {
            let (tx, rx) = channel::unbounded();
            row.push(tx);
            to_row[from] = Some(rx);
        }
        senders.push(row);
    }
    senders
        .into_iter()
        .zip(receivers)
        .map(|(tx, rx)| (tx, rx.into_iter().flatten().collect()))
        .collect()
}

/// In-process collective: one data channel and one barrier channel per
/// ordered rank pair.
///
/// A rank that drops its endpoint closes its channels, so the others fail
/// with [`TransportError::Collective`] instead of waiting for it.
pub struct LocalCollective {
    rank: PeerId,
    /// `outbox[p]` delivers to rank `p`.
    outbox: Vec<Sender<Vec<u8>>>,
    /// `inbox[p]` carries messages from rank `p`.
    inbox: Vec<Receiver<Vec<u8>>>,
    /// One token per barrier, in both directions.
    arrive: Vec<Sender<()>>,
    arrived: Vec<Receiver<()>>,
}

impl LocalCollective {
    /// Create the endpoints of a group of `size` ranks, indexed by rank.
    pub fn group(size: usize) -> Vec<LocalCollective> {
        mesh(size)
            .into_iter()
            .zip(mesh(size))
            .enumerate()
            .map(|(rank, ((outbox, inbox), (arrive, arrived)))| LocalCollective {
                rank: PeerId(rank as u32),
                outbox,
                inbox,
                arrive,
                arrived,
            })
            .collect()
    }

    fn others(&self) -> impl Iterator<Item = PeerId> + '_ {
        (0..self.outbox.len())
            .map(|p| PeerId(p as u32))
            .filter(move |&p| p != self.rank)
    }

    fn check(&self, peer: PeerId) -> Result<(), TransportError> {
        if peer.index() >= self.outbox.len() {
            return Err(TransportError::InvalidPeer(peer));
        }
        Ok(())
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> PeerId {
        self.rank
    }

    fn size(&self) -> usize {
        self.outbox.len()
    }

    fn send_to(&self, peer: PeerId, data: &[u8]) -> Result<(), TransportError> {
        self.check(peer)?;
        self.outbox[peer.index()]
            .send(data.to_vec())
            .map_err(|_| departed(peer))
    }

    fn recv_from(&self, peer: PeerId, buf: &mut [u8]) -> Result<(), TransportError> {
        self.check(peer)?;
        let msg = self.inbox[peer.index()]
            .recv()
            .map_err(|_| departed(peer))?;
        if msg.len() != buf.len() {
            return Err(TransportError::Collective(format!(
                "expected {} bytes from rank {peer}, got {}",
                buf.len(),
                msg.len()
            )));
        }
        buf.copy_from_slice(&msg);
        Ok(())
    }

    fn barrier(&self) -> Result<(), TransportError> {
        for peer in self.others() {
            self.arrive[peer.index()]
                .send(())
                .map_err(|_| departed(peer))?;
        }
        for peer in self.others() {
            self.arrived[peer.index()]
                .recv()
                .map_err(|_| departed(peer))?;
        }
        Ok(())
    }
}

fn departed(peer: PeerId) -> TransportError {
    TransportError::Collective(format!("rank {peer} has left the group"))
}
