//! Per-peer RC connections and their queue pair state machine.
//!
//! ```text
//! RESET -> INIT -> RTR -> RTS            establish
//! SQE ---------------> RTS                recover_from_send_error
//! ERR -> RESET -> INIT -> RTR -> RTS     recover_from_fatal_error
//! RTS -> SQD --------> RTS                drain_and_restore
//! any -> ERR                              flush_outstanding
//! ```
//!
//! Every recovery path ends by querying the device so the recorded state is
//! the hardware's, not the one we asked for.

use std::sync::Arc;

use netbench_transport::{Collective, TransportError};
use netbench_types::PeerId;
use netbench_verbs::{
    AccessFlags, CqHandle, QpHandle, QpInitAttr, QpState, QpTransition, Verbs, VerbsError,
};

use crate::config::{ConnectMode, RcConfig};
use crate::device::ActivePort;

/// What one side tells the other to connect its queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub lid: u16,
    pub qpn: u32,
    pub psn: u32,
}

impl EndpointInfo {
    pub const WIRE_SIZE: usize = 10;

    /// Little-endian `lid | qpn | psn`.
    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..2].copy_from_slice(&self.lid.to_le_bytes());
        out[2..6].copy_from_slice(&self.qpn.to_le_bytes());
        out[6..10].copy_from_slice(&self.psn.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::WIRE_SIZE]) -> Self {
        Self {
            lid: u16::from_le_bytes([bytes[0], bytes[1]]),
            qpn: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            psn: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        }
    }
}

/// How often each repair path ran on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub send_queue_recoveries: u64,
    pub fatal_recoveries: u64,
    pub drains: u64,
}

/// State of the connection to one peer.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub peer: PeerId,
    pub qp: QpHandle,
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub local: EndpointInfo,
    pub remote: EndpointInfo,
    pub state: QpState,
    pub stats: RecoveryStats,
}

/// Owns one RC queue pair per remote peer.
pub struct ConnectionManager<V: Verbs> {
    device: Arc<V>,
    config: RcConfig,
    port: ActivePort,
    rank: PeerId,
    records: Vec<Option<ConnectionRecord>>,
}

impl<V: Verbs> ConnectionManager<V> {
    pub fn new(device: Arc<V>, config: RcConfig, port: ActivePort, rank: PeerId, size: usize) -> Self {
        Self {
            device,
            config,
            port,
            rank,
            records: (0..size).map(|_| None).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, peer: PeerId) -> Option<&ConnectionRecord> {
        self.records.get(peer.index()).and_then(Option::as_ref)
    }

    /// The established connection to `peer`.
    pub fn connection(&self, peer: PeerId) -> Result<&ConnectionRecord, TransportError> {
        self.record(peer).ok_or_else(|| TransportError::Connection {
            peer,
            reason: "not connected".into(),
        })
    }

    fn record_mut(&mut self, peer: PeerId) -> Result<&mut ConnectionRecord, TransportError> {
        self.records
            .get_mut(peer.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| TransportError::Connection {
                peer,
                reason: "not connected".into(),
            })
    }

    /// Connect to every other rank, then wait for the whole group.
    pub fn establish_all(&mut self, collective: &dyn Collective) -> Result<(), TransportError> {
        if self.config.connect_mode == ConnectMode::OnDemand {
            return Err(TransportError::Connection {
                peer: self.rank,
                reason: "on-demand connection establishment is not supported".into(),
            });
        }
        for index in 0..self.size() {
            let peer = PeerId(index as u32);
            if peer != self.rank {
                self.establish(peer, collective)?;
            }
        }
        collective.barrier()
    }

    /// Create the queues for `peer`, exchange endpoints and bring the queue
    /// pair to RTS. Does nothing if the connection already exists.
    pub fn establish(
        &mut self,
        peer: PeerId,
        collective: &dyn Collective,
    ) -> Result<(), TransportError> {
        if peer == self.rank || peer.index() >= self.size() {
            return Err(TransportError::InvalidPeer(peer));
        }
        if self.record(peer).is_some() {
            return Ok(());
        }
        let fail = |e: VerbsError| TransportError::Connection {
            peer,
            reason: e.to_string(),
        };

        let (send_cq, recv_cq, qp) = self.create_queues().map_err(fail)?;
        let local = EndpointInfo {
            lid: self.port.lid,
            qpn: qp.qp_num(),
            psn: self.config.start_psn,
        };
        // Stored before the exchange so teardown reclaims the queues on failure.
        self.records[peer.index()] = Some(ConnectionRecord {
            peer,
            qp,
            send_cq,
            recv_cq,
            local,
            remote: local,
            state: QpState::Reset,
            stats: RecoveryStats::default(),
        });

        let remote = self.exchange(peer, local, collective)?;
        let transitions = [
            self.init_transition(),
            self.rtr_transition(&remote),
            self.rts_transition(),
        ];
        for transition in &transitions {
            self.device.modify_qp(qp, transition).map_err(fail)?;
        }
        let state = self.device.query_qp_state(qp).map_err(fail)?;
        let record = self.record_mut(peer)?;
        record.remote = remote;
        record.state = state;
        tracing::info!(
            %peer,
            qpn = local.qpn,
            remote_lid = remote.lid,
            remote_qpn = remote.qpn,
            state = %state,
            "connection established"
        );
        Ok(())
    }

    fn create_queues(&self) -> Result<(CqHandle, CqHandle, QpHandle), VerbsError> {
        let send_cq = self.device.create_cq(self.config.cq_entries)?;
        let recv_cq = match self.device.create_cq(self.config.cq_entries) {
            Ok(cq) => cq,
            Err(e) => {
                let _ = self.device.destroy_cq(send_cq);
                return Err(e);
            }
        };
        let attr = QpInitAttr {
            send_cq,
            recv_cq,
            max_send_wr: self.config.max_send_wr,
            max_recv_wr: self.config.max_recv_wr,
            max_send_sge: self.config.max_sge,
            max_recv_sge: self.config.max_sge,
        };
        match self.device.create_qp(&attr) {
            Ok(qp) => Ok((send_cq, recv_cq, qp)),
            Err(e) => {
                let _ = self.device.destroy_cq(recv_cq);
                let _ = self.device.destroy_cq(send_cq);
                Err(e)
            }
        }
    }

    /// Swap endpoints with `peer`. The lower rank sends first.
    fn exchange(
        &self,
        peer: PeerId,
        local: EndpointInfo,
        collective: &dyn Collective,
    ) -> Result<EndpointInfo, TransportError> {
        let mut buf = [0u8; EndpointInfo::WIRE_SIZE];
        if self.rank < peer {
            collective.send_to(peer, &local.to_bytes())?;
            collective.recv_from(peer, &mut buf)?;
        } else {
            collective.recv_from(peer, &mut buf)?;
            collective.send_to(peer, &local.to_bytes())?;
        }
        Ok(EndpointInfo::from_bytes(&buf))
    }

    fn init_transition(&self) -> QpTransition {
        QpTransition::Init {
            port: self.port.port_num,
            pkey_index: self.config.pkey_index,
            access: AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE,
        }
    }

    fn rtr_transition(&self, remote: &EndpointInfo) -> QpTransition {
        QpTransition::ReadyToReceive {
            path_mtu: self.port.path_mtu(&self.config),
            dest_qp_num: remote.qpn,
            dest_lid: remote.lid,
            rq_psn: remote.psn,
            min_rnr_timer: self.config.min_rnr_timer,
            max_dest_rd_atomic: self.config.max_rd_atomic,
        }
    }

    fn rts_transition(&self) -> QpTransition {
        QpTransition::ReadyToSend {
            sq_psn: self.config.start_psn,
            timeout: self.config.timeout,
            retry_cnt: self.config.retry_cnt,
            rnr_retry: self.config.rnr_retry,
            max_rd_atomic: self.config.max_rd_atomic,
        }
    }

    /// Apply `transitions` in order and store the queried result.
    fn replay(&mut self, peer: PeerId, transitions: &[QpTransition]) -> Result<QpState, TransportError> {
        let device = Arc::clone(&self.device);
        let record = self.record_mut(peer)?;
        let fail = |e: VerbsError| TransportError::Connection {
            peer,
            reason: e.to_string(),
        };
        for transition in transitions {
            device.modify_qp(record.qp, transition).map_err(fail)?;
        }
        record.state = device.query_qp_state(record.qp).map_err(fail)?;
        Ok(record.state)
    }

    /// SQE -> RTS.
    pub fn recover_from_send_error(&mut self, peer: PeerId) -> Result<QpState, TransportError> {
        tracing::warn!(%peer, "recovering from send queue error");
        let rts = self.rts_transition();
        let state = self.replay(peer, &[rts])?;
        self.record_mut(peer)?.stats.send_queue_recoveries += 1;
        Ok(state)
    }

    /// Any state -> RESET -> INIT -> RTR -> RTS.
    pub fn recover_from_fatal_error(&mut self, peer: PeerId) -> Result<QpState, TransportError> {
        tracing::warn!(%peer, "resetting queue pair after fatal error");
        let remote = self.connection(peer)?.remote;
        let transitions = [
            QpTransition::Reset,
            self.init_transition(),
            self.rtr_transition(&remote),
            self.rts_transition(),
        ];
        let state = self.replay(peer, &transitions)?;
        self.record_mut(peer)?.stats.fatal_recoveries += 1;
        Ok(state)
    }

    /// Move the queue pair to ERR so every posted work request completes
    /// flushed. The caller resets it with [`recover_from_fatal_error`] once
    /// the completions it cares about are reaped.
    ///
    /// [`recover_from_fatal_error`]: Self::recover_from_fatal_error
    pub fn flush_outstanding(&mut self, peer: PeerId) -> Result<QpState, TransportError> {
        tracing::warn!(%peer, "flushing outstanding work requests");
        self.replay(peer, &[QpTransition::Error])
    }

    /// Query the queue pair after a failed completion and repair it.
    pub fn recover_after_fault(&mut self, peer: PeerId) -> Result<QpState, TransportError> {
        let qp = self.connection(peer)?.qp;
        let state = self
            .device
            .query_qp_state(qp)
            .map_err(|e| TransportError::Connection {
                peer,
                reason: e.to_string(),
            })?;
        self.record_mut(peer)?.state = state;
        tracing::debug!(%peer, state = %state, "queue pair state after fault");
        match state {
            QpState::ReadyToSend => Ok(state),
            QpState::SendQueueError => self.recover_from_send_error(peer),
            _ => self.recover_from_fatal_error(peer),
        }
    }

    /// RTS -> SQD -> RTS, used when receive posts keep reporting busy.
    /// Falls back to the fatal path if the queue pair is not in RTS.
    pub fn drain_and_restore(&mut self, peer: PeerId) -> Result<QpState, TransportError> {
        let qp = self.connection(peer)?.qp;
        let current = self
            .device
            .query_qp_state(qp)
            .map_err(|e| TransportError::Connection {
                peer,
                reason: e.to_string(),
            })?;
        if current != QpState::ReadyToSend {
            return self.recover_from_fatal_error(peer);
        }
        tracing::warn!(%peer, "draining send queue");
        let rts = self.rts_transition();
        let state = self.replay(peer, &[QpTransition::SendQueueDrain, rts])?;
        self.record_mut(peer)?.stats.drains += 1;
        Ok(state)
    }

    /// Destroy the queue pair and completion queues of `peer`.
    /// Failures are logged; later calls do nothing.
    pub fn teardown(&mut self, peer: PeerId) {
        let Some(record) = self.records.get_mut(peer.index()).and_then(Option::take) else {
            return;
        };
        if let Err(e) = self.device.destroy_qp(record.qp) {
            tracing::error!(%peer, error = %e, "failed to destroy queue pair");
        }
        for cq in [record.send_cq, record.recv_cq] {
            if let Err(e) = self.device.destroy_cq(cq) {
                tracing::error!(%peer, error = %e, "failed to destroy completion queue");
            }
        }
        tracing::debug!(%peer, "connection torn down");
    }

    pub fn teardown_all(&mut self) {
        for index in 0..self.size() {
            self.teardown(PeerId(index as u32));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use netbench_transport::LocalCollective;
    use netbench_types::AlignedMemory;
    use netbench_verbs::{RecvWr, SendWr, Sge, SoftDevice, SoftFabric, WcStatus, WorkCompletion};

    use crate::device::open_port;

    type Manager = ConnectionManager<SoftDevice>;

    fn manager(fabric: &SoftFabric, rank: u32, size: usize, config: &RcConfig) -> Manager {
        let device = Arc::new(fabric.open_device(format!("soft_{rank}")));
        let port = open_port(&*device, config).unwrap();
        ConnectionManager::new(device, config.clone(), port, PeerId(rank), size)
    }

    /// Two managers connected to each other.
    fn connected_pair() -> (Manager, Manager) {
        let fabric = SoftFabric::new();
        let config = RcConfig::default();
        let mut group = LocalCollective::group(2);
        let cb = group.pop().unwrap();
        let ca = group.pop().unwrap();
        let mut a = manager(&fabric, 0, 2, &config);
        let mut b = manager(&fabric, 1, 2, &config);
        thread::scope(|s| {
            let ha = s.spawn(|| a.establish_all(&ca));
            let hb = s.spawn(|| b.establish_all(&cb));
            ha.join().unwrap().unwrap();
            hb.join().unwrap().unwrap();
        });
        (a, b)
    }

    fn state_of(m: &Manager, peer: u32) -> QpState {
        m.record(PeerId(peer)).unwrap().state
    }

    #[test]
    fn test_endpoint_encoding() {
        let info = EndpointInfo {
            lid: 0x0102,
            qpn: 0x0304_0506,
            psn: 7,
        };
        let bytes = info.to_bytes();
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(EndpointInfo::from_bytes(&bytes), info);
    }

    #[test]
    fn test_establish_pair() {
        let (a, b) = connected_pair();
        let ra = a.record(PeerId(1)).unwrap();
        let rb = b.record(PeerId(0)).unwrap();
        assert_eq!(ra.state, QpState::ReadyToSend);
        assert_eq!(rb.state, QpState::ReadyToSend);
        assert_eq!(ra.remote, rb.local);
        assert_eq!(rb.remote, ra.local);
        assert!(a.record(PeerId(0)).is_none());
    }

    #[test]
    fn test_on_demand_rejected() {
        let fabric = SoftFabric::new();
        let config = RcConfig {
            connect_mode: ConnectMode::OnDemand,
            ..RcConfig::default()
        };
        let mut m = manager(&fabric, 0, 1, &config);
        let group = LocalCollective::group(1);
        assert!(matches!(
            m.establish_all(&group[0]),
            Err(TransportError::Connection { .. })
        ));
    }

    #[test]
    fn test_establish_self_is_invalid() {
        let fabric = SoftFabric::new();
        let mut m = manager(&fabric, 0, 2, &RcConfig::default());
        let group = LocalCollective::group(2);
        assert!(matches!(
            m.establish(PeerId(0), &group[0]),
            Err(TransportError::InvalidPeer(PeerId(0)))
        ));
    }

    #[test]
    fn test_recover_from_send_queue_error() {
        let (mut a, _b) = connected_pair();
        let qp = a.record(PeerId(1)).unwrap().qp;
        a.device
            .inject_send_fault(qp, WcStatus::RemOpErr, QpState::SendQueueError)
            .unwrap();
        let wr = SendWr {
            wr_id: 1,
            sge: None,
            signaled: true,
        };
        a.device.post_send(qp, &wr).unwrap();
        assert_eq!(a.device.query_qp_state(qp).unwrap(), QpState::SendQueueError);

        assert_eq!(a.recover_after_fault(PeerId(1)).unwrap(), QpState::ReadyToSend);
        let stats = a.record(PeerId(1)).unwrap().stats;
        assert_eq!(stats.send_queue_recoveries, 1);
        assert_eq!(stats.fatal_recoveries, 0);
    }

    #[test]
    fn test_recover_from_error_state() {
        let (mut a, _b) = connected_pair();
        let qp = a.record(PeerId(1)).unwrap().qp;
        a.device.modify_qp(qp, &QpTransition::Error).unwrap();

        assert_eq!(a.recover_after_fault(PeerId(1)).unwrap(), QpState::ReadyToSend);
        assert_eq!(state_of(&a, 1), QpState::ReadyToSend);
        assert_eq!(a.record(PeerId(1)).unwrap().stats.fatal_recoveries, 1);
    }

    #[test]
    fn test_recover_when_healthy_is_noop() {
        let (mut a, _b) = connected_pair();
        assert_eq!(a.recover_after_fault(PeerId(1)).unwrap(), QpState::ReadyToSend);
        assert_eq!(a.record(PeerId(1)).unwrap().stats, RecoveryStats::default());
    }

    #[test]
    fn test_flush_outstanding_then_reset() {
        let (mut a, _b) = connected_pair();
        let r = a.record(PeerId(1)).unwrap().clone();
        let mem = Arc::new(AlignedMemory::zeroed(64).unwrap());
        let mr = a.device.reg_mr(&mem, AccessFlags::LOCAL_WRITE).unwrap();
        let wr = RecvWr {
            wr_id: 3,
            sge: Some(Sge {
                addr: mr.addr,
                length: 64,
                lkey: mr.lkey,
            }),
        };
        a.device.post_recv(r.qp, &wr).unwrap();

        assert_eq!(a.flush_outstanding(PeerId(1)).unwrap(), QpState::Error);
        assert_eq!(state_of(&a, 1), QpState::Error);
        let mut wcs = Vec::new();
        a.device.poll_cq(r.recv_cq, &mut wcs, 4).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!((wcs[0].wr_id, wcs[0].status), (3, WcStatus::WrFlushErr));

        assert_eq!(
            a.recover_from_fatal_error(PeerId(1)).unwrap(),
            QpState::ReadyToSend
        );
    }

    #[test]
    fn test_drain_and_restore() {
        let (mut a, _b) = connected_pair();
        assert_eq!(a.drain_and_restore(PeerId(1)).unwrap(), QpState::ReadyToSend);
        assert_eq!(a.record(PeerId(1)).unwrap().stats.drains, 1);

        let qp = a.record(PeerId(1)).unwrap().qp;
        a.device.modify_qp(qp, &QpTransition::Error).unwrap();
        assert_eq!(a.drain_and_restore(PeerId(1)).unwrap(), QpState::ReadyToSend);
        let stats = a.record(PeerId(1)).unwrap().stats;
        assert_eq!((stats.drains, stats.fatal_recoveries), (1, 1));
    }

    #[test]
    fn test_completion_order_matches_post_order() {
        let (a, b) = connected_pair();
        let ra = a.record(PeerId(1)).unwrap().clone();
        let rb = b.record(PeerId(0)).unwrap().clone();
        let src = Arc::new(AlignedMemory::zeroed(64).unwrap());
        let dst = Arc::new(AlignedMemory::zeroed(64).unwrap());
        let src_mr = a.device.reg_mr(&src, AccessFlags::LOCAL_WRITE).unwrap();
        let dst_mr = b.device.reg_mr(&dst, AccessFlags::LOCAL_WRITE).unwrap();

        for id in 0..8u64 {
            let wr = RecvWr {
                wr_id: id,
                sge: Some(Sge {
                    addr: dst_mr.addr,
                    length: 64,
                    lkey: dst_mr.lkey,
                }),
            };
            b.device.post_recv(rb.qp, &wr).unwrap();
        }
        for id in 0..8u64 {
            let wr = SendWr {
                wr_id: 100 + id,
                sge: Some(Sge {
                    addr: src_mr.addr,
                    length: 8,
                    lkey: src_mr.lkey,
                }),
                signaled: true,
            };
            a.device.post_send(ra.qp, &wr).unwrap();
        }

        let mut sends: Vec<WorkCompletion> = Vec::new();
        a.device.poll_cq(ra.send_cq, &mut sends, 16).unwrap();
        let mut recvs: Vec<WorkCompletion> = Vec::new();
        b.device.poll_cq(rb.recv_cq, &mut recvs, 16).unwrap();
        assert_eq!(
            sends.iter().map(|wc| wc.wr_id).collect::<Vec<_>>(),
            (100..108).collect::<Vec<_>>()
        );
        assert_eq!(
            recvs.iter().map(|wc| wc.wr_id).collect::<Vec<_>>(),
            (0..8).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (mut a, _b) = connected_pair();
        assert_eq!(a.device.resource_counts().qps, 1);
        a.teardown(PeerId(1));
        assert_eq!(a.device.resource_counts().qps, 0);
        assert_eq!(a.device.resource_counts().cqs, 0);
        a.teardown(PeerId(1));
        a.teardown_all();
        assert!(a.record(PeerId(1)).is_none());
        assert!(matches!(
            a.recover_after_fault(PeerId(1)),
            Err(TransportError::Connection { .. })
        ));
    }
}
