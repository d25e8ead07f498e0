//! An in-process verbs device.
//!
//! A [`SoftFabric`] is a switch that any number of [`SoftDevice`]s attach to,
//! each with its own LID on port 1. Queue pairs connected through the fabric
//! behave like RC queue pairs:
//!
//! - `modify_qp` only accepts legal state transitions;
//! - a send is matched FIFO against the receives posted on the destination
//!   queue pair and completes on both sides only once it has been placed, so
//!   a sender waits for the receiver to post (channel semantics);
//! - every SGE is checked against a live registration owned by the posting
//!   device, and data is copied in and out of the registered block;
//! - a queue pair entering `ERR` flushes its posted receives and its sends
//!   still waiting at the destination, and messages queued for it fail on the
//!   sending side with `RETRY_EXC_ERR`.
//!
//! Faults can be injected per queue pair: a completion status plus the state
//! the queue pair falls into for its next send, a number of receive posts
//! that fail with [`VerbsError::Busy`], or receive posts that drop the queue
//! pair into `ERR` once queued.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use netbench_types::AlignedMemory;
use parking_lot::Mutex;

use crate::error::VerbsError;
use crate::types::{
    AccessFlags, CqHandle, LinkLayer, MemoryRegion, MrHandle, Mtu, PortAttr, PortState,
    QpHandle, QpInitAttr, QpState, QpTransition, RecvWr, SendWr, Sge, WcOpcode, WcStatus,
    WorkCompletion,
};
use crate::Verbs;

/// The only port a soft device exposes.
const PORT_NUM: u8 = 1;

/// First queue pair number handed out; low numbers are reserved on real HCAs.
const FIRST_QPN: u32 = 0x100;

/// Bit distinguishing remote keys from local keys.
const RKEY_BIT: u32 = 0x8000_0000;

/// A message that left its sender and waits for a receive on the target.
struct Inbound {
    data: Vec<u8>,
    src_qpn: u32,
    wr_id: u64,
    signaled: bool,
}

struct SoftQp {
    owner: u16,
    state: QpState,
    send_cq: u32,
    recv_cq: u32,
    max_send_wr: u32,
    max_recv_wr: u32,
    /// (lid, qpn) of the connected queue pair, set on RTR.
    remote: Option<(u16, u32)>,
    recv_queue: VecDeque<RecvWr>,
    inbound: VecDeque<Inbound>,
    /// Sends that left this queue pair and are not completed yet.
    outstanding: u32,
    faults: VecDeque<(WcStatus, QpState)>,
    busy_recv_posts: u32,
    /// Receive posts that push the queue pair into `ERR` once queued.
    recv_faults: u32,
}

struct SoftCq {
    owner: u16,
    capacity: u32,
    entries: VecDeque<WorkCompletion>,
}

struct SoftMr {
    owner: u16,
    memory: Arc<AlignedMemory>,
    access: AccessFlags,
}

struct FabricState {
    next_lid: u16,
    next_qpn: u32,
    next_cq: u32,
    next_key: u32,
    qps: HashMap<u32, SoftQp>,
    cqs: HashMap<u32, SoftCq>,
    mrs: HashMap<u32, SoftMr>,
}

impl FabricState {
    fn new() -> Self {
        Self {
            next_lid: 1,
            next_qpn: FIRST_QPN,
            next_cq: 1,
            next_key: 1,
            qps: HashMap::new(),
            cqs: HashMap::new(),
            mrs: HashMap::new(),
        }
    }

    fn qp_mut(&mut self, owner: u16, qpn: u32) -> Result<&mut SoftQp, VerbsError> {
        self.qps
            .get_mut(&qpn)
            .filter(|qp| qp.owner == owner)
            .ok_or(VerbsError::UnknownQp(qpn))
    }

    fn cq_mut(&mut self, owner: u16, cq: u32) -> Result<&mut SoftCq, VerbsError> {
        self.cqs
            .get_mut(&cq)
            .filter(|c| c.owner == owner)
            .ok_or(VerbsError::UnknownCq(cq))
    }

    fn complete(&mut self, cq: u32, wc: WorkCompletion) {
        match self.cqs.get_mut(&cq) {
            Some(queue) => {
                if queue.entries.len() >= queue.capacity as usize {
                    tracing::warn!(cq, capacity = queue.capacity, "completion queue overrun");
                }
                queue.entries.push_back(wc);
            }
            None => tracing::debug!(cq, wr_id = wc.wr_id, "completion for a destroyed queue"),
        }
    }

    /// Complete a send on `src_qpn`, if it still exists.
    fn complete_send(&mut self, src_qpn: u32, wr_id: u64, signaled: bool, status: WcStatus) {
        let Some(qp) = self.qps.get_mut(&src_qpn) else {
            return;
        };
        qp.outstanding = qp.outstanding.saturating_sub(1);
        let cq = qp.send_cq;
        // Errors are always reported, even for unsignaled requests.
        if signaled || !status.is_success() {
            self.complete(
                cq,
                WorkCompletion {
                    wr_id,
                    status,
                    opcode: WcOpcode::Send,
                    byte_len: 0,
                    qp_num: src_qpn,
                },
            );
        }
        if !status.is_success() {
            self.enter_state(src_qpn, QpState::Error);
        }
    }

    /// Move `qpn` into `state`, applying the side effects of the fault states.
    fn enter_state(&mut self, qpn: u32, state: QpState) {
        let (recv_cq, flushed, dropped) = match self.qps.get_mut(&qpn) {
            Some(qp) => {
                let was = qp.state;
                qp.state = state;
                if was != state {
                    tracing::debug!(qpn, from = %was, to = %state, "queue pair state change");
                }
                if matches!(state, QpState::Error | QpState::Reset) {
                    let flushed: Vec<RecvWr> = qp.recv_queue.drain(..).collect();
                    let dropped: Vec<Inbound> = qp.inbound.drain(..).collect();
                    (qp.recv_cq, flushed, dropped)
                } else {
                    return;
                }
            }
            None => return,
        };

        // Sends of this queue pair still waiting at their destination.
        let mut withdrawn = Vec::new();
        for dest in self.qps.values_mut() {
            dest.inbound.retain(|msg| {
                if msg.src_qpn == qpn {
                    withdrawn.push((msg.wr_id, msg.signaled));
                    false
                } else {
                    true
                }
            });
        }

        // A reset discards work requests silently; ERR reports them.
        if state == QpState::Error {
            for (wr_id, signaled) in withdrawn {
                self.complete_send(qpn, wr_id, signaled, WcStatus::WrFlushErr);
            }
            for wr in flushed {
                self.complete(
                    recv_cq,
                    WorkCompletion {
                        wr_id: wr.wr_id,
                        status: WcStatus::WrFlushErr,
                        opcode: WcOpcode::Recv,
                        byte_len: 0,
                        qp_num: qpn,
                    },
                );
            }
        } else if let Some(qp) = self.qps.get_mut(&qpn) {
            qp.outstanding = 0;
        }
        for msg in dropped {
            self.complete_send(msg.src_qpn, msg.wr_id, msg.signaled, WcStatus::RetryExcErr);
        }
    }

    fn gather(&self, owner: u16, sge: &Sge) -> Option<Vec<u8>> {
        let mr = self.mrs.get(&sge.lkey).filter(|mr| mr.owner == owner)?;
        mr.memory.read_range(sge.addr, sge.length as usize)
    }

    fn scatter(&self, owner: u16, sge: &Sge, data: &[u8]) -> bool {
        match self.mrs.get(&sge.lkey) {
            Some(mr) if mr.owner == owner && mr.access.contains(AccessFlags::LOCAL_WRITE) => {
                mr.memory.write_range(sge.addr, data)
            }
            _ => false,
        }
    }

    /// Match queued inbound messages of `qpn` with its posted receives.
    fn deliver(&mut self, qpn: u32) {
        loop {
            let (owner, recv_cq, msg, wr) = match self.qps.get_mut(&qpn) {
                Some(qp)
                    if qp.state.can_receive()
                        && !qp.inbound.is_empty()
                        && !qp.recv_queue.is_empty() =>
                {
                    let (Some(msg), Some(wr)) = (qp.inbound.pop_front(), qp.recv_queue.pop_front())
                    else {
                        return;
                    };
                    (qp.owner, qp.recv_cq, msg, wr)
                }
                _ => return,
            };

            let capacity = wr.sge.map_or(0, |sge| sge.length as usize);
            let (recv_status, send_status) = if msg.data.len() > capacity {
                (WcStatus::LocLenErr, WcStatus::RemInvReqErr)
            } else {
                match wr.sge {
                    Some(sge) if !msg.data.is_empty() && !self.scatter(owner, &sge, &msg.data) => {
                        (WcStatus::LocProtErr, WcStatus::RemOpErr)
                    }
                    _ => (WcStatus::Success, WcStatus::Success),
                }
            };

            self.complete(
                recv_cq,
                WorkCompletion {
                    wr_id: wr.wr_id,
                    status: recv_status,
                    opcode: WcOpcode::Recv,
                    byte_len: if recv_status.is_success() {
                        msg.data.len() as u32
                    } else {
                        0
                    },
                    qp_num: qpn,
                },
            );
            self.complete_send(msg.src_qpn, msg.wr_id, msg.signaled, send_status);
            if !recv_status.is_success() {
                self.enter_state(qpn, QpState::Error);
            }
        }
    }
}

/// The switch soft devices attach to.
#[derive(Clone)]
pub struct SoftFabric {
    state: Arc<Mutex<FabricState>>,
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftFabric {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FabricState::new())),
        }
    }

    /// Attach a new device with the next free LID.
    pub fn open_device(&self, name: impl Into<String>) -> SoftDevice {
        let lid = {
            let mut state = self.state.lock();
            let lid = state.next_lid;
            state.next_lid += 1;
            lid
        };
        SoftDevice {
            name: name.into(),
            lid,
            port_state: Mutex::new(PortState::Active),
            fabric: Arc::clone(&self.state),
        }
    }
}

/// Counts of the objects a device currently owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub qps: usize,
    pub cqs: usize,
    pub mrs: usize,
}

/// One device attached to a [`SoftFabric`].
pub struct SoftDevice {
    name: String,
    lid: u16,
    port_state: Mutex<PortState>,
    fabric: Arc<Mutex<FabricState>>,
}

impl SoftDevice {
    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn set_port_state(&self, state: PortState) {
        *self.port_state.lock() = state;
    }

    /// Make the next send on `qp` complete with `status` and leave the queue
    /// pair in `next_state` instead of transmitting.
    pub fn inject_send_fault(
        &self,
        qp: QpHandle,
        status: WcStatus,
        next_state: QpState,
    ) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.lock();
        fabric
            .qp_mut(self.lid, qp.0)?
            .faults
            .push_back((status, next_state));
        Ok(())
    }

    /// Make the next `count` receive posts on `qp` fail with `Busy`.
    pub fn inject_busy_recv_posts(&self, qp: QpHandle, count: u32) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.lock();
        fabric.qp_mut(self.lid, qp.0)?.busy_recv_posts += count;
        Ok(())
    }

    /// Make the next `count` receive posts on `qp` drop the queue pair into
    /// `ERR` right after the request is queued, so it completes flushed.
    pub fn inject_recv_fault(&self, qp: QpHandle, count: u32) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.lock();
        fabric.qp_mut(self.lid, qp.0)?.recv_faults += count;
        Ok(())
    }

    pub fn resource_counts(&self) -> ResourceCounts {
        let fabric = self.fabric.lock();
        ResourceCounts {
            qps: fabric.qps.values().filter(|q| q.owner == self.lid).count(),
            cqs: fabric.cqs.values().filter(|c| c.owner == self.lid).count(),
            mrs: fabric.mrs.values().filter(|m| m.owner == self.lid).count(),
        }
    }
}

impl Verbs for SoftDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_port(&self, port: u8) -> Result<PortAttr, VerbsError> {
        if port != PORT_NUM {
            return Err(VerbsError::InvalidPort(port));
        }
        Ok(PortAttr {
            state: *self.port_state.lock(),
            lid: self.lid,
            active_mtu: Mtu::Mtu4096,
            link_layer: LinkLayer::Infiniband,
        })
    }

    fn create_cq(&self, entries: u32) -> Result<CqHandle, VerbsError> {
        let mut fabric = self.fabric.lock();
        let id = fabric.next_cq;
        fabric.next_cq += 1;
        fabric.cqs.insert(
            id,
            SoftCq {
                owner: self.lid,
                capacity: entries.max(1),
                entries: VecDeque::new(),
            },
        );
        Ok(CqHandle(id))
    }

    fn destroy_cq(&self, cq: CqHandle) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.lock();
        fabric.cq_mut(self.lid, cq.0)?;
        if fabric
            .qps
            .values()
            .any(|qp| qp.send_cq == cq.0 || qp.recv_cq == cq.0)
        {
            return Err(VerbsError::CqInUse(cq.0));
        }
        fabric.cqs.remove(&cq.0);
        Ok(())
    }

    fn create_qp(&self, attr: &QpInitAttr) -> Result<QpHandle, VerbsError> {
        let mut fabric = self.fabric.lock();
        fabric.cq_mut(self.lid, attr.send_cq.0)?;
        fabric.cq_mut(self.lid, attr.recv_cq.0)?;
        let qpn = fabric.next_qpn;
        fabric.next_qpn += 1;
        fabric.qps.insert(
            qpn,
            SoftQp {
                owner: self.lid,
                state: QpState::Reset,
                send_cq: attr.send_cq.0,
                recv_cq: attr.recv_cq.0,
                max_send_wr: attr.max_send_wr.max(1),
                max_recv_wr: attr.max_recv_wr.max(1),
                remote: None,
                recv_queue: VecDeque::new(),
                inbound: VecDeque::new(),
                outstanding: 0,
                faults: VecDeque::new(),
                busy_recv_posts: 0,
                recv_faults: 0,
            },
        );
        Ok(QpHandle(qpn))
    }

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.lock();
        let entry = fabric.qp_mut(self.lid, qp.0)?;
        let from = entry.state;
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(VerbsError::InvalidTransition { from, to });
        }
        match *transition {
            QpTransition::Init { port, .. } if port != PORT_NUM => {
                return Err(VerbsError::InvalidPort(port));
            }
            QpTransition::Reset => entry.remote = None,
            QpTransition::ReadyToReceive {
                dest_lid,
                dest_qp_num,
                ..
            } => entry.remote = Some((dest_lid, dest_qp_num)),
            _ => {}
        }
        fabric.enter_state(qp.0, to);
        fabric.deliver(qp.0);
        Ok(())
    }

    fn query_qp_state(&self, qp: QpHandle) -> Result<QpState, VerbsError> {
        let mut fabric = self.fabric.lock();
        Ok(fabric.qp_mut(self.lid, qp.0)?.state)
    }

    fn destroy_qp(&self, qp: QpHandle) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.lock();
        fabric.qp_mut(self.lid, qp.0)?;
        fabric.enter_state(qp.0, QpState::Reset);
        fabric.qps.remove(&qp.0);
        Ok(())
    }

    fn reg_mr(
        &self,
        memory: &Arc<AlignedMemory>,
        access: AccessFlags,
    ) -> Result<MemoryRegion, VerbsError> {
        let mut fabric = self.fabric.lock();
        let lkey = fabric.next_key;
        fabric.next_key += 1;
        fabric.mrs.insert(
            lkey,
            SoftMr {
                owner: self.lid,
                memory: Arc::clone(memory),
                access,
            },
        );
        Ok(MemoryRegion {
            handle: MrHandle(lkey),
            addr: memory.addr(),
            len: memory.len(),
            lkey,
            rkey: lkey | RKEY_BIT,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.lock();
        match fabric.mrs.get(&mr.0) {
            Some(region) if region.owner == self.lid => {
                fabric.mrs.remove(&mr.0);
                Ok(())
            }
            _ => Err(VerbsError::UnknownMr(mr.0)),
        }
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.lock();
        let lid = self.lid;
        let entry = fabric.qp_mut(lid, qp.0)?;
        match entry.state {
            QpState::Reset | QpState::Init | QpState::ReadyToReceive => {
                return Err(VerbsError::InvalidState {
                    op: "post_send",
                    state: entry.state,
                });
            }
            QpState::Error | QpState::SendQueueError => {
                let cq = entry.send_cq;
                fabric.complete(
                    cq,
                    WorkCompletion {
                        wr_id: wr.wr_id,
                        status: WcStatus::WrFlushErr,
                        opcode: WcOpcode::Send,
                        byte_len: 0,
                        qp_num: qp.0,
                    },
                );
                return Ok(());
            }
            QpState::ReadyToSend | QpState::SendQueueDrain => {}
        }
        if entry.outstanding >= entry.max_send_wr {
            return Err(VerbsError::QueueFull);
        }
        entry.outstanding += 1;
        let remote = entry.remote;

        if let Some((status, next_state)) = entry.faults.pop_front() {
            entry.outstanding -= 1;
            let cq = entry.send_cq;
            fabric.complete(
                cq,
                WorkCompletion {
                    wr_id: wr.wr_id,
                    status,
                    opcode: WcOpcode::Send,
                    byte_len: 0,
                    qp_num: qp.0,
                },
            );
            fabric.enter_state(qp.0, next_state);
            return Ok(());
        }

        let data = match wr.sge {
            None => Vec::new(),
            Some(ref sge) => match fabric.gather(lid, sge) {
                Some(data) => data,
                None => {
                    fabric.complete_send(qp.0, wr.wr_id, wr.signaled, WcStatus::LocProtErr);
                    return Ok(());
                }
            },
        };

        let target = remote.and_then(|(dest_lid, dest_qpn)| {
            fabric
                .qps
                .get(&dest_qpn)
                .filter(|dest| dest.owner == dest_lid && dest.state.can_receive())
                .map(|_| dest_qpn)
        });
        match target {
            Some(dest_qpn) => {
                if let Some(dest) = fabric.qps.get_mut(&dest_qpn) {
                    dest.inbound.push_back(Inbound {
                        data,
                        src_qpn: qp.0,
                        wr_id: wr.wr_id,
                        signaled: wr.signaled,
                    });
                }
                fabric.deliver(dest_qpn);
            }
            None => {
                fabric.complete_send(qp.0, wr.wr_id, wr.signaled, WcStatus::RetryExcErr);
            }
        }
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> Result<(), VerbsError> {
        let mut fabric = self.fabric.lock();
        let entry = fabric.qp_mut(self.lid, qp.0)?;
        if entry.busy_recv_posts > 0 {
            entry.busy_recv_posts -= 1;
            return Err(VerbsError::Busy);
        }
        match entry.state {
            QpState::Reset => {
                return Err(VerbsError::InvalidState {
                    op: "post_recv",
                    state: entry.state,
                });
            }
            QpState::Error => {
                let cq = entry.recv_cq;
                fabric.complete(
                    cq,
                    WorkCompletion {
                        wr_id: wr.wr_id,
                        status: WcStatus::WrFlushErr,
                        opcode: WcOpcode::Recv,
                        byte_len: 0,
                        qp_num: qp.0,
                    },
                );
                return Ok(());
            }
            _ => {}
        }
        if entry.recv_queue.len() >= entry.max_recv_wr as usize {
            return Err(VerbsError::QueueFull);
        }
        entry.recv_queue.push_back(*wr);
        if entry.recv_faults > 0 {
            entry.recv_faults -= 1;
            fabric.enter_state(qp.0, QpState::Error);
            return Ok(());
        }
        fabric.deliver(qp.0);
        Ok(())
    }

    fn poll_cq(
        &self,
        cq: CqHandle,
        out: &mut Vec<WorkCompletion>,
        max: usize,
    ) -> Result<usize, VerbsError> {
        let mut fabric = self.fabric.lock();
        let queue = fabric.cq_mut(self.lid, cq.0)?;
        let n = queue.entries.len().min(max);
        out.extend(queue.entries.drain(..n));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCESS: AccessFlags = AccessFlags::LOCAL_WRITE
        .union(AccessFlags::REMOTE_WRITE)
        .union(AccessFlags::REMOTE_READ);

    struct Side {
        dev: SoftDevice,
        qp: QpHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
    }

    fn side(fabric: &SoftFabric, name: &str) -> Side {
        let dev = fabric.open_device(name);
        let send_cq = dev.create_cq(16).unwrap();
        let recv_cq = dev.create_cq(16).unwrap();
        let qp = dev
            .create_qp(&QpInitAttr {
                send_cq,
                recv_cq,
                max_send_wr: 8,
                max_recv_wr: 8,
                max_send_sge: 1,
                max_recv_sge: 1,
            })
            .unwrap();
        Side {
            dev,
            qp,
            send_cq,
            recv_cq,
        }
    }

    fn bring_up(local: &Side, remote: &Side) {
        let dev = &local.dev;
        dev.modify_qp(
            local.qp,
            &QpTransition::Init {
                port: 1,
                pkey_index: 0,
                access: ACCESS,
            },
        )
        .unwrap();
        dev.modify_qp(
            local.qp,
            &QpTransition::ReadyToReceive {
                path_mtu: Mtu::Mtu1024,
                dest_qp_num: remote.qp.qp_num(),
                dest_lid: remote.dev.lid(),
                rq_psn: 0,
                min_rnr_timer: 12,
                max_dest_rd_atomic: 1,
            },
        )
        .unwrap();
        dev.modify_qp(
            local.qp,
            &QpTransition::ReadyToSend {
                sq_psn: 0,
                timeout: 14,
                retry_cnt: 7,
                rnr_retry: 7,
                max_rd_atomic: 1,
            },
        )
        .unwrap();
    }

    fn connected() -> (Side, Side) {
        let fabric = SoftFabric::new();
        let a = side(&fabric, "soft_0");
        let b = side(&fabric, "soft_1");
        bring_up(&a, &b);
        bring_up(&b, &a);
        (a, b)
    }

    fn region(dev: &SoftDevice, len: usize) -> (Arc<AlignedMemory>, MemoryRegion) {
        let mem = Arc::new(AlignedMemory::zeroed(len).unwrap());
        let mr = dev.reg_mr(&mem, ACCESS).unwrap();
        (mem, mr)
    }

    fn poll_one(dev: &SoftDevice, cq: CqHandle) -> Option<WorkCompletion> {
        let mut out = Vec::new();
        dev.poll_cq(cq, &mut out, 1).unwrap();
        out.pop()
    }

    fn send_wr(wr_id: u64, mr: &MemoryRegion, len: u32) -> SendWr {
        SendWr {
            wr_id,
            sge: Some(Sge {
                addr: mr.addr,
                length: len,
                lkey: mr.lkey,
            }),
            signaled: true,
        }
    }

    fn recv_wr(wr_id: u64, mr: &MemoryRegion, len: u32) -> RecvWr {
        RecvWr {
            wr_id,
            sge: Some(Sge {
                addr: mr.addr,
                length: len,
                lkey: mr.lkey,
            }),
        }
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let fabric = SoftFabric::new();
        let a = side(&fabric, "soft_0");
        let err = a
            .dev
            .modify_qp(
                a.qp,
                &QpTransition::ReadyToSend {
                    sq_psn: 0,
                    timeout: 14,
                    retry_cnt: 7,
                    rnr_retry: 7,
                    max_rd_atomic: 1,
                },
            )
            .unwrap_err();
        assert_eq!(
            err,
            VerbsError::InvalidTransition {
                from: QpState::Reset,
                to: QpState::ReadyToSend
            }
        );
    }

    #[test]
    fn test_send_waits_for_receive() {
        let (a, b) = connected();
        let (src, src_mr) = region(&a.dev, 64);
        let (dst, dst_mr) = region(&b.dev, 64);
        src.write_range(src.addr(), b"hello");

        a.dev.post_send(a.qp, &send_wr(1, &src_mr, 5)).unwrap();
        assert!(poll_one(&a.dev, a.send_cq).is_none());

        b.dev.post_recv(b.qp, &recv_wr(9, &dst_mr, 64)).unwrap();
        let recv = poll_one(&b.dev, b.recv_cq).unwrap();
        assert_eq!(recv.status, WcStatus::Success);
        assert_eq!(recv.wr_id, 9);
        assert_eq!(recv.byte_len, 5);
        assert_eq!(dst.read_range(dst.addr(), 5).unwrap(), b"hello");

        let sent = poll_one(&a.dev, a.send_cq).unwrap();
        assert_eq!(sent.status, WcStatus::Success);
        assert_eq!(sent.wr_id, 1);
    }

    #[test]
    fn test_completions_in_post_order() {
        let (a, b) = connected();
        let (_src, src_mr) = region(&a.dev, 16);
        let (_dst, dst_mr) = region(&b.dev, 16);
        for id in 0..5 {
            b.dev.post_recv(b.qp, &recv_wr(100 + id, &dst_mr, 16)).unwrap();
        }
        for id in 0..5 {
            a.dev.post_send(a.qp, &send_wr(id, &src_mr, 16)).unwrap();
        }
        let mut out = Vec::new();
        a.dev.poll_cq(a.send_cq, &mut out, 16).unwrap();
        let ids: Vec<u64> = out.iter().map(|wc| wc.wr_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_short_receive_buffer_is_length_error() {
        let (a, b) = connected();
        let (_src, src_mr) = region(&a.dev, 64);
        let (_dst, dst_mr) = region(&b.dev, 64);
        b.dev.post_recv(b.qp, &recv_wr(1, &dst_mr, 8)).unwrap();
        a.dev.post_send(a.qp, &send_wr(2, &src_mr, 32)).unwrap();

        assert_eq!(poll_one(&b.dev, b.recv_cq).unwrap().status, WcStatus::LocLenErr);
        assert_eq!(poll_one(&a.dev, a.send_cq).unwrap().status, WcStatus::RemInvReqErr);
        assert_eq!(b.dev.query_qp_state(b.qp).unwrap(), QpState::Error);
        assert_eq!(a.dev.query_qp_state(a.qp).unwrap(), QpState::Error);
    }

    #[test]
    fn test_unregistered_sge_is_protection_error() {
        let (a, _b) = connected();
        let wr = SendWr {
            wr_id: 5,
            sge: Some(Sge {
                addr: 0x1000,
                length: 8,
                lkey: 777,
            }),
            signaled: true,
        };
        a.dev.post_send(a.qp, &wr).unwrap();
        assert_eq!(poll_one(&a.dev, a.send_cq).unwrap().status, WcStatus::LocProtErr);
        assert_eq!(a.dev.query_qp_state(a.qp).unwrap(), QpState::Error);
    }

    #[test]
    fn test_injected_fault_and_flush() {
        let (a, _b) = connected();
        let (_src, src_mr) = region(&a.dev, 16);
        let (_dst, dst_mr) = region(&a.dev, 16);
        a.dev.post_recv(a.qp, &recv_wr(40, &dst_mr, 16)).unwrap();
        a.dev
            .inject_send_fault(a.qp, WcStatus::RetryExcErr, QpState::Error)
            .unwrap();

        a.dev.post_send(a.qp, &send_wr(41, &src_mr, 16)).unwrap();
        let wc = poll_one(&a.dev, a.send_cq).unwrap();
        assert_eq!((wc.wr_id, wc.status), (41, WcStatus::RetryExcErr));
        assert_eq!(a.dev.query_qp_state(a.qp).unwrap(), QpState::Error);

        let flushed = poll_one(&a.dev, a.recv_cq).unwrap();
        assert_eq!((flushed.wr_id, flushed.status), (40, WcStatus::WrFlushErr));
    }

    #[test]
    fn test_error_state_withdraws_waiting_send() {
        let (a, b) = connected();
        let (_src, src_mr) = region(&a.dev, 16);
        let (dst, dst_mr) = region(&b.dev, 16);
        a.dev.post_send(a.qp, &send_wr(5, &src_mr, 16)).unwrap();
        assert!(poll_one(&a.dev, a.send_cq).is_none());

        a.dev.modify_qp(a.qp, &QpTransition::Error).unwrap();
        let wc = poll_one(&a.dev, a.send_cq).unwrap();
        assert_eq!((wc.wr_id, wc.status), (5, WcStatus::WrFlushErr));

        // Nothing is left for the receiver to pick up.
        dst.write_range(dst.addr(), &[0x11; 16]);
        b.dev.post_recv(b.qp, &recv_wr(6, &dst_mr, 16)).unwrap();
        assert!(poll_one(&b.dev, b.recv_cq).is_none());
        assert_eq!(dst.read_range(dst.addr(), 1).unwrap(), vec![0x11]);
    }

    #[test]
    fn test_injected_receive_fault_flushes_post() {
        let (a, _b) = connected();
        let (_dst, dst_mr) = region(&a.dev, 16);
        a.dev.inject_recv_fault(a.qp, 1).unwrap();
        a.dev.post_recv(a.qp, &recv_wr(7, &dst_mr, 16)).unwrap();
        assert_eq!(a.dev.query_qp_state(a.qp).unwrap(), QpState::Error);
        let wc = poll_one(&a.dev, a.recv_cq).unwrap();
        assert_eq!((wc.wr_id, wc.status), (7, WcStatus::WrFlushErr));
    }

    #[test]
    fn test_busy_receive_posts() {
        let (a, _b) = connected();
        let (_dst, dst_mr) = region(&a.dev, 16);
        a.dev.inject_busy_recv_posts(a.qp, 2).unwrap();
        assert_eq!(a.dev.post_recv(a.qp, &recv_wr(1, &dst_mr, 16)), Err(VerbsError::Busy));
        assert_eq!(a.dev.post_recv(a.qp, &recv_wr(1, &dst_mr, 16)), Err(VerbsError::Busy));
        assert!(a.dev.post_recv(a.qp, &recv_wr(1, &dst_mr, 16)).is_ok());
    }

    #[test]
    fn test_send_to_unconnected_peer_exceeds_retries() {
        let fabric = SoftFabric::new();
        let a = side(&fabric, "soft_0");
        let b = side(&fabric, "soft_1");
        bring_up(&a, &b);
        let (_src, src_mr) = region(&a.dev, 16);
        a.dev.post_send(a.qp, &send_wr(3, &src_mr, 16)).unwrap();
        assert_eq!(poll_one(&a.dev, a.send_cq).unwrap().status, WcStatus::RetryExcErr);
    }

    #[test]
    fn test_destroy_order_and_ownership() {
        let (a, b) = connected();
        assert_eq!(a.dev.destroy_cq(a.send_cq), Err(VerbsError::CqInUse(a.send_cq.0)));
        assert_eq!(b.dev.destroy_qp(a.qp), Err(VerbsError::UnknownQp(a.qp.0)));

        a.dev.destroy_qp(a.qp).unwrap();
        a.dev.destroy_cq(a.send_cq).unwrap();
        a.dev.destroy_cq(a.recv_cq).unwrap();
        assert_eq!(a.dev.resource_counts(), ResourceCounts::default());
        assert_eq!(a.dev.destroy_qp(a.qp), Err(VerbsError::UnknownQp(a.qp.0)));
    }

    #[test]
    fn test_dereg_mr() {
        let fabric = SoftFabric::new();
        let dev = fabric.open_device("soft_0");
        let (_mem, mr) = region(&dev, 4096);
        assert_ne!(mr.lkey, mr.rkey);
        assert_eq!(dev.resource_counts().mrs, 1);
        dev.dereg_mr(mr.handle).unwrap();
        assert_eq!(dev.dereg_mr(mr.handle), Err(VerbsError::UnknownMr(mr.lkey)));
    }

    #[test]
    fn test_query_port() {
        let fabric = SoftFabric::new();
        let dev = fabric.open_device("soft_0");
        let attr = dev.query_port(1).unwrap();
        assert!(attr.is_active());
        assert_eq!(attr.lid, dev.lid());
        assert_eq!(dev.query_port(2), Err(VerbsError::InvalidPort(2)));
        dev.set_port_state(PortState::Down);
        assert!(!dev.query_port(1).unwrap().is_active());
    }
}
