//! Values exchanged with a verbs device.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Completion queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CqHandle(pub u32);

/// Queue pair handle; the value is the queue pair number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpHandle(pub u32);

impl QpHandle {
    pub fn qp_num(self) -> u32 {
        self.0
    }
}

/// Memory region handle; the value is the local key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u32);

/// A registration returned by [`Verbs::reg_mr`](crate::Verbs::reg_mr).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub handle: MrHandle,
    pub addr: usize,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// Link layer type for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkLayer {
    Infiniband,
    /// RoCE.
    Ethernet,
    Unspecified,
}

impl std::fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkLayer::Infiniband => write!(f, "INFINIBAND"),
            LinkLayer::Ethernet => write!(f, "ETHERNET"),
            LinkLayer::Unspecified => write!(f, "UNSPECIFIED"),
        }
    }
}

/// Logical port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Nop,
    Down,
    Init,
    Armed,
    Active,
    ActiveDefer,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Nop => write!(f, "NOP"),
            PortState::Down => write!(f, "DOWN"),
            PortState::Init => write!(f, "INIT"),
            PortState::Armed => write!(f, "ARMED"),
            PortState::Active => write!(f, "ACTIVE"),
            PortState::ActiveDefer => write!(f, "ACTIVE_DEFER"),
        }
    }
}

/// Path MTU of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Mtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl Mtu {
    pub fn bytes(self) -> u32 {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }
}

impl TryFrom<u32> for Mtu {
    type Error = String;

    fn try_from(bytes: u32) -> Result<Self, Self::Error> {
        match bytes {
            256 => Ok(Mtu::Mtu256),
            512 => Ok(Mtu::Mtu512),
            1024 => Ok(Mtu::Mtu1024),
            2048 => Ok(Mtu::Mtu2048),
            4096 => Ok(Mtu::Mtu4096),
            other => Err(format!("unsupported path MTU {other}")),
        }
    }
}

impl From<Mtu> for u32 {
    fn from(mtu: Mtu) -> u32 {
        mtu.bytes()
    }
}

/// Attributes of a physical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub state: PortState,
    /// Local identifier used to address this port.
    pub lid: u16,
    pub active_mtu: Mtu,
    pub link_layer: LinkLayer,
}

impl PortAttr {
    pub fn is_active(&self) -> bool {
        matches!(self.state, PortState::Active | PortState::ActiveDefer)
    }

    pub fn is_roce(&self) -> bool {
        self.link_layer == LinkLayer::Ethernet
    }
}

/// Hardware state of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    SendQueueDrain,
    SendQueueError,
    Error,
}

impl QpState {
    /// Whether the hardware accepts a modify from `self` into `to`.
    pub fn can_transition_to(self, to: QpState) -> bool {
        use QpState::*;
        matches!(
            (self, to),
            (_, Reset)
                | (_, Error)
                | (Reset, Init)
                | (Init, Init)
                | (Init, ReadyToReceive)
                | (ReadyToReceive, ReadyToSend)
                | (ReadyToSend, ReadyToSend)
                | (ReadyToSend, SendQueueDrain)
                | (SendQueueDrain, SendQueueDrain)
                | (SendQueueDrain, ReadyToSend)
                | (SendQueueError, ReadyToSend)
        )
    }

    /// Whether inbound packets are accepted.
    pub fn can_receive(self) -> bool {
        matches!(
            self,
            QpState::ReadyToReceive | QpState::ReadyToSend | QpState::SendQueueDrain
        )
    }
}

impl std::fmt::Display for QpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::ReadyToReceive => "RTR",
            QpState::ReadyToSend => "RTS",
            QpState::SendQueueDrain => "SQD",
            QpState::SendQueueError => "SQE",
            QpState::Error => "ERR",
        };
        f.write_str(name)
    }
}

/// A `modify_qp` request. Each variant carries exactly the attributes the
/// hardware requires for entering its target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpTransition {
    Reset,
    Init {
        port: u8,
        pkey_index: u16,
        access: AccessFlags,
    },
    ReadyToReceive {
        path_mtu: Mtu,
        dest_qp_num: u32,
        dest_lid: u16,
        rq_psn: u32,
        min_rnr_timer: u8,
        max_dest_rd_atomic: u8,
    },
    ReadyToSend {
        sq_psn: u32,
        timeout: u8,
        retry_cnt: u8,
        rnr_retry: u8,
        max_rd_atomic: u8,
    },
    SendQueueDrain,
    Error,
}

impl QpTransition {
    pub fn target(&self) -> QpState {
        match self {
            QpTransition::Reset => QpState::Reset,
            QpTransition::Init { .. } => QpState::Init,
            QpTransition::ReadyToReceive { .. } => QpState::ReadyToReceive,
            QpTransition::ReadyToSend { .. } => QpState::ReadyToSend,
            QpTransition::SendQueueDrain => QpState::SendQueueDrain,
            QpTransition::Error => QpState::Error,
        }
    }
}

/// Queue pair creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// One scatter/gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: usize,
    pub length: u32,
    pub lkey: u32,
}

/// A send work request. `sge` is `None` for a zero-length message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub sge: Option<Sge>,
    pub signaled: bool,
}

/// A receive work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Option<Sge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
}

/// Completion status, mirroring `ibv_wc_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocQpOpErr,
    LocProtErr,
    WrFlushErr,
    MwBindErr,
    BadRespErr,
    LocAccessErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    RemAbortErr,
    FatalErr,
    RespTimeoutErr,
    GeneralErr,
}

impl WcStatus {
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }

    /// Failures that a reconnect of the queue pair can clear.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            WcStatus::RetryExcErr
                | WcStatus::RnrRetryExcErr
                | WcStatus::RemInvReqErr
                | WcStatus::WrFlushErr
        )
    }
}

impl std::fmt::Display for WcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WcStatus::Success => "SUCCESS",
            WcStatus::LocLenErr => "LOC_LEN_ERR",
            WcStatus::LocQpOpErr => "LOC_QP_OP_ERR",
            WcStatus::LocProtErr => "LOC_PROT_ERR",
            WcStatus::WrFlushErr => "WR_FLUSH_ERR",
            WcStatus::MwBindErr => "MW_BIND_ERR",
            WcStatus::BadRespErr => "BAD_RESP_ERR",
            WcStatus::LocAccessErr => "LOC_ACCESS_ERR",
            WcStatus::RemInvReqErr => "REM_INV_REQ_ERR",
            WcStatus::RemAccessErr => "REM_ACCESS_ERR",
            WcStatus::RemOpErr => "REM_OP_ERR",
            WcStatus::RetryExcErr => "RETRY_EXC_ERR",
            WcStatus::RnrRetryExcErr => "RNR_RETRY_EXC_ERR",
            WcStatus::RemAbortErr => "REM_ABORT_ERR",
            WcStatus::FatalErr => "FATAL_ERR",
            WcStatus::RespTimeoutErr => "RESP_TIMEOUT_ERR",
            WcStatus::GeneralErr => "GENERAL_ERR",
        };
        f.write_str(name)
    }
}

/// One entry polled from a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Bytes placed, for receive completions.
    pub byte_len: u32,
    pub qp_num: u32,
}
