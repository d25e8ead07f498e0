//! A verbs-style device interface.
//!
//! [`Verbs`] is the narrow slice of an InfiniBand verbs provider that the
//! reliable-connection transport needs: completion queues, RC queue pairs
//! and their state transitions, memory registration, and posting/polling of
//! send and receive work requests. Handles are plain integers, so the trait
//! is object safe and cheap to share.
//!
//! [`soft::SoftFabric`] implements it in-process. It enforces the queue-pair
//! state machine, validates every scatter/gather entry against registered
//! memory and can inject faults, which makes it the device used by tests and
//! by the demo binary on machines without an HCA.

pub mod error;
pub mod soft;
pub mod types;

use std::sync::Arc;

use netbench_types::AlignedMemory;

pub use error::VerbsError;
pub use soft::{ResourceCounts, SoftDevice, SoftFabric};
pub use types::{
    AccessFlags, CqHandle, LinkLayer, MemoryRegion, MrHandle, Mtu, PortAttr, PortState,
    QpHandle, QpInitAttr, QpState, QpTransition, RecvWr, SendWr, Sge, WcOpcode, WcStatus,
    WorkCompletion,
};

/// Operations of an opened RDMA device context.
pub trait Verbs: Send + Sync {
    /// Device name, e.g. `mlx5_0`.
    fn name(&self) -> &str;

    fn query_port(&self, port: u8) -> Result<PortAttr, VerbsError>;

    fn create_cq(&self, entries: u32) -> Result<CqHandle, VerbsError>;

    /// Fails with `CqInUse` while a queue pair still references the queue.
    fn destroy_cq(&self, cq: CqHandle) -> Result<(), VerbsError>;

    /// Create an RC queue pair in `RESET`.
    fn create_qp(&self, attr: &QpInitAttr) -> Result<QpHandle, VerbsError>;

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> Result<(), VerbsError>;

    fn query_qp_state(&self, qp: QpHandle) -> Result<QpState, VerbsError>;

    fn destroy_qp(&self, qp: QpHandle) -> Result<(), VerbsError>;

    /// Register `memory` for local and remote access. The device keeps the
    /// block alive until it is deregistered.
    fn reg_mr(
        &self,
        memory: &Arc<AlignedMemory>,
        access: AccessFlags,
    ) -> Result<MemoryRegion, VerbsError>;

    fn dereg_mr(&self, mr: MrHandle) -> Result<(), VerbsError>;

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> Result<(), VerbsError>;

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> Result<(), VerbsError>;

    /// Move up to `max` completions from `cq` into `out`; returns how many.
    fn poll_cq(
        &self,
        cq: CqHandle,
        out: &mut Vec<WorkCompletion>,
        max: usize,
    ) -> Result<usize, VerbsError>;
}
