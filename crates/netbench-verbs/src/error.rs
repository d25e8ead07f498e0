use thiserror::Error;

use crate::types::QpState;

/// Errors returned synchronously by a verbs call.
///
/// Failures of the data transfer itself are not errors here; they arrive as
/// completions with a non-success [`WcStatus`](crate::WcStatus).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerbsError {
    /// The device could not take the request right now (`EAGAIN`/`EBUSY`).
    #[error("resource temporarily busy")]
    Busy,

    #[error("invalid queue pair transition {from} -> {to}")]
    InvalidTransition { from: QpState, to: QpState },

    #[error("{op} is not allowed in queue pair state {state}")]
    InvalidState { op: &'static str, state: QpState },

    #[error("unknown queue pair {0:#x}")]
    UnknownQp(u32),

    #[error("unknown completion queue {0}")]
    UnknownCq(u32),

    #[error("unknown memory region key {0:#x}")]
    UnknownMr(u32),

    #[error("completion queue {0} is still attached to a queue pair")]
    CqInUse(u32),

    #[error("work queue is full")]
    QueueFull,

    #[error("invalid port {0}")]
    InvalidPort(u8),
}

impl VerbsError {
    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VerbsError::Busy)
    }
}
