use netbench_types::PeerId;
use thiserror::Error;

/// The operation a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Send,
    Receive,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Send => write!(f, "send"),
            OpKind::Receive => write!(f, "receive"),
        }
    }
}

/// Errors surfaced by a transport to the benchmarking pattern.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The network device could not be opened or is not usable.
    #[error("device error: {0}")]
    Device(String),

    /// Memory for a buffer could not be allocated.
    #[error("allocation of {len} bytes failed")]
    Allocation { len: usize },

    /// The device refused to register memory for network access.
    #[error("memory registration failed: {0}")]
    Registration(String),

    /// A buffer address is not inside any registered region.
    #[error("address {addr:#x} (+{len} bytes) is not covered by a registered region")]
    UnresolvedAddress { addr: usize, len: usize },

    /// Connection setup with a peer failed; the transport is unusable.
    #[error("connection to peer {peer} failed: {reason}")]
    Connection { peer: PeerId, reason: String },

    /// A work request could not be enqueued.
    #[error("{op} post to peer {peer} failed: {reason}")]
    Post {
        peer: PeerId,
        op: OpKind,
        reason: String,
    },

    /// A work request completed with an error status.
    #[error("{op} to peer {peer} completed with {status}")]
    Completion {
        peer: PeerId,
        op: OpKind,
        status: String,
        retryable: bool,
    },

    /// The caller asked the run to stop while an operation was waiting.
    #[error("interrupted")]
    Interrupted,

    /// A configured polling ceiling was reached without a completion.
    #[error("{op} to peer {peer} saw no completion after {spins} polls")]
    PollLimitExceeded { peer: PeerId, op: OpKind, spins: u64 },

    /// The back-end does not implement this part of the contract.
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    /// The peer index is out of range or names the local rank.
    #[error("invalid peer {0}")]
    InvalidPeer(PeerId),

    /// `poll` was given a handle this transport never issued or already retired.
    #[error("unknown work handle {0}")]
    UnknownHandle(u64),

    /// The out-of-band collective service failed.
    #[error("collective exchange failed: {0}")]
    Collective(String),
}

impl TransportError {
    /// Whether the error came from a completion the hardware flagged as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Completion { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_peer_and_op() {
        let err = TransportError::Post {
            peer: PeerId(3),
            op: OpKind::Receive,
            reason: "busy".into(),
        };
        assert_eq!(err.to_string(), "receive post to peer 3 failed: busy");
    }

    #[test]
    fn test_display_unresolved_address() {
        let err = TransportError::UnresolvedAddress {
            addr: 0x1000,
            len: 8,
        };
        assert!(err.to_string().contains("0x1000"));
    }

    #[test]
    fn test_retryable_only_for_completions() {
        let retryable = TransportError::Completion {
            peer: PeerId(1),
            op: OpKind::Send,
            status: "RETRY_EXC_ERR".into(),
            retryable: true,
        };
        assert!(retryable.is_retryable());
        assert!(!TransportError::Interrupted.is_retryable());
    }
}
