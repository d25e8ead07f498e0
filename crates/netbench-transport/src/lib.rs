//! The transport contract consumed by every benchmarking pattern.
//!
//! A pattern holds a `Box<dyn Transport>` chosen at configuration time and
//! drives it with blocking `send`/`receive`, or with `post_*` + `poll` when
//! it wants to overlap operations. Back-ends live in their own crates
//! (e.g. `netbench-rdma`); this crate also ships an in-process
//! [`loopback::LoopbackTransport`].

pub mod buffer;
pub mod collective;
pub mod error;
pub mod loopback;
pub mod stop;
pub mod transport;
pub mod work;

pub use buffer::Buffer;
pub use collective::{Collective, LocalCollective};
pub use error::{OpKind, TransportError};
pub use loopback::{LoopbackConfig, LoopbackTransport};
pub use stop::StopFlag;
pub use transport::{Capabilities, PollResult, Transport, WorkHandle};
pub use work::PendingWorkItem;
