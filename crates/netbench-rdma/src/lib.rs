//! Reliable-connection transport over a verbs device.
//!
//! - [`RcConfig`]: queue pair tuning shared by every rank.
//! - [`device`]: port checks and device selection.
//! - [`MemoryDirectory`]: registrations of the buffers handed out by
//!   [`RcTransport::allocate`](netbench_transport::Transport::allocate).
//! - [`ConnectionManager`]: one RC queue pair per peer and its repair paths.
//! - [`RcTransport`]: the [`Transport`](netbench_transport::Transport)
//!   implementation tying them together.
//!
//! The crate is generic over [`netbench_verbs::Verbs`]; tests and the demo
//! binary run it on the in-process soft fabric.

pub mod config;
pub mod connection;
pub mod device;
pub mod engine;
pub mod memory;

pub use config::{ConnectMode, RcConfig};
pub use connection::{ConnectionManager, ConnectionRecord, EndpointInfo, RecoveryStats};
pub use device::{open_port, select_device, ActivePort};
pub use engine::RcTransport;
pub use memory::{MemoryDirectory, RegisteredRegion};
