//! Shared types for the netbench transports.
//!
//! - [`strong_type!`]: newtype wrappers used for ranks and work request ids.
//! - [`ids`]: the concrete identifier types.
//! - [`memory`]: page-aligned allocations handed to transports and devices.

#[macro_use]
pub mod strong_type;

pub mod ids;
pub mod memory;

pub use ids::{PeerId, WorkId};
pub use memory::{page_size, AlignedMemory};
