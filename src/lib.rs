//! An InfiniBand messaging substrate: connection management and send/recv
//! engines over reliable-connected queue pairs.
//!
//! The crate is split into four layers:
//!
//! - [`verbs`] abstracts the RDMA verbs library behind a narrow provider
//!   trait. Everything above it is hardware-agnostic and testable.
//! - The core IB objects (completion queues, send/recv queues, queue pairs,
//!   connections) are re-exported at the crate root.
//! - [`ctrl`] manages connection lifecycles: peer discovery over an
//!   out-of-band UDP channel, two-way queue pair parameter exchange, and
//!   handle-counted connection reuse.
//! - [`msg`] contains the datapath: a send engine that slices application
//!   payloads into work requests sized to the remote receive buffers, and a
//!   recv engine that drains two shared completion queues and recycles
//!   buffers back into the shared receive queues.
//!
//! [`Runtime`] wires all of the above together from a [`ctrl::Config`];
//! there is no process-global state.

#[cfg(not(target_os = "linux"))]
compile_error!("`ibmsg` currently only supports Linux");

/// Verbs provider abstraction.
pub mod verbs;

/// Shared utility functions.
mod utils;

/// Core IB objects.
/// Not to be publicly exposed, instead `pub use` necessary items.
mod ib;

pub use ib::connection::*;
pub use ib::cq::*;
pub use ib::creator::*;
pub use ib::error::*;
pub use ib::mr::*;
pub use ib::qp::*;
pub use ib::queue::*;
pub use ib::tracker::*;
pub use ib::{ConnectionId, NodeId, MAX_NODES, MAX_QPS_PER_CONNECTION, NODE_ID_INVALID};

/// Connection lifecycle management.
pub mod ctrl;

/// Send/recv engines and buffer pools.
pub mod msg;

mod runtime;
pub use runtime::Runtime;
