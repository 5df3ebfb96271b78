//! The datapath: send/recv engines and their buffer pools.

pub mod handler;

#[cfg(test)]
pub(crate) mod testing;

pub mod recv_pool;
pub mod send_buffers;
pub mod send_engine;
pub mod recv_engine;

pub use handler::{RecvSink, SendSource, WorkDescriptor};
pub use recv_pool::{RecvBuffer, RecvBufferPool};
pub use send_buffers::SendBuffers;
pub use send_engine::SendEngine;
pub use recv_engine::RecvEngine;
