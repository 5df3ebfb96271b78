//! Seams to the application above the engines.

use crate::ib::NodeId;

use super::recv_pool::RecvBuffer;

/// One unit of outbound work, pulled by the send engine.
///
/// `pos_front_rel..pos_back_rel` is the unsent window within the
/// per-connection send buffer; the application guarantees
/// `pos_front_rel <= pos_back_rel` (wrap-around is sliced by the caller).
#[derive(Debug, Clone, Copy)]
pub struct WorkDescriptor {
    pub node_id: NodeId,
    pub pos_front_rel: u32,
    pub pos_back_rel: u32,
    /// Accumulated flow control credits to send ahead of the payload;
    /// zero means none.
    pub flow_control_data: u32,
}

/// Supplies the send engine with work.
pub trait SendSource: Send + Sync {
    /// Report how the previous descriptor went and get the next one.
    /// `prev_node_id` is `NODE_ID_INVALID` when there was no previous
    /// descriptor; `None` means nothing to do right now.
    fn next_work(&self, prev_node_id: NodeId, prev_bytes_written: u32) -> Option<WorkDescriptor>;
}

/// Consumes what the recv engine pulls off the wire.
pub trait RecvSink: Send + Sync {
    /// A payload buffer arrived. The sink owns the buffer until it returns
    /// it to the pool via [`RecvBufferPool::return_buffer`], which may
    /// happen asynchronously on another thread.
    ///
    /// [`RecvBufferPool::return_buffer`]: super::recv_pool::RecvBufferPool::return_buffer
    fn received_buffer(&self, source: NodeId, buffer: RecvBuffer);

    /// A flow control credit arrived.
    fn received_flow_control(&self, source: NodeId, data: u32);
}
