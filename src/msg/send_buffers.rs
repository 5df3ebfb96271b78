//! Per-connection send buffers.

use std::mem;
use std::sync::Arc;

use crate::verbs::{PdHandle, Verbs};

use crate::ib::error::Result;
use crate::ib::mr::RegisteredBuffer;
use crate::ib::ConnectionId;

/// One pre-registered payload buffer and one four-byte flow control buffer
/// per connection id, indexed directly.
///
/// No pool-level locking: the send engine serializes access per connection
/// through the manager's handle counter, and connection ids are unique
/// among live connections.
pub struct SendBuffers {
    buffers: Vec<RegisteredBuffer>,
    flow_control_buffers: Vec<RegisteredBuffer>,
}

impl SendBuffers {
    pub fn new(
        verbs: &Arc<dyn Verbs>,
        pd: PdHandle,
        buffer_size: u32,
        max_connections: u32,
    ) -> Result<Self> {
        log::info!(
            "allocating send buffer pool for {} connections, buffer size {}",
            max_connections,
            buffer_size
        );

        let mut buffers = Vec::with_capacity(max_connections as usize);
        let mut flow_control_buffers = Vec::with_capacity(max_connections as usize);
        for _ in 0..max_connections {
            buffers.push(RegisteredBuffer::new(verbs, pd, buffer_size as usize)?);
            flow_control_buffers.push(RegisteredBuffer::new(verbs, pd, mem::size_of::<u32>())?);
        }

        Ok(SendBuffers {
            buffers,
            flow_control_buffers,
        })
    }

    /// Payload send buffer of the connection. The application writes
    /// outbound bytes here; the engine posts slices of it.
    pub fn buffer(&self, connection_id: ConnectionId) -> &RegisteredBuffer {
        &self.buffers[connection_id as usize]
    }

    /// Flow control send buffer of the connection.
    pub fn flow_control_buffer(&self, connection_id: ConnectionId) -> &RegisteredBuffer {
        &self.flow_control_buffers[connection_id as usize]
    }
}
