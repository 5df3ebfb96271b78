//! The send engine.

use std::cmp;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::ctrl::manager::{ConnectionGuard, ConnectionManager};
use crate::ib::error::{Error, Result};
use crate::ib::{NodeId, NODE_ID_INVALID};
use crate::utils::backoff::IdleBackoff;

use super::handler::{SendSource, WorkDescriptor};
use super::send_buffers::SendBuffers;

/// Counters shared with the stats thread.
pub struct SendEngineStats {
    run: AtomicBool,
    sent_bytes: AtomicU64,
    sent_flow_control_bytes: AtomicU64,
}

impl SendEngineStats {
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn sent_flow_control_bytes(&self) -> u64 {
        self.sent_flow_control_bytes.load(Ordering::Relaxed)
    }
}

/// Pulls work descriptors from the send source, slices the unsent window
/// into work requests no larger than one remote receive buffer, posts up
/// to a full send queue per batch and polls exactly that many completions.
///
/// Flow control data is always sent before payload, on QP\[1\], to avoid
/// credit-induced deadlocks.
pub struct SendEngine {
    stats: Arc<SendEngineStats>,
    thread: Option<JoinHandle<()>>,
}

impl SendEngine {
    pub fn start(
        manager: Arc<ConnectionManager>,
        buffers: Arc<SendBuffers>,
        source: Arc<dyn SendSource>,
        recv_buffer_size: u32,
    ) -> Result<Self> {
        let stats = Arc::new(SendEngineStats {
            run: AtomicBool::new(true),
            sent_bytes: AtomicU64::new(0),
            sent_flow_control_bytes: AtomicU64::new(0),
        });

        let thread = {
            let stats = stats.clone();
            thread::Builder::new()
                .name("ibmsg-send".into())
                .spawn(move || {
                    let mut engine = SendLoop {
                        manager,
                        buffers,
                        source,
                        recv_buffer_size,
                        stats,
                        prev_node_id: NODE_ID_INVALID,
                        prev_bytes_written: 0,
                        backoff: IdleBackoff::new(),
                    };
                    engine.run();
                })
                .map_err(Error::Io)?
        };

        Ok(SendEngine {
            stats,
            thread: Some(thread),
        })
    }

    pub fn stats(&self) -> &Arc<SendEngineStats> {
        &self.stats
    }

    /// Stop the loop and join the thread.
    pub fn stop(&mut self) {
        self.stats.run.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                log::error!("send engine panicked: {:?}", e);
            }
        }
    }
}

impl Drop for SendEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SendLoop {
    manager: Arc<ConnectionManager>,
    buffers: Arc<SendBuffers>,
    source: Arc<dyn SendSource>,
    recv_buffer_size: u32,
    stats: Arc<SendEngineStats>,
    prev_node_id: NodeId,
    prev_bytes_written: u32,
    backoff: IdleBackoff,
}

impl SendLoop {
    fn run(&mut self) {
        while self.stats.run.load(Ordering::Relaxed) {
            self.iteration();
        }
    }

    fn iteration(&mut self) {
        let prev_node_id = mem::replace(&mut self.prev_node_id, NODE_ID_INVALID);
        let prev_bytes_written = mem::replace(&mut self.prev_bytes_written, 0);

        let Some(work) = self.source.next_work(prev_node_id, prev_bytes_written) else {
            self.backoff.idle();
            return;
        };
        self.backoff.reset();

        self.prev_node_id = work.node_id;

        let guard = match self.manager.get_connection(work.node_id) {
            Ok(guard) => guard,
            // connection closed in the meantime; report zero written on
            // the next call
            Err(_) => return,
        };

        let result = self
            .process_flow_control(&guard, &work)
            .and_then(|()| self.process_buffer(&guard, &work));

        match result {
            Ok(written) => self.prev_bytes_written = written,
            // expected during graceful teardown
            Err(Error::QueueClosed) => {}
            Err(e) if e.is_disconnect() => {
                log::warn!("lost node {:#x}, closing connection", work.node_id);
                self.manager.close_connection(work.node_id, true);
            }
            Err(e) if e.is_fatal() => {
                panic!("send engine hit fatal error: {}", e);
            }
            Err(e) => {
                log::error!("sending to node {:#x} failed: {}", work.node_id, e);
            }
        }

        // guard drops here, returning the connection
    }

    /// Send accumulated flow control data ahead of any payload.
    fn process_flow_control(&self, guard: &ConnectionGuard, work: &WorkDescriptor) -> Result<()> {
        if work.flow_control_data == 0 {
            return Ok(());
        }

        let buffer = self.buffers.flow_control_buffer(guard.connection_id());
        buffer.write(0, &work.flow_control_data.to_le_bytes());

        let queue = guard.qp(1).send_queue();
        queue.send(&buffer.mem(), 0, 4, 0)?;
        queue.poll_completion(true)?;

        self.stats
            .sent_flow_control_bytes
            .fetch_add(4, Ordering::Relaxed);
        Ok(())
    }

    /// Slice the unsent window into receive-buffer-sized sends, batch up
    /// to the send queue depth, then poll one completion per posted send.
    fn process_buffer(&self, guard: &ConnectionGuard, work: &WorkDescriptor) -> Result<u32> {
        // the ring above us slices wrap-arounds; relative positions are
        // always ordered
        if work.pos_front_rel > work.pos_back_rel {
            return Err(Error::Invariant("pos_front_rel > pos_back_rel"));
        }
        // another send engine drained the window already
        if work.pos_front_rel == work.pos_back_rel {
            return Ok(0);
        }

        let send_buffer = self.buffers.buffer(guard.connection_id()).mem();
        let queue = guard.qp(0).send_queue();
        let queue_size = queue.capacity();

        let mut pos_front = work.pos_front_rel;
        let pos_back = work.pos_back_rel;
        let mut total_bytes_sent = 0;

        while pos_front != pos_back {
            let mut slice_count: u16 = 0;
            let mut iteration_bytes_sent = 0;

            // a single send never exceeds one remote receive slot
            while slice_count < queue_size && pos_front != pos_back {
                let size = cmp::min(self.recv_buffer_size, pos_back - pos_front);
                queue.send(&send_buffer, pos_front, size, 0)?;

                pos_front += size;
                iteration_bytes_sent += size;
                slice_count += 1;
            }

            for _ in 0..slice_count {
                queue.poll_completion(true)?;
            }

            self.stats
                .sent_bytes
                .fetch_add(u64::from(iteration_bytes_sent), Ordering::Relaxed);
            total_bytes_sent += iteration_bytes_sent;
        }

        Ok(total_bytes_sent)
    }
}
