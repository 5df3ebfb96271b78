//! Queue pairs.

use std::sync::Arc;

use crate::verbs::{PdHandle, QpHandle, QpTransition, Qpn, Verbs};

use super::cq::CompQueue;
use super::error::Result;
use super::queue::{RecvQueue, SendQueue, SharedRecvQueue};

/// A reliable-connected queue pair with its send and receive sides.
///
/// Creation leaves the QP in INIT state; `RecvQueue::open` then
/// `SendQueue::open` drive it to RTR and RTS. The recv side must be opened
/// first.
pub struct QueuePair {
    verbs: Arc<dyn Verbs>,
    qp: QpHandle,
    qp_num: Qpn,
    send_queue: SendQueue,
    recv_queue: RecvQueue,
}

impl QueuePair {
    /// Create a QP on the protection domain. A private send CQ is always
    /// created; the receive side uses the shared CQ/SRQ pair when given,
    /// else private ones sized to the receive depth.
    pub fn new(
        verbs: &Arc<dyn Verbs>,
        pd: PdHandle,
        max_send_reqs: u16,
        max_recv_reqs: u16,
        shared_recv_comp_queue: Option<Arc<CompQueue>>,
        shared_recv_queue: Option<Arc<SharedRecvQueue>>,
    ) -> Result<Self> {
        let send_cq = Arc::new(CompQueue::new(verbs, max_send_reqs)?);
        let recv_cq = match shared_recv_comp_queue {
            Some(shared) => {
                log::debug!("using shared recv completion queue");
                shared
            }
            None => Arc::new(CompQueue::new(verbs, max_recv_reqs)?),
        };

        let desc = verbs.create_qp(
            pd,
            send_cq.handle(),
            recv_cq.handle(),
            shared_recv_queue.as_ref().map(|srq| srq.handle()),
            u32::from(max_send_reqs),
            u32::from(max_recv_reqs),
        )?;
        verbs.modify_qp(desc.handle, &QpTransition::Init)?;

        log::trace!("created QP, qpNum {:#x}", desc.qpn);

        Ok(QueuePair {
            verbs: verbs.clone(),
            qp: desc.handle,
            qp_num: desc.qpn,
            send_queue: SendQueue::new(verbs.clone(), desc.handle, max_send_reqs, send_cq),
            recv_queue: RecvQueue::new(
                verbs.clone(),
                desc.handle,
                max_recv_reqs,
                recv_cq,
                shared_recv_queue,
            ),
        })
    }

    /// The underlying provider handle.
    pub fn handle(&self) -> QpHandle {
        self.qp
    }

    /// Physical QP number the fabric addresses this QP by.
    pub fn physical_qp_num(&self) -> Qpn {
        self.qp_num
    }

    pub fn send_queue(&self) -> &SendQueue {
        &self.send_queue
    }

    pub fn recv_queue(&self) -> &RecvQueue {
        &self.recv_queue
    }

    /// Close both sides.
    pub fn close(&self, force: bool) {
        self.send_queue.close(force);
        self.recv_queue.close(force);
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if let Err(e) = self.verbs.destroy_qp(self.qp) {
            log::error!("destroying QP {:#x} failed: {}", self.qp_num, e);
        }
    }
}
