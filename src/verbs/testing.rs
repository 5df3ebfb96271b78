//! Deterministic in-process verbs provider for tests.
//!
//! Posted sends complete immediately onto the QP's send CQ with a
//! configurable status. Posted receives park on the QP or SRQ until a test
//! injects a matching completion with [`SimVerbs::inject_wc`]. QP state
//! transitions are order-checked so tests catch a send side opened before
//! the recv side.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimQpState {
    Created,
    Init,
    Rtr,
    Rts,
}

struct QpSim {
    qpn: Qpn,
    send_cq: u64,
    srq: Option<u64>,
    state: SimQpState,
    /// Receives posted to the private (non-SRQ) queue.
    pending_recvs: VecDeque<RecvWr>,
}

struct SimState {
    next_handle: u64,
    next_qpn: Qpn,
    cqs: HashMap<u64, VecDeque<Wc>>,
    srqs: HashMap<u64, VecDeque<RecvWr>>,
    qps: HashMap<u64, QpSim>,
    mrs: HashMap<u64, (u64, usize)>,
    /// Global in-order log of every posted send, for ordering assertions.
    send_log: Vec<(QpHandle, SendWr)>,
    send_status: WcStatus,
}

impl Default for SimState {
    fn default() -> Self {
        SimState {
            next_handle: 0,
            next_qpn: 0x100,
            cqs: HashMap::new(),
            srqs: HashMap::new(),
            qps: HashMap::new(),
            mrs: HashMap::new(),
            send_log: Vec::new(),
            send_status: WcStatus::Success,
        }
    }
}

pub(crate) struct SimVerbs {
    lid: Lid,
    reject_sends: AtomicBool,
    state: Mutex<SimState>,
}

impl SimVerbs {
    pub fn new() -> Self {
        Self::with_lid(1)
    }

    pub fn with_lid(lid: Lid) -> Self {
        SimVerbs {
            lid,
            reject_sends: AtomicBool::new(false),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Make subsequent `post_send` calls fail with `ENOMEM`.
    pub fn reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::Relaxed);
    }

    /// Completion status for subsequently posted sends.
    pub fn set_send_status(&self, status: WcStatus) {
        self.state.lock().unwrap().send_status = status;
    }

    /// Push a completion onto a CQ, as the hardware would on an incoming
    /// message matched to a posted receive.
    pub fn inject_wc(&self, cq: CqHandle, wc: Wc) {
        self.state
            .lock()
            .unwrap()
            .cqs
            .get_mut(&cq.0)
            .expect("no such CQ")
            .push_back(wc);
    }

    /// Pop the oldest receive posted to the SRQ.
    pub fn take_srq_recv(&self, srq: SrqHandle) -> Option<RecvWr> {
        self.state
            .lock()
            .unwrap()
            .srqs
            .get_mut(&srq.0)
            .expect("no such SRQ")
            .pop_front()
    }

    /// Pop the oldest receive posted to a QP's private queue.
    pub fn take_qp_recv(&self, qp: QpHandle) -> Option<RecvWr> {
        self.state
            .lock()
            .unwrap()
            .qps
            .get_mut(&qp.0)
            .expect("no such QP")
            .pending_recvs
            .pop_front()
    }

    pub fn srq_pending(&self, srq: SrqHandle) -> usize {
        self.state.lock().unwrap().srqs.get(&srq.0).expect("no such SRQ").len()
    }

    /// Every send posted so far, in posting order.
    pub fn send_log(&self) -> Vec<(QpHandle, SendWr)> {
        self.state.lock().unwrap().send_log.clone()
    }

    fn alloc_handle(state: &mut SimState) -> u64 {
        state.next_handle += 1;
        state.next_handle
    }
}

impl Verbs for SimVerbs {
    fn open_device(&self) -> io::Result<DeviceAttr> {
        Ok(DeviceAttr { lid: self.lid })
    }

    fn alloc_pd(&self) -> io::Result<PdHandle> {
        let mut state = self.state.lock().unwrap();
        Ok(PdHandle(Self::alloc_handle(&mut state)))
    }

    fn register_mr(&self, _pd: PdHandle, addr: u64, len: usize) -> io::Result<MrDesc> {
        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_handle(&mut state);
        state.mrs.insert(handle, (addr, len));
        Ok(MrDesc {
            handle: MrHandle(handle),
            lkey: handle as LKey,
        })
    }

    fn deregister_mr(&self, mr: MrHandle) -> io::Result<()> {
        self.state.lock().unwrap().mrs.remove(&mr.0);
        Ok(())
    }

    fn create_cq(&self, _capacity: u32) -> io::Result<CqHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_handle(&mut state);
        state.cqs.insert(handle, VecDeque::new());
        Ok(CqHandle(handle))
    }

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()> {
        self.state.lock().unwrap().cqs.remove(&cq.0);
        Ok(())
    }

    fn create_srq(&self, _pd: PdHandle, _capacity: u32) -> io::Result<SrqHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_handle(&mut state);
        state.srqs.insert(handle, VecDeque::new());
        Ok(SrqHandle(handle))
    }

    fn destroy_srq(&self, srq: SrqHandle) -> io::Result<()> {
        self.state.lock().unwrap().srqs.remove(&srq.0);
        Ok(())
    }

    fn create_qp(
        &self,
        _pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        srq: Option<SrqHandle>,
        _max_send_wr: u32,
        _max_recv_wr: u32,
    ) -> io::Result<QpDesc> {
        let _ = recv_cq;
        let mut state = self.state.lock().unwrap();
        let handle = Self::alloc_handle(&mut state);
        let qpn = state.next_qpn;
        state.next_qpn += 1;
        state.qps.insert(
            handle,
            QpSim {
                qpn,
                send_cq: send_cq.0,
                srq: srq.map(|s| s.0),
                state: SimQpState::Created,
                pending_recvs: VecDeque::new(),
            },
        );
        Ok(QpDesc {
            handle: QpHandle(handle),
            qpn,
        })
    }

    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()> {
        self.state.lock().unwrap().qps.remove(&qp.0);
        Ok(())
    }

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let qp = state
            .qps
            .get_mut(&qp.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such QP"))?;
        let (expected, next) = match transition {
            QpTransition::Init => (SimQpState::Created, SimQpState::Init),
            QpTransition::ReadyToReceive { .. } => (SimQpState::Init, SimQpState::Rtr),
            QpTransition::ReadyToSend { .. } => (SimQpState::Rtr, SimQpState::Rts),
        };
        if qp.state != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad transition {:?} from {:?}", transition, qp.state),
            ));
        }
        qp.state = next;
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()> {
        if self.reject_sends.load(Ordering::Relaxed) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let mut state = self.state.lock().unwrap();
        let status = state.send_status;
        let (qpn, send_cq) = {
            let qp_sim = state
                .qps
                .get(&qp.0)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such QP"))?;
            (qp_sim.qpn, qp_sim.send_cq)
        };
        state.send_log.push((qp, *wr));
        let wc = Wc {
            wr_id: wr.wr_id,
            qp_num: qpn,
            byte_len: wr.sge.length,
            status,
        };
        state.cqs.get_mut(&send_cq).expect("send CQ gone").push_back(wc);
        Ok(())
    }

    fn post_recv_qp(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let qp_sim = state
            .qps
            .get_mut(&qp.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such QP"))?;
        if qp_sim.srq.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "QP is backed by an SRQ",
            ));
        }
        qp_sim.pending_recvs.push_back(*wr);
        Ok(())
    }

    fn post_recv_srq(&self, srq: SrqHandle, wr: &RecvWr) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let pending = state
            .srqs
            .get_mut(&srq.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such SRQ"))?;
        pending.push_back(*wr);
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle) -> io::Result<Option<Wc>> {
        let mut state = self.state.lock().unwrap();
        let queue = state
            .cqs
            .get_mut(&cq.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such CQ"))?;
        Ok(queue.pop_front())
    }
}
