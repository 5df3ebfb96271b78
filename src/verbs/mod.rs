//! The verbs provider abstraction.
//!
//! The actual RDMA verbs library is an external collaborator. This module
//! defines the narrow interface the rest of the crate programs against:
//! opaque handles for device resources, plain-data work request and work
//! completion types, and the [`Verbs`] trait with the post/poll primitives.
//!
//! A provider implementation is expected to be a thin shim over
//! `libibverbs` (or a compatible stack). All methods take `&self`; the
//! provider is shared across worker threads behind an `Arc<dyn Verbs>`.

use std::fmt;
use std::io;

#[cfg(test)]
pub(crate) mod testing;

/// Local identifier (LID) is a [`u16`] that identifies a port on a switch or an HCA in the cluster.
pub type Lid = u16;

/// QP number (QPN) is a [`u32`] that identifies a local queue pair.
pub type Qpn = u32;

/// Local key (LKey) is a [`u32`] that identifies a local memory region.
pub type LKey = u32;

/// Work request identifier (WrId) is a [`u64`] designated by the poster to
/// identify a work request in its completion.
pub type WrId = u64;

macro_rules! opaque_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

opaque_handle!(
    /// Opaque protection domain handle.
    PdHandle
);
opaque_handle!(
    /// Opaque completion queue handle.
    CqHandle
);
opaque_handle!(
    /// Opaque shared receive queue handle.
    SrqHandle
);
opaque_handle!(
    /// Opaque queue pair handle.
    QpHandle
);
opaque_handle!(
    /// Opaque memory region handle.
    MrHandle
);

/// Attributes of the opened device port.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttr {
    /// LID assigned to the port by the subnet manager.
    pub lid: Lid,
}

/// A registered memory region: handle plus the local key used in SGEs.
#[derive(Debug, Clone, Copy)]
pub struct MrDesc {
    pub handle: MrHandle,
    pub lkey: LKey,
}

/// A created queue pair: handle plus the physical QP number the fabric
/// addresses it by.
#[derive(Debug, Clone, Copy)]
pub struct QpDesc {
    pub handle: QpHandle,
    pub qpn: Qpn,
}

/// Single scatter-gather element. The engines always post exactly one SGE
/// per work request.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

/// Send work request: opcode SEND, signaled completion.
#[derive(Debug, Clone, Copy)]
pub struct SendWr {
    pub wr_id: WrId,
    pub sge: Sge,
}

/// Receive work request.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sge: Sge,
}

/// Status of a polled work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// Transport retry counter exceeded (`IBV_WC_RETRY_EXC_ERR`); the remote
    /// never acknowledged.
    RetryExceeded,
    /// Any other failure status, carried verbatim.
    Error(u32),
}

/// A polled work completion.
#[derive(Debug, Clone, Copy)]
pub struct Wc {
    pub wr_id: WrId,
    pub qp_num: Qpn,
    pub byte_len: u32,
    pub status: WcStatus,
}

/// Queue pair state transitions. Transitions are one-way:
/// INIT -> RTR -> RTS. The attribute values are fixed by the caller.
#[derive(Debug, Clone, Copy)]
pub enum QpTransition {
    /// RESET -> INIT, right after creation.
    Init,
    /// INIT -> RTR. Fixed path MTU, destination QP/PSN, no global routing.
    ReadyToReceive {
        remote_lid: Lid,
        remote_qpn: Qpn,
        path_mtu: u32,
        min_rnr_timer: u8,
    },
    /// RTR -> RTS. ACK timeout and retry parameters.
    ReadyToSend {
        timeout: u8,
        retry_count: u8,
        rnr_retry: u8,
    },
}

/// The verbs provider interface.
///
/// Implementations map these calls onto the underlying verbs library. Post
/// failures are reported as `io::Error` with the raw errno preserved;
/// `ENOMEM` means the target queue is full. `poll_cq` returns `Ok(None)`
/// when the completion queue is empty.
pub trait Verbs: Send + Sync {
    fn open_device(&self) -> io::Result<DeviceAttr>;

    fn alloc_pd(&self) -> io::Result<PdHandle>;

    fn register_mr(&self, pd: PdHandle, addr: u64, len: usize) -> io::Result<MrDesc>;

    fn deregister_mr(&self, mr: MrHandle) -> io::Result<()>;

    fn create_cq(&self, capacity: u32) -> io::Result<CqHandle>;

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()>;

    fn create_srq(&self, pd: PdHandle, capacity: u32) -> io::Result<SrqHandle>;

    fn destroy_srq(&self, srq: SrqHandle) -> io::Result<()>;

    /// Create a reliable-connected QP. When `srq` is given, the QP draws
    /// its receive buffers from the shared queue instead of a private one.
    #[allow(clippy::too_many_arguments)]
    fn create_qp(
        &self,
        pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        srq: Option<SrqHandle>,
        max_send_wr: u32,
        max_recv_wr: u32,
    ) -> io::Result<QpDesc>;

    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()>;

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()>;

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()>;

    fn post_recv_qp(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()>;

    fn post_recv_srq(&self, srq: SrqHandle, wr: &RecvWr) -> io::Result<()>;

    fn poll_cq(&self, cq: CqHandle) -> io::Result<Option<Wc>>;
}
