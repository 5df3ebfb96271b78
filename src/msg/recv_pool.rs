//! The receive buffer pool.

use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::verbs::{PdHandle, Verbs};

use crate::ib::error::{Error, Result};
use crate::ib::mr::{MemReg, RegisteredBuffer};

/// A payload buffer on loan from the pool: either travelling to the recv
/// sink or awaiting repost. Holding a `RecvBuffer` is exclusive; the pool
/// hands each underlying buffer to at most one place at a time.
pub struct RecvBuffer {
    index: u32,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: exclusive loan; the bytes are not touched by anyone else until
// the buffer is returned and re-posted.
unsafe impl Send for RecvBuffer {}
unsafe impl Sync for RecvBuffer {}

impl RecvBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The received bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the loan is exclusive and `len` was bounded by the
        // buffer size at construction.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// Pre-registered receive buffers.
///
/// Payload buffers live in an MPMC ring of buffer indices with the same
/// reserve/publish discipline as the job queue; the buffer count must be a
/// power of two. The ring storage is twice the buffer count so that every
/// buffer can be enqueued simultaneously. On exhaustion, takers busy-wait
/// with a one-shot warning: capacity is sized to the worst-case in-flight
/// count, so waiting beats allocating.
///
/// Flow control buffers are a plain indexed vector with a free stack; they
/// cycle between the FC receive queue and the recv engine only.
pub struct RecvBufferPool {
    buffer_size: u32,
    pool_size: u32,
    buffers: Vec<RegisteredBuffer>,
    ring_size: u32,
    ring: Box<[AtomicU32]>,
    front: AtomicU32,
    back: AtomicU32,
    back_res: AtomicU32,
    flow_control_buffers: Vec<RegisteredBuffer>,
    flow_control_free: Mutex<Vec<u32>>,
}

impl RecvBufferPool {
    pub fn new(
        verbs: &Arc<dyn Verbs>,
        pd: PdHandle,
        total_pool_bytes: u64,
        buffer_size: u32,
        flow_control_queue_size: u16,
    ) -> Result<Self> {
        let pool_size = total_pool_bytes / u64::from(buffer_size);
        if pool_size == 0 || !pool_size.is_power_of_two() || pool_size > u64::from(u32::MAX / 2) {
            return Err(Error::Config(format!(
                "recv pool size must be a power of two, invalid value: {}",
                pool_size
            )));
        }
        let pool_size = pool_size as u32;

        log::info!(
            "allocating {} recv buffers, size {} each",
            pool_size,
            buffer_size
        );

        let mut buffers = Vec::with_capacity(pool_size as usize);
        for _ in 0..pool_size {
            buffers.push(RegisteredBuffer::new(verbs, pd, buffer_size as usize)?);
        }

        let ring_size = pool_size * 2;
        let ring: Box<[AtomicU32]> = (0..ring_size).map(AtomicU32::new).collect();
        // slots [0, pool_size) already hold indices 0..pool_size

        log::info!("allocating {} flow control buffers", flow_control_queue_size);

        let mut flow_control_buffers = Vec::with_capacity(flow_control_queue_size as usize);
        for _ in 0..flow_control_queue_size {
            flow_control_buffers.push(RegisteredBuffer::new(verbs, pd, 4)?);
        }

        Ok(RecvBufferPool {
            buffer_size,
            pool_size,
            buffers,
            ring_size,
            ring,
            front: AtomicU32::new(0),
            back: AtomicU32::new(pool_size),
            back_res: AtomicU32::new(pool_size),
            flow_control_buffers,
            flow_control_free: Mutex::new((0..u32::from(flow_control_queue_size)).collect()),
        })
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    /// Take a buffer index out of the pool, busy-waiting if it is empty.
    pub(crate) fn acquire(&self) -> u32 {
        let mut warn_once = true;
        let mut front = self.front.load(Ordering::Relaxed);

        loop {
            let back = self.back.load(Ordering::Acquire);

            if front % self.ring_size == back % self.ring_size {
                if warn_once {
                    warn_once = false;
                    log::warn!(
                        "insufficient pooled incoming buffers, waiting for buffers to get \
                         returned. If this warning appears frequently, consider increasing \
                         the receive pool's total size"
                    );
                }
                thread::yield_now();
                front = self.front.load(Ordering::Relaxed);
                continue;
            }

            let index = self.ring[(front % self.ring_size) as usize].load(Ordering::Relaxed);

            match self.front.compare_exchange_weak(
                front,
                front.wrapping_add(1),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return index,
                Err(current) => front = current,
            }
        }
    }

    /// Hand a buffer out to the sink, trimmed to the received length.
    pub(crate) fn loan(&self, index: u32, len: usize) -> RecvBuffer {
        let buffer = &self.buffers[index as usize];
        debug_assert!(len <= buffer.len());
        RecvBuffer {
            index,
            // SAFETY: the pool keeps the allocation alive for its own
            // lifetime; the loan protocol makes access exclusive.
            ptr: NonNull::new(buffer.as_ptr()).expect("registered buffer is non-null"),
            len,
        }
    }

    pub(crate) fn payload_mem(&self, index: u32) -> MemReg {
        self.buffers[index as usize].mem()
    }

    /// Put a loaned buffer back into the ring.
    pub fn return_buffer(&self, buffer: RecvBuffer) {
        let mut back_res = self.back_res.load(Ordering::Relaxed);

        loop {
            let front = self.front.load(Ordering::Relaxed);

            if back_res.wrapping_add(1) % self.ring_size == front % self.ring_size {
                log::error!("recv pool overflow, this should not happen");
                return;
            }

            match self.back_res.compare_exchange_weak(
                back_res,
                back_res.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.ring[(back_res % self.ring_size) as usize]
                        .store(buffer.index, Ordering::Relaxed);

                    // a concurrent return may have reserved the preceding
                    // slot but not published it yet; wait for it so the
                    // back cursor never exposes an unwritten slot
                    while self
                        .back
                        .compare_exchange(
                            back_res,
                            back_res.wrapping_add(1),
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_err()
                    {
                        thread::yield_now();
                    }

                    return;
                }
                Err(current) => back_res = current,
            }
        }
    }

    /// Take a flow control buffer index; they only leave the free stack
    /// during the initial fill of the FC receive queue.
    pub(crate) fn take_flow_control(&self) -> Option<u32> {
        let taken = self.flow_control_free.lock().unwrap().pop();
        if taken.is_none() {
            log::error!("out of flow control buffers");
        }
        taken
    }

    pub(crate) fn flow_control_mem(&self, index: u32) -> MemReg {
        self.flow_control_buffers[index as usize].mem()
    }

    /// The credit value last received into the FC buffer.
    pub(crate) fn read_flow_control(&self, index: u32) -> u32 {
        self.flow_control_buffers[index as usize].read_u32_le(0)
    }

    #[cfg(test)]
    pub(crate) fn write_payload(&self, index: u32, offset: usize, data: &[u8]) {
        self.buffers[index as usize].write(offset, data);
    }

    #[cfg(test)]
    pub(crate) fn write_flow_control(&self, index: u32, data: u32) {
        self.flow_control_buffers[index as usize].write(0, &data.to_le_bytes());
    }
}
