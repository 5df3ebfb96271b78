//! Pre-registered memory buffers.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::verbs::{LKey, MrHandle, PdHandle, Sge, Verbs};

use super::error::Result;

/// Plain-data descriptor of a registered memory range, enough to build
/// scatter-gather elements from.
#[derive(Debug, Clone, Copy)]
pub struct MemReg {
    addr: u64,
    len: u32,
    lkey: LKey,
}

impl MemReg {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lkey(&self) -> LKey {
        self.lkey
    }

    /// SGE covering `length` bytes starting at `offset`.
    pub fn sge(&self, offset: u32, length: u32) -> Sge {
        debug_assert!(offset.checked_add(length).is_some_and(|end| end <= self.len));
        Sge {
            addr: self.addr + u64::from(offset),
            length,
            lkey: self.lkey,
        }
    }

    /// SGE covering the whole region.
    pub fn full_sge(&self) -> Sge {
        self.sge(0, self.len)
    }
}

/// A pinned, registered byte buffer the NIC may read and write directly.
///
/// The buffer is shared between the posting side and the application
/// through raw pointers; which bytes each party may touch at a given time
/// is governed by the surrounding buffer-ownership protocol (ring
/// positions for send buffers, pool membership for receive buffers), not
/// by the borrow checker.
pub struct RegisteredBuffer {
    verbs: Arc<dyn Verbs>,
    ptr: NonNull<u8>,
    len: usize,
    mr: MrHandle,
    reg: MemReg,
}

// SAFETY: access to the underlying bytes goes through raw pointer copies
// only, coordinated by the ownership protocol above.
unsafe impl Send for RegisteredBuffer {}
unsafe impl Sync for RegisteredBuffer {}

impl RegisteredBuffer {
    /// Allocate a zeroed buffer of `len` bytes and register it with the
    /// protection domain.
    pub fn new(verbs: &Arc<dyn Verbs>, pd: PdHandle, len: usize) -> Result<Self> {
        assert!(len > 0 && len <= u32::MAX as usize);

        let buf = vec![0u8; len].into_boxed_slice();
        // Ownership of the allocation moves into `ptr`; reconstructed and
        // freed in Drop.
        let ptr = NonNull::new(Box::into_raw(buf) as *mut u8).expect("boxed slice is non-null");

        let desc = verbs.register_mr(pd, ptr.as_ptr() as u64, len)?;

        Ok(RegisteredBuffer {
            verbs: verbs.clone(),
            ptr,
            len,
            mr: desc.handle,
            reg: MemReg {
                addr: ptr.as_ptr() as u64,
                len: len as u32,
                lkey: desc.lkey,
            },
        })
    }

    pub fn mem(&self) -> MemReg {
        self.reg
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len);
        // SAFETY: in-bounds, and the ownership protocol guarantees nobody
        // else touches this range concurrently.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Copy bytes out of the buffer at `offset` into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len);
        // SAFETY: see `write`.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Read a little-endian u32 at `offset`.
    pub fn read_u32_le(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        self.read(offset, &mut bytes);
        u32::from_le_bytes(bytes)
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.verbs.deregister_mr(self.mr) {
            log::error!("deregistering MR {:?} failed: {}", self.mr, e);
        }
        // SAFETY: `ptr`/`len` came from Box::into_raw of a boxed slice in
        // `new`, and are freed exactly once here.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::testing::SimVerbs;

    #[test]
    fn write_read_roundtrip() {
        let verbs: Arc<dyn Verbs> = Arc::new(SimVerbs::new());
        let pd = verbs.alloc_pd().unwrap();
        let buf = RegisteredBuffer::new(&verbs, pd, 64).unwrap();

        buf.write(8, &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(buf.read_u32_le(8), 0xDEAD_BEEF);
    }

    #[test]
    fn sge_offsets() {
        let verbs: Arc<dyn Verbs> = Arc::new(SimVerbs::new());
        let pd = verbs.alloc_pd().unwrap();
        let buf = RegisteredBuffer::new(&verbs, pd, 128).unwrap();

        let mem = buf.mem();
        let sge = mem.sge(32, 16);
        assert_eq!(sge.addr, mem.addr() + 32);
        assert_eq!(sge.length, 16);
        assert_eq!(mem.full_sge().length, 128);
    }
}
