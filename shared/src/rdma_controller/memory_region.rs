use std::{
    io,
    ops::{Deref, DerefMut},
};

use rdma_sys::{ibv_access_flags, ibv_dereg_mr, ibv_mr, ibv_pd, ibv_reg_mr};

/// A registered buffer. The memory is owned here so that it cannot be freed
/// while the adapter may still access it.
pub struct MemoryRegion {
    mr: *mut ibv_mr,
    buffer: Box<[u64]>,
}

unsafe impl Send for MemoryRegion {}

unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Registers a zeroed buffer of at least `len` bytes, aligned for atomics.
    pub fn register(pd: *mut ibv_pd, len: usize) -> io::Result<Self> {
        let words = len.div_ceil(8).max(1);
        let buffer = vec![0u64; words].into_boxed_slice();

        let mr = unsafe {
            ibv_reg_mr(
                pd,
                buffer.as_ptr().cast_mut().cast(),
                words * 8,
                (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                    | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
                    .0 as i32,
            )
        };

        if mr.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(MemoryRegion { mr, buffer })
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.buffer)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.buffer)
    }

    pub fn addr(&self) -> u64 {
        self.buffer.as_ptr() as u64
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            ibv_dereg_mr(self.mr);
        }
    }
}

impl Deref for MemoryRegion {
    type Target = ibv_mr;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mr }
    }
}

impl DerefMut for MemoryRegion {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mr }
    }
}
