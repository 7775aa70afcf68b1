//! Coherent memory shared with the controller's DMA engines.

use core::ptr::NonNull;
use usb_hcd::HcdError;

/// A block of coherent memory, visible to the CPU at `ptr` and to the
/// controller at `bus`.
#[derive(Debug)]
pub struct DmaRegion {
    ptr: NonNull<u8>,
    bus: u32,
    len: usize,
}

// Only reachable through the owning ring, under the controller lock.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes, aligned to
    /// at least 8 bytes, and stay valid until the region is handed back to
    /// the allocator that produced it.
    pub unsafe fn from_raw(ptr: NonNull<u8>, bus: u32, len: usize) -> Self {
        DmaRegion { ptr, bus, len }
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns a reference to a `T` at `offset`, or `None` if it does not fit.
    pub fn get_mut<T>(&mut self, offset: usize) -> Option<&mut T> {
        if offset + core::mem::size_of::<T>() > self.len || offset % core::mem::align_of::<T>() != 0 {
            return None;
        }
        Some(unsafe { &mut *(self.ptr.as_ptr().add(offset) as *mut T) })
    }

    pub fn get<T>(&self, offset: usize) -> Option<&T> {
        if offset + core::mem::size_of::<T>() > self.len || offset % core::mem::align_of::<T>() != 0 {
            return None;
        }
        Some(unsafe { &*(self.ptr.as_ptr().add(offset) as *const T) })
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        let n = dst.len().min(self.len.saturating_sub(offset));
        for (i, byte) in dst.iter_mut().take(n).enumerate() {
            *byte = unsafe { core::ptr::read_volatile(self.ptr.as_ptr().add(offset + i)) };
        }
    }

    pub fn fill(&mut self, value: u8) {
        for i in 0..self.len {
            unsafe { core::ptr::write_volatile(self.ptr.as_ptr().add(i), value) };
        }
    }
}

/// Source of coherent DMA memory, supplied by the platform.
pub trait DmaAllocator: Send + Sync {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, HcdError>;

    fn free_coherent(&self, region: DmaRegion);
}
