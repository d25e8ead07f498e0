//! Page-aligned memory blocks.
//!
//! An [`AlignedMemory`] is the unit of memory that transports hand to
//! benchmarking patterns and that devices register for network access. It is
//! shared through an `Arc`: the caller's buffer and the device's registration
//! table may both hold it, and the allocation is freed once both are gone.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Page size used when none can be queried from the OS.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Return the system page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 && (size as usize).is_power_of_two() {
            size as usize
        } else {
            FALLBACK_PAGE_SIZE
        }
    })
}

/// A zero-initialized, page-aligned heap allocation.
///
/// The bytes are reachable through raw pointers by a device while a work
/// request referencing them is outstanding, the same way a NIC would DMA into
/// them. Safe slice access is provided by the owning buffer types; this type
/// only exposes the raw range.
pub struct AlignedMemory {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the allocation is plain bytes with no thread affinity. Concurrent
// access discipline is the same as for DMA-visible memory and is upheld by the
// transports (one outstanding work request per buffer at a time).
unsafe impl Send for AlignedMemory {}
unsafe impl Sync for AlignedMemory {}

impl AlignedMemory {
    /// Allocate `len` zeroed bytes aligned to the page size.
    ///
    /// Returns `None` when the allocator fails or the size overflows. A
    /// zero-length request still reserves one page so the block has a unique
    /// address.
    pub fn zeroed(len: usize) -> Option<Self> {
        let page = page_size();
        let size = len.max(1).checked_next_multiple_of(page)?;
        let layout = Layout::from_size_align(size, page).ok()?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)?;
        Some(Self { ptr, len, layout })
    }

    /// Start address of the block.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the first byte.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Whether `[addr, addr + len)` lies inside this block.
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        let start = self.addr();
        match (addr.checked_sub(start), addr.checked_add(len)) {
            (Some(offset), Some(_)) => offset <= self.len && len <= self.len - offset,
            _ => false,
        }
    }

    /// Copy `len` bytes starting at absolute address `addr` out of the block.
    ///
    /// Returns `None` if the range is not inside the block.
    pub fn read_range(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        if !self.contains_range(addr, len) {
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: the range was checked to be inside the live allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), len);
        }
        Some(out)
    }

    /// Copy `data` into the block at absolute address `addr`.
    ///
    /// Returns `false` without writing if the range is not inside the block.
    pub fn write_range(&self, addr: usize, data: &[u8]) -> bool {
        if !self.contains_range(addr, data.len()) {
            return false;
        }
        // SAFETY: the range was checked to be inside the live allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
        }
        true
    }
}

impl std::fmt::Debug for AlignedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedMemory")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for AlignedMemory {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn test_alignment_and_zeroing() {
        let mem = AlignedMemory::zeroed(10_000).unwrap();
        assert_eq!(mem.addr() % page_size(), 0);
        assert_eq!(mem.len(), 10_000);
        assert_eq!(mem.read_range(mem.addr(), 16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_zero_length_has_address() {
        let mem = AlignedMemory::zeroed(0).unwrap();
        assert!(mem.is_empty());
        assert_ne!(mem.addr(), 0);
        assert!(mem.contains_range(mem.addr(), 0));
    }

    #[test]
    fn test_range_checks() {
        let mem = AlignedMemory::zeroed(64).unwrap();
        let base = mem.addr();
        assert!(mem.contains_range(base, 64));
        assert!(mem.contains_range(base + 60, 4));
        assert!(!mem.contains_range(base + 60, 5));
        assert!(!mem.contains_range(base - 1, 1));
        assert!(!mem.contains_range(usize::MAX, 2));
    }

    #[test]
    fn test_write_then_read() {
        let mem = AlignedMemory::zeroed(32).unwrap();
        assert!(mem.write_range(mem.addr() + 4, &[1, 2, 3]));
        assert_eq!(mem.read_range(mem.addr() + 3, 5).unwrap(), vec![0, 1, 2, 3, 0]);
        assert!(!mem.write_range(mem.addr() + 30, &[9, 9, 9]));
    }
}
