//! Memory regions.
//!
//! A region makes a span of local memory addressable by the fabric: as a
//! source or target of message transfers, and as the target of one-sided
//! RMA writes when registered with remote-write access. Remote peers cite
//! the region by its key; targets are zero-based offsets into the region.

use std::sync::Weak;

use crate::domain::DomainInner;

/// Local descriptor for a registered region.
///
/// Passed alongside each I/O vector segment when posting operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MrDesc(pub u64);

/// A registered memory region.
///
/// The registration is released when the region is dropped.
#[derive(Debug)]
pub struct MemoryRegion {
    domain: Weak<DomainInner>,
    key: u64,
    addr: *mut u8,
    len: usize,
}

// Safety: the raw base pointer is never dereferenced through this handle;
// all access goes through the domain registry, which synchronizes.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    pub(crate) fn new(domain: Weak<DomainInner>, key: u64, addr: *mut u8, len: usize) -> Self {
        Self {
            domain,
            key,
            addr,
            len,
        }
    }

    /// The provider-assigned key remote peers cite for RMA.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Local descriptor for posting operations over this region.
    pub fn desc(&self) -> MrDesc {
        MrDesc(self.key)
    }

    /// Base address of the registered span.
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Length of the registered span in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the registered span is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Some(domain) = self.domain.upgrade() {
            domain.remove(self.key);
        }
    }
}
