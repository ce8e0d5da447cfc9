//! Fabric and resource-domain objects.
//!
//! A [`Domain`] is the protection scope for memory registrations: every
//! region registered within it is addressable by key for incoming RMA
//! writes. Endpoints, completion queues, and address vectors are created
//! from a domain (or the parent [`Fabric`]) and may be shared across
//! threads.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::info::FabricInfo;
use crate::mr::MemoryRegion;
use crate::Flags;

/// Top-level fabric object, opened from a [`FabricInfo`].
pub struct Fabric {
    provider_name: &'static str,
}

impl Fabric {
    /// Open the fabric described by `info`.
    pub fn new(info: &FabricInfo) -> io::Result<Self> {
        Ok(Self {
            provider_name: info.provider_name,
        })
    }

    /// Name of the provider backing this fabric.
    pub fn provider_name(&self) -> &'static str {
        self.provider_name
    }

    /// Open a resource domain on this fabric.
    pub fn domain(&self, _info: &FabricInfo) -> io::Result<Domain> {
        Ok(Domain(Arc::new(DomainInner {
            mrs: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        })))
    }
}

/// A registered memory span.
///
/// Raw pointer wrapper so the registry can be shared between threads; the
/// registrant promised validity for the registration lifetime (see
/// [`Domain::register`]).
pub(crate) struct Span(pub *mut u8);

unsafe impl Send for Span {}
unsafe impl Sync for Span {}

pub(crate) struct MrEntry {
    pub base: Span,
    pub len: usize,
    pub access: Flags,
}

pub(crate) struct DomainInner {
    mrs: Mutex<HashMap<u64, MrEntry>>,
    next_key: AtomicU64,
}

impl DomainInner {
    pub(crate) fn insert(&self, base: *mut u8, len: usize, access: Flags) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut mrs = self.mrs.lock().unwrap();
        mrs.insert(
            key,
            MrEntry {
                base: Span(base),
                len,
                access,
            },
        );
        key
    }

    pub(crate) fn remove(&self, key: u64) {
        let mut mrs = self.mrs.lock().unwrap();
        mrs.remove(&key);
    }

    /// Place `data` at `offset` within the region `key`.
    ///
    /// Returns the OS errno to acknowledge with: 0 on success, `EACCES`
    /// when the region is not writable from remote peers, `EINVAL` when the
    /// key is unknown or the write falls outside the region.
    pub(crate) fn apply_write(&self, key: u64, offset: u64, data: &[u8]) -> i32 {
        let mrs = self.mrs.lock().unwrap();
        let Some(entry) = mrs.get(&key) else {
            return nix::libc::EINVAL;
        };
        if !entry.access.contains(Flags::REMOTE_WRITE) {
            return nix::libc::EACCES;
        }
        let Some(end) = (offset as usize).checked_add(data.len()) else {
            return nix::libc::EINVAL;
        };
        if end > entry.len {
            return nix::libc::EINVAL;
        }
        // Safety: the registrant guaranteed [base, base+len) valid while the
        // registration is live, and the registry entry is removed before the
        // backing memory is released.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                entry.base.0.add(offset as usize),
                data.len(),
            );
        }
        0
    }
}

/// Resource domain. Cheaply cloneable.
#[derive(Clone)]
pub struct Domain(pub(crate) Arc<DomainInner>);

impl Domain {
    /// Register `len` bytes at `addr` with the given access rights.
    ///
    /// The provider assigns the region key; `requested_key` is advisory and
    /// ignored, as for any provider-keyed domain. Read the effective key
    /// back with [`MemoryRegion::key`].
    ///
    /// # Safety
    /// The memory must be valid for reads and writes for the whole lifetime
    /// of the returned [`MemoryRegion`], and must not be mutated by the
    /// application while an operation the fabric owns may access it.
    pub unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: Flags,
        _requested_key: u64,
    ) -> io::Result<MemoryRegion> {
        let key = self.0.insert(addr, len, access);
        Ok(MemoryRegion::new(Arc::downgrade(&self.0), key, addr, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{getinfo, version, GetInfoFlags, Hints};

    #[test]
    fn test_register_and_write() {
        let info = getinfo(version(1, 13), None, None, GetInfoFlags::empty(), &Hints::default())
            .unwrap();
        let fabric = Fabric::new(&info).unwrap();
        let domain = fabric.domain(&info).unwrap();

        let mut buf = vec![0u8; 64];
        let mr = unsafe {
            domain
                .register(buf.as_mut_ptr(), buf.len(), Flags::RECV | Flags::REMOTE_WRITE, 7)
                .unwrap()
        };

        assert_eq!(domain.0.apply_write(mr.key(), 8, b"abc"), 0);
        assert_eq!(&buf[8..11], b"abc");

        // out of bounds
        assert_ne!(domain.0.apply_write(mr.key(), 62, b"abc"), 0);
        // unknown key
        assert_ne!(domain.0.apply_write(mr.key() + 1000, 0, b"x"), 0);

        let key = mr.key();
        drop(mr);
        assert_ne!(domain.0.apply_write(key, 0, b"x"), 0);
    }

    #[test]
    fn test_write_access_enforced() {
        let info = getinfo(version(1, 13), None, None, GetInfoFlags::empty(), &Hints::default())
            .unwrap();
        let domain = Fabric::new(&info).unwrap().domain(&info).unwrap();

        let mut buf = vec![0u8; 16];
        let mr = unsafe {
            domain
                .register(buf.as_mut_ptr(), buf.len(), Flags::SEND, 0)
                .unwrap()
        };
        assert_eq!(domain.0.apply_write(mr.key(), 0, b"x"), nix::libc::EACCES);
    }
}
