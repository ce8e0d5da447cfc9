//! Memory-registration helpers.
//!
//! [`fibonacci_iov_setup`] deterministically slices a buffer into segments
//! of varied lengths so multi-segment paths are exercised even for small
//! messages. [`mr_regv_all`] registers such a vector under the provider's
//! per-registration segment cap.

use std::io;

use fabric::{Domain, Flags, IoVec, MemoryRegion, MrDesc};
use tracing::trace;

use crate::keys::KeySource;

/// Slice `len` bytes at `base` into at most `maxsegs` segments using
/// successive Fibonacci lengths {1, 1, 2, 3, 5, 8, …}; the final segment
/// absorbs any remainder. Returns an empty vector when `maxsegs` cannot
/// cover a non-empty buffer.
pub fn fibonacci_iov_setup(base: *mut u8, len: usize, maxsegs: usize) -> Vec<IoVec> {
    if maxsegs < 1 && len > 0 {
        return Vec::new();
    }

    let mut iovs = Vec::new();
    let (mut prev, mut curr) = (0usize, 1usize);
    let mut off = 0usize;
    let mut left = len;

    while left > 0 && iovs.len() + 1 < maxsegs {
        let seg = curr.min(left);
        iovs.push(IoVec {
            addr: base as u64 + off as u64,
            len: seg,
        });
        off += seg;
        left -= seg;
        (prev, curr) = (curr, prev + curr);
    }
    if left > 0 {
        iovs.push(IoVec {
            addr: base as u64 + off as u64,
            len: left,
        });
    }
    iovs
}

/// Registrations covering one I/O vector, with per-segment descriptors and
/// zero-based remote offsets.
pub struct RegisteredVec {
    /// One region per `maxsegs`-sized chunk of the vector.
    pub mrs: Vec<MemoryRegion>,
    /// One descriptor per segment.
    pub descs: Vec<MrDesc>,
    /// One zero-based remote offset per segment.
    pub raddrs: Vec<u64>,
}

/// Register the `iovs` vector in ⌈n / maxsegs⌉ registrations.
///
/// All segments within one registration share one region and descriptor;
/// each segment records its cumulative offset within the registration as
/// its remote address. Should a registration fail mid-way, the regions
/// already created are released before the error returns.
///
/// # Safety
/// The memory named by `iovs` must stay valid for the lifetime of the
/// returned registrations, and the segments of each `maxsegs` chunk must be
/// adjacent in memory.
pub unsafe fn mr_regv_all(
    domain: &Domain,
    iovs: &[IoVec],
    maxsegs: usize,
    access: Flags,
    keys: &mut KeySource,
) -> io::Result<RegisteredVec> {
    let mut out = RegisteredVec {
        mrs: Vec::new(),
        descs: Vec::with_capacity(iovs.len()),
        raddrs: Vec::with_capacity(iovs.len()),
    };

    for chunk in iovs.chunks(maxsegs) {
        trace!(target: "memreg", nsegs = chunk.len(), "registering I/O vector chunk");
        let base = chunk[0].addr;
        let total: usize = chunk.iter().map(|v| v.len).sum();
        debug_assert!(
            chunk
                .windows(2)
                .all(|w| w[0].addr + w[0].len as u64 == w[1].addr),
            "registration chunk must be contiguous"
        );

        // A failure here drops `out`, releasing the regions registered so
        // far.
        let mr = domain.register(base as *mut u8, total, access, keys.next())?;

        let mut raddr = 0u64;
        for seg in chunk {
            out.descs.push(mr.desc());
            out.raddrs.push(raddr);
            raddr += seg.len as u64;
        }
        out.mrs.push(mr);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_lengths() {
        let mut buf = [0u8; 100];
        let iovs = fibonacci_iov_setup(buf.as_mut_ptr(), buf.len(), 12);
        let lens: Vec<usize> = iovs.iter().map(|v| v.len).collect();
        // 1+1+2+3+5+8+13+21+34 = 88, remainder 12 in the final segment
        assert_eq!(lens, vec![1, 1, 2, 3, 5, 8, 13, 21, 34, 12]);
        assert_eq!(lens.iter().sum::<usize>(), 100);

        // segments tile the buffer
        let mut expect = buf.as_ptr() as u64;
        for iov in &iovs {
            assert_eq!(iov.addr, expect);
            expect += iov.len as u64;
        }
    }

    #[test]
    fn test_fibonacci_truncates_to_maxsegs() {
        let mut buf = [0u8; 540];
        let iovs = fibonacci_iov_setup(buf.as_mut_ptr(), buf.len(), 2);
        assert_eq!(iovs.len(), 2);
        assert_eq!(iovs[0].len, 1);
        assert_eq!(iovs[1].len, 539);

        let one = fibonacci_iov_setup(buf.as_mut_ptr(), buf.len(), 1);
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].len, 540);
    }

    #[test]
    fn test_fibonacci_degenerate() {
        let mut buf = [0u8; 8];
        assert!(fibonacci_iov_setup(buf.as_mut_ptr(), 8, 0).is_empty());
        assert!(fibonacci_iov_setup(buf.as_mut_ptr(), 0, 4).is_empty());
    }

    #[test]
    fn test_mr_regv_all_offsets() {
        use fabric::{getinfo, version, Fabric, GetInfoFlags, Hints};

        let info = getinfo(version(1, 13), None, None, GetInfoFlags::empty(), &Hints::default())
            .unwrap();
        let domain = Fabric::new(&info).unwrap().domain(&info).unwrap();
        let mut keys = KeySource::new();

        let mut buf = [0u8; 64];
        let iovs = fibonacci_iov_setup(buf.as_mut_ptr(), buf.len(), 5);
        assert_eq!(iovs.len(), 5); // 1,1,2,3 + remainder 57

        let reg = unsafe { mr_regv_all(&domain, &iovs, 2, Flags::RECV, &mut keys).unwrap() };
        // ⌈5/2⌉ registrations
        assert_eq!(reg.mrs.len(), 3);
        assert_eq!(reg.descs.len(), 5);
        // offsets restart at each registration: [1,1], [2,3], [57]
        assert_eq!(reg.raddrs, vec![0, 1, 0, 2, 0]);
        // segments within one chunk share the registration's descriptor
        assert_eq!(reg.descs[0], reg.descs[1]);
        assert_eq!(reg.descs[2], reg.descs[3]);
    }
}
