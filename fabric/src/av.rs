//! Address vectors.
//!
//! An address vector resolves the opaque peer names exchanged during
//! connection setup into routable addresses. Applications move names around
//! as byte strings (they travel inside handshake messages) and talk to the
//! fabric in terms of [`FiAddr`] indices.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

/// Index of a resolved peer within an [`AddressVector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiAddr(pub u64);

impl FiAddr {
    /// No particular peer.
    pub const UNSPEC: FiAddr = FiAddr(u64::MAX);
}

/// Longest encoded name this provider produces.
pub const NAME_MAX: usize = 19;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Encode a socket address as an opaque fabric name.
///
/// Layout: family tag (1 byte, 4 or 6), port (2 bytes big-endian), then the
/// raw IP octets. Trailing bytes in an oversized buffer are ignored by
/// [`decode_name`], so names may be carried in fixed-size message fields.
pub fn encode_name(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(NAME_MAX);
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(FAMILY_V4);
            out.extend_from_slice(&addr.port().to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(FAMILY_V6);
            out.extend_from_slice(&addr.port().to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
    }
    out
}

/// Decode an opaque fabric name back into a socket address.
pub fn decode_name(name: &[u8]) -> io::Result<SocketAddr> {
    let err = || io::Error::new(io::ErrorKind::InvalidData, "malformed fabric name");
    if name.len() < 3 {
        return Err(err());
    }
    let port = u16::from_be_bytes([name[1], name[2]]);
    match name[0] {
        FAMILY_V4 if name.len() >= 7 => {
            let octets: [u8; 4] = name[3..7].try_into().unwrap();
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_V6 if name.len() >= 19 => {
            let octets: [u8; 16] = name[3..19].try_into().unwrap();
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(err()),
    }
}

/// Table resolving [`FiAddr`] indices to peer addresses.
#[derive(Clone, Default)]
pub struct AddressVector {
    slots: Arc<Mutex<Vec<Option<SocketAddr>>>>,
}

impl AddressVector {
    /// Open an empty address vector.
    pub fn open() -> Self {
        Self::default()
    }

    /// Insert an encoded peer name; returns its index.
    pub fn insert(&self, name: &[u8]) -> io::Result<FiAddr> {
        let addr = decode_name(name)?;
        let mut slots = self.slots.lock().unwrap();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(addr);
                return Ok(FiAddr(i as u64));
            }
        }
        slots.push(Some(addr));
        Ok(FiAddr(slots.len() as u64 - 1))
    }

    /// Remove a previously inserted peer.
    pub fn remove(&self, fi_addr: FiAddr) -> io::Result<()> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(fi_addr.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "address not present in vector",
            )),
        }
    }

    /// Resolve an index back to its address.
    pub fn lookup(&self, fi_addr: FiAddr) -> Option<SocketAddr> {
        let slots = self.slots.lock().unwrap();
        slots.get(fi_addr.0 as usize).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        let v4: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        assert_eq!(decode_name(&encode_name(v4)).unwrap(), v4);

        let v6: SocketAddr = "[::1]:9999".parse().unwrap();
        assert_eq!(decode_name(&encode_name(v6)).unwrap(), v6);
    }

    #[test]
    fn test_name_ignores_padding() {
        let addr: SocketAddr = "10.0.0.7:1".parse().unwrap();
        let mut padded = [0u8; 512];
        let name = encode_name(addr);
        padded[..name.len()].copy_from_slice(&name);
        assert_eq!(decode_name(&padded).unwrap(), addr);
    }

    #[test]
    fn test_insert_remove_reuse() {
        let av = AddressVector::open();
        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2000".parse().unwrap();

        let fa = av.insert(&encode_name(a)).unwrap();
        let fb = av.insert(&encode_name(b)).unwrap();
        assert_ne!(fa, fb);
        assert_eq!(av.lookup(fa), Some(a));

        av.remove(fa).unwrap();
        assert_eq!(av.lookup(fa), None);
        assert!(av.remove(fa).is_err());

        // freed slot is reused
        let fc = av.insert(&encode_name(a)).unwrap();
        assert_eq!(fc, fa);
    }

    #[test]
    fn test_malformed_name() {
        assert!(decode_name(&[]).is_err());
        assert!(decode_name(&[9, 0, 0, 1, 2, 3, 4]).is_err());
        assert!(decode_name(&[FAMILY_V4, 0]).is_err());
    }
}
