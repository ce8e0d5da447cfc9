//! Wire messages.
//!
//! Four fixed-layout messages travel on the control channel; integers are
//! big-endian:
//!
//! - *initial*: nonce (16) + nsources (4) + id (4) + addrlen (4) + addr (512)
//! - *ack*: addrlen (4) + addr (512)
//! - *vector*: niovs (4) + niovs × (addr (8) + len (8) + key (8)), at most
//!   12 triples; only the cited triples are transmitted
//! - *progress*: nfilled (8) + nleftover (8)
//!
//! The decoders validate as they parse; a vector message announcing more
//! triples than it carries, a ragged triple area, or more than 12 triples
//! is malformed, as is a progress message that is not exactly 16 bytes.

use fabric::RmaIoVec;

use crate::error::{Error, Result};

/// Nonce bytes in the initial message.
pub const NONCE_SIZE: usize = 16;
/// Fixed space reserved for an endpoint name.
pub const ADDR_SIZE: usize = 512;

/// Encoded size of an initial message.
pub const INITIAL_MSG_SIZE: usize = NONCE_SIZE + 4 + 4 + 4 + ADDR_SIZE;
/// Encoded size of an ack message.
pub const ACK_MSG_SIZE: usize = 4 + ADDR_SIZE;

/// Most triples one vector message may cite.
pub const VECTOR_IOV_MAX: usize = 12;
/// Encoded size of one vector triple.
pub const VECTOR_IOV_SIZE: usize = 24;
/// Encoded size of the vector-message header.
pub const VECTOR_HDR_SIZE: usize = 4;
/// Largest encoded vector message.
pub const VECTOR_MSG_MAX_SIZE: usize = VECTOR_HDR_SIZE + VECTOR_IOV_MAX * VECTOR_IOV_SIZE;

/// Encoded size of a progress message.
pub const PROGRESS_MSG_SIZE: usize = 16;

/// Handshake opener sent by the transmitter.
#[derive(Debug, Clone)]
pub struct InitialMsg {
    pub nonce: [u8; NONCE_SIZE],
    pub nsources: u32,
    pub id: u32,
    pub addr: [u8; ADDR_SIZE],
    pub addrlen: u32,
}

impl InitialMsg {
    pub fn new(name: &[u8]) -> Self {
        let mut addr = [0u8; ADDR_SIZE];
        addr[..name.len()].copy_from_slice(name);
        Self {
            nonce: [0u8; NONCE_SIZE],
            nsources: 1,
            id: 0,
            addr,
            addrlen: name.len() as u32,
        }
    }
}

/// Handshake answer sent by the receiver.
#[derive(Debug, Clone)]
pub struct AckMsg {
    pub addr: [u8; ADDR_SIZE],
    pub addrlen: u32,
}

impl AckMsg {
    pub fn new(name: &[u8]) -> Self {
        let mut addr = [0u8; ADDR_SIZE];
        addr[..name.len()].copy_from_slice(name);
        Self {
            addr,
            addrlen: name.len() as u32,
        }
    }
}

/// RDMA-target advertisement sent by the receiver. Zero triples signal EOF.
#[derive(Debug, Clone, Default)]
pub struct VectorMsg {
    pub iovs: Vec<RmaIoVec>,
}

/// Placement report sent by the transmitter. Zero leftover signals EOF.
#[derive(Debug, Clone, Copy)]
pub struct ProgressMsg {
    pub nfilled: u64,
    pub nleftover: u64,
}

pub fn encode_initial(msg: &InitialMsg, out: &mut [u8; INITIAL_MSG_SIZE]) {
    out[..NONCE_SIZE].copy_from_slice(&msg.nonce);
    out[16..20].copy_from_slice(&msg.nsources.to_be_bytes());
    out[20..24].copy_from_slice(&msg.id.to_be_bytes());
    out[24..28].copy_from_slice(&msg.addrlen.to_be_bytes());
    out[28..].copy_from_slice(&msg.addr);
}

pub fn decode_initial(buf: &[u8]) -> Result<InitialMsg> {
    if buf.len() != INITIAL_MSG_SIZE {
        return Err(Error::Protocol("initial message has the wrong size"));
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&buf[..NONCE_SIZE]);
    let nsources = u32::from_be_bytes(buf[16..20].try_into().unwrap());
    let id = u32::from_be_bytes(buf[20..24].try_into().unwrap());
    let addrlen = u32::from_be_bytes(buf[24..28].try_into().unwrap());
    if addrlen as usize > ADDR_SIZE {
        return Err(Error::Protocol("initial message address overruns its field"));
    }
    let mut addr = [0u8; ADDR_SIZE];
    addr.copy_from_slice(&buf[28..]);
    Ok(InitialMsg {
        nonce,
        nsources,
        id,
        addr,
        addrlen,
    })
}

pub fn encode_ack(msg: &AckMsg, out: &mut [u8; ACK_MSG_SIZE]) {
    out[..4].copy_from_slice(&msg.addrlen.to_be_bytes());
    out[4..].copy_from_slice(&msg.addr);
}

pub fn decode_ack(buf: &[u8]) -> Result<AckMsg> {
    if buf.len() != ACK_MSG_SIZE {
        return Err(Error::Protocol("ack message has the wrong size"));
    }
    let addrlen = u32::from_be_bytes(buf[..4].try_into().unwrap());
    if addrlen as usize > ADDR_SIZE {
        return Err(Error::Protocol("ack message address overruns its field"));
    }
    let mut addr = [0u8; ADDR_SIZE];
    addr.copy_from_slice(&buf[4..]);
    Ok(AckMsg { addr, addrlen })
}

/// Encode a vector message; returns the encoded length.
///
/// # Panics
/// When more than [`VECTOR_IOV_MAX`] triples are given.
pub fn encode_vector(iovs: &[RmaIoVec], out: &mut [u8; VECTOR_MSG_MAX_SIZE]) -> usize {
    assert!(iovs.len() <= VECTOR_IOV_MAX, "vector message overflow");
    out[..4].copy_from_slice(&(iovs.len() as u32).to_be_bytes());
    let mut off = VECTOR_HDR_SIZE;
    for iov in iovs {
        out[off..off + 8].copy_from_slice(&iov.addr.to_be_bytes());
        out[off + 8..off + 16].copy_from_slice(&iov.len.to_be_bytes());
        out[off + 16..off + 24].copy_from_slice(&iov.key.to_be_bytes());
        off += VECTOR_IOV_SIZE;
    }
    off
}

pub fn decode_vector(buf: &[u8]) -> Result<VectorMsg> {
    if buf.len() < VECTOR_HDR_SIZE {
        return Err(Error::Protocol("vector message shorter than its header"));
    }
    if (buf.len() - VECTOR_HDR_SIZE) % VECTOR_IOV_SIZE != 0 {
        return Err(Error::Protocol(
            "vector message does not end on a triple boundary",
        ));
    }
    let niovs = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
    let space = (buf.len() - VECTOR_HDR_SIZE) / VECTOR_IOV_SIZE;
    if niovs > VECTOR_IOV_MAX {
        return Err(Error::Protocol("vector message cites too many triples"));
    }
    if space < niovs {
        return Err(Error::Protocol("vector message truncates its triples"));
    }
    let mut iovs = Vec::with_capacity(niovs);
    for i in 0..niovs {
        let off = VECTOR_HDR_SIZE + i * VECTOR_IOV_SIZE;
        iovs.push(RmaIoVec {
            addr: u64::from_be_bytes(buf[off..off + 8].try_into().unwrap()),
            len: u64::from_be_bytes(buf[off + 8..off + 16].try_into().unwrap()),
            key: u64::from_be_bytes(buf[off + 16..off + 24].try_into().unwrap()),
        });
    }
    Ok(VectorMsg { iovs })
}

pub fn encode_progress(msg: &ProgressMsg, out: &mut [u8; PROGRESS_MSG_SIZE]) {
    out[..8].copy_from_slice(&msg.nfilled.to_be_bytes());
    out[8..].copy_from_slice(&msg.nleftover.to_be_bytes());
}

pub fn decode_progress(buf: &[u8]) -> Result<ProgressMsg> {
    if buf.len() != PROGRESS_MSG_SIZE {
        return Err(Error::Protocol("progress message has the wrong size"));
    }
    Ok(ProgressMsg {
        nfilled: u64::from_be_bytes(buf[..8].try_into().unwrap()),
        nleftover: u64::from_be_bytes(buf[8..].try_into().unwrap()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_roundtrip() {
        let msg = InitialMsg::new(&[4, 0x10, 0x92, 127, 0, 0, 1]);
        let mut buf = [0u8; INITIAL_MSG_SIZE];
        encode_initial(&msg, &mut buf);
        let back = decode_initial(&buf).unwrap();
        assert_eq!(back.nsources, 1);
        assert_eq!(back.id, 0);
        assert_eq!(back.addrlen, 7);
        assert_eq!(back.addr[..7], msg.addr[..7]);
        assert_eq!(back.nonce, [0u8; NONCE_SIZE]);
    }

    #[test]
    fn test_ack_roundtrip() {
        let msg = AckMsg::new(&[4, 0x20, 0x00, 10, 0, 0, 9]);
        let mut buf = [0u8; ACK_MSG_SIZE];
        encode_ack(&msg, &mut buf);
        let back = decode_ack(&buf).unwrap();
        assert_eq!(back.addrlen, 7);
        assert_eq!(back.addr[..7], msg.addr[..7]);
    }

    #[test]
    fn test_wrong_handshake_sizes_rejected() {
        assert!(decode_initial(&[0u8; INITIAL_MSG_SIZE - 1]).is_err());
        assert!(decode_ack(&[0u8; ACK_MSG_SIZE + 1]).is_err());
    }

    #[test]
    fn test_vector_roundtrip() {
        let iovs: Vec<RmaIoVec> = (0..12)
            .map(|i| RmaIoVec {
                addr: i,
                len: 23 + i,
                key: 0x1000 + i,
            })
            .collect();
        let mut buf = [0u8; VECTOR_MSG_MAX_SIZE];
        let used = encode_vector(&iovs, &mut buf);
        assert_eq!(used, VECTOR_MSG_MAX_SIZE);

        // a full 12-triple message is accepted
        let back = decode_vector(&buf[..used]).unwrap();
        assert_eq!(back.iovs, iovs);
    }

    #[test]
    fn test_vector_eof_is_empty() {
        let mut buf = [0u8; VECTOR_MSG_MAX_SIZE];
        let used = encode_vector(&[], &mut buf);
        assert_eq!(used, VECTOR_HDR_SIZE);
        let back = decode_vector(&buf[..used]).unwrap();
        assert!(back.iovs.is_empty());
    }

    #[test]
    fn test_vector_malformed_rejected() {
        // 13 announced triples, 13 carried: too many
        let mut buf = vec![0u8; VECTOR_HDR_SIZE + 13 * VECTOR_IOV_SIZE];
        buf[..4].copy_from_slice(&13u32.to_be_bytes());
        assert!(decode_vector(&buf).is_err());

        // trailing bytes not a whole number of triples
        let mut buf = vec![0u8; VECTOR_HDR_SIZE + VECTOR_IOV_SIZE + 3];
        buf[..4].copy_from_slice(&1u32.to_be_bytes());
        assert!(decode_vector(&buf).is_err());

        // shorter than the header
        assert!(decode_vector(&[0u8; 3]).is_err());

        // announces more triples than it carries
        let mut buf = vec![0u8; VECTOR_HDR_SIZE + VECTOR_IOV_SIZE];
        buf[..4].copy_from_slice(&2u32.to_be_bytes());
        assert!(decode_vector(&buf).is_err());
    }

    #[test]
    fn test_progress_roundtrip() {
        let msg = ProgressMsg {
            nfilled: 780_000,
            nleftover: 1,
        };
        let mut buf = [0u8; PROGRESS_MSG_SIZE];
        encode_progress(&msg, &mut buf);
        let back = decode_progress(&buf).unwrap();
        assert_eq!(back.nfilled, 780_000);
        assert_eq!(back.nleftover, 1);
    }

    #[test]
    fn test_progress_wrong_size_rejected() {
        assert!(decode_progress(&[0u8; 15]).is_err());
        assert!(decode_progress(&[0u8; 17]).is_err());
        assert!(decode_progress(&[]).is_err());
    }
}
