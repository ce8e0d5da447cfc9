//! Datagram framing for the emulated provider.
//!
//! One datagram carries one frame:
//! - `Msg`: a two-sided message payload, matched against posted receives.
//! - `Write`: a whole scatter/gather RMA write — every remote segment with
//!   its placement bytes — plus an operation id for acknowledgement.
//! - `WriteAck`: delivery acknowledgement; status 0 means placed, otherwise
//!   an OS errno from the target.
//!
//! Framing integers are little-endian and internal to the provider; they
//! never appear on any application-visible surface.

const TYPE_MSG: u8 = 1;
const TYPE_WRITE: u8 = 2;
const TYPE_WRITE_ACK: u8 = 3;

/// Per-segment header: key (8) + offset (8) + length (4).
const SEG_HDR_SIZE: usize = 20;

/// One placement segment of an RMA write.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WriteSeg<'a> {
    pub key: u64,
    pub addr: u64,
    pub data: &'a [u8],
}

/// A decoded frame, borrowing from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame<'a> {
    Msg(&'a [u8]),
    Write { op: u64, segs: Vec<WriteSeg<'a>> },
    WriteAck { op: u64, status: i32 },
}

pub(crate) fn encode_msg(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(TYPE_MSG);
    out.extend_from_slice(payload);
    out
}

pub(crate) fn encode_write(op: u64, segs: &[(u64, u64, &[u8])]) -> Vec<u8> {
    let body: usize = segs.iter().map(|(_, _, d)| SEG_HDR_SIZE + d.len()).sum();
    let mut out = Vec::with_capacity(11 + body);
    out.push(TYPE_WRITE);
    out.extend_from_slice(&op.to_le_bytes());
    out.extend_from_slice(&(segs.len() as u16).to_le_bytes());
    for (key, addr, data) in segs {
        out.extend_from_slice(&key.to_le_bytes());
        out.extend_from_slice(&addr.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }
    out
}

pub(crate) fn encode_write_ack(op: u64, status: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(TYPE_WRITE_ACK);
    out.extend_from_slice(&op.to_le_bytes());
    out.extend_from_slice(&status.to_le_bytes());
    out
}

pub(crate) fn decode(buf: &[u8]) -> Option<Frame<'_>> {
    let (&ty, rest) = buf.split_first()?;
    match ty {
        TYPE_MSG => Some(Frame::Msg(rest)),
        TYPE_WRITE => {
            if rest.len() < 10 {
                return None;
            }
            let op = u64::from_le_bytes(rest[..8].try_into().unwrap());
            let nsegs = u16::from_le_bytes(rest[8..10].try_into().unwrap()) as usize;
            let mut segs = Vec::with_capacity(nsegs);
            let mut cur = &rest[10..];
            for _ in 0..nsegs {
                if cur.len() < SEG_HDR_SIZE {
                    return None;
                }
                let key = u64::from_le_bytes(cur[..8].try_into().unwrap());
                let addr = u64::from_le_bytes(cur[8..16].try_into().unwrap());
                let len = u32::from_le_bytes(cur[16..20].try_into().unwrap()) as usize;
                cur = &cur[SEG_HDR_SIZE..];
                if cur.len() < len {
                    return None;
                }
                segs.push(WriteSeg {
                    key,
                    addr,
                    data: &cur[..len],
                });
                cur = &cur[len..];
            }
            Some(Frame::Write { op, segs })
        }
        TYPE_WRITE_ACK => {
            if rest.len() < 12 {
                return None;
            }
            let op = u64::from_le_bytes(rest[..8].try_into().unwrap());
            let status = i32::from_le_bytes(rest[8..12].try_into().unwrap());
            Some(Frame::WriteAck { op, status })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_roundtrip() {
        let frame = encode_msg(b"hello");
        assert_eq!(decode(&frame), Some(Frame::Msg(b"hello")));
    }

    #[test]
    fn test_write_roundtrip() {
        let frame = encode_write(42, &[(7, 0, b"abc"), (9, 16, b"defgh")]);
        match decode(&frame) {
            Some(Frame::Write { op, segs }) => {
                assert_eq!(op, 42);
                assert_eq!(segs.len(), 2);
                assert_eq!(segs[0], WriteSeg { key: 7, addr: 0, data: b"abc" });
                assert_eq!(segs[1], WriteSeg { key: 9, addr: 16, data: b"defgh" });
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_ack_roundtrip() {
        let frame = encode_write_ack(3, nix::libc::EINVAL);
        assert_eq!(
            decode(&frame),
            Some(Frame::WriteAck {
                op: 3,
                status: nix::libc::EINVAL
            })
        );
    }

    #[test]
    fn test_truncated_frames_rejected() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(&[TYPE_WRITE, 0, 0]), None);
        let mut frame = encode_write(1, &[(7, 0, b"abcdef")]);
        frame.truncate(frame.len() - 3);
        assert_eq!(decode(&frame), None);
        assert_eq!(decode(&[TYPE_WRITE_ACK, 1, 2, 3]), None);
        assert_eq!(decode(&[0xff, 1, 2]), None);
    }
}
