//! Communication buffers.
//!
//! Every buffer starts with a common header: capacity, used length, a
//! remote-address slot, the optional memory registration, and the transfer
//! context the fabric hands back with each completion. The context id is
//! process-unique and doubles as the fabric operation context, so a
//! completion can always be matched against the FIFO of posted buffers.
//!
//! Four families share the header:
//! - byte buffers carry variable-length payload,
//! - progress buffers carry exactly one progress message,
//! - vector buffers carry one vector message,
//! - fragments are zero-length placeholders referring to a parent byte
//!   buffer by context id, used when one payload buffer is written as
//!   several RDMA segments.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use fabric::{MemoryRegion, MrDesc};

use crate::message::{PROGRESS_MSG_SIZE, VECTOR_MSG_MAX_SIZE};

/// Payload capacities the replenisher cycles through. The odd sizes force
/// interior fragmentation and multi-segment writes.
pub const PAYLOAD_SIZE_CYCLE: [usize; 4] = [23, 29, 31, 37];

/// The capacity following `prev` in the payload size cycle.
pub fn next_payload_len(prev: usize) -> usize {
    match prev {
        23 => 29,
        29 => 31,
        31 => 37,
        _ => 23,
    }
}

/// What a posted buffer is in flight for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferType {
    Progress,
    RdmaWrite,
    Vector,
    Fragment,
}

/// Who currently owns the buffer; completions hand ownership back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Program,
    Nic,
}

bitflags! {
    /// Batch-boundary marks within a multi-buffer RDMA write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Place: u8 {
        const FIRST = 0x1;
        const LAST = 0x2;
    }
}

static NEXT_CTX_ID: AtomicU64 = AtomicU64::new(1);

/// Context the fabric echoes back with a completion.
#[derive(Debug)]
pub struct XferContext {
    /// Process-unique id; also the fabric operation context.
    pub ctx_id: u64,
    pub xtype: XferType,
    pub owner: Owner,
    pub place: Place,
    /// Outstanding fragments referring to this buffer.
    pub nchildren: u8,
    pub cancelled: bool,
}

impl XferContext {
    fn new(xtype: XferType) -> Self {
        Self {
            ctx_id: NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed),
            xtype,
            owner: Owner::Program,
            place: Place::empty(),
            nchildren: 0,
            cancelled: false,
        }
    }
}

/// Common buffer header.
#[derive(Debug)]
pub struct BufHdr {
    /// Remote address bookkeeping; fragments record their parent offset.
    pub raddr: u64,
    pub nused: usize,
    pub nallocated: usize,
    pub mr: Option<MemoryRegion>,
    pub desc: MrDesc,
    pub xfc: XferContext,
}

impl BufHdr {
    fn new(xtype: XferType, nallocated: usize) -> Self {
        Self {
            raddr: 0,
            nused: 0,
            nallocated,
            mr: None,
            desc: MrDesc::default(),
            xfc: XferContext::new(xtype),
        }
    }
}

/// Variable-length payload buffer.
#[derive(Debug)]
pub struct ByteBuf {
    pub hdr: BufHdr,
    payload: Box<[u8]>,
}

impl ByteBuf {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }
}

/// Buffer carrying exactly one progress message.
#[derive(Debug)]
pub struct ProgBuf {
    pub hdr: BufHdr,
    msg: [u8; PROGRESS_MSG_SIZE],
}

impl ProgBuf {
    pub fn msg(&self) -> &[u8; PROGRESS_MSG_SIZE] {
        &self.msg
    }

    pub fn msg_mut(&mut self) -> &mut [u8; PROGRESS_MSG_SIZE] {
        &mut self.msg
    }
}

/// Buffer carrying one vector message.
#[derive(Debug)]
pub struct VecBuf {
    pub hdr: BufHdr,
    msg: [u8; VECTOR_MSG_MAX_SIZE],
}

impl VecBuf {
    pub fn msg(&self) -> &[u8; VECTOR_MSG_MAX_SIZE] {
        &self.msg
    }

    pub fn msg_mut(&mut self) -> &mut [u8; VECTOR_MSG_MAX_SIZE] {
        &mut self.msg
    }
}

/// Zero-length placeholder referring to a parent byte buffer.
#[derive(Debug)]
pub struct Fragment {
    pub hdr: BufHdr,
    /// Context id of the parent byte buffer; never an owning reference.
    pub parent_ctx: u64,
}

/// Any communication buffer. Boxed so its memory never moves while the
/// fabric may still write into it.
#[derive(Debug)]
pub enum Buf {
    Bytes(ByteBuf),
    Prog(ProgBuf),
    Vec(VecBuf),
    Frag(Fragment),
}

impl Buf {
    /// Allocate a payload buffer of the given capacity.
    pub fn alloc_bytes(paylen: usize) -> Box<Buf> {
        Box::new(Buf::Bytes(ByteBuf {
            hdr: BufHdr::new(XferType::RdmaWrite, paylen),
            payload: vec![0u8; paylen].into_boxed_slice(),
        }))
    }

    /// Allocate a progress-message buffer.
    pub fn alloc_prog() -> Box<Buf> {
        Box::new(Buf::Prog(ProgBuf {
            hdr: BufHdr::new(XferType::Progress, PROGRESS_MSG_SIZE),
            msg: [0u8; PROGRESS_MSG_SIZE],
        }))
    }

    /// Allocate a vector-message buffer.
    pub fn alloc_vec() -> Box<Buf> {
        Box::new(Buf::Vec(VecBuf {
            hdr: BufHdr::new(XferType::Vector, VECTOR_MSG_MAX_SIZE),
            msg: [0u8; VECTOR_MSG_MAX_SIZE],
        }))
    }

    /// Allocate a fragment placeholder. Fragments carry no payload, so
    /// their capacity is zero.
    pub fn alloc_frag() -> Box<Buf> {
        Box::new(Buf::Frag(Fragment {
            hdr: BufHdr::new(XferType::Fragment, 0),
            parent_ctx: 0,
        }))
    }

    pub fn hdr(&self) -> &BufHdr {
        match self {
            Buf::Bytes(b) => &b.hdr,
            Buf::Prog(b) => &b.hdr,
            Buf::Vec(b) => &b.hdr,
            Buf::Frag(b) => &b.hdr,
        }
    }

    pub fn hdr_mut(&mut self) -> &mut BufHdr {
        match self {
            Buf::Bytes(b) => &mut b.hdr,
            Buf::Prog(b) => &mut b.hdr,
            Buf::Vec(b) => &mut b.hdr,
            Buf::Frag(b) => &mut b.hdr,
        }
    }

    pub fn ctx_id(&self) -> u64 {
        self.hdr().xfc.ctx_id
    }

    /// Base address of the buffer's data area, for posting to the fabric.
    ///
    /// # Panics
    /// On fragments, which carry no data of their own.
    pub fn data_base(&self) -> u64 {
        match self {
            Buf::Bytes(b) => b.payload.as_ptr() as u64,
            Buf::Prog(b) => b.msg.as_ptr() as u64,
            Buf::Vec(b) => b.msg.as_ptr() as u64,
            Buf::Frag(_) => panic!("fragment carries no data"),
        }
    }

    pub fn as_bytes(&self) -> Option<&ByteBuf> {
        match self {
            Buf::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bytes_mut(&mut self) -> Option<&mut ByteBuf> {
        match self {
            Buf::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_vec(&self) -> Option<&VecBuf> {
        match self {
            Buf::Vec(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_vec_mut(&mut self) -> Option<&mut VecBuf> {
        match self {
            Buf::Vec(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_prog(&self) -> Option<&ProgBuf> {
        match self {
            Buf::Prog(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_prog_mut(&mut self) -> Option<&mut ProgBuf> {
        match self {
            Buf::Prog(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_frag(&self) -> Option<&Fragment> {
        match self {
            Buf::Frag(b) => Some(b),
            _ => None,
        }
    }
}

/// Stack of unused buffers with a fixed capacity.
pub struct BufList {
    bufs: Vec<Box<Buf>>,
    cap: usize,
}

impl BufList {
    pub fn new(cap: usize) -> Self {
        Self {
            bufs: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn get(&mut self) -> Option<Box<Buf>> {
        self.bufs.pop()
    }

    /// Push a buffer back; hands it back when the list is at capacity.
    pub fn put(&mut self, h: Box<Buf>) -> std::result::Result<(), Box<Buf>> {
        if self.bufs.len() == self.cap {
            return Err(h);
        }
        self.bufs.push(h);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctx_ids_unique() {
        let a = Buf::alloc_bytes(23);
        let b = Buf::alloc_prog();
        let c = Buf::alloc_vec();
        assert_ne!(a.ctx_id(), b.ctx_id());
        assert_ne!(b.ctx_id(), c.ctx_id());
        assert_ne!(a.ctx_id(), 0);
    }

    #[test]
    fn test_capacities() {
        assert_eq!(Buf::alloc_bytes(37).hdr().nallocated, 37);
        assert_eq!(Buf::alloc_prog().hdr().nallocated, PROGRESS_MSG_SIZE);
        assert_eq!(Buf::alloc_vec().hdr().nallocated, VECTOR_MSG_MAX_SIZE);
        assert_eq!(Buf::alloc_frag().hdr().nallocated, 0);
    }

    #[test]
    fn test_payload_cycle() {
        let mut len = 0;
        let seen: Vec<usize> = (0..5)
            .map(|_| {
                len = next_payload_len(len);
                len
            })
            .collect();
        assert_eq!(seen, vec![23, 29, 31, 37, 23]);
    }

    #[test]
    fn test_buflist_capacity() {
        let mut bl = BufList::new(2);
        assert!(bl.put(Buf::alloc_prog()).is_ok());
        assert!(bl.put(Buf::alloc_prog()).is_ok());
        assert!(bl.put(Buf::alloc_prog()).is_err());
        assert!(bl.get().is_some());
        assert!(bl.get().is_some());
        assert!(bl.get().is_none());
    }
}
