//! Reliable-datagram endpoints.
//!
//! An endpoint owns one UDP socket. Peers are cited by [`FiAddr`] through
//! the bound address vector. Posted receives match incoming messages in
//! post order; scatter/gather RMA writes travel as a single datagram and
//! complete once the target acknowledges placement, which realizes
//! delivery-complete semantics.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::av::{encode_name, AddressVector, FiAddr};
use crate::cq::{CompletionQueue, CqEvent, CqInner};
use crate::cq::{Completion, CompletionError};
use crate::domain::Domain;
use crate::eq::EventQueue;
use crate::info::FabricInfo;
use crate::mr::MrDesc;
use crate::wire;
use crate::Flags;

/// One local scatter/gather segment: base address and length.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoVec {
    pub addr: u64,
    pub len: usize,
}

/// One remote RMA segment: zero-based offset into the region `key`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmaIoVec {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

/// Arguments for a message send or receive.
pub struct MsgDesc<'a> {
    pub iov: &'a [IoVec],
    pub desc: &'a [MrDesc],
    pub addr: FiAddr,
    pub context: u64,
}

/// Arguments for a scatter/gather RMA write.
pub struct RmaMsgDesc<'a> {
    pub iov: &'a [IoVec],
    pub desc: &'a [MrDesc],
    pub addr: FiAddr,
    pub rma_iov: &'a [RmaIoVec],
    pub context: u64,
}

struct PostedRecv {
    segs: Vec<(u64, usize)>,
    context: u64,
    completion: bool,
}

struct PendingWrite {
    context: u64,
    len: usize,
    completion: bool,
}

struct EpState {
    posted: VecDeque<PostedRecv>,
    writes: HashMap<u64, PendingWrite>,
    next_op: u64,
}

pub(crate) struct EpInner {
    sock: UdpSocket,
    domain: Domain,
    cq: OnceLock<(Weak<CqInner>, Flags)>,
    av: OnceLock<AddressVector>,
    eq_bound: AtomicBool,
    enabled: AtomicBool,
    closed: AtomicBool,
    state: Mutex<EpState>,
    /// Serializes reception; also the scratch datagram buffer.
    rbuf: Mutex<Box<[u8]>>,
}

/// A reliable-datagram endpoint. Cheaply cloneable.
#[derive(Clone)]
pub struct Endpoint(Arc<EpInner>);

impl Endpoint {
    /// Create an endpoint.
    ///
    /// Binds `info.src_addr` when present; otherwise picks an ephemeral
    /// port on the interface that routes to `info.dest_addr` (loopback when
    /// neither is given), so the name reported by [`Endpoint::getname`] is
    /// reachable from the peer.
    pub fn new(domain: &Domain, info: &FabricInfo) -> io::Result<Self> {
        let bind_addr = match (info.src_addr, info.dest_addr) {
            (Some(src), _) => src,
            (None, Some(dest)) => {
                let probe = UdpSocket::bind((unspecified_of(dest), 0))?;
                probe.connect(dest)?;
                SocketAddr::new(probe.local_addr()?.ip(), 0)
            }
            (None, None) => "127.0.0.1:0".parse().unwrap(),
        };

        let sock = UdpSocket::bind(bind_addr)?;
        sock.set_nonblocking(true)?;

        Ok(Self(Arc::new(EpInner {
            sock,
            domain: domain.clone(),
            cq: OnceLock::new(),
            av: OnceLock::new(),
            eq_bound: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: Mutex::new(EpState {
                posted: VecDeque::new(),
                writes: HashMap::new(),
                next_op: 0,
            }),
            rbuf: Mutex::new(vec![0u8; 65536].into_boxed_slice()),
        })))
    }

    /// Bind the completion queue that reports this endpoint's operations.
    pub fn bind_cq(&self, cq: &CompletionQueue, flags: Flags) -> io::Result<()> {
        self.0
            .cq
            .set((Arc::downgrade(&cq.0), flags))
            .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "completion queue bound"))?;
        cq.register(Arc::downgrade(&self.0));
        Ok(())
    }

    /// Bind the event queue. Required before [`Endpoint::enable`].
    pub fn bind_eq(&self, _eq: &EventQueue) -> io::Result<()> {
        self.0.eq_bound.store(true, Ordering::Release);
        Ok(())
    }

    /// Bind the address vector used to resolve peers.
    pub fn bind_av(&self, av: &AddressVector) -> io::Result<()> {
        self.0
            .av
            .set(av.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "address vector bound"))
    }

    /// Transition the endpoint to the enabled state.
    pub fn enable(&self) -> io::Result<()> {
        if self.0.cq.get().is_none()
            || self.0.av.get().is_none()
            || !self.0.eq_bound.load(Ordering::Acquire)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "endpoint requires event queue, completion queue, and address vector bindings",
            ));
        }
        self.0.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Opaque name of this endpoint, insertable into a peer's address
    /// vector.
    pub fn getname(&self) -> io::Result<Vec<u8>> {
        Ok(encode_name(self.0.sock.local_addr()?))
    }

    /// Post a receive.
    ///
    /// # Safety
    /// Every segment in `msg.iov` must stay valid and untouched by the
    /// application until the operation completes or is cancelled.
    pub unsafe fn recvmsg(&self, msg: &MsgDesc<'_>, flags: Flags) -> io::Result<()> {
        self.0.check_usable()?;
        let mut st = self.0.state.lock().unwrap();
        st.posted.push_back(PostedRecv {
            segs: msg.iov.iter().map(|v| (v.addr, v.len)).collect(),
            context: msg.context,
            completion: self.0.completion_wanted(flags),
        });
        Ok(())
    }

    /// Send a message to `msg.addr`.
    ///
    /// Returns [`io::ErrorKind::WouldBlock`] when the socket cannot accept
    /// the datagram right now; the caller retries on a later pass.
    ///
    /// # Safety
    /// Every segment in `msg.iov` must be valid for reads.
    pub unsafe fn sendmsg(&self, msg: &MsgDesc<'_>, flags: Flags) -> io::Result<()> {
        self.0.check_usable()?;
        let peer = self.0.resolve(msg.addr)?;

        let payload = gather(msg.iov);
        let frame = wire::encode_msg(&payload);
        self.0.sock.send_to(&frame, peer).map_err(map_send_err)?;

        if self.0.completion_wanted(flags) {
            self.0.complete(CqEvent::Data(Completion {
                context: msg.context,
                flags: Flags::SEND | Flags::MSG,
                len: payload.len(),
            }));
        }
        Ok(())
    }

    /// Post a scatter/gather RMA write to `msg.addr`.
    ///
    /// The local segments are placed into the remote segments in order; the
    /// local total must fit the remote total. With `COMPLETION |
    /// DELIVERY_COMPLETE` a single completion is reported on `msg.context`
    /// once the target acknowledges placement.
    ///
    /// # Safety
    /// Every segment in `msg.iov` must be valid for reads until the write
    /// completes or is cancelled.
    pub unsafe fn writemsg(&self, msg: &RmaMsgDesc<'_>, flags: Flags) -> io::Result<()> {
        self.0.check_usable()?;
        let peer = self.0.resolve(msg.addr)?;

        let stream = gather(msg.iov);
        let remote_cap: u64 = msg.rma_iov.iter().map(|r| r.len).sum();
        if (stream.len() as u64) > remote_cap {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "local segments exceed remote segment capacity",
            ));
        }

        let mut segs: Vec<(u64, u64, &[u8])> = Vec::with_capacity(msg.rma_iov.len());
        let mut off = 0usize;
        for riov in msg.rma_iov {
            if off == stream.len() {
                break;
            }
            let take = (riov.len as usize).min(stream.len() - off);
            segs.push((riov.key, riov.addr, &stream[off..off + take]));
            off += take;
        }

        let op = {
            let mut st = self.0.state.lock().unwrap();
            let op = st.next_op;
            st.next_op += 1;
            st.writes.insert(
                op,
                PendingWrite {
                    context: msg.context,
                    len: stream.len(),
                    completion: self.0.completion_wanted(flags),
                },
            );
            op
        };

        let frame = wire::encode_write(op, &segs);
        if let Err(e) = self.0.sock.send_to(&frame, peer) {
            self.0.state.lock().unwrap().writes.remove(&op);
            return Err(map_send_err(e));
        }
        Ok(())
    }

    /// Cancel the pending operation posted with `context`, if any.
    ///
    /// A cancelled operation reports an `ECANCELED` error entry on the
    /// bound completion queue.
    pub fn cancel(&self, context: u64) -> io::Result<()> {
        let mut st = self.0.state.lock().unwrap();

        if let Some(pos) = st.posted.iter().position(|p| p.context == context) {
            st.posted.remove(pos);
            drop(st);
            self.0.complete(CqEvent::Err(CompletionError {
                context,
                errno: nix::libc::ECANCELED,
            }));
            return Ok(());
        }

        if let Some(&op) = st
            .writes
            .iter()
            .find(|(_, w)| w.context == context)
            .map(|(op, _)| op)
        {
            st.writes.remove(&op);
            drop(st);
            self.0.complete(CqEvent::Err(CompletionError {
                context,
                errno: nix::libc::ECANCELED,
            }));
        }
        Ok(())
    }

    /// Close the endpoint. Outstanding posted receives are discarded.
    pub fn close(&self) -> io::Result<()> {
        self.0.closed.store(true, Ordering::Release);
        let mut st = self.0.state.lock().unwrap();
        st.posted.clear();
        st.writes.clear();
        Ok(())
    }
}

impl EpInner {
    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }

    fn check_usable(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"));
        }
        if !self.enabled.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "endpoint not enabled"));
        }
        Ok(())
    }

    fn completion_wanted(&self, op_flags: Flags) -> bool {
        match self.cq.get() {
            Some((_, bind_flags)) if bind_flags.contains(Flags::SELECTIVE_COMPLETION) => {
                op_flags.contains(Flags::COMPLETION)
            }
            _ => true,
        }
    }

    fn resolve(&self, addr: FiAddr) -> io::Result<SocketAddr> {
        self.av
            .get()
            .and_then(|av| av.lookup(addr))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "peer address not in vector")
            })
    }

    fn complete(&self, ev: CqEvent) {
        if let Some((cq, _)) = self.cq.get() {
            if let Some(cq) = cq.upgrade() {
                cq.push(ev);
            }
        }
    }

    /// Receive and dispatch every datagram currently queued on the socket.
    pub(crate) fn progress(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) || !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut buf = self.rbuf.lock().unwrap();
        loop {
            match self.sock.recv_from(&mut buf) {
                Ok((n, src)) => self.dispatch(&buf[..n], src),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&self, datagram: &[u8], src: SocketAddr) {
        match wire::decode(datagram) {
            Some(wire::Frame::Msg(payload)) => self.deliver_msg(payload),
            Some(wire::Frame::Write { op, segs }) => {
                let mut status = 0;
                for seg in &segs {
                    status = self.domain.0.apply_write(seg.key, seg.addr, seg.data);
                    if status != 0 {
                        break;
                    }
                }
                let ack = wire::encode_write_ack(op, status);
                let _ = self.sock.send_to(&ack, src);
            }
            Some(wire::Frame::WriteAck { op, status }) => {
                let pending = self.state.lock().unwrap().writes.remove(&op);
                if let Some(w) = pending {
                    if status != 0 {
                        self.complete(CqEvent::Err(CompletionError {
                            context: w.context,
                            errno: status,
                        }));
                    } else if w.completion {
                        self.complete(CqEvent::Data(Completion {
                            context: w.context,
                            flags: Flags::RMA | Flags::WRITE,
                            len: w.len,
                        }));
                    }
                }
            }
            None => {} // garbage datagram, drop
        }
    }

    fn deliver_msg(&self, payload: &[u8]) {
        let recv = self.state.lock().unwrap().posted.pop_front();
        let Some(recv) = recv else {
            return; // no posted receive: datagram semantics, the message is lost
        };

        let mut copied = 0usize;
        for &(addr, len) in &recv.segs {
            if copied == payload.len() {
                break;
            }
            let take = len.min(payload.len() - copied);
            // Safety: the poster guaranteed the segment valid and untouched
            // until this operation completes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload[copied..].as_ptr(),
                    addr as *mut u8,
                    take,
                );
            }
            copied += take;
        }

        if recv.completion {
            self.complete(CqEvent::Data(Completion {
                context: recv.context,
                flags: Flags::RECV | Flags::MSG,
                len: copied,
            }));
        }
    }
}

/// Transient send-side exhaustion reads as "try again on a later pass".
fn map_send_err(e: io::Error) -> io::Error {
    if e.raw_os_error() == Some(nix::libc::ENOBUFS) {
        return io::Error::new(io::ErrorKind::WouldBlock, e);
    }
    e
}

fn unspecified_of(addr: SocketAddr) -> std::net::IpAddr {
    if addr.is_ipv4() {
        std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
    } else {
        std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
    }
}

/// Concatenate the bytes named by an I/O vector.
///
/// # Safety
/// Every segment must be valid for reads.
unsafe fn gather(iov: &[IoVec]) -> Vec<u8> {
    let total: usize = iov.iter().map(|v| v.len).sum();
    let mut out = Vec::with_capacity(total);
    for v in iov {
        out.extend_from_slice(std::slice::from_raw_parts(v.addr as *const u8, v.len));
    }
    out
}
