//! Transmitter state machine.
//!
//! The transmitter consumes the receiver's vector advertisements, batches
//! payload buffers into scatter/gather RDMA writes against them, and
//! reports placement through progress messages. When a payload buffer is
//! larger than the remote room left in one write and no more remote
//! segments are expected, it is split: fragments referring back to the
//! parent are written independently, and the parent is only released once
//! every fragment has completed.
//!
//! Two parallel sets of I/O-vector staging arrays are selected by a phase
//! bit: while the fabric consumes one set, the next write is prepared in
//! the other, and [`write_fully`] parks the unconsumed remote suffix there.

use std::io;
use std::sync::Arc;

use fabric::{
    Completion, CqEvent, Domain, Endpoint, FiAddr, Flags, IoVec, MemoryRegion, MrDesc, MsgDesc,
    RmaIoVec, RmaMsgDesc,
};
use tracing::{debug, trace};

use crate::buffer::{Buf, BufList, Owner, Place};
use crate::ctl::{fifo_cancel, RxCtl, TxCtl, DESIRED_RX_FLAGS, DESIRED_WR_FLAGS};
use crate::fifo::Fifo;
use crate::message::{
    decode_ack, decode_vector, encode_progress, ProgressMsg, ACK_MSG_SIZE, VECTOR_IOV_MAX,
};
use crate::session::{CxnCore, LoopControl, StepStatus};
use crate::terminal::Terminal;
use crate::worker::{Worker, PAYLOAD_TX_ACCESS};
use crate::Runtime;

const PROGBUF_POOL_SIZE: usize = 16;
const MAXPOSTED: usize = 64;
const CTL_FIFO_DEPTH: usize = 64;

/// A registered handshake-message staging buffer.
pub struct Staged {
    buf: Box<[u8]>,
    pub desc: MrDesc,
    _mr: MemoryRegion,
}

impl Staged {
    /// Register `bytes` for handshake use.
    pub fn new(domain: &Domain, mut bytes: Box<[u8]>, access: Flags, key: u64) -> io::Result<Self> {
        // Safety: the bytes are boxed and owned by the returned value, so
        // they outlive the registration.
        let mr = unsafe { domain.register(bytes.as_mut_ptr(), bytes.len(), access, key)? };
        Ok(Self {
            desc: mr.desc(),
            _mr: mr,
            buf: bytes,
        })
    }

    pub fn base(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Transmitter ("put" personality) connection state.
pub struct Transmitter {
    pub cxn: CxnCore,
    /// Buffers whose RDMA writes are in flight, in issue order.
    wrposted: Fifo,
    /// Bytes written since the last progress message.
    bytes_progress: usize,
    /// Incoming vector stream.
    vec: RxCtl,
    /// Outgoing progress stream.
    progress: TxCtl,
    initial: Staged,
    ack: Staged,
    /// Double-buffered local scatter/gather staging, indexed by `phase`.
    payload_iov: [[IoVec; VECTOR_IOV_MAX]; 2],
    payload_desc: [[MrDesc; VECTOR_IOV_MAX]; 2],
    /// Double-buffered remote RMA segments, indexed by `phase`.
    riov: [[RmaIoVec; VECTOR_IOV_MAX]; 2],
    /// Remote segments currently available.
    nriovs: usize,
    /// Next triple to consume from the vector at the head of `vec.rcvd`.
    next_riov: usize,
    phase: bool,
    frag_pool: BufList,
    /// Offset of the fragmentation cursor into the buffer at the head of
    /// `ready_for_cxn`.
    frag_offset: usize,
    rt: Arc<Runtime>,
}

impl Transmitter {
    /// Build the transmitter state around a bootstrap connection. The
    /// progress-message pool and the fragment pool are filled up front.
    pub fn new(rt: Arc<Runtime>, mut cxn: CxnCore, initial: Staged, ack: Staged) -> Self {
        let mut progress = TxCtl::new(CTL_FIFO_DEPTH, PROGBUF_POOL_SIZE);
        for _ in 0..PROGBUF_POOL_SIZE {
            let mut pb = Buf::alloc_prog();
            let base = pb.data_base() as *mut u8;
            let nalloc = pb.hdr().nallocated;
            // Safety: the message bytes live inside the boxed buffer, which
            // stays allocated for the life of the pool.
            let mr = unsafe {
                rt.domain
                    .register(base, nalloc, Flags::SEND, cxn.keys.next())
            }
            .unwrap_or_else(|e| panic!("progress buffer registration failed: {}", e));
            let hdr = pb.hdr_mut();
            hdr.desc = mr.desc();
            hdr.mr = Some(mr);
            progress.pool.put(pb).ok().expect("progress buffer pool full");
        }

        let mut frag_pool = BufList::new(MAXPOSTED);
        for _ in 0..MAXPOSTED {
            frag_pool.put(Buf::alloc_frag()).ok().expect("fragment pool full");
        }

        Self {
            cxn,
            wrposted: Fifo::new(MAXPOSTED),
            bytes_progress: 0,
            vec: RxCtl::new(CTL_FIFO_DEPTH),
            progress,
            initial,
            ack,
            payload_iov: [[IoVec::default(); VECTOR_IOV_MAX]; 2],
            payload_desc: [[MrDesc::default(); VECTOR_IOV_MAX]; 2],
            riov: [[RmaIoVec::default(); VECTOR_IOV_MAX]; 2],
            nriovs: 0,
            next_riov: 0,
            phase: false,
            frag_pool,
            frag_offset: 0,
            rt,
        }
    }

    /// One pass of the transmitter loop.
    pub fn step(
        &mut self,
        worker: &Worker,
        terminal: &mut Terminal,
        ready_for_cxn: &mut Fifo,
        ready_for_terminal: &mut Fifo,
    ) -> LoopControl {
        if !self.cxn.started {
            return self.start(worker, ready_for_terminal);
        }

        if self.cq_process(ready_for_cxn, ready_for_terminal) == StepStatus::Error {
            return self.fail();
        }

        if self.cxn.cancelled {
            if self.progress.posted.is_empty()
                && self.vec.posted.is_empty()
                && self.wrposted.is_empty()
            {
                return self.fail();
            }
            return LoopControl::Continue;
        } else if self.rt.cancel.is_set() {
            self.progress.cancel(&self.cxn.ep);
            self.vec.cancel(&self.cxn.ep);
            fifo_cancel(&self.cxn.ep, &mut self.wrposted);
            self.cxn.cancelled = true;
            return LoopControl::Continue;
        }

        if self.vecbuf_unload().is_err() {
            return self.fail();
        }

        if terminal.trade(ready_for_terminal, ready_for_cxn) == LoopControl::Error {
            return self.fail();
        }

        if self.targets_write(ready_for_cxn) == LoopControl::Error {
            return self.fail();
        }

        self.progress_update(terminal, ready_for_cxn);

        if let Err(e) = self.progress.transmit(&self.cxn.ep, self.cxn.peer_addr) {
            debug!(target: "txctl", error = %e, "progress transmit failed");
            return self.fail();
        }

        if !(terminal.eof()
            && ready_for_cxn.is_empty()
            && self.wrposted.is_empty()
            && self.bytes_progress == 0
            && self.cxn.eof.local)
        {
            return LoopControl::Continue;
        }

        // Hunt for the remote EOF: an empty vector advertisement.
        while !self.cxn.eof.remote {
            let Some(vb) = self.vec.rcvd.get() else {
                break;
            };
            let nused = vb.hdr().nused;
            let msg = decode_vector(
                &vb.as_vec().expect("vector stream held a non-vector buffer").msg()[..nused],
            )
            .expect("vector validated at receipt");
            if msg.iovs.is_empty() {
                self.cxn.eof.remote = true;
            }
            drop(vb); // registration released with the buffer
        }

        if self.cxn.eof.remote && self.progress.posted.is_empty() {
            let _ = self.cxn.ep.close();
            debug!(target: "close", "transmitter closed");
            return LoopControl::End;
        }

        LoopControl::Continue
    }

    fn fail(&mut self) -> LoopControl {
        let _ = self.cxn.ep.close();
        debug!(target: "close", "transmitter closed");
        LoopControl::Error
    }

    /// First entry: hand empty payload buffers to the source, then run the
    /// handshake — post the ack receive, send the initial message, await
    /// and validate the ack, swap the bootstrap peer address for the one
    /// the ack names, and post the vector Rx pool.
    fn start(&mut self, worker: &Worker, ready_for_terminal: &mut Fifo) -> LoopControl {
        self.cxn.started = true;

        while !ready_for_terminal.is_full() {
            let Some(mut b) = worker.payload_txbuf_get() else {
                panic!("could not get a payload buffer");
            };
            b.hdr_mut().nused = 0;
            ready_for_terminal
                .put(b)
                .ok()
                .expect("could not enqueue tx buffer");
        }

        // Post the receive for the connection acknowledgement.
        let ack_iov = [IoVec {
            addr: self.ack.base(),
            len: self.ack.len(),
        }];
        let ack_desc = [self.ack.desc];
        // Safety: the staging buffer lives in `self` until the completion.
        let rc = unsafe {
            self.cxn.ep.recvmsg(
                &MsgDesc {
                    iov: &ack_iov,
                    desc: &ack_desc,
                    addr: self.cxn.peer_addr,
                    context: 0,
                },
                Flags::COMPLETION,
            )
        };
        if let Err(e) = rc {
            panic!("posting ack receive failed: {}", e);
        }

        // Transmit the initial message. No completion is requested; any
        // completion surfacing while the send retries is a protocol error.
        let init_iov = [IoVec {
            addr: self.initial.base(),
            len: self.initial.len(),
        }];
        let init_desc = [self.initial.desc];
        loop {
            // Safety: the staging buffer lives in `self`.
            let rc = unsafe {
                self.cxn.ep.sendmsg(
                    &MsgDesc {
                        iov: &init_iov,
                        desc: &init_desc,
                        addr: self.cxn.peer_addr,
                        context: 0,
                    },
                    Flags::empty(),
                )
            };
            match rc {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.cxn.cq.read() {
                        Ok(None) => continue,
                        Ok(Some(_)) => {
                            debug!(
                                target: "tx_start",
                                "completion arrived before the initial send went out"
                            );
                            return self.fail();
                        }
                        Err(e) => panic!("completion queue read failed: {}", e),
                    }
                }
                Err(e) => panic!("sending initial message failed: {}", e),
            }
        }

        // Await the ack.
        debug!(target: "tx_start", "awaiting ack message reception");
        let ev = loop {
            match self.cxn.cq.sread(self.rt.handshake_timeout) {
                Ok(Some(ev)) => break ev,
                Ok(None) => {
                    debug!(target: "tx_start", "timed out awaiting the ack");
                    return self.fail();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if self.rt.cancel.is_set() {
                        return self.fail();
                    }
                }
                Err(e) => panic!("completion queue read failed: {}", e),
            }
        };

        let cmpl = match ev {
            CqEvent::Data(c) => c,
            CqEvent::Err(e) => {
                debug!(target: "tx_start", error = %e.strerror(), "ack reception failed");
                return self.fail();
            }
        };
        if !cmpl.flags.contains(DESIRED_RX_FLAGS) {
            debug!(target: "tx_start", flags = ?cmpl.flags, "unexpected ack completion flags");
            return self.fail();
        }
        if cmpl.len != ACK_MSG_SIZE {
            debug!(target: "tx_start", len = cmpl.len, "ack is incorrect size");
            return self.fail();
        }

        let ack = match decode_ack(self.ack.bytes()) {
            Ok(a) => a,
            Err(e) => {
                debug!(target: "tx_start", error = %e, "malformed ack");
                return self.fail();
            }
        };

        // The ack names the peer's session endpoint; replace the bootstrap
        // address with it.
        let old_addr = self.cxn.peer_addr;
        match self.cxn.av.insert(&ack.addr) {
            Ok(addr) => self.cxn.peer_addr = addr,
            Err(e) => {
                debug!(target: "tx_start", error = %e, "ack address rejected");
                return self.fail();
            }
        }
        if let Err(e) = self.cxn.av.remove(old_addr) {
            debug!(target: "tx_start", error = %e, "bootstrap address removal failed");
            return self.fail();
        }

        // Post the whole vector Rx pool.
        while !self.vec.posted.is_full() {
            let mut vb = Buf::alloc_vec();
            let base = vb.data_base() as *mut u8;
            let nalloc = vb.hdr().nallocated;
            // Safety: message bytes live inside the boxed buffer, parked in
            // the posted FIFO until completion.
            let mr = unsafe {
                self.rt
                    .domain
                    .register(base, nalloc, Flags::RECV, self.cxn.keys.next())
            }
            .unwrap_or_else(|e| panic!("vector buffer registration failed: {}", e));
            let hdr = vb.hdr_mut();
            hdr.desc = mr.desc();
            hdr.mr = Some(mr);
            if let Err(e) = self.vec.post(&self.cxn.ep, self.cxn.peer_addr, vb) {
                debug!(target: "err", error = %e, "posting vector receives failed");
                return LoopControl::Error;
            }
        }

        LoopControl::Continue
    }

    /// Drain one completion and dispatch it by the posted queue holding its
    /// context.
    fn cq_process(&mut self, ready_for_cxn: &mut Fifo, ready_for_terminal: &mut Fifo) -> StepStatus {
        let ev = match self.cxn.cq.read() {
            Ok(None) => return StepStatus::NoActivity,
            Ok(Some(ev)) => ev,
            Err(e) => panic!("completion queue read failed: {}", e),
        };

        let cmpl = match ev {
            CqEvent::Data(c) => c,
            CqEvent::Err(e) => {
                if !(e.is_canceled() && self.posted_ctx_cancelled(e.context)) {
                    debug!(
                        target: "err",
                        context = e.context,
                        error = %e.strerror(),
                        "completion failed"
                    );
                    return StepStatus::Error;
                }
                Completion {
                    context: e.context,
                    flags: Flags::empty(),
                    len: 0,
                }
            }
        };

        if self
            .vec
            .posted
            .find_mut(|h| h.ctx_id() == cmpl.context)
            .is_some()
        {
            trace!(target: "completion", "read a vector rx completion");
            self.vector_rx_process(&cmpl)
        } else if self
            .wrposted
            .find_mut(|h| h.ctx_id() == cmpl.context)
            .is_some()
        {
            trace!(target: "completion", "read an RDMA-write completion");
            self.write_process(&cmpl, ready_for_cxn, ready_for_terminal)
        } else if self
            .progress
            .posted
            .find_mut(|h| h.ctx_id() == cmpl.context)
            .is_some()
        {
            trace!(target: "completion", "read a progress tx completion");
            match self.progress.complete(&cmpl) {
                Ok(()) => StepStatus::Activity,
                Err(_) => StepStatus::Error,
            }
        } else {
            debug!(target: "completion", context = cmpl.context, "unexpected transfer context");
            StepStatus::Error
        }
    }

    fn posted_ctx_cancelled(&mut self, context: u64) -> bool {
        for fifo in [
            &mut self.vec.posted,
            &mut self.wrposted,
            &mut self.progress.posted,
        ] {
            if let Some(h) = fifo.find_mut(|h| h.ctx_id() == context) {
                return h.hdr().xfc.cancelled;
            }
        }
        false
    }

    fn vector_rx_process(&mut self, cmpl: &Completion) -> StepStatus {
        let Some(vb) = self.vec.complete(cmpl) else {
            return StepStatus::Error;
        };

        if vb.hdr().xfc.cancelled {
            drop(vb);
            return StepStatus::NoActivity;
        }

        let nused = vb.hdr().nused;
        if decode_vector(
            &vb.as_vec().expect("vector stream held a non-vector buffer").msg()[..nused],
        )
        .is_err()
        {
            debug!(target: "err", "rx'd malformed vector message");
            if let Err(e) = self.vec.post(&self.cxn.ep, self.cxn.peer_addr, vb) {
                debug!(target: "err", error = %e, "vector repost failed");
                return StepStatus::Error;
            }
            return StepStatus::NoActivity;
        }

        self.vec
            .rcvd
            .put(vb)
            .ok()
            .expect("received vectors FIFO was full");
        StepStatus::Activity
    }

    /// An RDMA write (or one of its fragments) completed: hand ownership
    /// back, free leading fragments, and release leading writes whose
    /// fragments have all completed.
    fn write_process(
        &mut self,
        cmpl: &Completion,
        ready_for_cxn: &mut Fifo,
        ready_for_terminal: &mut Fifo,
    ) -> StepStatus {
        if let Some(h) = self.wrposted.find_mut(|h| h.ctx_id() == cmpl.context) {
            h.hdr_mut().xfc.owner = Owner::Program;
        }

        let Some(head) = self.wrposted.peek() else {
            debug!(target: "err", "no RDMA-write completions expected");
            return StepStatus::Error;
        };
        if !head.hdr().xfc.place.contains(Place::FIRST) {
            debug!(target: "err", "expected a batch-first context at the head");
            return StepStatus::Error;
        }

        // Free leading fragments back to the pool, crediting their parents.
        loop {
            let is_leading_frag = self.wrposted.peek().is_some_and(|h| {
                matches!(h, Buf::Frag(_)) && h.hdr().xfc.owner == Owner::Program
            });
            if !is_leading_frag {
                break;
            }
            let h = self.wrposted.get().expect("peeked buffer vanished");
            let parent_ctx = h.as_frag().expect("fragment vanished").parent_ctx;
            Self::parent_nchildren_dec(parent_ctx, ready_for_cxn, &mut self.wrposted);
            self.frag_pool.put(h).ok().expect("fragment pool overflow");
        }

        // Release leading writes whose fragments have all completed.
        loop {
            let releasable = self.wrposted.peek().is_some_and(|h| {
                matches!(h, Buf::Bytes(_))
                    && h.hdr().xfc.owner == Owner::Program
                    && h.hdr().xfc.nchildren == 0
            });
            if !releasable || ready_for_terminal.is_full() {
                break;
            }
            let mut h = self.wrposted.get().expect("peeked buffer vanished");
            if self.rt.reregister {
                let hdr = h.hdr_mut();
                hdr.mr = None;
                hdr.desc = MrDesc::default();
            }
            self.bytes_progress += h.hdr().nused;
            ready_for_terminal
                .put(h)
                .ok()
                .expect("terminal queue overflow");
        }

        StepStatus::Activity
    }

    /// A parent payload buffer sits either at the head of `ready_for_cxn`
    /// (still being fragmented) or behind its fragments in `wrposted`.
    fn parent_nchildren_dec(parent_ctx: u64, ready_for_cxn: &mut Fifo, wrposted: &mut Fifo) {
        let parent = match ready_for_cxn.peek_mut() {
            Some(h) if h.ctx_id() == parent_ctx => Some(h),
            _ => wrposted.find_mut(|h| h.ctx_id() == parent_ctx),
        };
        let parent = parent.expect("fragment outlived its parent");
        let xfc = &mut parent.hdr_mut().xfc;
        assert!(xfc.nchildren > 0, "fragment completed with no children outstanding");
        xfc.nchildren -= 1;
    }

    /// Load remote segments from the vector at the head of `vec.rcvd` into
    /// the current phase's array; an empty vector signals remote EOF.
    fn vecbuf_unload(&mut self) -> crate::Result<()> {
        let Some(head) = self.vec.rcvd.peek() else {
            return Ok(());
        };
        let nused = head.hdr().nused;
        let msg = decode_vector(
            &head.as_vec().expect("vector stream held a non-vector buffer").msg()[..nused],
        )
        .expect("vector validated at receipt");

        if !self.cxn.eof.remote && msg.iovs.is_empty() {
            debug!(target: "protocol", "received remote EOF");
            self.cxn.eof.remote = true;
        }

        let cur = self.phase as usize;
        let mut i = self.next_riov;
        while i < msg.iovs.len() && self.nriovs < VECTOR_IOV_MAX {
            trace!(
                target: "protocol",
                index = i,
                addr = msg.iovs[i].addr,
                len = msg.iovs[i].len,
                key = msg.iovs[i].key,
                "received vector segment"
            );
            self.riov[cur][self.nriovs] = msg.iovs[i];
            self.nriovs += 1;
            i += 1;
        }

        if i == msg.iovs.len() {
            let vb = self.vec.rcvd.get().expect("peeked buffer vanished");
            self.vec.post(&self.cxn.ep, self.cxn.peer_addr, vb)?;
            self.next_riov = 0;
        } else {
            self.next_riov = i;
        }
        Ok(())
    }

    /// Batch payload buffers from the head of `ready_for_cxn` into one
    /// scatter/gather RDMA write against the available remote segments.
    ///
    /// A buffer that does not fit the remaining remote room is deferred
    /// while more remote segments are expected, and split into fragments
    /// otherwise.
    fn targets_write(&mut self, ready_for_cxn: &mut Fifo) -> LoopControl {
        let cur = self.phase as usize;
        let maxriovs = self.rt.rma_maxsegs.min(self.nriovs);
        let maxbytes: usize = self.riov[cur][..maxriovs]
            .iter()
            .map(|r| r.len as usize)
            .sum();

        // With fewer remote segments than the provider allows, more are on
        // the way; prefer waiting over fragmenting.
        let riovs_maxed_out = self.nriovs >= self.rt.rma_maxsegs;

        let mut niovs = 0usize;
        let mut total = 0usize;
        let mut first_ctx: Option<u64> = None;
        let mut last_ctx: Option<u64> = None;

        while niovs < maxriovs && total < maxbytes && !self.wrposted.is_full() {
            let Some((head_ctx, head_nused, nchildren)) = ready_for_cxn
                .peek()
                .map(|h| (h.ctx_id(), h.hdr().nused, h.hdr().xfc.nchildren))
            else {
                break;
            };
            let oversize_load = head_nused - self.frag_offset > maxbytes - total;

            trace!(
                target: "write",
                nchildren,
                offset = self.frag_offset,
                nused = head_nused,
                total,
                maxbytes,
                nriovs = self.nriovs,
                "batching payload buffer"
            );

            if oversize_load && !riovs_maxed_out {
                break;
            }

            let len = if oversize_load {
                maxbytes - total
            } else {
                head_nused - self.frag_offset
            };

            let (parent_base, parent_desc) = {
                let head = ready_for_cxn.peek_mut().expect("peeked buffer vanished");
                if self.frag_offset == 0 {
                    head.hdr_mut().xfc.nchildren = 0;
                    if self.rt.reregister {
                        let base = head.data_base() as *mut u8;
                        let nalloc = head.hdr().nallocated;
                        // Safety: payload bytes live inside the boxed
                        // buffer, which stays queued until the registration
                        // is dropped.
                        let mr = unsafe {
                            self.rt.domain.register(
                                base,
                                nalloc,
                                PAYLOAD_TX_ACCESS,
                                self.cxn.keys.next(),
                            )
                        }
                        .unwrap_or_else(|e| {
                            panic!("payload memory registration failed: {}", e)
                        });
                        let hdr = head.hdr_mut();
                        hdr.desc = mr.desc();
                        hdr.mr = Some(mr);
                    }
                }
                (head.data_base(), head.hdr().desc)
            };

            let h_ctx = if oversize_load {
                debug_assert!(self.frag_offset < head_nused);
                debug_assert!(len < head_nused - self.frag_offset);
                let Some(mut frag) = self.frag_pool.get() else {
                    panic!("out of fragment headers");
                };
                {
                    let fh = frag.hdr_mut();
                    fh.raddr = self.frag_offset as u64;
                    fh.nused = len;
                    fh.nallocated = 0;
                    fh.desc = parent_desc;
                }
                if let Buf::Frag(f) = &mut *frag {
                    f.parent_ctx = head_ctx;
                }
                let head = ready_for_cxn.peek_mut().expect("peeked buffer vanished");
                head.hdr_mut().xfc.nchildren += 1;
                let ctx = frag.ctx_id();
                self.wrposted_stage(frag);
                ctx
            } else {
                let h = ready_for_cxn.get().expect("peeked buffer vanished");
                self.wrposted_stage(h);
                head_ctx
            };

            self.payload_iov[cur][niovs] = IoVec {
                addr: parent_base + self.frag_offset as u64,
                len,
            };
            self.payload_desc[cur][niovs] = parent_desc;

            if first_ctx.is_none() {
                first_ctx = Some(h_ctx);
            }
            last_ctx = Some(h_ctx);

            if oversize_load {
                self.frag_offset += len;
                debug_assert!(self.frag_offset < head_nused);
            } else {
                self.frag_offset = 0;
            }

            niovs += 1;
            total += len;
        }

        let (Some(first), Some(last)) = (first_ctx, last_ctx) else {
            return LoopControl::Continue;
        };

        if let Some(f) = self.wrposted.find_mut(|h| h.ctx_id() == first) {
            let xfc = &mut f.hdr_mut().xfc;
            xfc.owner = Owner::Nic;
            xfc.place = Place::FIRST;
        }
        if let Some(l) = self.wrposted.find_mut(|h| h.ctx_id() == last) {
            l.hdr_mut().xfc.place |= Place::LAST;
        }

        let (iov_lo, iov_hi) = self.payload_iov.split_at_mut(1);
        let (desc_lo, desc_hi) = self.payload_desc.split_at_mut(1);
        let (riov_lo, riov_hi) = self.riov.split_at_mut(1);
        let (iov_in, iov_out, desc_in, desc_out, riov_in, riov_out) = if cur == 0 {
            (
                &iov_lo[0], &mut iov_hi[0], &desc_lo[0], &mut desc_hi[0], &riov_lo[0],
                &mut riov_hi[0],
            )
        } else {
            (
                &iov_hi[0], &mut iov_lo[0], &desc_hi[0], &mut desc_lo[0], &riov_hi[0],
                &mut riov_lo[0],
            )
        };

        let wrote = write_fully(WriteFullyParams {
            ep: &self.cxn.ep,
            iov_in: &iov_in[..niovs],
            desc_in: &desc_in[..niovs],
            iov_out,
            desc_out,
            riov_in: &riov_in[..self.nriovs],
            riov_out,
            len: total,
            maxsegs: maxriovs,
            flags: DESIRED_WR_FLAGS,
            addr: self.cxn.peer_addr,
            context: first,
        });

        let wrote = match wrote {
            Ok(w) => w,
            Err(e) => {
                debug!(target: "err", error = %e, "scatter/gather write failed");
                return LoopControl::Error;
            }
        };

        if wrote.nwritten != total || wrote.niovs_out != 0 {
            debug!(
                target: "err",
                nwritten = wrote.nwritten,
                total,
                niovs_out = wrote.niovs_out,
                "local I/O vectors were partially written"
            );
            return LoopControl::Error;
        }

        self.nriovs = wrote.nriovs_out;
        self.phase = !self.phase;
        LoopControl::Continue
    }

    /// Park a batched buffer in `wrposted` with a cleared batch mark.
    fn wrposted_stage(&mut self, mut h: Box<Buf>) {
        let xfc = &mut h.hdr_mut().xfc;
        xfc.owner = Owner::Program;
        xfc.place = Place::empty();
        self.wrposted.put(h).ok().expect("posted writes overflow");
    }

    /// Emit a progress message when bytes have been placed, or the EOF
    /// report once everything is drained.
    fn progress_update(&mut self, terminal: &Terminal, ready_for_cxn: &Fifo) {
        let reached_eof = terminal.eof()
            && ready_for_cxn.is_empty()
            && self.wrposted.is_empty()
            && !self.cxn.eof.local;

        if self.bytes_progress == 0 && !reached_eof {
            return;
        }
        if self.progress.ready.is_full() {
            return;
        }
        let Some(mut pb) = self.progress.pool.get() else {
            return;
        };

        {
            let hdr = pb.hdr_mut();
            hdr.xfc.owner = Owner::Nic;
            hdr.nused = hdr.nallocated;
        }
        let msg = ProgressMsg {
            nfilled: self.bytes_progress as u64,
            nleftover: if reached_eof { 0 } else { 1 },
        };
        encode_progress(
            &msg,
            pb.as_prog_mut().expect("progress pool held a non-progress buffer").msg_mut(),
        );

        debug!(
            target: "protocol",
            nfilled = msg.nfilled,
            nleftover = msg.nleftover,
            "sending progress message"
        );

        self.bytes_progress = 0;
        self.progress.ready.put(pb).ok().expect("progress ready overflow");

        if reached_eof {
            debug!(target: "protocol", "enqueued local EOF");
            self.cxn.eof.local = true;
        }
    }
}

/// Arguments to [`write_fully`].
pub struct WriteFullyParams<'a> {
    pub ep: &'a Endpoint,
    pub iov_in: &'a [IoVec],
    pub desc_in: &'a [MrDesc],
    pub iov_out: &'a mut [IoVec],
    pub desc_out: &'a mut [MrDesc],
    pub riov_in: &'a [RmaIoVec],
    pub riov_out: &'a mut [RmaIoVec],
    pub len: usize,
    pub maxsegs: usize,
    pub flags: Flags,
    pub addr: FiAddr,
    pub context: u64,
}

/// Result of [`write_fully`].
#[derive(Debug, PartialEq, Eq)]
pub struct WriteFullyOut {
    /// Bytes actually submitted.
    pub nwritten: usize,
    /// Local segments left unconsumed, parked in the out arrays.
    pub niovs_out: usize,
    /// Remote segments left unconsumed, parked in the out arrays.
    pub nriovs_out: usize,
}

/// Submit one scatter/gather RMA write over at most `maxsegs` local and
/// remote segments, clipped to the shorter of the two sides (and `len`).
/// The unconsumed suffix of both vectors is written into the out arrays —
/// the alternate phase's staging — preserving segment identity, with the
/// first partially consumed segment advanced past the written bytes.
pub fn write_fully(p: WriteFullyParams<'_>) -> io::Result<WriteFullyOut> {
    let maxsegs_local = p.maxsegs.min(p.iov_in.len());
    let maxsegs_remote = p.maxsegs.min(p.riov_in.len());

    let sum_local: usize = p.iov_in[..maxsegs_local].iter().map(|v| v.len).sum();
    let sum_remote: usize = p.riov_in[..maxsegs_remote]
        .iter()
        .map(|r| r.len as usize)
        .sum();
    let len = sum_local.min(sum_remote).min(p.len);

    let mut nsegs_local = 0;
    let mut nremaining = len;
    for i in 0..maxsegs_local {
        if nremaining == 0 {
            break;
        }
        p.iov_out[i] = p.iov_in[i];
        p.desc_out[i] = p.desc_in[i];
        if p.iov_in[i].len > nremaining {
            p.iov_out[i].len = nremaining;
            nremaining = 0;
        } else {
            nremaining -= p.iov_in[i].len;
        }
        nsegs_local = i + 1;
    }

    let mut nsegs_remote = 0;
    nremaining = len;
    for i in 0..maxsegs_remote {
        if nremaining == 0 {
            break;
        }
        p.riov_out[i] = p.riov_in[i];
        if p.riov_in[i].len as usize > nremaining {
            p.riov_out[i].len = nremaining as u64;
            nremaining = 0;
        } else {
            nremaining -= p.riov_in[i].len as usize;
        }
        nsegs_remote = i + 1;
    }

    // Safety: the segments point into buffers parked in `wrposted` (or
    // their parents) until the write's completion.
    unsafe {
        p.ep.writemsg(
            &RmaMsgDesc {
                iov: &p.iov_out[..nsegs_local],
                desc: &p.desc_out[..nsegs_local],
                addr: p.addr,
                rma_iov: &p.riov_out[..nsegs_remote],
                context: p.context,
            },
            p.flags,
        )?;
    }

    // Park the unconsumed suffixes in the out arrays for the next phase.
    let mut j = 0;
    nremaining = len;
    for i in 0..p.iov_in.len() {
        if nremaining >= p.iov_in[i].len {
            nremaining -= p.iov_in[i].len;
            continue;
        }
        p.desc_out[j] = p.desc_in[i];
        p.iov_out[j] = p.iov_in[i];
        if nremaining > 0 {
            p.iov_out[j].len -= nremaining;
            p.iov_out[j].addr += nremaining as u64;
            nremaining = 0;
        }
        j += 1;
    }
    let niovs_out = j;

    j = 0;
    nremaining = len;
    for i in 0..p.riov_in.len() {
        if nremaining >= p.riov_in[i].len as usize {
            nremaining -= p.riov_in[i].len as usize;
            continue;
        }
        p.riov_out[j] = p.riov_in[i];
        if nremaining > 0 {
            p.riov_out[j].len -= nremaining as u64;
            p.riov_out[j].addr += nremaining as u64;
            nremaining = 0;
        }
        j += 1;
    }

    Ok(WriteFullyOut {
        nwritten: len,
        niovs_out,
        nriovs_out: j,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric::{
        getinfo, version, AddressVector, CompletionQueue, CqAttr, EqAttr, EventQueue, Fabric,
        GetInfoFlags, Hints,
    };
    use std::time::{Duration, Instant};

    struct Peer {
        ep: Endpoint,
        cq: CompletionQueue,
        av: AddressVector,
        domain: Domain,
    }

    fn make_peer() -> Peer {
        let info = getinfo(
            version(1, 13),
            None,
            None,
            GetInfoFlags::empty(),
            &Hints::default(),
        )
        .unwrap();
        let fabric = Fabric::new(&info).unwrap();
        let domain = fabric.domain(&info).unwrap();
        let cq = CompletionQueue::open(&domain, &CqAttr::default()).unwrap();
        let eq = EventQueue::open(&fabric, &EqAttr::default()).unwrap();
        let av = AddressVector::open();
        let ep = Endpoint::new(&domain, &info).unwrap();
        ep.bind_eq(&eq).unwrap();
        ep.bind_cq(&cq, Flags::SELECTIVE_COMPLETION | Flags::RECV | Flags::TRANSMIT)
            .unwrap();
        ep.bind_av(&av).unwrap();
        ep.enable().unwrap();
        Peer { ep, cq, av, domain }
    }

    #[test]
    fn test_write_fully_clips_and_parks_suffix() {
        let a = make_peer();
        let b = make_peer();
        let a_to_b = a.av.insert(&b.ep.getname().unwrap()).unwrap();

        let mut target = vec![0u8; 64];
        let mr = unsafe {
            b.domain
                .register(
                    target.as_mut_ptr(),
                    target.len(),
                    Flags::RECV | Flags::REMOTE_WRITE,
                    0,
                )
                .unwrap()
        };

        let data: Vec<u8> = (0..40u8).collect();
        let base = data.as_ptr() as u64;
        let iov_in = [
            IoVec { addr: base, len: 10 },
            IoVec { addr: base + 10, len: 10 },
            IoVec { addr: base + 20, len: 20 },
        ];
        let desc_in = [MrDesc::default(); 3];
        let riov_in = [
            RmaIoVec { addr: 0, len: 8, key: mr.key() },
            RmaIoVec { addr: 16, len: 8, key: mr.key() },
            RmaIoVec { addr: 32, len: 9, key: mr.key() },
        ];

        let mut iov_out = [IoVec::default(); VECTOR_IOV_MAX];
        let mut desc_out = [MrDesc::default(); VECTOR_IOV_MAX];
        let mut riov_out = [RmaIoVec::default(); VECTOR_IOV_MAX];

        // Two-segment cap on either side: 20 local bytes vs 16 remote bytes
        // in reach, so 16 go out and the suffixes get parked.
        let out = write_fully(WriteFullyParams {
            ep: &a.ep,
            iov_in: &iov_in,
            desc_in: &desc_in,
            iov_out: &mut iov_out,
            desc_out: &mut desc_out,
            riov_in: &riov_in,
            riov_out: &mut riov_out,
            len: 40,
            maxsegs: 2,
            flags: DESIRED_WR_FLAGS,
            addr: a_to_b,
            context: 99,
        })
        .unwrap();

        assert_eq!(out.nwritten, 16);
        assert_eq!(out.niovs_out, 2);
        assert_eq!(out.nriovs_out, 1);

        // local suffix: 4 bytes left of segment 1, then segment 2 intact
        assert_eq!(iov_out[0].addr, base + 16);
        assert_eq!(iov_out[0].len, 4);
        assert_eq!(iov_out[1].addr, base + 20);
        assert_eq!(iov_out[1].len, 20);

        // remote suffix: the untouched third segment
        assert_eq!(riov_out[0], riov_in[2]);

        // drive both sides until the delivery-complete completion arrives
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "write never completed");
            let _ = b.cq.read().unwrap();
            match a.cq.read().unwrap() {
                Some(fabric::CqEvent::Data(c)) => {
                    assert_eq!(c.context, 99);
                    assert_eq!(c.len, 16);
                    break;
                }
                Some(fabric::CqEvent::Err(e)) => panic!("write failed: {}", e.strerror()),
                None => std::thread::yield_now(),
            }
        }

        assert_eq!(&target[..8], &data[..8]);
        assert_eq!(&target[16..24], &data[8..16]);
    }

    #[test]
    fn test_write_fully_len_caps_the_write() {
        let a = make_peer();
        let b = make_peer();
        let a_to_b = a.av.insert(&b.ep.getname().unwrap()).unwrap();

        let mut target = vec![0u8; 32];
        let mr = unsafe {
            b.domain
                .register(
                    target.as_mut_ptr(),
                    target.len(),
                    Flags::RECV | Flags::REMOTE_WRITE,
                    0,
                )
                .unwrap()
        };

        let data = [7u8; 32];
        let iov_in = [IoVec { addr: data.as_ptr() as u64, len: 32 }];
        let desc_in = [MrDesc::default()];
        let riov_in = [RmaIoVec { addr: 0, len: 32, key: mr.key() }];

        let mut iov_out = [IoVec::default(); VECTOR_IOV_MAX];
        let mut desc_out = [MrDesc::default(); VECTOR_IOV_MAX];
        let mut riov_out = [RmaIoVec::default(); VECTOR_IOV_MAX];

        let out = write_fully(WriteFullyParams {
            ep: &a.ep,
            iov_in: &iov_in,
            desc_in: &desc_in,
            iov_out: &mut iov_out,
            desc_out: &mut desc_out,
            riov_in: &riov_in,
            riov_out: &mut riov_out,
            len: 12,
            maxsegs: 4,
            flags: DESIRED_WR_FLAGS,
            addr: a_to_b,
            context: 7,
        })
        .unwrap();

        assert_eq!(out.nwritten, 12);
        assert_eq!(out.niovs_out, 1);
        assert_eq!(out.nriovs_out, 1);
        assert_eq!(iov_out[0].len, 20);
        assert_eq!(riov_out[0].addr, 12);
        assert_eq!(riov_out[0].len, 20);
    }
}
