//! Receiver state machine.
//!
//! The receiver advertises payload buffers as RDMA targets through vector
//! messages, consumes the transmitter's progress messages to learn how many
//! bytes landed, hands filled buffers to the sink, and performs its half of
//! the EOF handshake: once the peer reports no leftover bytes, it answers
//! with an empty vector.

use std::sync::Arc;

use fabric::{Completion, CqEvent, Flags, MrDesc, RmaIoVec};
use tracing::{debug, trace};

use crate::buffer::Buf;
use crate::ctl::{RxCtl, TxCtl};
use crate::fifo::Fifo;
use crate::message::{decode_progress, encode_vector, VECTOR_IOV_MAX};
use crate::session::{CxnCore, LoopControl, StepStatus};
use crate::terminal::{Terminal, TXBUF};
use crate::worker::{Worker, PAYLOAD_RX_ACCESS};
use crate::Runtime;

const VECBUF_POOL_SIZE: usize = 16;
const CTL_FIFO_DEPTH: usize = 64;

/// Receiver ("get" personality) connection state.
pub struct Receiver {
    pub cxn: CxnCore,
    /// Bytes the peer reports placed but not yet credited to a target.
    nfull: u64,
    /// RDMA targets advertised and awaiting fill, in advertisement order.
    tgtposted: Fifo,
    /// Outgoing vector stream.
    vec: TxCtl,
    /// Incoming progress stream.
    progress: RxCtl,
    rt: Arc<Runtime>,
}

impl Receiver {
    /// Build the receiver state around an established connection. The
    /// vector-message pool is registered up front.
    pub fn new(rt: Arc<Runtime>, mut cxn: CxnCore) -> Self {
        let mut vec = TxCtl::new(CTL_FIFO_DEPTH, VECBUF_POOL_SIZE);
        for _ in 0..VECBUF_POOL_SIZE {
            let mut vb = Buf::alloc_vec();
            let base = vb.data_base() as *mut u8;
            let nalloc = vb.hdr().nallocated;
            // Safety: the message bytes live inside the boxed buffer, which
            // stays allocated for the life of the pool.
            let mr = unsafe {
                rt.domain
                    .register(base, nalloc, Flags::SEND, cxn.keys.next())
            }
            .unwrap_or_else(|e| panic!("vector buffer registration failed: {}", e));
            let hdr = vb.hdr_mut();
            hdr.desc = mr.desc();
            hdr.mr = Some(mr);
            vec.pool.put(vb).ok().expect("vector buffer pool full");
        }

        Self {
            cxn,
            nfull: 0,
            tgtposted: Fifo::new(CTL_FIFO_DEPTH),
            vec,
            progress: RxCtl::new(CTL_FIFO_DEPTH),
            rt,
        }
    }

    /// One pass of the receiver loop.
    pub fn step(
        &mut self,
        worker: &Worker,
        terminal: &mut Terminal,
        ready_for_cxn: &mut Fifo,
        ready_for_terminal: &mut Fifo,
    ) -> LoopControl {
        if !self.cxn.started {
            return self.start(worker, ready_for_cxn);
        }

        if self.cq_process() == StepStatus::Error {
            return self.fail();
        }

        if self.cxn.cancelled {
            if self.progress.posted.is_empty() && self.vec.posted.is_empty() {
                return self.fail();
            }
            return LoopControl::Continue;
        } else if self.rt.cancel.is_set() {
            self.progress.cancel(&self.cxn.ep);
            self.vec.cancel(&self.cxn.ep);
            self.cxn.cancelled = true;
            return LoopControl::Continue;
        }

        if terminal.trade(ready_for_terminal, ready_for_cxn) == LoopControl::Error {
            return self.fail();
        }

        self.vector_update(ready_for_cxn);

        if let Err(e) = self.vec.transmit(&self.cxn.ep, self.cxn.peer_addr) {
            debug!(target: "txctl", error = %e, "vector transmit failed");
            return self.fail();
        }

        self.targets_read(ready_for_terminal);

        if terminal.eof()
            && ready_for_terminal.is_empty()
            && self.cxn.eof.remote
            && self.cxn.eof.local
            && self.vec.posted.is_empty()
        {
            let _ = self.cxn.ep.close();
            debug!(target: "close", "receiver closed");
            return LoopControl::End;
        }
        LoopControl::Continue
    }

    fn fail(&mut self) -> LoopControl {
        let _ = self.cxn.ep.close();
        debug!(target: "close", "receiver closed");
        LoopControl::Error
    }

    /// First entry: post the whole progress Rx pool and pre-fill the
    /// session with payload buffers covering the reference text, so the
    /// sink has something to verify against from the first pass.
    fn start(&mut self, worker: &Worker, ready_for_cxn: &mut Fifo) -> LoopControl {
        self.cxn.started = true;

        while !self.progress.posted.is_full() {
            let pb = Buf::alloc_prog();
            if let Err(e) = self.progress.post(&self.cxn.ep, self.cxn.peer_addr, pb) {
                debug!(target: "err", error = %e, "posting progress receives failed");
                return LoopControl::Error;
            }
        }

        let mut nleftover = TXBUF.len();
        while nleftover > 0 {
            let Some(mut b) = worker.payload_rxbuf_get() else {
                debug!(target: "err", "could not get a buffer");
                return LoopControl::Error;
            };
            let n = nleftover.min(b.hdr().nallocated);
            b.hdr_mut().nused = n;
            nleftover -= n;
            if ready_for_cxn.put(b).is_err() {
                debug!(target: "err", "could not enqueue rx buffer");
                return LoopControl::Error;
            }
        }

        LoopControl::Continue
    }

    /// Drain one completion and dispatch it by the posted queue holding its
    /// context.
    fn cq_process(&mut self) -> StepStatus {
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
            .progress
            .posted
            .find_mut(|h| h.ctx_id() == cmpl.context)
            .is_some()
        {
            trace!(target: "completion", "read a progress rx completion");
            self.progress_rx_process(&cmpl)
        } else if self
            .vec
            .posted
            .find_mut(|h| h.ctx_id() == cmpl.context)
            .is_some()
        {
            trace!(target: "completion", "read a vector tx completion");
            match self.vec.complete(&cmpl) {
                Ok(()) => StepStatus::Activity,
                Err(_) => StepStatus::Error,
            }
        } else {
            debug!(target: "completion", context = cmpl.context, "unexpected transfer context");
            StepStatus::Error
        }
    }

    fn posted_ctx_cancelled(&mut self, context: u64) -> bool {
        let in_progress = self
            .progress
            .posted
            .find_mut(|h| h.ctx_id() == context)
            .map(|h| h.hdr().xfc.cancelled);
        in_progress
            .or_else(|| {
                self.vec
                    .posted
                    .find_mut(|h| h.ctx_id() == context)
                    .map(|h| h.hdr().xfc.cancelled)
            })
            .unwrap_or(false)
    }

    fn progress_rx_process(&mut self, cmpl: &Completion) -> StepStatus {
        let Some(pb) = self.progress.complete(cmpl) else {
            return StepStatus::Error;
        };

        if pb.hdr().xfc.cancelled {
            drop(pb);
            return StepStatus::NoActivity;
        }

        let nused = pb.hdr().nused;
        let msg = match decode_progress(&pb.as_prog().expect("progress stream held a non-progress buffer").msg()[..nused.min(crate::message::PROGRESS_MSG_SIZE)])
        {
            Ok(m) if nused == crate::message::PROGRESS_MSG_SIZE => m,
            _ => {
                debug!(target: "rxctl", nused, "malformed progress message, reposting");
                if let Err(e) = self.progress.post(&self.cxn.ep, self.cxn.peer_addr, pb) {
                    debug!(target: "err", error = %e, "progress repost failed");
                    return StepStatus::Error;
                }
                return StepStatus::NoActivity;
            }
        };

        debug!(
            target: "msg",
            nfilled = msg.nfilled,
            nleftover = msg.nleftover,
            "received progress message"
        );

        self.nfull += msg.nfilled;
        if msg.nleftover == 0 {
            debug!(target: "protocol", "received remote EOF");
            self.cxn.eof.remote = true;
        }

        if let Err(e) = self.progress.post(&self.cxn.ep, self.cxn.peer_addr, pb) {
            debug!(target: "err", error = %e, "progress repost failed");
            return StepStatus::Error;
        }
        StepStatus::Activity
    }

    /// Advertise payload buffers as RDMA targets, or answer the peer's EOF
    /// with an empty vector.
    fn vector_update(&mut self, ready_for_cxn: &mut Fifo) {
        if self.cxn.eof.remote && !self.cxn.eof.local {
            if self.vec.ready.is_full() {
                return;
            }
            let Some(mut vb) = self.vec.pool.get() else {
                return;
            };
            let used = encode_vector(
                &[],
                vb.as_vec_mut().expect("vector pool held a non-vector buffer").msg_mut(),
            );
            vb.hdr_mut().nused = used;
            self.vec.ready.put(vb).ok().expect("vector ready overflow");
            self.cxn.eof.local = true;
            debug!(target: "protocol", "enqueued local EOF");
            return;
        }

        while !self.vec.ready.is_full() && !ready_for_cxn.is_empty() {
            let Some(mut vb) = self.vec.pool.get() else {
                break;
            };

            let mut triples: Vec<RmaIoVec> = Vec::with_capacity(VECTOR_IOV_MAX);
            while triples.len() < VECTOR_IOV_MAX {
                let Some(mut h) = ready_for_cxn.get() else {
                    break;
                };
                h.hdr_mut().nused = 0;

                if self.rt.reregister {
                    let base = h.data_base() as *mut u8;
                    let nalloc = h.hdr().nallocated;
                    // Safety: payload bytes live inside the boxed buffer,
                    // which stays queued until the registration is dropped.
                    let mr = unsafe {
                        self.rt.domain.register(
                            base,
                            nalloc,
                            PAYLOAD_RX_ACCESS,
                            self.cxn.keys.next(),
                        )
                    }
                    .unwrap_or_else(|e| panic!("payload memory registration failed: {}", e));
                    let hdr = h.hdr_mut();
                    hdr.desc = mr.desc();
                    hdr.mr = Some(mr);
                }

                let hdr = h.hdr();
                let key = hdr
                    .mr
                    .as_ref()
                    .expect("advertised buffer lacks a registration")
                    .key();
                triples.push(RmaIoVec {
                    addr: 0,
                    len: hdr.nallocated as u64,
                    key,
                });
                self.tgtposted.put(h).ok().expect("RDMA target FIFO overflow");
            }

            let used = encode_vector(
                &triples,
                vb.as_vec_mut().expect("vector pool held a non-vector buffer").msg_mut(),
            );
            vb.hdr_mut().nused = used;
            self.vec.ready.put(vb).ok().expect("vector ready overflow");
        }
    }

    /// Credit reported bytes to the advertised targets, releasing each
    /// filled buffer (and, on remote EOF, the partially filled head) to the
    /// sink.
    fn targets_read(&mut self, ready_for_terminal: &mut Fifo) {
        while self.nfull > 0 && !ready_for_terminal.is_full() {
            let Some(head) = self.tgtposted.peek_mut() else {
                break;
            };
            let hdr = head.hdr_mut();
            if (hdr.nused as u64) + self.nfull < hdr.nallocated as u64 {
                hdr.nused += self.nfull as usize;
                self.nfull = 0;
            } else {
                self.nfull -= (hdr.nallocated - hdr.nused) as u64;
                hdr.nused = hdr.nallocated;
                let mut h = self.tgtposted.get().expect("peeked buffer vanished");
                if self.rt.reregister {
                    let hdr = h.hdr_mut();
                    hdr.mr = None;
                    hdr.desc = MrDesc::default();
                }
                ready_for_terminal
                    .put(h)
                    .ok()
                    .expect("terminal queue overflow");
            }
        }

        // The peer does not necessarily stop on a target-buffer boundary;
        // on EOF the partially filled head goes to the sink too.
        if self.cxn.eof.remote && self.tgtposted.peek().is_some_and(|h| h.hdr().nused != 0) {
            let mut h = self.tgtposted.get().expect("peeked buffer vanished");
            if self.rt.reregister {
                let hdr = h.hdr_mut();
                hdr.mr = None;
                hdr.desc = MrDesc::default();
            }
            ready_for_terminal
                .put(h)
                .ok()
                .expect("terminal queue overflow");
        }
    }
}
