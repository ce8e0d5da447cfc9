//! Control-message plumbing.
//!
//! [`RxCtl`] posts receives for one control-message stream and matches
//! their completions in FIFO order; [`TxCtl`] drains a ready queue into
//! fabric sends while the posted window has room, recycling buffers through
//! a fixed pool on completion. Both cancel by cancelling their posted FIFO,
//! preserving order so `ECANCELED` completions are matched like ordinary
//! ones.

use fabric::{Completion, Endpoint, FiAddr, Flags, IoVec, MsgDesc};
use tracing::debug;

use crate::buffer::{Buf, BufList};
use crate::error::{Error, Result};
use crate::fifo::Fifo;

/// Flags a well-formed receive completion must carry.
pub const DESIRED_RX_FLAGS: Flags = Flags::RECV.union(Flags::MSG);
/// Flags a well-formed send completion must carry.
pub const DESIRED_TX_FLAGS: Flags = Flags::SEND.union(Flags::MSG);
/// Flags requested on RDMA writes.
pub const DESIRED_WR_FLAGS: Flags = Flags::RMA
    .union(Flags::WRITE)
    .union(Flags::COMPLETION)
    .union(Flags::DELIVERY_COMPLETE);

/// Walk a FIFO of posted buffers, flagging each context cancelled and
/// issuing a fabric cancel, in FIFO order. Later `ECANCELED` completions
/// then match in the same order the operations were posted.
pub fn fifo_cancel(ep: &Endpoint, posted: &mut Fifo) {
    posted.for_each_mut(|h| {
        let hdr = h.hdr_mut();
        hdr.xfc.cancelled = true;
        let _ = ep.cancel(hdr.xfc.ctx_id);
    });
}

/// Receive side of one control-message stream.
pub struct RxCtl {
    /// Buffers posted to the fabric, in posting order.
    pub posted: Fifo,
    /// Buffers holding received, well-formed messages.
    pub rcvd: Fifo,
}

impl RxCtl {
    pub fn new(depth: usize) -> Self {
        Self {
            posted: Fifo::new(depth),
            rcvd: Fifo::new(depth),
        }
    }

    /// Post `h` for reception and append it to the posted FIFO.
    pub fn post(&mut self, ep: &Endpoint, peer: FiAddr, h: Box<Buf>) -> Result<()> {
        let hdr = h.hdr();
        let iov = [IoVec {
            addr: h.data_base(),
            len: hdr.nallocated,
        }];
        let desc = [hdr.desc];
        // Safety: the buffer is boxed and parked in `posted` untouched until
        // its completion hands ownership back.
        unsafe {
            ep.recvmsg(
                &MsgDesc {
                    iov: &iov,
                    desc: &desc,
                    addr: peer,
                    context: hdr.xfc.ctx_id,
                },
                Flags::COMPLETION,
            )
            .map_err(Error::Fabric)?;
        }
        self.posted.put(h).ok().expect("posted receives overflow");
        Ok(())
    }

    /// Match a completion against the head of the posted FIFO.
    ///
    /// Returns the completed buffer with its used length recorded, or
    /// `None` when no receive was posted (the caller treats that as a
    /// per-session failure).
    ///
    /// # Panics
    /// When a non-cancelled completion lacks the RECV|MSG flags, or the
    /// completion context does not match the FIFO head.
    pub fn complete(&mut self, cmpl: &Completion) -> Option<Box<Buf>> {
        let head_cancelled = self
            .posted
            .peek()
            .is_some_and(|h| h.hdr().xfc.cancelled);
        if !cmpl.flags.contains(DESIRED_RX_FLAGS) && !head_cancelled {
            panic!(
                "rx completion flags {:?} lack {:?}",
                cmpl.flags, DESIRED_RX_FLAGS
            );
        }

        let Some(mut h) = self.posted.get() else {
            debug!(target: "rxctl", "received a message, but no Rx was posted");
            return None;
        };
        assert_eq!(
            h.ctx_id(),
            cmpl.context,
            "completion context does not match the posted head"
        );
        h.hdr_mut().nused = cmpl.len;
        Some(h)
    }

    pub fn cancel(&mut self, ep: &Endpoint) {
        fifo_cancel(ep, &mut self.posted);
    }
}

/// Transmit side of one control-message stream.
pub struct TxCtl {
    /// Message buffers ready to transmit.
    pub ready: Fifo,
    /// Buffers posted with messages, in posting order.
    pub posted: Fifo,
    /// Unused message buffers.
    pub pool: BufList,
}

impl TxCtl {
    pub fn new(depth: usize, pool_cap: usize) -> Self {
        Self {
            ready: Fifo::new(depth),
            posted: Fifo::new(depth),
            pool: BufList::new(pool_cap),
        }
    }

    /// Drain the ready queue into fabric sends while the posted window has
    /// room; stops quietly when the fabric asks to try again later.
    pub fn transmit(&mut self, ep: &Endpoint, peer: FiAddr) -> Result<()> {
        while let Some(h) = self.ready.peek() {
            if self.posted.is_full() {
                break;
            }
            let hdr = h.hdr();
            let iov = [IoVec {
                addr: h.data_base(),
                len: hdr.nused,
            }];
            let desc = [hdr.desc];
            // Safety: the buffer stays parked in `posted` until the send
            // completion hands it back.
            let rc = unsafe {
                ep.sendmsg(
                    &MsgDesc {
                        iov: &iov,
                        desc: &desc,
                        addr: peer,
                        context: hdr.xfc.ctx_id,
                    },
                    Flags::COMPLETION,
                )
            };
            match rc {
                Ok(()) => {
                    let h = self.ready.get().expect("peeked buffer vanished");
                    self.posted.put(h).ok().expect("posted sends overflow");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Fabric(e)),
            }
        }
        Ok(())
    }

    /// Match a send completion against the head of the posted FIFO and
    /// return the buffer to the pool.
    ///
    /// # Panics
    /// When a non-cancelled completion lacks the SEND|MSG flags, when the
    /// context does not match the FIFO head, or when the pool overflows.
    pub fn complete(&mut self, cmpl: &Completion) -> Result<()> {
        let head_cancelled = self
            .posted
            .peek()
            .is_some_and(|h| h.hdr().xfc.cancelled);
        if !cmpl.flags.contains(DESIRED_TX_FLAGS) && !head_cancelled {
            panic!(
                "tx completion flags {:?} lack {:?}",
                cmpl.flags, DESIRED_TX_FLAGS
            );
        }

        let Some(h) = self.posted.get() else {
            debug!(target: "txctl", "message Tx completed, but no Tx was posted");
            return Err(Error::Protocol("transmit completed with nothing posted"));
        };
        assert_eq!(
            h.ctx_id(),
            cmpl.context,
            "completion context does not match the posted head"
        );
        self.pool.put(h).ok().expect("control buffer pool overflow");
        Ok(())
    }

    pub fn cancel(&mut self, ep: &Endpoint) {
        fifo_cancel(ep, &mut self.posted);
    }
}
