//! Sessions: a connection state machine paired with a terminal.
//!
//! A session owns two FIFOs: `ready_for_cxn` carries buffers destined for
//! the fabric, `ready_for_terminal` buffers destined for the source or
//! sink. Each worker pass steps the connection once, which in turn trades
//! buffers with the terminal.

use fabric::{AddressVector, CompletionQueue, Endpoint, EventQueue, FiAddr};

use crate::fifo::Fifo;
use crate::keys::KeySource;
use crate::rcvr::Receiver;
use crate::terminal::Terminal;
use crate::worker::Worker;
use crate::xmtr::Transmitter;

/// Slots in each session FIFO.
pub const SESSION_FIFO_DEPTH: usize = 64;

/// Verdict of one session pass (or one terminal trade).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Come back on the next pass.
    Continue,
    /// The session finished cleanly.
    End,
    /// The session failed; the worker records the failure.
    Error,
}

/// Outcome of one sub-step inside a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    NoActivity,
    Activity,
    Error,
}

/// Local/remote EOF handshake state.
#[derive(Debug, Default, Clone, Copy)]
pub struct EofState {
    pub local: bool,
    pub remote: bool,
}

/// State common to both connection variants.
pub struct CxnCore {
    pub ep: Endpoint,
    pub eq: EventQueue,
    pub cq: CompletionQueue,
    pub av: AddressVector,
    pub peer_addr: FiAddr,
    pub started: bool,
    pub cancelled: bool,
    pub eof: EofState,
    pub keys: KeySource,
}

impl CxnCore {
    pub fn new(
        ep: Endpoint,
        eq: EventQueue,
        cq: CompletionQueue,
        av: AddressVector,
        peer_addr: FiAddr,
    ) -> Self {
        Self {
            ep,
            eq,
            cq,
            av,
            peer_addr,
            started: false,
            cancelled: false,
            eof: EofState::default(),
            keys: KeySource::new(),
        }
    }
}

/// Connection state machine, one variant per personality.
pub enum Cxn {
    Rcvr(Box<Receiver>),
    Xmtr(Box<Transmitter>),
}

impl Cxn {
    pub fn core(&self) -> &CxnCore {
        match self {
            Cxn::Rcvr(r) => &r.cxn,
            Cxn::Xmtr(x) => &x.cxn,
        }
    }
}

/// A terminal and a connection joined by two buffer FIFOs.
pub struct Session {
    pub terminal: Terminal,
    pub cxn: Cxn,
    pub ready_for_cxn: Fifo,
    pub ready_for_terminal: Fifo,
}

impl Session {
    pub fn new(cxn: Cxn, terminal: Terminal) -> Self {
        Self {
            terminal,
            cxn,
            ready_for_cxn: Fifo::new(SESSION_FIFO_DEPTH),
            ready_for_terminal: Fifo::new(SESSION_FIFO_DEPTH),
        }
    }

    /// The completion queue a worker registers with its poll set.
    pub fn cq(&self) -> &CompletionQueue {
        &self.cxn.core().cq
    }

    /// Run one pass of the connection loop.
    pub fn step(&mut self, worker: &Worker) -> LoopControl {
        let Session {
            terminal,
            cxn,
            ready_for_cxn,
            ready_for_terminal,
        } = self;
        match cxn {
            Cxn::Rcvr(r) => r.step(worker, terminal, ready_for_cxn, ready_for_terminal),
            Cxn::Xmtr(x) => x.step(worker, terminal, ready_for_cxn, ready_for_terminal),
        }
    }
}
