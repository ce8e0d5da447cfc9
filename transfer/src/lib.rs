//! transfer - bidirectional bulk data transfer over a reliable-datagram RMA
//! fabric.
//!
//! # Architecture
//!
//! ```text
//!  fput (transmitter)                        fget (receiver)
//!  ┌──────────────────────┐                 ┌──────────────────────┐
//!  │ Source ⇄ Transmitter │                 │ Receiver ⇄ Sink      │
//!  │   session FIFOs      │                 │   session FIFOs      │
//!  └──────────┬───────────┘                 └──────────┬───────────┘
//!             │  vector adverts ◀───────────────────────┤
//!             ├──────────────────▶ RDMA writes          │
//!             ├──────────────────▶ progress / EOF       │
//!  ┌──────────┴───────────┐                 ┌──────────┴───────────┐
//!  │ worker pool          │                 │ worker pool          │
//!  └──────────────────────┘                 └──────────────────────┘
//! ```
//!
//! The receiver advertises RDMA target buffers through *vector* messages;
//! the transmitter fills them with scatter/gather one-sided writes and
//! reports placement through *progress* messages. EOF is explicit and
//! bidirectional: the transmitter sends a progress message with no leftover
//! bytes, the receiver answers with an empty vector.
//!
//! Sessions — a connection state machine paired with a byte source or sink —
//! are multiplexed onto a bounded pool of worker threads, each of which
//! polls the completion queues of the sessions it owns.

pub mod buffer;
pub mod ctl;
pub mod error;
pub mod fifo;
pub mod keys;
pub mod memreg;
pub mod message;
pub mod personality;
pub mod rcvr;
pub mod session;
pub mod signal;
pub mod terminal;
pub mod worker;
pub mod xmtr;

use std::time::Duration;

use fabric::{Domain, Fabric, FabricInfo};

pub use error::{Error, Result};
pub use session::{Cxn, LoopControl, Session};
pub use signal::CancelToken;

/// Service name both personalities rendezvous on.
pub const SERVICE_NAME: &str = "4242";

/// Immutable per-run state shared by the personalities, workers, and
/// connection state machines.
pub struct Runtime {
    pub fabric: Fabric,
    pub domain: Domain,
    pub info: FabricInfo,
    /// Segments per memory registration.
    pub mr_maxsegs: usize,
    /// Segments per posted receive.
    pub rx_maxsegs: usize,
    /// Segments per posted send.
    pub tx_maxsegs: usize,
    /// Remote segments per RMA write; 1 in contiguous mode.
    pub rma_maxsegs: usize,
    /// Re-register payload regions on every transfer instead of once.
    pub reregister: bool,
    /// Restrict RMA writes to one remote segment.
    pub contiguous: bool,
    /// Reference-text repetitions each terminal produces or expects.
    pub repeats: usize,
    /// Echo the transferred stream to stdout.
    pub echo: bool,
    /// Deadline for the initial/ack exchange; `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Cooperative cancellation flag, set by the signal handler.
    pub cancel: CancelToken,
}
