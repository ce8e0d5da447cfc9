//! fabric - reliable-datagram messaging and one-sided RMA, emulated over UDP.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Domain                              │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  MR registry: key → (span, access)                   │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//!          │                │                  │
//!          ▼                ▼                  ▼
//!    ┌──────────┐     ┌──────────┐       ┌──────────┐
//!    │ Endpoint │────▶│    CQ    │◀──────│ Endpoint │
//!    │ UDP sock │     │ (events) │       │ UDP sock │
//!    └──────────┘     └──────────┘       └──────────┘
//! ```
//!
//! - **Endpoint**: one UDP socket with reliable-datagram semantics; peers are
//!   resolved through an [`av::AddressVector`].
//! - **Progress**: manual. Reading a [`cq::CompletionQueue`] (or polling a
//!   [`poll::PollSet`]) receives datagrams, matches posted receives in post
//!   order, applies incoming RMA writes to registered regions, and
//!   acknowledges delivery back to the writer.
//! - **Completions** carry the 64-bit context the application supplied when
//!   posting; cancelled operations surface as `ECANCELED` error entries.

pub mod av;
pub mod cq;
pub mod domain;
pub mod ep;
pub mod eq;
pub mod info;
pub mod mr;
pub mod poll;

mod wire;

pub use av::{AddressVector, FiAddr};
pub use cq::{Completion, CompletionError, CompletionQueue, CqAttr, CqEvent};
pub use domain::{Domain, Fabric};
pub use ep::{Endpoint, IoVec, MsgDesc, RmaIoVec, RmaMsgDesc};
pub use eq::{EqAttr, EventQueue};
pub use info::{getinfo, version, FabricInfo, GetInfoFlags, Hints, MrMode};
pub use mr::{MemoryRegion, MrDesc};
pub use poll::PollSet;

use bitflags::bitflags;

bitflags! {
    /// Capability, access, operation, and completion flags.
    ///
    /// The same flag space is used for endpoint capabilities, memory-region
    /// access rights, per-operation flags, and completion flags, so a
    /// completion can be checked directly against the flags the operation
    /// was posted with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u64 {
        /// Two-sided message transfers.
        const MSG = 1 << 0;
        /// One-sided remote memory access.
        const RMA = 1 << 1;
        /// Receive direction / receive access for an MR.
        const RECV = 1 << 2;
        /// Send direction / send access for an MR.
        const SEND = 1 << 3;
        /// Initiate RMA writes / write access for an MR.
        const WRITE = 1 << 4;
        /// Be the target of RMA writes.
        const REMOTE_WRITE = 1 << 5;
        /// Transmit side of an endpoint binding.
        const TRANSMIT = 1 << 6;
        /// Request a completion for this operation.
        const COMPLETION = 1 << 7;
        /// Complete only once the payload is placed at the target.
        const DELIVERY_COMPLETE = 1 << 8;
        /// Only operations flagged `COMPLETION` generate completions.
        const SELECTIVE_COMPLETION = 1 << 9;
    }
}
