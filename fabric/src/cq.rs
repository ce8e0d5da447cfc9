//! Completion queues.
//!
//! Completions are reported in MSG format: the context the operation was
//! posted with, the completion flags, and the transferred length. Failed
//! operations (notably cancelled ones) surface as error entries carrying an
//! OS errno.
//!
//! Progress is manual: [`CompletionQueue::read`] drives datagram reception
//! on every endpoint bound to the queue before looking for an entry.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::domain::Domain;
use crate::ep::EpInner;
use crate::Flags;

/// Completion queue attributes.
#[derive(Debug, Clone)]
pub struct CqAttr {
    /// Advisory depth; the emulated queue grows as needed.
    pub size: usize,
}

impl Default for CqAttr {
    fn default() -> Self {
        Self { size: 128 }
    }
}

/// A successful completion in MSG format.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Context supplied when the operation was posted.
    pub context: u64,
    /// Completion flags describing the operation.
    pub flags: Flags,
    /// Bytes transferred.
    pub len: usize,
}

/// A failed completion.
#[derive(Debug, Clone)]
pub struct CompletionError {
    /// Context supplied when the operation was posted.
    pub context: u64,
    /// OS errno describing the failure.
    pub errno: i32,
}

impl CompletionError {
    /// Whether the operation failed because it was cancelled.
    pub fn is_canceled(&self) -> bool {
        self.errno == nix::libc::ECANCELED
    }

    /// Human-readable description of the failure.
    pub fn strerror(&self) -> String {
        Errno::from_raw(self.errno).desc().to_string()
    }
}

/// One entry read from a completion queue.
#[derive(Debug, Clone)]
pub enum CqEvent {
    Data(Completion),
    Err(CompletionError),
}

pub(crate) struct CqInner {
    events: Mutex<VecDeque<CqEvent>>,
    members: Mutex<Vec<Weak<EpInner>>>,
}

impl CqInner {
    pub(crate) fn push(&self, ev: CqEvent) {
        self.events.lock().unwrap().push_back(ev);
    }

    pub(crate) fn has_events(&self) -> bool {
        !self.events.lock().unwrap().is_empty()
    }

    fn live_members(&self) -> Vec<Arc<EpInner>> {
        let mut members = self.members.lock().unwrap();
        members.retain(|w| w.strong_count() > 0);
        members.iter().filter_map(Weak::upgrade).collect()
    }

    /// Drive datagram reception on every member endpoint.
    pub(crate) fn progress(&self) -> io::Result<()> {
        for ep in self.live_members() {
            ep.progress()?;
        }
        Ok(())
    }
}

/// Queue of operation completions. Cheaply cloneable.
#[derive(Clone)]
pub struct CompletionQueue(pub(crate) Arc<CqInner>);

impl CompletionQueue {
    /// Open a completion queue on `domain`.
    pub fn open(_domain: &Domain, _attr: &CqAttr) -> io::Result<Self> {
        Ok(Self(Arc::new(CqInner {
            events: Mutex::new(VecDeque::new()),
            members: Mutex::new(Vec::new()),
        })))
    }

    pub(crate) fn register(&self, ep: Weak<EpInner>) {
        self.0.members.lock().unwrap().push(ep);
    }

    /// Non-blocking read. `None` means no completion is available yet.
    pub fn read(&self) -> io::Result<Option<CqEvent>> {
        self.0.progress()?;
        Ok(self.0.events.lock().unwrap().pop_front())
    }

    /// Blocking read.
    ///
    /// Waits until a completion is available, the timeout expires (`None`
    /// waits forever), or a signal interrupts the wait — which surfaces as
    /// an [`io::ErrorKind::Interrupted`] error.
    pub fn sread(&self, timeout: Option<Duration>) -> io::Result<Option<CqEvent>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(ev) = self.read()? {
                return Ok(Some(ev));
            }

            let wait_ms: u16 = match deadline {
                None => 50,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left.as_millis().min(50) as u16
                }
            };

            let eps = self.0.live_members();
            let mut fds: Vec<PollFd> = eps
                .iter()
                .map(|ep| PollFd::new(ep.fd(), PollFlags::POLLIN))
                .collect();

            match poll(&mut fds, PollTimeout::from(wait_ms)) {
                Ok(_) => {}
                Err(Errno::EINTR) => {
                    return Err(io::Error::from(io::ErrorKind::Interrupted));
                }
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }
}
