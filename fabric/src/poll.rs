//! Poll sets.
//!
//! A poll set aggregates completion queues so one caller can drive progress
//! on many sessions' queues in a single sweep.

use std::io;
use std::sync::{Arc, Mutex, Weak};

use crate::cq::{CompletionQueue, CqInner};
use crate::domain::Domain;

/// Aggregate over completion queues. Cheaply cloneable.
#[derive(Clone, Default)]
pub struct PollSet {
    cqs: Arc<Mutex<Vec<Weak<CqInner>>>>,
}

impl PollSet {
    /// Open an empty poll set on `domain`.
    pub fn open(_domain: &Domain) -> io::Result<Self> {
        Ok(Self::default())
    }

    /// Add a completion queue to the set.
    pub fn add(&self, cq: &CompletionQueue) -> io::Result<()> {
        self.cqs.lock().unwrap().push(Arc::downgrade(&cq.0));
        Ok(())
    }

    /// Remove a completion queue from the set.
    pub fn del(&self, cq: &CompletionQueue) -> io::Result<()> {
        let mut cqs = self.cqs.lock().unwrap();
        let target = Arc::downgrade(&cq.0);
        match cqs.iter().position(|w| w.ptr_eq(&target)) {
            Some(pos) => {
                cqs.swap_remove(pos);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "completion queue not in poll set",
            )),
        }
    }

    /// Drive progress on every queue in the set.
    ///
    /// Returns the number of queues currently holding completions. The
    /// value is informational; callers read the queues regardless.
    pub fn poll(&self) -> io::Result<usize> {
        let members: Vec<Arc<CqInner>> = {
            let mut cqs = self.cqs.lock().unwrap();
            cqs.retain(|w| w.strong_count() > 0);
            cqs.iter().filter_map(Weak::upgrade).collect()
        };

        let mut ready = 0;
        for cq in members {
            cq.progress()?;
            if cq.has_events() {
                ready += 1;
            }
        }
        Ok(ready)
    }
}
