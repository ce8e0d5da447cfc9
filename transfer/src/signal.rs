//! Signal-driven cancellation.
//!
//! SIGHUP, SIGINT, SIGQUIT, and SIGTERM all set one process-wide flag that
//! every session loop polls. Worker threads run with these signals blocked
//! so delivery always lands on the main thread, where the handshake paths
//! block interruptibly.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::error::{Error, Result};

/// Signals that cancel a run.
pub const CANCEL_SIGNALS: [Signal; 4] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

/// Cooperative cancellation flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

static GLOBAL: OnceLock<CancelToken> = OnceLock::new();

/// The token the signal handler sets.
pub fn global_token() -> CancelToken {
    GLOBAL.get_or_init(CancelToken::new).clone()
}

extern "C" fn handler(_signum: c_int) {
    // Only an atomic store; async-signal-safe.
    if let Some(token) = GLOBAL.get() {
        token.0.store(true, Ordering::Relaxed);
    }
}

/// Install the cancellation handler for every signal in [`CANCEL_SIGNALS`].
pub fn install_handlers() -> Result<()> {
    global_token();
    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in CANCEL_SIGNALS {
        // Safety: the handler only performs an atomic store.
        unsafe {
            signal::sigaction(sig, &action).map_err(|e| Error::Fabric(e.into()))?;
        }
    }
    Ok(())
}

fn cancel_sigset() -> SigSet {
    let mut set = SigSet::empty();
    for sig in CANCEL_SIGNALS {
        set.add(sig);
    }
    set
}

/// Run `f` with the cancellation signals blocked in this thread, so threads
/// spawned inside inherit the blocked mask.
pub fn with_signals_blocked<T>(f: impl FnOnce() -> T) -> T {
    let set = cancel_sigset();
    let mut old = SigSet::empty();
    let blocked =
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut old)).is_ok();
    let out = f();
    if blocked {
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token() {
        let t = CancelToken::new();
        assert!(!t.is_set());
        let t2 = t.clone();
        t2.set();
        assert!(t.is_set());
    }

    #[test]
    fn test_blocked_scope_returns_value() {
        let v = with_signals_blocked(|| 7);
        assert_eq!(v, 7);
    }
}
