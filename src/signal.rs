//! Unix signal handling (SIGINT) and cooperative interruption.
//!
//! Subprocesses run in their own process groups, so a terminal Ctrl-C only
//! reaches us.  The handler records it in a flag that evaluator and builder
//! checkpoints observe; running subprocesses are then killed by their runners
//! and the worker threads drained before the process exits.  The handler
//! restores the default disposition, so a second Ctrl-C kills us outright.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

fn sigint_action(handler: libc::sighandler_t) {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

extern "C" fn sigint_handler(_sig: libc::c_int) {
    // Only async-signal-safe operations here: an atomic store and sigaction.
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
    sigint_action(libc::SIG_DFL);
}

pub fn register_sigint() {
    sigint_action(sigint_handler as extern "C" fn(libc::c_int) as libc::sighandler_t);
}

/// A cancellation token.  Triggered explicitly (catastrophic failure,
/// fail-fast abort) or, when created with `with_sigint`, by Ctrl-C.
/// Tokens form a chain: a child fires when any ancestor fires, but
/// triggering a child leaves its ancestors alone.
#[derive(Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<Interrupt>>,
    watch_sigint: bool,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sigint() -> Self {
        Interrupt {
            watch_sigint: true,
            ..Self::default()
        }
    }

    pub fn child(&self) -> Interrupt {
        Interrupt {
            flag: Arc::default(),
            parent: Some(Arc::new(self.clone())),
            watch_sigint: false,
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.external()
    }

    /// Whether the interruption came from Ctrl-C or an ancestor token rather
    /// than from `trigger` on this one.
    pub fn external(&self) -> bool {
        (self.watch_sigint && SIGINT_RECEIVED.load(Ordering::SeqCst))
            || self.parent.as_ref().map_or(false, |p| p.is_set())
    }
}
