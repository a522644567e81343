//! Per-request allocation accounting.
//!
//! Every byte of request-scoped state (body, slot values, effector results
//! copied into the request) is charged against an [`Arena`]. Crossing the soft
//! cap is traced once as a warning; crossing the hard cap fails the request.
//! Values are owned by the request context and dropped wholesale at teardown,
//! which is what gives slots their arena lifetime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Error, ErrorKind};

/// Byte-budget accountant for one request
#[derive(Debug)]
pub struct Arena {
    soft_cap: usize,
    hard_cap: usize,
    used: AtomicUsize,
    soft_exceeded: AtomicBool,
}

impl Arena {
    pub fn new(soft_cap: usize, hard_cap: usize) -> Self {
        Self {
            soft_cap,
            hard_cap,
            used: AtomicUsize::new(0),
            soft_exceeded: AtomicBool::new(false),
        }
    }

    /// Charge `len` bytes against the budget.
    ///
    /// Fails with `Internal(arena/hard_cap)` once the hard cap would be
    /// exceeded; the coordinator surfaces that as a pipeline failure.
    pub fn charge(&self, len: usize) -> Result<(), Error> {
        let used = self.used.fetch_add(len, Ordering::Relaxed) + len;
        if used > self.hard_cap {
            self.used.fetch_sub(len, Ordering::Relaxed);
            return Err(Error::new(ErrorKind::Internal, "arena", "hard_cap"));
        }
        if used > self.soft_cap && !self.soft_exceeded.swap(true, Ordering::Relaxed) {
            tracing::warn!(used, soft_cap = self.soft_cap, "request arena over soft cap");
        }
        Ok(())
    }

    /// Release bytes previously charged (multi-write slot overwrites)
    pub fn discharge(&self, len: usize) {
        self.used.fetch_sub(len.min(self.used.load(Ordering::Relaxed)), Ordering::Relaxed);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn soft_cap(&self) -> usize {
        self.soft_cap
    }

    pub fn hard_cap(&self) -> usize {
        self.hard_cap
    }
}
