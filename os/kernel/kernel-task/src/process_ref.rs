//! # Weak Process References
//!
//! A [`ProcessRef`] names a process without keeping it alive. Every process
//! carries a [`Liveness`] token; the handles share it, and the process flips
//! it when it dies. A handle to a dead process fails with [`StaleReference`]
//! even if its PID has since been handed out again.

use crate::process::ProcessId;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("process {0} no longer exists")]
pub struct StaleReference(pub ProcessId);

/// Owned by the process; shared with its handles.
#[derive(Debug)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Invalidates every outstanding handle.
    pub fn invalidate(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn handle(&self, pid: ProcessId) -> ProcessRef {
        ProcessRef {
            pid,
            alive: Arc::clone(&self.0),
        }
    }

    /// Number of handles still held.
    #[must_use]
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.0) - 1
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Liveness {
    fn drop(&mut self) {
        self.invalidate();
    }
}

/// Non-owning handle to a process.
#[derive(Debug, Clone)]
pub struct ProcessRef {
    pid: ProcessId,
    alive: Arc<AtomicBool>,
}

impl ProcessRef {
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// The PID, if the process is still alive.
    ///
    /// # Errors
    /// The process died.
    pub fn upgrade(&self) -> Result<ProcessId, StaleReference> {
        if self.is_valid() {
            Ok(self.pid)
        } else {
            Err(StaleReference(self.pid))
        }
    }
}

impl PartialEq for ProcessRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.alive, &other.alive)
    }
}

impl Eq for ProcessRef {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_observe_invalidation() {
        let token = Liveness::new();
        let a = token.handle(ProcessId::new(5));
        let b = a.clone();
        assert_eq!(token.handles(), 2);
        assert_eq!(a.upgrade(), Ok(ProcessId::new(5)));

        token.invalidate();
        assert!(!b.is_valid());
        assert_eq!(a.upgrade(), Err(StaleReference(ProcessId::new(5))));
    }

    #[test]
    fn dropping_the_token_invalidates() {
        let token = Liveness::new();
        let handle = token.handle(ProcessId::new(9));
        drop(token);
        assert!(!handle.is_valid());
    }

    #[test]
    fn equality_is_per_process_instance() {
        let first = Liveness::new();
        let second = Liveness::new();
        let pid = ProcessId::new(3);
        assert_eq!(first.handle(pid), first.handle(pid));
        assert_ne!(first.handle(pid), second.handle(pid));
    }
}
