//! Thread-confinement guard for the multiplexer's registries.

use std::thread::{self, ThreadId};

/// Records the owning thread at construction and asserts that all further
/// access happens on that thread.
///
/// The multiplexer's buffers and registries use no internal locking; the
/// guard substitutes for a locking discipline by turning cross-thread access
/// into an immediate, loud failure instead of silent corruption. The runnable
/// queue is the only component exempt from the guard.
#[derive(Debug)]
pub struct ThreadGuard {
    owner: ThreadId,
}

impl ThreadGuard {
    /// Creates a guard owned by the calling thread.
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
        }
    }

    /// Panics when called from any thread other than the owner.
    #[track_caller]
    pub fn check(&self) {
        let current = thread::current().id();
        assert_eq!(
            self.owner, current,
            "multiplexer state accessed from a foreign thread (owner {:?}, caller {:?})",
            self.owner, current
        );
    }
}

impl Default for ThreadGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_thread_passes() {
        let guard = ThreadGuard::new();
        guard.check();
    }

    #[test]
    fn foreign_thread_panics() {
        let guard = ThreadGuard::new();
        let result = thread::spawn(move || guard.check()).join();
        assert!(result.is_err());
    }
}
