//! Job generation tracking and cooperative cancellation.
//!
//! One controller is shared by the scan coordinator and the correlation
//! analyzer: at most one job runs at a time, and every inbound event is
//! checked against the current generation so late events from a superseded
//! run are discarded rather than processed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct OperationController {
    generation: AtomicU64,
    active: AtomicBool,
}

impl OperationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the controller for a new job and returns its generation.
    ///
    /// Fails if another job is already active; callers must surface this
    /// as a protocol error, never queue silently.
    pub fn begin(&self) -> Option<u64> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Marks the given generation's job as finished.
    ///
    /// A stale generation (job already superseded by `cancel`) is a no-op.
    pub fn finish(&self, generation: u64) {
        if self.current() == generation {
            self.active.store(false, Ordering::Release);
        }
    }

    /// Cancels the active job and bumps the generation so any event still
    /// in flight for the old run compares stale.
    pub fn cancel(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.active.store(false, Ordering::Release);
        next
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_allocates_monotonic_generations() {
        let controller = OperationController::new();
        let first = controller.begin().unwrap();
        controller.finish(first);
        let second = controller.begin().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_begin_rejected_while_active() {
        let controller = OperationController::new();
        let generation = controller.begin().unwrap();
        assert!(controller.begin().is_none());
        controller.finish(generation);
        assert!(controller.begin().is_some());
    }

    #[test]
    fn test_cancel_invalidates_generation() {
        let controller = OperationController::new();
        let generation = controller.begin().unwrap();
        assert!(controller.is_current(generation));
        controller.cancel();
        assert!(!controller.is_current(generation));
        assert!(!controller.is_active());
    }

    #[test]
    fn test_finish_with_stale_generation_is_noop() {
        let controller = OperationController::new();
        let old = controller.begin().unwrap();
        controller.cancel();
        let new = controller.begin().unwrap();
        controller.finish(old);
        assert!(controller.is_active());
        controller.finish(new);
        assert!(!controller.is_active());
    }
}
