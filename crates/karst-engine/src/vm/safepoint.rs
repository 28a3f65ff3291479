//! Stop-the-world coordination
//!
//! Cooperative safepoints: mutator threads call [`SafepointCoordinator::poll`]
//! at allocation and loop back-edges; a thread that needs exclusive heap
//! access takes a [`SuspendAllScope`], which parks every registered mutator
//! until the scope is dropped. Both the collector and the heap profiler run
//! their heap walks inside such a scope.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Reasons for requesting a stop-the-world pause.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Garbage collection.
    GarbageCollection,
    /// Heap snapshot / raw-heap dump.
    HeapDump,
    /// Debugger inspection.
    Debug,
}

/// Coordinates stop-the-world pauses across mutator threads.
pub struct SafepointCoordinator {
    /// Number of registered mutator threads.
    mutator_count: AtomicUsize,

    /// Mutators currently parked at a safepoint.
    parked: AtomicUsize,

    /// A pause is pending; mutators park until it clears.
    pause_pending: AtomicBool,

    /// Current pause reason.
    reason: Mutex<Option<StopReason>>,
}

impl SafepointCoordinator {
    pub fn new() -> Self {
        Self {
            mutator_count: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            pause_pending: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    /// Register the calling thread as a mutator.
    pub fn register_mutator(&self) {
        self.mutator_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Deregister the calling thread.
    pub fn deregister_mutator(&self) {
        self.mutator_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of registered mutators.
    pub fn mutator_count(&self) -> usize {
        self.mutator_count.load(Ordering::Acquire)
    }

    /// Fast check, called frequently from mutator hot paths.
    #[inline(always)]
    pub fn poll(&self) {
        if self.pause_pending.load(Ordering::Acquire) {
            self.park();
        }
    }

    /// Current pause reason, if a pause is active.
    pub fn current_reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }

    #[cold]
    #[inline(never)]
    fn park(&self) {
        self.parked.fetch_add(1, Ordering::AcqRel);
        while self.pause_pending.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_micros(50));
        }
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }

    /// Request a pause and wait for every mutator to park.
    fn request_suspend(&self, reason: StopReason) {
        {
            let mut current = self.reason.lock();
            assert!(
                current.is_none(),
                "cannot request a pause while another is active"
            );
            *current = Some(reason);
        }
        self.pause_pending.store(true, Ordering::Release);

        // Spin with backoff until everyone reached a safepoint.
        let mut backoff = 1u32;
        while self.parked.load(Ordering::Acquire) < self.mutator_count.load(Ordering::Acquire) {
            for _ in 0..backoff {
                std::hint::spin_loop();
            }
            backoff = (backoff * 2).min(1024);
        }
    }

    fn resume(&self) {
        self.pause_pending.store(false, Ordering::Release);
        *self.reason.lock() = None;
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII stop-the-world scope. All registered mutators are parked for the
/// lifetime of this value; dropping it resumes them.
pub struct SuspendAllScope {
    coordinator: Arc<SafepointCoordinator>,
}

impl SuspendAllScope {
    pub fn new(coordinator: Arc<SafepointCoordinator>, reason: StopReason) -> Self {
        coordinator.request_suspend(reason);
        Self { coordinator }
    }
}

impl Drop for SuspendAllScope {
    fn drop(&mut self) {
        self.coordinator.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_no_mutators_suspend_is_immediate() {
        let coord = Arc::new(SafepointCoordinator::new());
        let scope = SuspendAllScope::new(coord.clone(), StopReason::HeapDump);
        assert_eq!(coord.current_reason(), Some(StopReason::HeapDump));
        drop(scope);
        assert_eq!(coord.current_reason(), None);
    }

    #[test]
    fn test_poll_without_pause_returns() {
        let coord = SafepointCoordinator::new();
        coord.poll();
    }

    #[test]
    fn test_mutators_park_during_scope() {
        let coord = Arc::new(SafepointCoordinator::new());
        let progressed = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::new();
        for _ in 0..2 {
            let coord = coord.clone();
            let progressed = progressed.clone();
            let stop = stop.clone();
            coord.register_mutator();
            workers.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    coord.poll();
                    progressed.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(Duration::from_micros(10));
                }
                coord.deregister_mutator();
            }));
        }

        {
            let _scope = SuspendAllScope::new(coord.clone(), StopReason::GarbageCollection);
            // Both mutators are parked; progress halts.
            let before = progressed.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(20));
            let after = progressed.load(Ordering::Relaxed);
            assert_eq!(before, after);
        }

        stop.store(true, Ordering::Release);
        for w in workers {
            w.join().unwrap();
        }
    }
}
