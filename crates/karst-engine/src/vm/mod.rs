//! VM runtime: tagged values, the object model, the garbage-collected heap,
//! and stop-the-world coordination.

pub mod gc;
pub mod object;
pub mod safepoint;
pub mod value;

pub use gc::{GarbageCollector, Heap, RootSet};
pub use safepoint::{SafepointCoordinator, StopReason, SuspendAllScope};
pub use value::{ObjAddr, TaggedValue};

use crate::profiler::HeapProfiler;
use std::sync::Arc;

/// One VM runtime context: the heap, its roots, the collector, and the
/// optionally attached heap profiler.
///
/// The profiler is an owned component with an explicit lifecycle
/// ([`get_or_new_heap_profile`](Self::get_or_new_heap_profile) /
/// [`delete_heap_profile`](Self::delete_heap_profile)) rather than a
/// process-wide singleton; the GC hook call sites reach it through the
/// heap's listener registration.
pub struct VmContext {
    heap: Heap,
    roots: RootSet,
    gc: GarbageCollector,
    safepoint: Arc<SafepointCoordinator>,
    profiler: Option<Arc<HeapProfiler>>,
}

impl VmContext {
    pub fn new() -> Self {
        Self {
            heap: Heap::new(),
            roots: RootSet::new(),
            gc: GarbageCollector::new(),
            safepoint: Arc::new(SafepointCoordinator::new()),
            profiler: None,
        }
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    #[inline]
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    #[inline]
    pub fn roots_mut(&mut self) -> &mut RootSet {
        &mut self.roots
    }

    #[inline]
    pub fn safepoint(&self) -> Arc<SafepointCoordinator> {
        Arc::clone(&self.safepoint)
    }

    /// Collector statistics.
    pub fn gc_stats(&self) -> &gc::GcStats {
        self.gc.stats()
    }

    /// Run a full stop-the-world collection.
    pub fn collect_garbage(&mut self) {
        let _scope = SuspendAllScope::new(self.safepoint(), StopReason::GarbageCollection);
        self.gc.collect(&mut self.heap, &mut self.roots);
    }

    /// Collect inside an already-established pause (the profiler holds the
    /// suspend scope when it forces a GC before dumping).
    pub(crate) fn collect_garbage_in_pause(&mut self) {
        self.gc.collect(&mut self.heap, &mut self.roots);
    }

    /// The attached profiler, if any.
    pub fn heap_profile(&self) -> Option<Arc<HeapProfiler>> {
        self.profiler.clone()
    }

    /// Get the attached profiler, creating and wiring one on first use.
    pub fn get_or_new_heap_profile(&mut self) -> Arc<HeapProfiler> {
        if let Some(profiler) = &self.profiler {
            return Arc::clone(profiler);
        }
        let profiler = Arc::new(HeapProfiler::new(self.heap.counters()));
        self.heap
            .set_gc_listener(Some(profiler.clone() as Arc<dyn gc::GcListener>));
        self.profiler = Some(Arc::clone(&profiler));
        profiler
    }

    /// Detach and drop the profiler, unhooking it from the GC.
    pub fn delete_heap_profile(&mut self) {
        self.heap.set_gc_listener(None);
        self.profiler = None;
    }
}

impl Default for VmContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_lifecycle() {
        let mut vm = VmContext::new();
        assert!(vm.heap_profile().is_none());
        let p1 = vm.get_or_new_heap_profile();
        let p2 = vm.get_or_new_heap_profile();
        assert!(Arc::ptr_eq(&p1, &p2));
        vm.delete_heap_profile();
        assert!(vm.heap_profile().is_none());
    }

    #[test]
    fn test_collect_garbage_smoke() {
        let mut vm = VmContext::new();
        let s = vm.heap_mut().alloc_string("rooted");
        vm.roots_mut().add_global(TaggedValue::object(s));
        vm.heap_mut().alloc_string("floating");
        let before = vm.heap().object_count();
        vm.collect_garbage();
        assert!(vm.heap().object_count() < before);
    }
}
