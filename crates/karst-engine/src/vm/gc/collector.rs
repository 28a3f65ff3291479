//! Mark-compact garbage collector
//!
//! A full stop-the-world collection: mark the transitive closure of the
//! root set, slide every survivor into fresh regions, rewrite all reference
//! slots (weak references to dead objects are cleared to undefined), and
//! release the old regions. Every relocation is reported through the
//! attached [`GcListener`] so the heap profiler can keep node identity
//! stable across moves.

use super::heap::Heap;
use super::region::{Region, REGION_SIZE};
use super::roots::RootSet;
use super::GcListener;
use crate::vm::object::{visit_object_body, ObjectRef};
use crate::vm::value::{ObjAddr, TaggedValue};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default allocation threshold before a collection is suggested.
pub const DEFAULT_GC_THRESHOLD: usize = 4 * 1024 * 1024;

/// Garbage collector statistics.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total number of collections.
    pub collections: usize,

    /// Total objects freed.
    pub objects_freed: usize,

    /// Total bytes freed.
    pub bytes_freed: usize,

    /// Objects relocated in the last collection.
    pub last_moved_count: usize,

    /// Live objects after the last collection.
    pub live_objects: usize,

    /// Live bytes after the last collection.
    pub live_bytes: usize,

    /// Last collection duration.
    pub last_pause_time: Duration,

    /// Total pause time across all collections.
    pub total_pause_time: Duration,
}

/// Mark-compact collector. Owns policy and statistics; the heap and the
/// root set are borrowed per collection from the owning context.
pub struct GarbageCollector {
    threshold: usize,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            threshold: DEFAULT_GC_THRESHOLD,
            stats: GcStats::default(),
        }
    }

    /// Set the allocation threshold used by [`should_collect`].
    pub fn set_threshold(&mut self, bytes: usize) {
        self.threshold = bytes;
    }

    /// Whether allocated bytes crossed the collection threshold.
    pub fn should_collect(&self, heap: &Heap) -> bool {
        heap.allocated_bytes() > self.threshold
    }

    /// Collector statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Run a full collection. Must be called with all mutators suspended.
    pub fn collect(&mut self, heap: &mut Heap, roots: &mut RootSet) {
        let start = Instant::now();
        let listener = heap.gc_listener();

        let prev_objects = heap.object_count();
        let prev_bytes = heap.allocated_bytes();

        let marked = mark(heap, roots);
        let forward = compact(heap, &marked, listener.as_deref());
        fixup(heap, roots, &forward);

        let duration = start.elapsed();
        self.stats.collections += 1;
        self.stats.last_moved_count = forward.len();
        self.stats.objects_freed += prev_objects - forward.len();
        self.stats.bytes_freed += prev_bytes.saturating_sub(heap.allocated_bytes());
        self.stats.live_objects = heap.object_count();
        self.stats.live_bytes = heap.allocated_bytes();
        self.stats.last_pause_time = duration;
        self.stats.total_pause_time += duration;

        log::debug!(
            "gc: {} live objects ({} bytes), {} moved, pause {:?}",
            self.stats.live_objects,
            self.stats.live_bytes,
            self.stats.last_moved_count,
            duration
        );

        // Grow the threshold to twice the surviving heap.
        self.threshold = (heap.allocated_bytes() * 2).max(DEFAULT_GC_THRESHOLD);
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Mark phase: breadth-first closure over strong references. Weak
/// references do not keep their targets alive.
fn mark(heap: &Heap, roots: &RootSet) -> FxHashSet<ObjAddr> {
    let mut marked = FxHashSet::default();
    let mut work = VecDeque::new();

    let mut push_root = |addr: ObjAddr, work: &mut VecDeque<ObjAddr>| {
        if marked.insert(addr) {
            work.push_back(addr);
        }
    };

    roots.visit(|v| {
        if v.is_object() {
            push_root(v.heap_addr().expect("strong ref has an address"), &mut work);
        }
    });
    let mut base = *heap.base_classes();
    base.for_each_mut(|slot| push_root(*slot, &mut work));

    while let Some(addr) = work.pop_front() {
        visit_object_body(ObjectRef(addr), |slot| {
            if slot.value.is_object() {
                let target = slot.value.heap_addr().expect("strong ref has an address");
                if marked.insert(target) {
                    work.push_back(target);
                }
            }
        });
    }

    marked
}

/// Compact phase: slide survivors into fresh regions in iteration order,
/// reporting each relocation to the listener.
fn compact(
    heap: &mut Heap,
    marked: &FxHashSet<ObjAddr>,
    listener: Option<&dyn GcListener>,
) -> FxHashMap<ObjAddr, ObjAddr> {
    let mut new_regions = vec![Region::new()];
    let mut forward = FxHashMap::default();
    let mut live_bytes = 0usize;

    heap.iterate_over_objects(|addr| {
        if !marked.contains(&addr) {
            return;
        }
        let size = ObjectRef(addr).size();
        assert!(size <= REGION_SIZE);
        let new_addr = match new_regions.last_mut().and_then(|r| r.allocate(size)) {
            Some(a) => a,
            None => {
                let mut region = Region::new();
                let a = region
                    .allocate(size)
                    .expect("fresh region always fits one object");
                new_regions.push(region);
                a
            }
        };
        // SAFETY: source and destination regions are distinct allocations;
        // both stay alive until the old regions are replaced below.
        unsafe {
            std::ptr::copy_nonoverlapping(
                addr as usize as *const u8,
                new_addr as usize as *mut u8,
                size,
            );
        }
        live_bytes += size;
        forward.insert(addr, new_addr);
        if let Some(listener) = listener {
            listener.move_event(addr, new_addr, size);
        }
    });

    let live_objects = forward.len();
    heap.replace_regions(new_regions, live_objects, live_bytes);
    forward
}

/// Fix-up phase: rewrite every reference slot of every survivor, the root
/// set, and the bootstrap class table through the forwarding map.
fn fixup(heap: &mut Heap, roots: &mut RootSet, forward: &FxHashMap<ObjAddr, ObjAddr>) {
    let relocate = |value: TaggedValue| -> TaggedValue {
        match value.heap_addr() {
            Some(old) => match forward.get(&old) {
                Some(&new) => {
                    if value.is_weak() {
                        TaggedValue::weak(new)
                    } else {
                        TaggedValue::object(new)
                    }
                }
                // A weak reference to a reclaimed object is cleared; a
                // dangling strong reference would be a collector bug.
                None => {
                    debug_assert!(value.is_weak(), "strong ref to unmarked object");
                    TaggedValue::undefined()
                }
            },
            None => value,
        }
    };

    heap.iterate_over_objects(|addr| {
        let obj = ObjectRef(addr);
        let mut patches = Vec::new();
        visit_object_body(obj, |slot| {
            if slot.value.is_heap_ref() {
                patches.push((slot.offset, relocate(slot.value)));
            }
        });
        for (offset, value) in patches {
            obj.set_slot(offset, value);
        }
    });

    roots.visit_mut(|slot| *slot = relocate(*slot));
    heap.base_classes_mut().for_each_mut(|slot| {
        *slot = *forward.get(slot).expect("base classes are always live");
    });
}
