//! Reachability marking for snapshot construction
//!
//! A breadth-first walk over the managed heap starting from the VM root
//! set. The resulting marked set (with its discovery order) decides which
//! objects become snapshot nodes. Strings are traversal terminals: their
//! hclass is marked but their body is not walked, so rope children show up
//! only if something else references them.

use crate::vm::gc::{Heap, RootSet};
use crate::vm::object::{visit_object_body, ObjectRef};
use crate::vm::value::ObjAddr;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;

/// Mark set over heap addresses, preserving discovery order.
pub struct HeapMarker {
    marked: FxHashSet<ObjAddr>,
    order: Vec<ObjAddr>,
}

impl HeapMarker {
    pub fn new() -> Self {
        Self {
            marked: FxHashSet::default(),
            order: Vec::new(),
        }
    }

    /// Mark `addr`; true iff it was not marked before.
    pub fn mark(&mut self, addr: ObjAddr) -> bool {
        if self.marked.insert(addr) {
            self.order.push(addr);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn is_marked(&self, addr: ObjAddr) -> bool {
        self.marked.contains(&addr)
    }

    /// Visit marked addresses in discovery order.
    pub fn iterate_marked(&self, mut f: impl FnMut(ObjAddr)) {
        for addr in &self.order {
            f(*addr);
        }
    }

    /// Number of marked addresses.
    pub fn count(&self) -> usize {
        self.order.len()
    }
}

impl Default for HeapMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the VM root set (global handles, module table, cached strings).
pub struct RootMarker;

impl RootMarker {
    /// Mark every root and return them in visit order as BFS seeds.
    /// Weak roots are included: the referent is still a live heap object.
    pub fn mark(roots: &RootSet, marker: &mut HeapMarker) -> Vec<ObjAddr> {
        let mut seeds = Vec::new();
        roots.visit(|v| {
            if let Some(addr) = v.heap_addr() {
                if marker.mark(addr) {
                    seeds.push(addr);
                }
            }
        });
        seeds
    }
}

/// Breadth-first object-graph walker.
pub struct ObjectMarker;

impl ObjectMarker {
    /// Traverse from the seed addresses, marking everything reachable.
    ///
    /// Both strong and weak slots are followed: a weakly held object is
    /// still present in the heap and gets a node; only the edge kind
    /// differs. References leaving the heap (never possible for a healthy
    /// heap, tolerated for a corrupt one) are dropped with a diagnostic.
    pub fn traverse(heap: &Heap, marker: &mut HeapMarker, seeds: Vec<ObjAddr>) {
        let mut work: VecDeque<ObjAddr> = seeds.into();
        while let Some(addr) = work.pop_front() {
            let obj = ObjectRef(addr);

            if obj.js_type().is_string() {
                // Terminal: mark the class, skip the body.
                let hclass = obj.hclass();
                if marker.mark(hclass) {
                    work.push_back(hclass);
                }
                continue;
            }

            visit_object_body(obj, |slot| {
                let Some(target) = slot.value.heap_addr() else {
                    return;
                };
                if !heap.contains(target) {
                    log::warn!(
                        "object graph walk: not found member {target:#x} at {addr:#x}+{}",
                        slot.offset
                    );
                    return;
                }
                if marker.mark(target) {
                    work.push_back(target);
                }
            });
        }
    }
}
