//! Stable node identity
//!
//! Maps heap addresses to node ids that survive GC relocation. Ids only
//! ever grow, step by [`SEQ_STEP`]; the even stripe is reserved for future
//! flag bits. Id 1 names the synthetic "GC roots" node and 3 is the first
//! id handed to a real object, so ids stay comparable across consecutive
//! snapshots taken from the same profiler, which is what heap-diff tooling relies on.

use super::marker::HeapMarker;
use crate::vm::value::ObjAddr;
use rustc_hash::FxHashMap;

/// Stable snapshot node id.
pub type NodeId = u64;

/// Stride between consecutively assigned ids.
pub const SEQ_STEP: NodeId = 2;

/// Id of the synthetic "GC roots" pseudo-node.
pub const GC_ROOTS_NODE_ID: NodeId = 1;

/// First id assigned to a real heap object.
pub const FIRST_NODE_ID: NodeId = 3;

/// Address → stable node id table, one per heap profiler.
pub struct EntryIdMap {
    ids: FxHashMap<ObjAddr, NodeId>,
    next_id: NodeId,
}

impl EntryIdMap {
    pub fn new() -> Self {
        Self {
            ids: FxHashMap::default(),
            next_id: FIRST_NODE_ID,
        }
    }

    /// Take the next id from the sequence.
    pub fn get_next_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += SEQ_STEP;
        id
    }

    /// Peek at the id an unknown address would receive.
    pub fn get_last_id(&self) -> NodeId {
        self.next_id
    }

    /// Look up `addr`. On a miss, returns `(false, next_available_id)`
    /// without registering anything; the caller decides whether to commit.
    pub fn find_id(&self, addr: ObjAddr) -> (bool, NodeId) {
        match self.ids.get(&addr) {
            Some(&id) => (true, id),
            None => (false, self.next_id),
        }
    }

    /// Idempotent get-or-create.
    pub fn find_or_insert_id(&mut self, addr: ObjAddr) -> NodeId {
        if let Some(&id) = self.ids.get(&addr) {
            return id;
        }
        let id = self.get_next_id();
        self.ids.insert(addr, id);
        id
    }

    /// Register `id` for `addr`, replacing any previous entry.
    pub fn insert_id(&mut self, addr: ObjAddr, id: NodeId) {
        self.ids.insert(addr, id);
    }

    /// Remove the entry for `addr`.
    pub fn erase_id(&mut self, addr: ObjAddr) -> bool {
        self.ids.remove(&addr).is_some()
    }

    /// Re-key an entry when the GC relocates an object. Returns false (and
    /// mutates nothing) when `old_addr` was never registered; the dropped
    /// move event is tolerated.
    pub fn move_entry(&mut self, old_addr: ObjAddr, new_addr: ObjAddr) -> bool {
        if old_addr == new_addr {
            return true;
        }
        match self.ids.remove(&old_addr) {
            Some(id) => {
                self.ids.insert(new_addr, id);
                true
            }
            None => false,
        }
    }

    /// Delete every entry whose address is not marked. Reclaims the ids of
    /// objects that died since the last assignment pass; must run before an
    /// `EntryIdMap` is reused across dumps in synchronous mode.
    pub fn remove_unmarked_objects(&mut self, marker: &HeapMarker) {
        self.ids.retain(|addr, _| marker.is_marked(*addr));
    }

    /// Number of registered addresses.
    pub fn size(&self) -> usize {
        self.ids.len()
    }

    pub fn contains(&self, addr: ObjAddr) -> bool {
        self.ids.contains_key(&addr)
    }
}

impl Default for EntryIdMap {
    fn default() -> Self {
        Self::new()
    }
}
