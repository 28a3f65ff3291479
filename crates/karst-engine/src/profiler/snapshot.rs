//! In-memory snapshot graph
//!
//! One [`HeapSnapshot`] is a point-in-time materialization of the
//! reachable-object graph: an index-addressed node arena, a flat edge list
//! grouped by source node, a deduplicated string table, an optional
//! allocation-site trace tree, and tracking-mode time stamps. Nodes are
//! addressed by index; a side table maps the current heap address to the
//! index and is rewritten transactionally on every GC move event, so a raw
//! pointer is never a long-lived key.

use super::entry_id_map::{EntryIdMap, NodeId, GC_ROOTS_NODE_ID};
use super::marker::{HeapMarker, ObjectMarker, RootMarker};
use super::string_table::{StringId, StringTable};
use crate::vm::gc::{Heap, RootSet};
use crate::vm::object::{
    visit_object_body, JsType, ObjectRef, SlotKind, LINE_STRING_STRUCT_SIZE,
    SLICED_STRING_STRUCT_SIZE, TREE_STRING_STRUCT_SIZE,
};
use crate::vm::value::ObjAddr;
use rustc_hash::FxHashMap;

/// Scalars per node record in the flattened `nodes` array.
pub const NODE_FIELD_COUNT: u32 = 8;

/// Scalars per edge record in the flattened `edges` array.
pub const EDGE_FIELD_COUNT: u32 = 3;

/// Snapshot node categories, in wire order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Hidden = 0,
    Array = 1,
    String = 2,
    Object = 3,
    Code = 4,
    Closure = 5,
    Regexp = 6,
    HeapNumber = 7,
    Native = 8,
    Synthetic = 9,
    ConsString = 10,
    SlicedString = 11,
    Symbol = 12,
    BigInt = 13,
}

/// Edge categories, in wire order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    Context = 0,
    Element = 1,
    Property = 2,
    Internal = 3,
    Hidden = 4,
    Shortcut = 5,
    Weak = 6,
}

/// One heap object in the snapshot.
#[derive(Debug, Clone)]
pub struct Node {
    /// Stable id from the [`EntryIdMap`].
    pub id: NodeId,
    /// Position in the emitted node array.
    pub index: u32,
    pub name: StringId,
    pub node_type: NodeType,
    pub self_size: usize,
    pub native_size: usize,
    pub edge_count: u32,
    /// Allocation-site id, 0 when allocation tracing is off.
    pub trace_id: u32,
    /// Current heap address; ephemeral, rewritten on GC moves.
    pub address: ObjAddr,
    pub is_live: bool,
}

/// An edge carries either a name or a numeric index, keyed by its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeNameOrIndex {
    Name(StringId),
    Index(u32),
}

/// One reference between two nodes. `from`/`to` are node indices into the
/// owning snapshot's arena.
#[derive(Debug, Clone)]
pub struct Edge {
    pub edge_type: EdgeType,
    pub from: u32,
    pub to: u32,
    pub name_or_index: EdgeNameOrIndex,
}

/// One entry of the `trace_function_infos` table.
#[derive(Debug, Clone)]
pub struct TraceFunctionInfo {
    pub function_id: u32,
    pub name: StringId,
    pub script_name: StringId,
    pub script_id: u32,
    pub line: u32,
    pub column: u32,
}

/// Allocation-site call tree node.
#[derive(Debug, Clone)]
pub struct TraceNode {
    pub id: u32,
    pub function_info_index: u32,
    pub count: u32,
    pub size: u32,
    pub children: Vec<TraceNode>,
}

/// Allocation-site call tree. Flat in practice (one level under the root:
/// the VM records no interpreter stacks), but emitted with the recursive
/// wire shape.
#[derive(Debug, Clone)]
pub struct TraceTree {
    pub root: TraceNode,
    next_id: u32,
}

impl TraceTree {
    pub fn new() -> Self {
        Self {
            root: TraceNode {
                id: 1,
                function_info_index: 0,
                count: 0,
                size: 0,
                children: Vec::new(),
            },
            next_id: 2,
        }
    }

    /// Record one allocation under the site `function_info_index`.
    /// Returns the trace-node id for the allocated node.
    pub fn add_allocation(&mut self, function_info_index: u32, size: usize) -> u32 {
        if let Some(child) = self
            .root
            .children
            .iter_mut()
            .find(|c| c.function_info_index == function_info_index)
        {
            child.count += 1;
            child.size += size as u32;
            return child.id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.root.children.push(TraceNode {
            id,
            function_info_index,
            count: 1,
            size: size as u32,
            children: Vec::new(),
        });
        id
    }
}

impl Default for TraceTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracking-mode heap sample.
#[derive(Debug, Clone, Copy)]
pub struct TimeStamp {
    /// Highest node id assigned when the sample was taken.
    pub last_sequence_id: NodeId,
    pub timestamp_us: u64,
    pub size: usize,
    pub count: u32,
}

/// Point-in-time snapshot of the reachable heap graph.
pub struct HeapSnapshot {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    addr_to_node: FxHashMap<ObjAddr, u32>,
    strings: StringTable,
    trace_infos: Vec<TraceFunctionInfo>,
    trace_tree: TraceTree,
    trace_sites: FxHashMap<StringId, u32>,
    samples: Vec<TimeStamp>,
    root_addrs: Vec<ObjAddr>,

    private_mode: bool,
    capture_numeric: bool,
    simplify: bool,
    trace_allocation: bool,
}

impl HeapSnapshot {
    pub fn new(
        private_mode: bool,
        capture_numeric: bool,
        simplify: bool,
        trace_allocation: bool,
    ) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            addr_to_node: FxHashMap::default(),
            strings: StringTable::new(),
            trace_infos: Vec::new(),
            trace_tree: TraceTree::new(),
            trace_sites: FxHashMap::default(),
            samples: Vec::new(),
            root_addrs: Vec::new(),
            private_mode,
            capture_numeric,
            simplify,
            trace_allocation,
        }
    }

    // ── Accessors (serializers read these) ─────────────────────────────

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StringTable {
        &mut self.strings
    }

    pub fn trace_function_infos(&self) -> &[TraceFunctionInfo] {
        &self.trace_infos
    }

    pub fn trace_tree(&self) -> &TraceTree {
        &self.trace_tree
    }

    pub fn samples(&self) -> &[TimeStamp] {
        &self.samples
    }

    pub fn node_for_addr(&self, addr: ObjAddr) -> Option<&Node> {
        self.addr_to_node.get(&addr).map(|&i| &self.nodes[i as usize])
    }

    /// Highest node id in the snapshot.
    pub fn last_node_id(&self) -> NodeId {
        self.nodes.iter().map(|n| n.id).max().unwrap_or(GC_ROOTS_NODE_ID)
    }

    // ── Construction ───────────────────────────────────────────────────

    /// Install the synthetic "GC roots" pseudo-node at index 0.
    pub fn prepare(&mut self) {
        debug_assert!(self.nodes.is_empty(), "prepare must run on a fresh snapshot");
        let name = self.strings.get_or_insert("GC Roots");
        self.nodes.push(Node {
            id: GC_ROOTS_NODE_ID,
            index: 0,
            name,
            node_type: NodeType::Synthetic,
            self_size: 0,
            native_size: 0,
            edge_count: 0,
            trace_id: 0,
            address: 0,
            is_live: true,
        });
    }

    /// Walk the heap from the root set, build all nodes, then all edges.
    pub fn build_up(&mut self, heap: &Heap, roots: &RootSet, ids: &mut EntryIdMap) -> bool {
        self.prepare();

        let mut marker = HeapMarker::new();
        let seeds = RootMarker::mark(roots, &mut marker);
        self.root_addrs = seeds.clone();
        ObjectMarker::traverse(heap, &mut marker, seeds);

        self.fill_nodes(&marker, ids);
        self.fill_edges();
        true
    }

    fn fill_nodes(&mut self, marker: &HeapMarker, ids: &mut EntryIdMap) {
        marker.iterate_marked(|addr| {
            self.generate_node(ObjectRef(addr), ids);
        });
    }

    /// Classify one heap object into a node. Returns its index.
    pub fn generate_node(&mut self, obj: ObjectRef, ids: &mut EntryIdMap) -> u32 {
        if let Some(&idx) = self.addr_to_node.get(&obj.addr()) {
            return idx;
        }
        let ty = obj.js_type();
        let (node_type, name, self_size, native_size, trace_id) = if ty.is_string() {
            self.handle_string_node(obj, ty)
        } else if ty == JsType::Function {
            self.handle_function_node(obj)
        } else {
            self.handle_object_node(obj, ty)
        };

        let id = ids.find_or_insert_id(obj.addr());
        let index = self.nodes.len() as u32;
        self.addr_to_node.insert(obj.addr(), index);
        self.nodes.push(Node {
            id,
            index,
            name,
            node_type,
            self_size,
            native_size,
            edge_count: 0,
            trace_id,
            address: obj.addr(),
            is_live: true,
        });
        index
    }

    fn handle_string_node(
        &mut self,
        obj: ObjectRef,
        ty: JsType,
    ) -> (NodeType, StringId, usize, usize, u32) {
        let node_type = match ty {
            JsType::TreeString => NodeType::ConsString,
            JsType::SlicedString => NodeType::SlicedString,
            _ => NodeType::String,
        };
        // Private dumps never capture character content; the node keeps a
        // self-size consistent with its structural representation.
        let (name, self_size) = if self.private_mode {
            let size = match ty {
                JsType::TreeString => TREE_STRING_STRUCT_SIZE,
                JsType::SlicedString => SLICED_STRING_STRUCT_SIZE,
                _ => LINE_STRING_STRUCT_SIZE,
            };
            (self.strings.get_or_insert(""), size)
        } else {
            let mut content = Vec::new();
            flatten_string(obj, &mut content, 0);
            (self.strings.insert_bytes(&content), obj.size())
        };
        (node_type, name, self_size, 0, 0)
    }

    fn handle_function_node(&mut self, obj: ObjectRef) -> (NodeType, StringId, usize, usize, u32) {
        let name = match obj.function_name().heap_addr() {
            Some(name_addr) => {
                let mut content = Vec::new();
                flatten_string(ObjectRef(name_addr), &mut content, 0);
                self.strings.insert_bytes(&content)
            }
            None => self.strings.get_or_insert("(anonymous)"),
        };
        let trace_id = if self.trace_allocation && !self.simplify {
            self.trace_allocation_site(name, obj.size())
        } else {
            0
        };
        (NodeType::Closure, name, obj.size(), 0, trace_id)
    }

    fn handle_object_node(
        &mut self,
        obj: ObjectRef,
        ty: JsType,
    ) -> (NodeType, StringId, usize, usize, u32) {
        let class_name = |snapshot: &mut Self| {
            let hclass = ObjectRef(obj.hclass());
            match hclass.hclass_name().heap_addr() {
                Some(name_addr) => {
                    let mut content = Vec::new();
                    flatten_string(ObjectRef(name_addr), &mut content, 0);
                    snapshot.strings.insert_bytes(&content)
                }
                None => snapshot.strings.get_or_insert("Object"),
            }
        };
        match ty {
            JsType::Array => (NodeType::Array, class_name(self), obj.size(), 0, 0),
            JsType::Hclass => (NodeType::Hidden, class_name(self), obj.size(), 0, 0),
            JsType::HeapNumber => {
                let name = if self.capture_numeric && !self.simplify {
                    let formatted = format_number(obj.number_value());
                    self.strings.get_or_insert(&formatted)
                } else {
                    self.strings.get_or_insert("number")
                };
                (NodeType::HeapNumber, name, obj.size(), 0, 0)
            }
            JsType::BigInt => (
                NodeType::BigInt,
                self.strings.get_or_insert("bigint"),
                obj.size(),
                0,
                0,
            ),
            JsType::Symbol => (
                NodeType::Symbol,
                self.strings.get_or_insert("symbol"),
                obj.size(),
                0,
                0,
            ),
            JsType::NativeBinding => {
                (NodeType::Native, class_name(self), obj.size(), obj.native_size(), 0)
            }
            _ => (NodeType::Object, class_name(self), obj.size(), 0, 0),
        }
    }

    fn trace_allocation_site(&mut self, name: StringId, size: usize) -> u32 {
        if self.trace_infos.is_empty() {
            let root_name = self.strings.get_or_insert("(root)");
            let empty = self.strings.get_or_insert("");
            self.trace_infos.push(TraceFunctionInfo {
                function_id: 0,
                name: root_name,
                script_name: empty,
                script_id: 0,
                line: 0,
                column: 0,
            });
        }
        let info_index = match self.trace_sites.get(&name) {
            Some(&i) => i,
            None => {
                let i = self.trace_infos.len() as u32;
                let empty = self.strings.get_or_insert("");
                self.trace_infos.push(TraceFunctionInfo {
                    function_id: i,
                    name,
                    script_name: empty,
                    script_id: 0,
                    line: 0,
                    column: 0,
                });
                self.trace_sites.insert(name, i);
                i
            }
        };
        self.trace_tree.add_allocation(info_index, size)
    }

    /// Second pass: re-walk reference slots and resolve them to nodes.
    /// Unresolvable targets are logged and dropped; the dump proceeds with
    /// a best-effort graph.
    fn fill_edges(&mut self) {
        // Synthetic root → every root object.
        for (ordinal, root) in self.root_addrs.clone().into_iter().enumerate() {
            if let Some(&to) = self.addr_to_node.get(&root) {
                self.push_edge(0, to, EdgeType::Element, EdgeNameOrIndex::Index(ordinal as u32));
            }
        }

        for index in 1..self.nodes.len() as u32 {
            if !self.nodes[index as usize].is_live {
                continue;
            }
            let addr = self.nodes[index as usize].address;
            let obj = ObjectRef(addr);
            if obj.js_type().is_string() {
                // Terminal: a string node contributes no edges, matching
                // the marker's traversal rule.
                continue;
            }
            let mut slots = Vec::new();
            visit_object_body(obj, |slot| slots.push(slot));
            for slot in slots {
                let Some(target) = slot.value.heap_addr() else {
                    continue;
                };
                let Some(&to) = self.addr_to_node.get(&target) else {
                    log::warn!(
                        "edge build: not found member {target:#x} referenced from {addr:#x}"
                    );
                    continue;
                };
                let (mut edge_type, name_or_index) = self.classify_slot(obj, slot.kind);
                if slot.value.is_weak() {
                    edge_type = EdgeType::Weak;
                }
                self.push_edge(index, to, edge_type, name_or_index);
            }
        }
    }

    fn classify_slot(&mut self, obj: ObjectRef, kind: SlotKind) -> (EdgeType, EdgeNameOrIndex) {
        match kind {
            SlotKind::Hclass => (
                EdgeType::Hidden,
                EdgeNameOrIndex::Name(self.strings.get_or_insert("hclass")),
            ),
            SlotKind::Element(i) => (EdgeType::Element, EdgeNameOrIndex::Index(i)),
            SlotKind::Internal(name) => (
                EdgeType::Internal,
                EdgeNameOrIndex::Name(self.strings.get_or_insert(name)),
            ),
            SlotKind::Context(name) => (
                EdgeType::Context,
                EdgeNameOrIndex::Name(self.strings.get_or_insert(name)),
            ),
            SlotKind::Property(i) => {
                let name = self
                    .property_name(obj, i)
                    .unwrap_or_else(|| i.to_string());
                (
                    EdgeType::Property,
                    EdgeNameOrIndex::Name(self.strings.get_or_insert(&name)),
                )
            }
        }
    }

    fn property_name(&self, obj: ObjectRef, index: u32) -> Option<String> {
        let layout = ObjectRef(obj.hclass()).hclass_layout().heap_addr()?;
        let layout = ObjectRef(layout);
        if layout.js_type() != JsType::Array || index as usize >= layout.array_len() {
            return None;
        }
        let name_addr = layout.array_element(index as usize).heap_addr()?;
        let mut content = Vec::new();
        flatten_string(ObjectRef(name_addr), &mut content, 0);
        Some(String::from_utf8_lossy(&content).into_owned())
    }

    fn push_edge(
        &mut self,
        from: u32,
        to: u32,
        edge_type: EdgeType,
        name_or_index: EdgeNameOrIndex,
    ) {
        self.edges.push(Edge {
            edge_type,
            from,
            to,
            name_or_index,
        });
        self.nodes[from as usize].edge_count += 1;
    }

    // ── Tracking mode ──────────────────────────────────────────────────

    /// Incremental refresh for heap-tracking: keep nodes whose address
    /// still holds a live object of matching type and size, add nodes for
    /// new allocations, and mark vanished nodes dead. When `is_in_finish`,
    /// rebuild the edge list for the final serialization.
    pub fn update_nodes(&mut self, heap: &Heap, ids: &mut EntryIdMap, is_in_finish: bool) {
        let mut current = Vec::new();
        heap.iterate_over_objects(|addr| current.push(addr));

        let mut seen = FxHashMap::default();
        for addr in &current {
            seen.insert(*addr, true);
        }

        for node in &mut self.nodes {
            if node.index == 0 {
                continue;
            }
            if !seen.contains_key(&node.address) {
                node.is_live = false;
            }
        }

        for addr in current {
            let obj = ObjectRef(addr);
            match self.addr_to_node.get(&addr) {
                Some(&idx) => {
                    let node = &self.nodes[idx as usize];
                    let same_kind = node_type_for(obj.js_type()) == node.node_type
                        && (self.private_mode || node.self_size == obj.size());
                    if same_kind {
                        self.nodes[idx as usize].is_live = true;
                    } else {
                        // The address was reused by a different object.
                        self.nodes[idx as usize].is_live = false;
                        ids.erase_id(addr);
                        self.addr_to_node.remove(&addr);
                        self.generate_node(obj, ids);
                    }
                }
                None => {
                    self.generate_node(obj, ids);
                }
            }
        }

        if is_in_finish {
            self.rebuild_edges();
        }
    }

    fn rebuild_edges(&mut self) {
        self.edges.clear();
        for node in &mut self.nodes {
            node.edge_count = 0;
        }
        self.fill_edges();
    }

    /// Record a tracking-mode sample.
    pub fn add_time_stamp(&mut self, heap: &Heap, timestamp_us: u64, ids: &EntryIdMap) {
        self.samples.push(TimeStamp {
            last_sequence_id: ids.get_last_id(),
            timestamp_us,
            size: heap.allocated_bytes(),
            count: heap.object_count() as u32,
        });
    }

    // ── GC move hook ───────────────────────────────────────────────────

    /// Relocate a node when the GC moves its object. Safe to call inside a
    /// GC pause with no extra locking; the profiler additionally guards it
    /// with its own mutex for other callers.
    pub fn move_node(&mut self, address: ObjAddr, forward_address: ObjAddr, size: usize) {
        let Some(idx) = self.addr_to_node.remove(&address) else {
            return;
        };
        self.addr_to_node.insert(forward_address, idx);
        let node = &mut self.nodes[idx as usize];
        node.address = forward_address;
        node.self_size = size;
    }

    // ── Offline (binary-mode) construction ─────────────────────────────

    /// Append a node reconstructed from a decoded raw-heap record.
    pub fn add_node_for_bin_mod(
        &mut self,
        id: NodeId,
        name: StringId,
        node_type: NodeType,
        self_size: usize,
        native_size: usize,
        addr: ObjAddr,
    ) -> u32 {
        let index = self.nodes.len() as u32;
        self.addr_to_node.insert(addr, index);
        self.nodes.push(Node {
            id,
            index,
            name,
            node_type,
            self_size,
            native_size,
            edge_count: 0,
            trace_id: 0,
            address: addr,
            is_live: true,
        });
        index
    }

    /// Append an edge during offline reconstruction.
    pub fn add_edge_for_bin_mod(
        &mut self,
        from: u32,
        to: u32,
        edge_type: EdgeType,
        name_or_index: EdgeNameOrIndex,
    ) {
        self.push_edge(from, to, edge_type, name_or_index);
    }

    /// Node index for a decoded address, if present.
    pub fn node_index_for_addr(&self, addr: ObjAddr) -> Option<u32> {
        self.addr_to_node.get(&addr).copied()
    }

    /// Resolve an edge-classification against a decoded object view.
    pub fn classify_slot_for_bin_mod(
        &mut self,
        obj: ObjectRef,
        kind: SlotKind,
    ) -> (EdgeType, EdgeNameOrIndex) {
        self.classify_slot(obj, kind)
    }
}

/// Snapshot node type for a runtime kind (used by tracking-mode matching).
pub fn node_type_for(ty: JsType) -> NodeType {
    match ty {
        JsType::LineString => NodeType::String,
        JsType::TreeString => NodeType::ConsString,
        JsType::SlicedString => NodeType::SlicedString,
        JsType::Array => NodeType::Array,
        JsType::Function => NodeType::Closure,
        JsType::HeapNumber => NodeType::HeapNumber,
        JsType::BigInt => NodeType::BigInt,
        JsType::Symbol => NodeType::Symbol,
        JsType::NativeBinding => NodeType::Native,
        JsType::Hclass => NodeType::Hidden,
        JsType::Object => NodeType::Object,
    }
}

/// Flatten any string representation into UTF-8 bytes. Depth-limited so a
/// corrupt rope cannot recurse unboundedly.
pub fn flatten_string(obj: ObjectRef, out: &mut Vec<u8>, depth: u32) {
    const MAX_DEPTH: u32 = 32;
    if depth > MAX_DEPTH {
        return;
    }
    match obj.js_type() {
        JsType::LineString => out.extend_from_slice(obj.line_string_bytes()),
        JsType::TreeString => {
            if let Some(first) = obj.tree_string_first().heap_addr() {
                flatten_string(ObjectRef(first), out, depth + 1);
            }
            if let Some(second) = obj.tree_string_second().heap_addr() {
                flatten_string(ObjectRef(second), out, depth + 1);
            }
        }
        JsType::SlicedString => {
            if let Some(parent) = obj.sliced_string_parent().heap_addr() {
                let mut parent_bytes = Vec::new();
                flatten_string(ObjectRef(parent), &mut parent_bytes, depth + 1);
                let start = (obj.read_word(8) as u32 as usize).min(parent_bytes.len());
                let end = (start + obj.string_len()).min(parent_bytes.len());
                out.extend_from_slice(&parent_bytes[start..end]);
            }
        }
        _ => {}
    }
}

/// Format a heap number the way the tooling expects: integral values
/// without a trailing `.0`.
fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::TaggedValue;

    fn build(heap: &Heap, roots: &RootSet, ids: &mut EntryIdMap) -> HeapSnapshot {
        let mut snapshot = HeapSnapshot::new(false, false, false, false);
        snapshot.build_up(heap, roots, ids);
        snapshot
    }

    #[test]
    fn test_synthetic_root_node() {
        let heap = Heap::new();
        let roots = RootSet::new();
        let mut ids = EntryIdMap::new();
        let snapshot = build(&heap, &roots, &mut ids);
        assert_eq!(snapshot.nodes()[0].id, GC_ROOTS_NODE_ID);
        assert_eq!(snapshot.nodes()[0].node_type, NodeType::Synthetic);
        assert_eq!(snapshot.nodes().len(), 1); // empty root set
    }

    #[test]
    fn test_nodes_cover_reachable_objects() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let mut ids = EntryIdMap::new();

        let cls = heap.new_object_class("Thing", &["payload"]);
        let s = heap.alloc_string("hello");
        let obj = heap.alloc_object(cls, &[TaggedValue::object(s)]);
        roots.add_global(TaggedValue::object(obj));

        let snapshot = build(&heap, &roots, &mut ids);

        let obj_node = snapshot.node_for_addr(obj).expect("object node");
        assert_eq!(obj_node.node_type, NodeType::Object);
        assert_eq!(snapshot.strings().get(obj_node.name), "Thing");

        let str_node = snapshot.node_for_addr(s).expect("string node");
        assert_eq!(str_node.node_type, NodeType::String);
        assert_eq!(snapshot.strings().get(str_node.name), "hello");
        assert_eq!(str_node.self_size, 24);
    }

    #[test]
    fn test_edges_resolve_and_count() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let mut ids = EntryIdMap::new();

        let arr = heap.alloc_array(&[TaggedValue::int(1)]);
        let holder = heap.alloc_array(&[TaggedValue::object(arr)]);
        roots.add_global(TaggedValue::object(holder));

        let snapshot = build(&heap, &roots, &mut ids);

        // Meta-header invariant: per-node counts sum to the edge total.
        let total: u32 = snapshot.nodes().iter().map(|n| n.edge_count).sum();
        assert_eq!(total as usize, snapshot.edges().len());

        // Root node points at the rooted holder.
        let root_edges: Vec<_> = snapshot.edges().iter().filter(|e| e.from == 0).collect();
        assert_eq!(root_edges.len(), 1);
        let holder_idx = snapshot.node_index_for_addr(holder).unwrap();
        assert_eq!(root_edges[0].to, holder_idx);

        // holder[0] is an element edge to the inner array.
        let arr_idx = snapshot.node_index_for_addr(arr).unwrap();
        assert!(snapshot
            .edges()
            .iter()
            .any(|e| e.from == holder_idx
                && e.to == arr_idx
                && e.edge_type == EdgeType::Element
                && e.name_or_index == EdgeNameOrIndex::Index(0)));
    }

    #[test]
    fn test_property_edges_use_layout_names() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let mut ids = EntryIdMap::new();

        let cls = heap.new_object_class("Point", &["x", "y"]);
        let x = heap.alloc_number(1.0);
        let y = heap.alloc_number(2.0);
        let p = heap.alloc_object(cls, &[TaggedValue::object(x), TaggedValue::object(y)]);
        roots.add_global(TaggedValue::object(p));

        let mut snapshot = build(&heap, &roots, &mut ids);
        let p_idx = snapshot.node_index_for_addr(p).unwrap();
        let x_idx = snapshot.node_index_for_addr(x).unwrap();
        let x_name = snapshot.strings_mut().get_or_insert("x");
        assert!(snapshot.edges().iter().any(|e| e.from == p_idx
            && e.to == x_idx
            && e.edge_type == EdgeType::Property
            && e.name_or_index == EdgeNameOrIndex::Name(x_name)));
    }

    #[test]
    fn test_weak_edges_are_typed_weak() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let mut ids = EntryIdMap::new();

        let target = heap.alloc_string("weak target");
        let holder = heap.alloc_array(&[TaggedValue::weak(target)]);
        roots.add_global(TaggedValue::object(holder));

        let snapshot = build(&heap, &roots, &mut ids);
        let holder_idx = snapshot.node_index_for_addr(holder).unwrap();
        let target_idx = snapshot.node_index_for_addr(target).unwrap();
        assert!(snapshot
            .edges()
            .iter()
            .any(|e| e.from == holder_idx && e.to == target_idx && e.edge_type == EdgeType::Weak));
    }

    #[test]
    fn test_private_mode_hides_string_content() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let mut ids = EntryIdMap::new();

        let a = heap.alloc_string("secret");
        let b = heap.alloc_string("other half");
        let rope = heap.alloc_tree_string(a, b);
        roots.add_global(TaggedValue::object(a));
        roots.add_global(TaggedValue::object(rope));

        let mut snapshot = HeapSnapshot::new(true, false, false, false);
        snapshot.build_up(&heap, &roots, &mut ids);

        let line = snapshot.node_for_addr(a).unwrap();
        assert_eq!(snapshot.strings().get(line.name), "");
        assert_eq!(line.self_size, 24);

        let cons = snapshot.node_for_addr(rope).unwrap();
        assert_eq!(snapshot.strings().get(cons.name), "");
        assert_eq!(cons.self_size, 32);

        // No interned string carries the secret content.
        assert!(!snapshot.strings().iter().any(|s| s.contains("secret")));
    }

    #[test]
    fn test_capture_numeric_value() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let mut ids = EntryIdMap::new();

        let n = heap.alloc_number(42.0);
        roots.add_global(TaggedValue::object(n));

        let mut snapshot = HeapSnapshot::new(false, true, false, false);
        snapshot.build_up(&heap, &roots, &mut ids);
        let node = snapshot.node_for_addr(n).unwrap();
        assert_eq!(snapshot.strings().get(node.name), "42");
    }

    #[test]
    fn test_move_node_preserves_identity() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let mut ids = EntryIdMap::new();

        let s = heap.alloc_string("movable");
        roots.add_global(TaggedValue::object(s));
        let mut snapshot = build(&heap, &roots, &mut ids);

        let id_before = snapshot.node_for_addr(s).unwrap().id;
        snapshot.move_node(s, 0xDEAD_B000, 24);
        assert!(snapshot.node_for_addr(s).is_none());
        let node = snapshot.node_for_addr(0xDEAD_B000).unwrap();
        assert_eq!(node.id, id_before);
        assert_eq!(node.address, 0xDEAD_B000);
    }

    #[test]
    fn test_update_nodes_tracks_new_allocations() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let mut ids = EntryIdMap::new();

        let s = heap.alloc_string("first");
        roots.add_global(TaggedValue::object(s));
        let mut snapshot = build(&heap, &roots, &mut ids);
        let before = snapshot.nodes().len();

        heap.alloc_string("second");
        snapshot.update_nodes(&heap, &mut ids, false);
        assert!(snapshot.nodes().len() > before);
    }

    #[test]
    fn test_trace_tree_aggregates_sites() {
        let mut tree = TraceTree::new();
        let a = tree.add_allocation(1, 24);
        let b = tree.add_allocation(1, 24);
        let c = tree.add_allocation(2, 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(tree.root.children.len(), 2);
        assert_eq!(tree.root.children[0].count, 2);
        assert_eq!(tree.root.children[0].size, 48);
    }

    #[test]
    fn test_flatten_string_representations() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("hello ");
        let b = heap.alloc_string("world");
        let rope = heap.alloc_tree_string(a, b);
        let slice = heap.alloc_sliced_string(rope, 6, 5);

        let mut out = Vec::new();
        flatten_string(ObjectRef(rope), &mut out, 0);
        assert_eq!(out, b"hello world");

        let mut out = Vec::new();
        flatten_string(ObjectRef(slice), &mut out, 0);
        assert_eq!(out, b"world");
    }
}
