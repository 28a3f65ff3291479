//! Offline raw-heap decoding
//!
//! Reconstructs a heap graph from serialized bytes with no live VM: read
//! the trailer to find the sections, copy every object record into a fresh
//! aligned buffer, then relocate: substitute each dump-space address
//! (raw pointer in V1, synthetic in V2) with the corresponding buffer
//! address, rewriting reference slots in place exactly the way a moving
//! collector would. The relocated buffers can then be walked with the
//! ordinary object-model accessors to rebuild nodes and edges.
//!
//! Robustness policy: a bad unit size in any section header aborts the
//! decode; a bad individual record (truncated, unresolvable) is logged and
//! skipped so one corrupt object cannot sink the whole snapshot.

use super::{
    RawHeapError, BYTE_UNIT, SECTION_COUNT, TRAILER_UNIT, V1_NAME_UNIT, V1_OBJECT_UNIT,
    V1_ROOT_UNIT, V2_NAME_UNIT, V2_OBJECT_UNIT, V2_ROOT_UNIT, VERSION_V1, VERSION_V2,
};
use crate::profiler::entry_id_map::NodeId;
use crate::profiler::snapshot::{node_type_for, HeapSnapshot, NodeType};
use crate::vm::object::{visit_object_body, JsType, ObjectRef, WORD_SIZE};
use crate::vm::value::{ObjAddr, TaggedValue};
use rustc_hash::FxHashMap;

/// Wire version of a dump file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawHeapVersion {
    V1,
    V2,
}

impl RawHeapVersion {
    /// Detect the version from the 8-byte magic. Dumps from before the
    /// version field existed carry zeroes and decode as V1.
    pub fn from_magic(magic: &[u8; 8]) -> Option<Self> {
        if *magic == VERSION_V1 || *magic == [0u8; 8] {
            Some(Self::V1)
        } else if *magic == VERSION_V2 {
            Some(Self::V2)
        } else {
            None
        }
    }
}

/// One decoded object record.
#[derive(Debug, Clone, Copy)]
pub struct DecodedObject {
    /// Address in the dump's own address space.
    pub dump_addr: u64,
    pub id: NodeId,
    /// Size recorded in the object table.
    pub size: usize,
    /// Address of the relocated copy.
    pub new_addr: ObjAddr,
    /// Whether the full `size` bytes were present in the memory section.
    pub complete: bool,
    /// Whether the hclass word resolved to a decoded object.
    pub hclass_resolved: bool,
}

/// A fully decoded and relocated raw-heap file.
pub struct DecodedRawHeap {
    pub version: RawHeapVersion,
    pub timestamp_ms: u64,
    /// Root addresses in dump space.
    pub roots: Vec<u64>,
    /// Dump-space address → dump-local string id.
    pub names: FxHashMap<u64, u32>,
    /// Dump-local string id → content.
    pub strings: FxHashMap<u32, String>,
    pub objects: Vec<DecodedObject>,
    addr_map: FxHashMap<u64, ObjAddr>,
    /// Owns the relocation buffers; word-aligned so buffer addresses are
    /// valid tagged object references.
    _arena: Vec<Box<[u64]>>,
}

impl DecodedRawHeap {
    /// Buffer address for a dump-space address.
    pub fn new_addr(&self, dump_addr: u64) -> Option<ObjAddr> {
        self.addr_map.get(&dump_addr).copied()
    }
}

/// Decode and relocate a raw-heap file held in memory.
pub fn decode_rawheap(bytes: &[u8]) -> Result<DecodedRawHeap, RawHeapError> {
    if bytes.len() < 16 + (SECTION_COUNT * TRAILER_UNIT + 8) as usize {
        return Err(RawHeapError::Truncated);
    }
    let magic: [u8; 8] = bytes[0..8].try_into().expect("length checked");
    let version = RawHeapVersion::from_magic(&magic).ok_or(RawHeapError::UnknownVersion)?;
    let timestamp_ms = u64::from_le_bytes(bytes[8..16].try_into().expect("length checked"));

    let sections = get_section_info(bytes)?;

    let (root_unit, name_unit, object_unit) = match version {
        RawHeapVersion::V1 => (V1_ROOT_UNIT, V1_NAME_UNIT, V1_OBJECT_UNIT),
        RawHeapVersion::V2 => (V2_ROOT_UNIT, V2_NAME_UNIT, V2_OBJECT_UNIT),
    };

    let roots = decode_root_table(section(bytes, &sections, 0, root_unit)?, version);
    let names = decode_name_table(section(bytes, &sections, 1, name_unit)?, version);
    let strings = decode_str_table(section(bytes, &sections, 2, BYTE_UNIT)?);
    let object_section = section(bytes, &sections, 3, object_unit)?;
    let memory_section = section(bytes, &sections, 4, BYTE_UNIT)?;

    let (objects, addr_map, arena) =
        decode_mem_obj(object_section, memory_section, version)?;

    let mut decoded = DecodedRawHeap {
        version,
        timestamp_ms,
        roots,
        names,
        strings,
        objects,
        addr_map,
        _arena: arena,
    };
    relocate(&mut decoded);
    Ok(decoded)
}

/// Parse the trailing section index: the last 8 bytes carry
/// `{section_count, unit}`, preceded by one `{offset, size}` pair per
/// section in emission order.
fn get_section_info(bytes: &[u8]) -> Result<Vec<(usize, usize)>, RawHeapError> {
    let n = bytes.len();
    let count = u32::from_le_bytes(bytes[n - 8..n - 4].try_into().expect("length checked"));
    let unit = u32::from_le_bytes(bytes[n - 4..].try_into().expect("length checked"));
    if count != SECTION_COUNT || unit != TRAILER_UNIT {
        log::error!("bad section trailer: count={count} unit={unit}");
        return Err(RawHeapError::BadSectionTable);
    }
    let pairs_start = n - 8 - (count * unit) as usize;
    let mut sections = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let at = pairs_start + i * unit as usize;
        let offset =
            u32::from_le_bytes(bytes[at..at + 4].try_into().expect("length checked")) as usize;
        let size =
            u32::from_le_bytes(bytes[at + 4..at + 8].try_into().expect("length checked")) as usize;
        if offset < 16 || offset + size > pairs_start || size < 8 {
            log::error!("section {i} out of bounds: offset={offset} size={size}");
            return Err(RawHeapError::BadSectionTable);
        }
        sections.push((offset, size));
    }
    Ok(sections)
}

/// Resolved section: record count plus payload bytes.
struct Section<'a> {
    count: usize,
    payload: &'a [u8],
}

/// Read one section header, enforcing the expected unit size. Header
/// violations are hard stops.
fn section<'a>(
    bytes: &'a [u8],
    sections: &[(usize, usize)],
    index: usize,
    expected_unit: u32,
) -> Result<Section<'a>, RawHeapError> {
    let (offset, size) = sections[index];
    let count = u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("bounds checked"));
    let unit =
        u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().expect("bounds checked"));
    if unit != expected_unit {
        log::error!("section {index}: expected unit {expected_unit}, got {unit}");
        return Err(RawHeapError::UnexpectedUnitSize {
            section: index,
            expected: expected_unit,
            actual: unit,
        });
    }
    Ok(Section {
        count: count as usize,
        payload: &bytes[offset + 8..offset + size],
    })
}

fn decode_root_table(section: Section<'_>, version: RawHeapVersion) -> Vec<u64> {
    let unit = match version {
        RawHeapVersion::V1 => 8,
        RawHeapVersion::V2 => 4,
    };
    let usable = section.count.min(section.payload.len() / unit);
    if usable < section.count {
        log::error!(
            "root table truncated: {} of {} records present",
            usable,
            section.count
        );
    }
    let mut roots = Vec::with_capacity(usable);
    for i in 0..usable {
        let at = i * unit;
        let addr = match version {
            RawHeapVersion::V1 => {
                u64::from_le_bytes(section.payload[at..at + 8].try_into().expect("bounds"))
            }
            RawHeapVersion::V2 => {
                u32::from_le_bytes(section.payload[at..at + 4].try_into().expect("bounds")) as u64
            }
        };
        roots.push(addr);
    }
    roots
}

fn decode_name_table(section: Section<'_>, version: RawHeapVersion) -> FxHashMap<u64, u32> {
    let unit = match version {
        RawHeapVersion::V1 => V1_NAME_UNIT as usize,
        RawHeapVersion::V2 => V2_NAME_UNIT as usize,
    };
    let usable = section.count.min(section.payload.len() / unit);
    if usable < section.count {
        log::error!(
            "name table truncated: {} of {} records present",
            usable,
            section.count
        );
    }
    let mut names = FxHashMap::default();
    for i in 0..usable {
        let at = i * unit;
        let (addr, string_id) = match version {
            RawHeapVersion::V1 => (
                u64::from_le_bytes(section.payload[at..at + 8].try_into().expect("bounds")),
                u32::from_le_bytes(section.payload[at + 8..at + 12].try_into().expect("bounds")),
            ),
            RawHeapVersion::V2 => (
                u32::from_le_bytes(section.payload[at..at + 4].try_into().expect("bounds")) as u64,
                u32::from_le_bytes(section.payload[at + 4..at + 8].try_into().expect("bounds")),
            ),
        };
        names.insert(addr, string_id);
    }
    names
}

fn decode_str_table(section: Section<'_>) -> FxHashMap<u32, String> {
    let mut strings = FxHashMap::default();
    let payload = section.payload;
    let mut at = 0usize;
    for _ in 0..section.count {
        if at + 8 > payload.len() {
            log::error!("string blob truncated at offset {at}");
            break;
        }
        let id = u32::from_le_bytes(payload[at..at + 4].try_into().expect("bounds"));
        let len =
            u32::from_le_bytes(payload[at + 4..at + 8].try_into().expect("bounds")) as usize;
        at += 8;
        if at + len > payload.len() {
            log::error!("string {id} overruns the blob");
            break;
        }
        let content = String::from_utf8_lossy(&payload[at..at + len]).into_owned();
        strings.insert(id, content);
        at += len;
    }
    strings
}

type MemObjResult = (
    Vec<DecodedObject>,
    FxHashMap<u64, ObjAddr>,
    Vec<Box<[u64]>>,
);

/// Copy each object record into a fresh zeroed, word-aligned buffer.
///
/// The size check keeps the historical tolerance: when the memory section
/// holds fewer bytes than the recorded object size, the record is accepted
/// anyway iff exactly one word (an hclass-forwarding stub) is available;
/// anything else skips the record.
fn decode_mem_obj(
    objects: Section<'_>,
    memory: Section<'_>,
    version: RawHeapVersion,
) -> Result<MemObjResult, RawHeapError> {
    let unit = match version {
        RawHeapVersion::V1 => V1_OBJECT_UNIT as usize,
        RawHeapVersion::V2 => V2_OBJECT_UNIT as usize,
    };
    let usable = objects.count.min(objects.payload.len() / unit);
    if usable < objects.count {
        log::error!(
            "object table truncated: {} of {} records present",
            usable,
            objects.count
        );
    }

    let mut decoded = Vec::with_capacity(usable);
    let mut addr_map = FxHashMap::default();
    let mut arena = Vec::with_capacity(usable);

    for i in 0..usable {
        let at = i * unit;
        let rec = &objects.payload[at..at + unit];
        let (dump_addr, id, size, offset) = match version {
            RawHeapVersion::V1 => (
                u64::from_le_bytes(rec[0..8].try_into().expect("bounds")),
                u64::from_le_bytes(rec[8..16].try_into().expect("bounds")),
                u32::from_le_bytes(rec[16..20].try_into().expect("bounds")) as usize,
                u32::from_le_bytes(rec[20..24].try_into().expect("bounds")) as usize,
            ),
            RawHeapVersion::V2 => (
                u32::from_le_bytes(rec[0..4].try_into().expect("bounds")) as u64,
                u32::from_le_bytes(rec[4..8].try_into().expect("bounds")) as u64,
                u32::from_le_bytes(rec[8..12].try_into().expect("bounds")) as usize,
                u32::from_le_bytes(rec[12..16].try_into().expect("bounds")) as usize,
            ),
        };
        if size == 0 || offset > memory.payload.len() {
            log::error!("object {i}: bad record (size={size}, offset={offset})");
            continue;
        }
        let available = (memory.payload.len() - offset).min(size);
        let complete = available == size;
        if !complete && available != WORD_SIZE {
            log::error!(
                "object {i}: {available} of {size} bytes available, skipping record"
            );
            continue;
        }

        let words = size.div_ceil(WORD_SIZE);
        let buf: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let new_addr = buf.as_ptr() as u64;
        // SAFETY: the destination buffer holds `words * 8 >= available`
        // bytes and does not overlap the input slice.
        unsafe {
            std::ptr::copy_nonoverlapping(
                memory.payload[offset..].as_ptr(),
                new_addr as usize as *mut u8,
                available,
            );
        }
        arena.push(buf);
        addr_map.insert(dump_addr, new_addr);
        decoded.push(DecodedObject {
            dump_addr,
            id,
            size,
            new_addr,
            complete,
            hclass_resolved: false,
        });
    }

    Ok((decoded, addr_map, arena))
}

/// Dump-space key for a reference slot value found in copied memory.
#[inline]
fn slot_key(value: TaggedValue, version: RawHeapVersion) -> Option<(u64, bool)> {
    let addr = value.heap_addr()?;
    match version {
        RawHeapVersion::V1 => Some((addr, value.is_weak())),
        RawHeapVersion::V2 => Some((addr >> 3, value.is_weak())),
    }
}

/// In-place relocation over the decoded buffers: first resolve every
/// object's hclass word, then rewrite the remaining reference slots.
fn relocate(decoded: &mut DecodedRawHeap) {
    let version = decoded.version;

    // Pass A: hclass words.
    for obj in &mut decoded.objects {
        let view = ObjectRef(obj.new_addr);
        let raw = TaggedValue::from_raw(view.read_word(0));
        let Some((key, _)) = slot_key(raw, version) else {
            log::error!("object {:#x}: missing hclass word", obj.dump_addr);
            view.write_word(0, 0);
            continue;
        };
        match decoded.addr_map.get(&key) {
            Some(&hclass_buf) => {
                view.write_word(0, hclass_buf);
                obj.hclass_resolved = true;
            }
            None => {
                log::error!(
                    "object {:#x}: hclass {key:#x} not present in dump",
                    obj.dump_addr
                );
                view.write_word(0, 0);
            }
        }
    }

    // Pass B: body slots of complete, classified objects.
    for obj in &decoded.objects {
        if !obj.complete || !obj.hclass_resolved {
            continue;
        }
        let view = ObjectRef(obj.new_addr);
        let Some(ty) = read_js_type(view) else {
            log::error!("object {:#x}: unknown kind tag", obj.dump_addr);
            continue;
        };
        if view.size() != obj.size {
            log::error!(
                "object {:#x}: derived size {} disagrees with record {}",
                obj.dump_addr,
                view.size(),
                obj.size
            );
            continue;
        }
        if matches!(ty, JsType::LineString | JsType::HeapNumber | JsType::BigInt) {
            continue; // no body references
        }

        let mut patches = Vec::new();
        visit_object_body(view, |slot| {
            if slot.offset == 0 {
                return; // hclass done in pass A
            }
            let raw = TaggedValue::from_raw(view.read_word(slot.offset));
            let Some((key, weak)) = slot_key(raw, version) else {
                return;
            };
            match decoded.addr_map.get(&key) {
                Some(&target) => {
                    let value = if weak {
                        TaggedValue::weak(target)
                    } else {
                        TaggedValue::object(target)
                    };
                    patches.push((slot.offset, value));
                }
                None => {
                    log::warn!(
                        "object {:#x}: not found member {key:#x}",
                        obj.dump_addr
                    );
                    patches.push((slot.offset, TaggedValue::undefined()));
                }
            }
        });
        for (offset, value) in patches {
            view.set_slot(offset, value);
        }
    }
}

/// Kind tag of a relocated object, tolerating corrupt hclass payloads.
fn read_js_type(view: ObjectRef) -> Option<JsType> {
    let hclass = view.hclass();
    if hclass == 0 {
        return None;
    }
    JsType::from_u8(ObjectRef(hclass).read_word(8) as u8)
}

// ---------------------------------------------------------------------------
// Snapshot reconstruction
// ---------------------------------------------------------------------------

/// Rebuild a [`HeapSnapshot`] from a decoded dump. This is the conversion behind
/// turning a crash-dump rawheap file into a viewable JSON heapsnapshot.
pub fn build_snapshot_for_bin_mod(decoded: &DecodedRawHeap) -> HeapSnapshot {
    let mut snapshot = HeapSnapshot::new(false, false, false, false);
    snapshot.prepare();

    // Nodes, in object-table order.
    for obj in &decoded.objects {
        generate_node_for_bin_mod(decoded, obj, &mut snapshot);
    }

    // Synthetic root → every dumped root.
    for (ordinal, root) in decoded.roots.iter().enumerate() {
        let Some(target) = decoded.new_addr(*root) else {
            log::warn!("root {root:#x} not present in dump");
            continue;
        };
        if let Some(to) = snapshot.node_index_for_addr(target) {
            snapshot.add_edge_for_bin_mod(
                0,
                to,
                crate::profiler::snapshot::EdgeType::Element,
                crate::profiler::snapshot::EdgeNameOrIndex::Index(ordinal as u32),
            );
        }
    }

    // Edges, walking the relocated buffers with the live-heap visitor.
    for obj in &decoded.objects {
        if !obj.complete || !obj.hclass_resolved {
            continue;
        }
        let view = ObjectRef(obj.new_addr);
        let Some(ty) = read_js_type(view) else {
            continue;
        };
        if ty.is_string() || view.size() != obj.size {
            continue;
        }
        let Some(from) = snapshot.node_index_for_addr(obj.new_addr) else {
            continue;
        };
        let mut slots = Vec::new();
        visit_object_body(view, |slot| slots.push(slot));
        for slot in slots {
            let Some(target) = slot.value.heap_addr() else {
                continue;
            };
            let Some(to) = snapshot.node_index_for_addr(target) else {
                log::warn!(
                    "edge build: not found member {target:#x} from {:#x}",
                    obj.dump_addr
                );
                continue;
            };
            let (mut edge_type, name_or_index) =
                snapshot.classify_slot_for_bin_mod(view, slot.kind);
            if slot.value.is_weak() {
                edge_type = crate::profiler::snapshot::EdgeType::Weak;
            }
            snapshot.add_edge_for_bin_mod(from, to, edge_type, name_or_index);
        }
    }

    snapshot
}

/// Classify one decoded object into a node.
fn generate_node_for_bin_mod(
    decoded: &DecodedRawHeap,
    obj: &DecodedObject,
    snapshot: &mut HeapSnapshot,
) {
    let view = ObjectRef(obj.new_addr);
    let ty = if obj.hclass_resolved {
        read_js_type(view)
    } else {
        None
    };
    let node_type = match ty {
        Some(t) => node_type_for(t),
        None => {
            log::error!(
                "object {:#x}: unresolved hclass, emitting hidden node",
                obj.dump_addr
            );
            NodeType::Hidden
        }
    };

    let name = lookup_name(decoded, obj.dump_addr);
    let name_id = snapshot.strings_mut().get_or_insert(&name);

    let native_size = match ty {
        Some(JsType::NativeBinding) if obj.complete => view.native_size(),
        _ => 0,
    };

    snapshot.add_node_for_bin_mod(obj.id, name_id, node_type, obj.size, native_size, obj.new_addr);
}

fn lookup_name(decoded: &DecodedRawHeap, dump_addr: u64) -> String {
    decoded
        .names
        .get(&dump_addr)
        .and_then(|id| decoded.strings.get(id))
        .cloned()
        .unwrap_or_else(|| "(unknown)".to_owned())
}

/// Decode a dump and rebuild the snapshot in one step.
pub fn translate_rawheap(bytes: &[u8]) -> Result<HeapSnapshot, RawHeapError> {
    let decoded = decode_rawheap(bytes)?;
    Ok(build_snapshot_for_bin_mod(&decoded))
}

/// Summary of a dump file used by inspection tooling.
pub struct RawHeapSummary {
    pub version: RawHeapVersion,
    pub timestamp_ms: u64,
    pub root_count: usize,
    pub object_count: usize,
    pub string_count: usize,
    pub sections: Vec<(usize, usize)>,
}

/// Parse only the cheap parts of a dump: version, trailer, record counts.
pub fn summarize_rawheap(bytes: &[u8]) -> Result<RawHeapSummary, RawHeapError> {
    let decoded = decode_rawheap(bytes)?;
    let sections = get_section_info(bytes)?;
    Ok(RawHeapSummary {
        version: decoded.version,
        timestamp_ms: decoded.timestamp_ms,
        root_count: decoded.roots.len(),
        object_count: decoded.objects.len(),
        string_count: decoded.strings.len(),
        sections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::entry_id_map::EntryIdMap;
    use crate::profiler::rawheap::{RawHeapDumpV1, RawHeapDumpV2};
    use crate::profiler::stream::VecStream;
    use crate::vm::gc::{Heap, RootSet};
    use crate::vm::value::TaggedValue;

    fn sample_heap() -> (Heap, RootSet, u64, u64) {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let cls = heap.new_object_class("Widget", &["label", "count"]);
        let label = heap.alloc_string("button");
        let count = heap.alloc_number(3.0);
        let widget = heap.alloc_object(
            cls,
            &[TaggedValue::object(label), TaggedValue::object(count)],
        );
        let arr = heap.alloc_array(&[TaggedValue::object(widget), TaggedValue::weak(label)]);
        roots.add_global(TaggedValue::object(arr));
        (heap, roots, arr, widget)
    }

    fn dump_v1(heap: &Heap, roots: &RootSet) -> Vec<u8> {
        let mut ids = EntryIdMap::new();
        let mut stream = VecStream::new();
        RawHeapDumpV1::dump(heap, roots, &mut ids, &mut stream).unwrap();
        stream.into_inner()
    }

    fn dump_v2(heap: &Heap, roots: &RootSet) -> Vec<u8> {
        let mut ids = EntryIdMap::new();
        let mut stream = VecStream::new();
        RawHeapDumpV2::dump(heap, roots, &mut ids, &mut stream).unwrap();
        stream.into_inner()
    }

    #[test]
    fn test_decode_v1_round_trip() {
        let (heap, roots, arr, widget) = sample_heap();
        let bytes = dump_v1(&heap, &roots);
        let decoded = decode_rawheap(&bytes).unwrap();

        assert_eq!(decoded.version, RawHeapVersion::V1);
        assert_eq!(decoded.roots, vec![arr]);
        assert!(decoded.new_addr(arr).is_some());
        assert!(decoded.new_addr(widget).is_some());
        assert!(decoded.objects.iter().all(|o| o.complete && o.hclass_resolved));

        // The relocated widget still reads like a widget.
        let widget_view = ObjectRef(decoded.new_addr(widget).unwrap());
        assert_eq!(read_js_type(widget_view), Some(JsType::Object));
        let label_buf = widget_view.field(0).heap_addr().unwrap();
        assert_eq!(ObjectRef(label_buf).line_string_bytes(), b"button");
    }

    #[test]
    fn test_decode_v2_round_trip() {
        let (heap, roots, arr, widget) = sample_heap();
        let bytes = dump_v2(&heap, &roots);
        let decoded = decode_rawheap(&bytes).unwrap();

        assert_eq!(decoded.version, RawHeapVersion::V2);
        assert_eq!(decoded.roots.len(), 1);
        let arr_buf = decoded.new_addr(decoded.roots[0]).unwrap();
        let arr_view = ObjectRef(arr_buf);
        assert_eq!(read_js_type(arr_view), Some(JsType::Array));
        assert_eq!(arr_view.array_len(), 2);

        // Strong element relocated, weak element kept weak.
        let widget_buf = arr_view.array_element(0).heap_addr().unwrap();
        assert_eq!(read_js_type(ObjectRef(widget_buf)), Some(JsType::Object));
        assert!(arr_view.array_element(1).is_weak());

        // Same object population as the V1 dump.
        let v1 = decode_rawheap(&dump_v1(&heap, &roots)).unwrap();
        assert_eq!(v1.objects.len(), decoded.objects.len());
        let _ = widget;
    }

    #[test]
    fn test_translate_builds_snapshot() {
        let (heap, roots, _, widget) = sample_heap();
        let bytes = dump_v1(&heap, &roots);
        let decoded = decode_rawheap(&bytes).unwrap();
        let snapshot = build_snapshot_for_bin_mod(&decoded);

        // Synthetic root + every dumped object.
        assert_eq!(snapshot.nodes().len(), decoded.objects.len() + 1);
        // The widget node carries its class name and property edges.
        let widget_node = snapshot
            .node_for_addr(decoded.new_addr(widget).unwrap())
            .unwrap();
        assert_eq!(snapshot.strings().get(widget_node.name), "Widget");
        assert!(widget_node.edge_count >= 2);
    }

    #[test]
    fn test_zeroed_version_decodes_as_legacy_v1() {
        let (heap, roots, _, _) = sample_heap();
        let mut bytes = dump_v1(&heap, &roots);
        bytes[0..8].copy_from_slice(&[0u8; 8]);
        let decoded = decode_rawheap(&bytes).unwrap();
        assert_eq!(decoded.version, RawHeapVersion::V1);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let (heap, roots, _, _) = sample_heap();
        let mut bytes = dump_v1(&heap, &roots);
        bytes[0..8].copy_from_slice(b"9.9.9\0\0\0");
        assert!(matches!(
            decode_rawheap(&bytes),
            Err(RawHeapError::UnknownVersion)
        ));
    }

    #[test]
    fn test_corrupt_object_table_unit_is_hard_stop() {
        let (heap, roots, _, _) = sample_heap();
        let mut bytes = dump_v1(&heap, &roots);

        // Overwrite the object-table unit size (4th section) in place.
        let n = bytes.len();
        let pairs = n - 8 - (SECTION_COUNT * 8) as usize;
        let off =
            u32::from_le_bytes(bytes[pairs + 24..pairs + 28].try_into().unwrap()) as usize;
        let bad_unit = (WORD_SIZE as u32 - 1).to_le_bytes();
        bytes[off + 4..off + 8].copy_from_slice(&bad_unit);

        assert!(matches!(
            decode_rawheap(&bytes),
            Err(RawHeapError::UnexpectedUnitSize { section: 3, .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        assert!(matches!(
            decode_rawheap(&[0u8; 10]),
            Err(RawHeapError::Truncated)
        ));
    }

    #[test]
    fn test_hclass_stub_tolerance() {
        // A record whose memory was cropped to exactly one word decodes as
        // an incomplete node instead of being dropped.
        let (heap, roots, _, _) = sample_heap();
        let mut bytes = dump_v1(&heap, &roots);

        let n = bytes.len();
        let pairs = n - 8 - (SECTION_COUNT * 8) as usize;
        let obj_off =
            u32::from_le_bytes(bytes[pairs + 24..pairs + 28].try_into().unwrap()) as usize;
        let count =
            u32::from_le_bytes(bytes[obj_off..obj_off + 4].try_into().unwrap()) as usize;
        let mem_payload_len =
            u32::from_le_bytes(bytes[pairs + 36..pairs + 40].try_into().unwrap()) as usize - 8;

        // Point the last record one word before the end of the memory
        // payload, whatever its recorded size.
        let last = obj_off + 8 + (count - 1) * V1_OBJECT_UNIT as usize;
        let new_offset = (mem_payload_len - WORD_SIZE) as u32;
        bytes[last + 20..last + 24].copy_from_slice(&new_offset.to_le_bytes());
        // Give it a size larger than one word so only the stub fits.
        bytes[last + 16..last + 20].copy_from_slice(&32u32.to_le_bytes());

        let decoded = decode_rawheap(&bytes).unwrap();
        let stub = decoded.objects.last().unwrap();
        assert!(!stub.complete);
        assert_eq!(decoded.objects.len(), count);
    }
}
