//! Raw-heap binary dump protocol
//!
//! A dense, versioned wire format for very large heaps and OOM dumps,
//! decodable offline into a regular heapsnapshot. Layout, both versions:
//!
//! ```text
//! [version magic: 8 bytes] [timestamp ms: u64]
//! [root table] [name table] [string blob] [object table] [object memory]
//! [trailer: {offset,size} per section ... {section_count, trailer_unit}]
//! ```
//!
//! Every section starts with `{count: u32, unit: u32}`. The trailer is an
//! index at the *end* of the file: the last 8 bytes give the section count
//! and the pair size, the pairs immediately before them give each section's
//! file offset and total size in emission order. Writing therefore needs a
//! single pass with no up-front size knowledge; readers seek from the end.
//!
//! V1 records carry raw 64-bit heap addresses. V2 shrinks every address to
//! a 32-bit synthetic `{region_id:16, slot_index:16}` form, which requires
//! assigning sequential ids to heap regions and rewriting reference slots
//! inside the copied object memory.

pub mod decode;
pub mod v1;
pub mod v2;

pub use decode::{
    decode_rawheap, summarize_rawheap, translate_rawheap, DecodedRawHeap, RawHeapSummary,
    RawHeapVersion,
};
pub use v1::RawHeapDumpV1;
pub use v2::RawHeapDumpV2;

use super::marker::{HeapMarker, ObjectMarker, RootMarker};
use super::stream::Stream;
use super::string_table::StringTable;
use crate::vm::gc::{region_base, Heap, RootSet, REGION_MASK};
use crate::vm::object::{visit_object_body, JsType, ObjectRef, TAGGED_TYPE_SIZE_LOG};
use crate::vm::value::ObjAddr;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// 8-byte version magics.
pub const VERSION_V1: [u8; 8] = *b"1.0.0\0\0\0";
pub const VERSION_V2: [u8; 8] = *b"2.0.0\0\0\0";

/// Number of sections in a dump, in emission order:
/// roots, names, strings, objects, memory.
pub const SECTION_COUNT: u32 = 5;

/// Size of one trailer entry (`{offset: u32, size: u32}`).
pub const TRAILER_UNIT: u32 = 8;

/// V1 object-table record: `{addr: u64, id: u64, obj_size: u32, offset: u32}`.
pub const V1_OBJECT_UNIT: u32 = 24;
/// V1 name record: `{addr: u64, string_id: u32, pad: u32}`.
pub const V1_NAME_UNIT: u32 = 16;
/// V1 root record: raw address.
pub const V1_ROOT_UNIT: u32 = 8;

/// V2 object-table record: `{addr: u32, id: u32, obj_size: u32, offset: u32}`.
pub const V2_OBJECT_UNIT: u32 = 16;
/// V2 name record: `{addr: u32, string_id: u32}`.
pub const V2_NAME_UNIT: u32 = 8;
/// V2 root record: synthetic address.
pub const V2_ROOT_UNIT: u32 = 4;

/// Unit marker for byte-granular (variable-record) sections.
pub const BYTE_UNIT: u32 = 1;

/// Raw-heap protocol errors.
#[derive(Debug, Error)]
pub enum RawHeapError {
    #[error("raw heap file is truncated")]
    Truncated,

    #[error("unknown raw heap version magic")]
    UnknownVersion,

    #[error("unexpected unit size in section {section}: expected {expected}, got {actual}")]
    UnexpectedUnitSize {
        section: usize,
        expected: u32,
        actual: u32,
    },

    #[error("section table is malformed")]
    BadSectionTable,

    #[error("stream write failed at offset {0}")]
    StreamWrite(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Synthetic addresses (V2)
// ---------------------------------------------------------------------------

/// Pack a region id and an in-region slot index into a synthetic address.
#[inline]
pub const fn encode_synthetic_addr(region_id: u16, index: u16) -> u32 {
    (region_id as u32) << 16 | index as u32
}

/// Unpack a synthetic address.
#[inline]
pub const fn decode_synthetic_addr(synthetic: u32) -> (u16, u16) {
    ((synthetic >> 16) as u16, synthetic as u16)
}

/// Lazily assigns sequential 16-bit ids to heap regions. Region ids start
/// at 1 so no valid synthetic address is ever zero.
pub struct RegionIdMap {
    ids: FxHashMap<ObjAddr, u16>,
    next: u16,
}

impl RegionIdMap {
    pub fn new() -> Self {
        Self {
            ids: FxHashMap::default(),
            next: 1,
        }
    }

    /// Id of the region containing `addr`, assigning one on first use.
    pub fn generate_region_id(&mut self, addr: ObjAddr) -> u16 {
        let base = region_base(addr);
        if let Some(&id) = self.ids.get(&base) {
            return id;
        }
        let id = self.next;
        self.next = self.next.checked_add(1).expect("more than 65534 regions");
        self.ids.insert(base, id);
        id
    }

    /// Synthetic address of an object.
    pub fn generate_synthetic_addr(&mut self, addr: ObjAddr) -> u32 {
        let region_id = self.generate_region_id(addr);
        let index = ((addr & REGION_MASK) >> TAGGED_TYPE_SIZE_LOG) as u16;
        encode_synthetic_addr(region_id, index)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Default for RegionIdMap {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference slot stored in V2 object memory: the synthetic address
/// shifted up so the value stays 8-aligned, with the weak bit preserved in
/// bit 0. Never zero because region ids start at 1.
#[inline]
pub const fn encode_v2_slot(synthetic: u32, weak: bool) -> u64 {
    (synthetic as u64) << TAGGED_TYPE_SIZE_LOG | weak as u64
}

#[inline]
pub const fn decode_v2_slot(raw: u64) -> (u32, bool) {
    ((raw >> TAGGED_TYPE_SIZE_LOG) as u32, raw & 1 == 1)
}

// ---------------------------------------------------------------------------
// Writer base
// ---------------------------------------------------------------------------

/// Section-offset bookkeeping plus the version/timestamp prelude: the part
/// of the dump protocol both versions share.
pub struct RawHeapWriter<'a> {
    stream: &'a mut dyn Stream,
    offset: u32,
    sections: Vec<(u32, u32)>,
}

impl<'a> RawHeapWriter<'a> {
    /// Open a dump: write the version magic and the millisecond timestamp.
    pub fn new(stream: &'a mut dyn Stream, version: &[u8; 8]) -> Result<Self, RawHeapError> {
        let mut writer = Self {
            stream,
            offset: 0,
            sections: Vec::with_capacity(SECTION_COUNT as usize),
        };
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        writer.write(version)?;
        writer.write(&timestamp.to_le_bytes())?;
        Ok(writer)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), RawHeapError> {
        if !self.stream.write_bin_block(bytes) {
            return Err(RawHeapError::StreamWrite(self.offset));
        }
        self.offset += bytes.len() as u32;
        Ok(())
    }

    /// Emit one `{count, unit}`-headed section and record it for the
    /// trailer index.
    pub fn write_section(
        &mut self,
        count: u32,
        unit: u32,
        payload: &[u8],
    ) -> Result<(), RawHeapError> {
        let start = self.offset;
        self.write(&count.to_le_bytes())?;
        self.write(&unit.to_le_bytes())?;
        self.write(payload)?;
        self.sections.push((start, 8 + payload.len() as u32));
        Ok(())
    }

    /// Emit the trailing section index and finish the stream.
    pub fn write_trailer(mut self) -> Result<(), RawHeapError> {
        debug_assert_eq!(self.sections.len() as u32, SECTION_COUNT);
        let mut trailer = Vec::with_capacity(self.sections.len() * 8 + 8);
        for (offset, size) in &self.sections {
            trailer.extend_from_slice(&offset.to_le_bytes());
            trailer.extend_from_slice(&size.to_le_bytes());
        }
        trailer.extend_from_slice(&(self.sections.len() as u32).to_le_bytes());
        trailer.extend_from_slice(&TRAILER_UNIT.to_le_bytes());
        self.write(&trailer)?;
        self.stream.end_of_stream();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared dump-set collection
// ---------------------------------------------------------------------------

/// One object selected for dumping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DumpObject {
    pub addr: ObjAddr,
    pub size: usize,
    /// Byte offset of this object's copy in the memory section payload.
    pub offset: u32,
}

pub(crate) struct DumpSet {
    pub roots: Vec<ObjAddr>,
    pub objects: Vec<DumpObject>,
    pub memory_len: usize,
}

/// Walk the heap from the roots and lay out the reachable objects for the
/// memory section (discovery order, packed back to back).
pub(crate) fn collect_dump_set(heap: &Heap, roots: &RootSet) -> DumpSet {
    let mut marker = HeapMarker::new();
    let seeds = RootMarker::mark(roots, &mut marker);
    ObjectMarker::traverse(heap, &mut marker, seeds.clone());

    let mut objects = Vec::with_capacity(marker.count());
    let mut offset = 0u32;
    marker.iterate_marked(|addr| {
        let size = ObjectRef(addr).size();
        objects.push(DumpObject {
            addr,
            size,
            offset,
        });
        offset += size as u32;
    });
    DumpSet {
        roots: seeds,
        objects,
        memory_len: offset as usize,
    }
}

/// Display name recorded for an object in the name table: string content
/// for strings, the function name for closures, the class name otherwise.
pub(crate) fn object_display_name(obj: ObjectRef) -> Vec<u8> {
    use super::snapshot::flatten_string;
    let ty = obj.js_type();
    let mut out = Vec::new();
    if ty.is_string() {
        flatten_string(obj, &mut out, 0);
    } else if ty == JsType::Function {
        if let Some(name) = obj.function_name().heap_addr() {
            flatten_string(ObjectRef(name), &mut out, 0);
        }
    } else if let Some(name) = ObjectRef(obj.hclass()).hclass_name().heap_addr() {
        flatten_string(ObjectRef(name), &mut out, 0);
    }
    if out.is_empty() {
        out.extend_from_slice(b"(unknown)");
    }
    out
}

/// Build the dump-local string table and the per-object name assignments.
pub(crate) fn build_name_table(objects: &[DumpObject]) -> (StringTable, Vec<u32>) {
    let mut strings = StringTable::new();
    let mut assignments = Vec::with_capacity(objects.len());
    for obj in objects {
        let name = object_display_name(ObjectRef(obj.addr));
        assignments.push(strings.insert_bytes(&name));
    }
    (strings, assignments)
}

/// Encode the string blob: `{id: u32, byte_len: u32, bytes}` per string.
pub(crate) fn encode_string_blob(strings: &StringTable) -> Vec<u8> {
    let mut blob = Vec::new();
    for (id, s) in strings.iter().enumerate() {
        blob.extend_from_slice(&(id as u32).to_le_bytes());
        blob.extend_from_slice(&(s.len() as u32).to_le_bytes());
        blob.extend_from_slice(s.as_bytes());
    }
    blob
}

/// Copy every object's raw bytes into the memory-section payload, one
/// worker per shard, each writing a disjoint range. `rewrite` runs on each
/// object's copy after the memcpy (V2 uses it to substitute synthetic
/// addresses into reference slots).
pub(crate) fn copy_object_mem_to_buf(
    objects: &[DumpObject],
    memory_len: usize,
    rewrite: impl Fn(ObjAddr, &mut [u8]) + Sync,
) -> Vec<u8> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(objects.len().max(1));
    let shard_len = objects.len().div_ceil(workers);

    let mut payload = vec![0u8; memory_len];
    if objects.is_empty() {
        return payload;
    }

    // Split the output buffer at shard boundaries so every worker owns a
    // disjoint slice; shards are contiguous object ranges, so the split
    // points are the first object offset of each shard.
    let shards: Vec<&[DumpObject]> = objects.chunks(shard_len).collect();
    let mut slices: Vec<&mut [u8]> = Vec::with_capacity(shards.len());
    let mut rest = payload.as_mut_slice();
    for (i, shard) in shards.iter().enumerate() {
        let shard_bytes: usize = shard.iter().map(|o| o.size).sum();
        if i + 1 == shards.len() {
            slices.push(rest);
            rest = &mut [];
        } else {
            let (head, tail) = rest.split_at_mut(shard_bytes);
            slices.push(head);
            rest = tail;
        }
    }
    debug_assert!(rest.is_empty());

    std::thread::scope(|scope| {
        for (shard, slice) in shards.into_iter().zip(slices) {
            let rewrite = &rewrite;
            scope.spawn(move || {
                let base = shard[0].offset as usize;
                for obj in shard {
                    let dst = &mut slice[obj.offset as usize - base..][..obj.size];
                    // SAFETY: the object lives in the suspended heap for
                    // the duration of the dump; dst is a disjoint buffer.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            obj.addr as usize as *const u8,
                            dst.as_mut_ptr(),
                            obj.size,
                        );
                    }
                    rewrite(obj.addr, dst);
                }
            });
        }
    });

    payload
}

/// Rewrite the reference slots of one object copy to V2 synthetic form.
/// Slots holding immediates are left untouched.
pub(crate) fn rewrite_slots_v2(
    addr: ObjAddr,
    buf: &mut [u8],
    synthetic: &FxHashMap<ObjAddr, u32>,
) {
    visit_object_body(ObjectRef(addr), |slot| {
        let Some(target) = slot.value.heap_addr() else {
            return;
        };
        let Some(&synth) = synthetic.get(&target) else {
            // Dropped from the dump set (e.g. a string-terminal child);
            // clear the slot so the decoder does not chase a raw address.
            buf[slot.offset..slot.offset + 8].copy_from_slice(&0u64.to_le_bytes());
            return;
        };
        let encoded = encode_v2_slot(synth, slot.value.is_weak());
        buf[slot.offset..slot.offset + 8].copy_from_slice(&encoded.to_le_bytes());
    });
}
