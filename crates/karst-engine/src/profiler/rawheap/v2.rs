//! Raw-heap dump, wire version 2
//!
//! Every address shrinks to a 32-bit synthetic `{region_id, slot_index}`
//! form: regions get sequential ids on first use, and reference slots in
//! the copied object memory are rewritten to the synthetic encoding before
//! the bytes hit the stream. Purely an on-disk compaction scheme; the
//! decoded snapshot is indistinguishable from a V1 one.

use super::{
    build_name_table, collect_dump_set, copy_object_mem_to_buf, encode_string_blob,
    rewrite_slots_v2, RawHeapError, RawHeapWriter, RegionIdMap, BYTE_UNIT, V2_NAME_UNIT,
    V2_OBJECT_UNIT, V2_ROOT_UNIT, VERSION_V2,
};
use crate::profiler::entry_id_map::EntryIdMap;
use crate::profiler::stream::Stream;
use crate::vm::gc::{Heap, RootSet};
use crate::vm::value::ObjAddr;
use rustc_hash::FxHashMap;

/// Writer for the compact synthetic-address dump format.
pub struct RawHeapDumpV2;

impl RawHeapDumpV2 {
    /// Dump the reachable heap into `stream` using synthetic addressing.
    pub fn dump(
        heap: &Heap,
        roots: &RootSet,
        ids: &mut EntryIdMap,
        stream: &mut dyn Stream,
    ) -> Result<(), RawHeapError> {
        let set = collect_dump_set(heap, roots);
        let (strings, name_ids) = build_name_table(&set.objects);

        // Assign region ids and synthetic addresses up front; the copy
        // workers read this map concurrently.
        let mut regions = RegionIdMap::new();
        let mut synthetic: FxHashMap<ObjAddr, u32> = FxHashMap::default();
        for obj in &set.objects {
            synthetic.insert(obj.addr, regions.generate_synthetic_addr(obj.addr));
        }

        let mut writer = RawHeapWriter::new(stream, &VERSION_V2)?;

        // Root table.
        let mut payload = Vec::with_capacity(set.roots.len() * V2_ROOT_UNIT as usize);
        for root in &set.roots {
            payload.extend_from_slice(&synthetic[root].to_le_bytes());
        }
        writer.write_section(set.roots.len() as u32, V2_ROOT_UNIT, &payload)?;

        // Name table.
        let mut payload = Vec::with_capacity(set.objects.len() * V2_NAME_UNIT as usize);
        for (obj, name_id) in set.objects.iter().zip(&name_ids) {
            payload.extend_from_slice(&synthetic[&obj.addr].to_le_bytes());
            payload.extend_from_slice(&name_id.to_le_bytes());
        }
        writer.write_section(set.objects.len() as u32, V2_NAME_UNIT, &payload)?;

        // String blob.
        let blob = encode_string_blob(&strings);
        writer.write_section(strings.len() as u32, BYTE_UNIT, &blob)?;

        // Object table. Node ids fit the packed 32-bit field by
        // construction (sequential, stride 2).
        let mut payload = Vec::with_capacity(set.objects.len() * V2_OBJECT_UNIT as usize);
        for obj in &set.objects {
            let id = ids.find_or_insert_id(obj.addr);
            debug_assert!(id <= u32::MAX as u64, "node id overflows the V2 record");
            payload.extend_from_slice(&synthetic[&obj.addr].to_le_bytes());
            payload.extend_from_slice(&(id as u32).to_le_bytes());
            payload.extend_from_slice(&(obj.size as u32).to_le_bytes());
            payload.extend_from_slice(&obj.offset.to_le_bytes());
        }
        writer.write_section(set.objects.len() as u32, V2_OBJECT_UNIT, &payload)?;

        // Object memory with reference slots rewritten to synthetic form.
        let memory = copy_object_mem_to_buf(&set.objects, set.memory_len, |addr, buf| {
            rewrite_slots_v2(addr, buf, &synthetic)
        });
        writer.write_section(memory.len() as u32, BYTE_UNIT, &memory)?;

        writer.write_trailer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::rawheap::decode_synthetic_addr;
    use crate::profiler::stream::VecStream;
    use crate::vm::value::TaggedValue;

    #[test]
    fn test_v2_dump_uses_synthetic_roots() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let s = heap.alloc_string("v2 payload");
        roots.add_global(TaggedValue::object(s));

        let mut ids = EntryIdMap::new();
        let mut stream = VecStream::new();
        RawHeapDumpV2::dump(&heap, &roots, &mut ids, &mut stream).unwrap();
        let bytes = stream.as_slice();
        assert_eq!(&bytes[0..8], &VERSION_V2);

        // Root section sits right after the 16-byte prelude.
        let count = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let unit = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
        assert_eq!(count, 1);
        assert_eq!(unit, V2_ROOT_UNIT);
        let synth = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        let (region_id, _index) = decode_synthetic_addr(synth);
        assert!(region_id >= 1);
    }

    #[test]
    fn test_v2_object_table_is_packed() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let arr = heap.alloc_array(&[TaggedValue::int(1), TaggedValue::int(2)]);
        roots.add_global(TaggedValue::object(arr));

        let mut ids = EntryIdMap::new();
        let mut stream = VecStream::new();
        RawHeapDumpV2::dump(&heap, &roots, &mut ids, &mut stream).unwrap();
        let bytes = stream.as_slice();

        let n = bytes.len();
        let pairs = n - 8 - (crate::profiler::rawheap::SECTION_COUNT * 8) as usize;
        let off = u32::from_le_bytes(bytes[pairs + 24..pairs + 28].try_into().unwrap()) as usize;
        let size = u32::from_le_bytes(bytes[pairs + 28..pairs + 32].try_into().unwrap());
        let count = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let unit = u32::from_le_bytes(bytes[off + 4..off + 8].try_into().unwrap());
        assert_eq!(unit, V2_OBJECT_UNIT);
        assert_eq!(size, 8 + count * V2_OBJECT_UNIT);
    }
}
