//! Raw-heap dump, wire version 1
//!
//! Addresses are raw 64-bit heap pointers and object memory is copied
//! verbatim, reference slots included; the offline decoder relocates them.

use super::{
    build_name_table, collect_dump_set, copy_object_mem_to_buf, encode_string_blob,
    RawHeapError, RawHeapWriter, BYTE_UNIT, V1_NAME_UNIT, V1_OBJECT_UNIT, V1_ROOT_UNIT,
    VERSION_V1,
};
use crate::profiler::entry_id_map::EntryIdMap;
use crate::profiler::stream::Stream;
use crate::vm::gc::{Heap, RootSet};

/// Writer for the legacy 64-bit-address dump format.
pub struct RawHeapDumpV1;

impl RawHeapDumpV1 {
    /// Dump the reachable heap into `stream`. Ids are taken from (and
    /// committed to) `ids`, so a dump and a later snapshot agree on node
    /// identity.
    pub fn dump(
        heap: &Heap,
        roots: &RootSet,
        ids: &mut EntryIdMap,
        stream: &mut dyn Stream,
    ) -> Result<(), RawHeapError> {
        let set = collect_dump_set(heap, roots);
        let (strings, name_ids) = build_name_table(&set.objects);

        let mut writer = RawHeapWriter::new(stream, &VERSION_V1)?;

        // Root table.
        let mut payload = Vec::with_capacity(set.roots.len() * V1_ROOT_UNIT as usize);
        for root in &set.roots {
            payload.extend_from_slice(&root.to_le_bytes());
        }
        writer.write_section(set.roots.len() as u32, V1_ROOT_UNIT, &payload)?;

        // Name table.
        let mut payload = Vec::with_capacity(set.objects.len() * V1_NAME_UNIT as usize);
        for (obj, name_id) in set.objects.iter().zip(&name_ids) {
            payload.extend_from_slice(&obj.addr.to_le_bytes());
            payload.extend_from_slice(&name_id.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
        }
        writer.write_section(set.objects.len() as u32, V1_NAME_UNIT, &payload)?;

        // String blob.
        let blob = encode_string_blob(&strings);
        writer.write_section(strings.len() as u32, BYTE_UNIT, &blob)?;

        // Object table.
        let mut payload = Vec::with_capacity(set.objects.len() * V1_OBJECT_UNIT as usize);
        for obj in &set.objects {
            let id = ids.find_or_insert_id(obj.addr);
            payload.extend_from_slice(&obj.addr.to_le_bytes());
            payload.extend_from_slice(&id.to_le_bytes());
            payload.extend_from_slice(&(obj.size as u32).to_le_bytes());
            payload.extend_from_slice(&obj.offset.to_le_bytes());
        }
        writer.write_section(set.objects.len() as u32, V1_OBJECT_UNIT, &payload)?;

        // Object memory, copied verbatim in parallel shards.
        let memory = copy_object_mem_to_buf(&set.objects, set.memory_len, |_, _| {});
        writer.write_section(memory.len() as u32, BYTE_UNIT, &memory)?;

        writer.write_trailer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::stream::VecStream;
    use crate::vm::value::TaggedValue;

    #[test]
    fn test_v1_dump_prelude_and_sections() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let s = heap.alloc_string("v1 payload");
        roots.add_global(TaggedValue::object(s));

        let mut ids = EntryIdMap::new();
        let mut stream = VecStream::new();
        RawHeapDumpV1::dump(&heap, &roots, &mut ids, &mut stream).unwrap();

        let bytes = stream.as_slice();
        assert_eq!(&bytes[0..8], &VERSION_V1);

        let n = bytes.len();
        let count = u32::from_le_bytes(bytes[n - 8..n - 4].try_into().unwrap());
        assert_eq!(count, crate::profiler::rawheap::SECTION_COUNT);
    }

    #[test]
    fn test_v1_object_table_records_ids() {
        let mut heap = Heap::new();
        let mut roots = RootSet::new();
        let s = heap.alloc_string("identified");
        roots.add_global(TaggedValue::object(s));

        let mut ids = EntryIdMap::new();
        let known_id = ids.find_or_insert_id(s);

        let mut stream = VecStream::new();
        RawHeapDumpV1::dump(&heap, &roots, &mut ids, &mut stream).unwrap();
        let bytes = stream.as_slice();

        // Locate the object table (4th section) via the trailer.
        let n = bytes.len();
        let pairs = n - 8 - (crate::profiler::rawheap::SECTION_COUNT * 8) as usize;
        let off = u32::from_le_bytes(bytes[pairs + 24..pairs + 28].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let unit = u32::from_le_bytes(bytes[off + 4..off + 8].try_into().unwrap());
        assert_eq!(unit, V1_OBJECT_UNIT);
        assert!(count > 0);

        // The rooted string keeps its pre-assigned id.
        let mut found = false;
        for i in 0..count as usize {
            let rec = off + 8 + i * V1_OBJECT_UNIT as usize;
            let addr = u64::from_le_bytes(bytes[rec..rec + 8].try_into().unwrap());
            let id = u64::from_le_bytes(bytes[rec + 8..rec + 16].try_into().unwrap());
            if addr == s {
                assert_eq!(id, known_id);
                found = true;
            }
        }
        assert!(found);
    }
}
