//! Chrome DevTools `.heapsnapshot` JSON output
//!
//! Streams the snapshot in the exact section order consumers rely on:
//! meta header, flattened `nodes` (8 scalars each), flattened `edges`
//! (3 scalars each, with `to_node` given as the target's flat-array field
//! offset), trace tables, samples, the always-empty `locations`, and the
//! deduplicated `strings`. The file's final line is exactly `}`; downstream
//! consumers detect truncation by that closing brace.

use crate::profiler::snapshot::{
    Edge, EdgeNameOrIndex, HeapSnapshot, TraceNode, EDGE_FIELD_COUNT, NODE_FIELD_COUNT,
};
use crate::profiler::stream::Stream;

/// Flush threshold for the chunked writer.
const CHUNK_SIZE: usize = 1 << 20;

/// Writes a [`HeapSnapshot`] as DevTools-compatible JSON.
pub struct HeapSnapshotJsonSerializer;

impl HeapSnapshotJsonSerializer {
    /// Serialize `snapshot` into `stream`. Returns false when the stream
    /// went bad; partial output may remain in the sink.
    pub fn serialize(snapshot: &HeapSnapshot, stream: &mut dyn Stream) -> bool {
        let mut w = ChunkWriter::new(stream);

        Self::serialize_fixed_header(snapshot, &mut w);
        Self::serialize_nodes(snapshot, &mut w);
        Self::serialize_edges(snapshot, &mut w);
        Self::serialize_trace_function_infos(snapshot, &mut w);
        Self::serialize_trace_tree(snapshot, &mut w);
        Self::serialize_samples(snapshot, &mut w);
        Self::serialize_locations(&mut w);
        Self::serialize_strings(snapshot, &mut w);
        w.write("\n}");

        w.finish()
    }

    fn serialize_fixed_header(snapshot: &HeapSnapshot, w: &mut ChunkWriter<'_>) {
        debug_assert_eq!(NODE_FIELD_COUNT, 8);
        debug_assert_eq!(EDGE_FIELD_COUNT, 3);
        w.write("{\"snapshot\":\n{\"meta\":\n{");
        w.write(
            "\"node_fields\":[\"type\",\"name\",\"id\",\"self_size\",\"edge_count\",\
             \"trace_node_id\",\"detachedness\",\"native_size\"],\n",
        );
        w.write(
            "\"node_types\":[[\"hidden\",\"array\",\"string\",\"object\",\"code\",\
             \"closure\",\"regexp\",\"number\",\"native\",\"synthetic\",\
             \"concatenated string\",\"sliced string\",\"symbol\",\"bigint\"],\
             \"string\",\"number\",\"number\",\"number\",\"number\",\"number\",\"number\"],\n",
        );
        w.write("\"edge_fields\":[\"type\",\"name_or_index\",\"to_node\"],\n");
        w.write(
            "\"edge_types\":[[\"context\",\"element\",\"property\",\"internal\",\
             \"hidden\",\"shortcut\",\"weak\"],\"string_or_number\",\"node\"],\n",
        );
        w.write(
            "\"trace_function_info_fields\":[\"function_id\",\"name\",\"script_name\",\
             \"script_id\",\"line\",\"column\"],\n",
        );
        w.write(
            "\"trace_node_fields\":[\"id\",\"function_info_index\",\"count\",\"size\",\
             \"children\"],\n",
        );
        w.write("\"sample_fields\":[\"timestamp_us\",\"last_assigned_id\"],\n");
        w.write("\"location_fields\":[\"object_index\",\"script_id\",\"line\",\"column\"]},\n");
        w.write(&format!(
            "\"node_count\":{},\n\"edge_count\":{},\n\"trace_function_count\":{}}},\n",
            snapshot.nodes().len(),
            snapshot.edges().len(),
            snapshot.trace_function_infos().len(),
        ));
    }

    fn serialize_nodes(snapshot: &HeapSnapshot, w: &mut ChunkWriter<'_>) {
        w.write("\"nodes\":[");
        for (i, node) in snapshot.nodes().iter().enumerate() {
            if i > 0 {
                w.write(",\n");
            }
            // type,name,id,self_size,edge_count,trace_node_id,detachedness,native_size
            w.write(&format!(
                "{},{},{},{},{},{},0,{}",
                node.node_type as u8,
                node.name,
                node.id,
                node.self_size,
                node.edge_count,
                node.trace_id,
                node.native_size,
            ));
        }
        w.write("],\n");
    }

    fn serialize_edges(snapshot: &HeapSnapshot, w: &mut ChunkWriter<'_>) {
        w.write("\"edges\":[");
        for (i, edge) in snapshot.edges().iter().enumerate() {
            if i > 0 {
                w.write(",\n");
            }
            // type,name_or_index,to_node. Targets are addressed by their
            // offset into the flattened nodes array.
            let name_or_index = match edge.name_or_index {
                EdgeNameOrIndex::Name(id) => id,
                EdgeNameOrIndex::Index(idx) => idx,
            };
            w.write(&format!(
                "{},{},{}",
                edge.edge_type as u8,
                name_or_index,
                Self::to_node_offset(edge),
            ));
        }
        w.write("],\n");
    }

    #[inline]
    fn to_node_offset(edge: &Edge) -> u32 {
        edge.to * NODE_FIELD_COUNT
    }

    fn serialize_trace_function_infos(snapshot: &HeapSnapshot, w: &mut ChunkWriter<'_>) {
        w.write("\"trace_function_infos\":[");
        for (i, info) in snapshot.trace_function_infos().iter().enumerate() {
            if i > 0 {
                w.write(",\n");
            }
            w.write(&format!(
                "{},{},{},{},{},{}",
                info.function_id, info.name, info.script_name, info.script_id, info.line,
                info.column,
            ));
        }
        w.write("],\n");
    }

    fn serialize_trace_tree(snapshot: &HeapSnapshot, w: &mut ChunkWriter<'_>) {
        w.write("\"trace_tree\":[");
        if !snapshot.trace_function_infos().is_empty() {
            Self::serialize_trace_node(&snapshot.trace_tree().root, w);
        }
        w.write("],\n");
    }

    fn serialize_trace_node(node: &TraceNode, w: &mut ChunkWriter<'_>) {
        w.write(&format!(
            "{},{},{},{},[",
            node.id, node.function_info_index, node.count, node.size
        ));
        for (i, child) in node.children.iter().enumerate() {
            if i > 0 {
                w.write(",");
            }
            Self::serialize_trace_node(child, w);
        }
        w.write("]");
    }

    fn serialize_samples(snapshot: &HeapSnapshot, w: &mut ChunkWriter<'_>) {
        w.write("\"samples\":[");
        let first_ts = snapshot.samples().first().map(|s| s.timestamp_us).unwrap_or(0);
        for (i, sample) in snapshot.samples().iter().enumerate() {
            if i > 0 {
                w.write(",\n");
            }
            // Timestamps are deltas relative to the first sample.
            w.write(&format!(
                "{},{}",
                sample.timestamp_us - first_ts,
                sample.last_sequence_id
            ));
        }
        w.write("],\n");
    }

    fn serialize_locations(w: &mut ChunkWriter<'_>) {
        // Source locations are not captured.
        w.write("\"locations\":[],\n");
    }

    fn serialize_strings(snapshot: &HeapSnapshot, w: &mut ChunkWriter<'_>) {
        w.write("\"strings\":[");
        for (i, s) in snapshot.strings().iter().enumerate() {
            if i > 0 {
                w.write(",\n");
            }
            let mut escaped = String::with_capacity(s.len() + 2);
            escape_json_string(&mut escaped, s);
            w.write(&escaped);
        }
        w.write("]");
    }
}

/// Escape `s` into a quoted JSON string: control characters get their short
/// escapes, everything non-ASCII is emitted as `\uXXXX` (with surrogate
/// pairs beyond the BMP).
pub fn escape_json_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if c.is_ascii() => out.push(c),
            c => {
                let cp = c as u32;
                if cp <= 0xFFFF {
                    out.push_str(&format!("\\u{cp:04x}"));
                } else {
                    // Encode as a UTF-16 surrogate pair.
                    let v = cp - 0x10000;
                    let high = 0xD800 + (v >> 10);
                    let low = 0xDC00 + (v & 0x3FF);
                    out.push_str(&format!("\\u{high:04x}\\u{low:04x}"));
                }
            }
        }
    }
    out.push('"');
}

/// Buffered writer flushing fixed-size chunks into the stream.
struct ChunkWriter<'a> {
    stream: &'a mut dyn Stream,
    buf: String,
    ok: bool,
}

impl<'a> ChunkWriter<'a> {
    fn new(stream: &'a mut dyn Stream) -> Self {
        Self {
            stream,
            buf: String::with_capacity(CHUNK_SIZE + 4096),
            ok: true,
        }
    }

    fn write(&mut self, s: &str) {
        if !self.ok {
            return;
        }
        self.buf.push_str(s);
        if self.buf.len() >= CHUNK_SIZE {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if !self.buf.is_empty() {
            if !self.stream.write_bin_block(self.buf.as_bytes()) {
                self.ok = false;
            }
            self.buf.clear();
        }
    }

    fn finish(mut self) -> bool {
        self.flush();
        self.stream.end_of_stream();
        self.ok && self.stream.good()
    }
}
