//! End-to-end heap profiler tests: dump, convert, and diff whole heaps
//! through the public API.

use karst_engine::profiler::rawheap::RawHeapVersion;
use karst_engine::profiler::{DumpFormat, DumpSnapshotOption, Stream, VecStream};
use karst_engine::vm::{TaggedValue, VmContext};
use karst_engine::HeapProfiler;
use serde_json::Value;

const NODE_FIELDS: usize = 8;
const EDGE_FIELDS: usize = 3;

/// Build a VM with a small object graph and return interesting roots.
fn populated_vm() -> VmContext {
    let mut vm = VmContext::new();
    let heap = vm.heap_mut();

    let cls = heap.new_object_class("Session", &["user", "token", "attempts"]);
    let user = heap.alloc_string("persistent-user-name");
    let token = heap.alloc_string("persistent-token-value");
    let attempts = heap.alloc_number(7.0);
    let session = heap.alloc_object(
        cls,
        &[
            TaggedValue::object(user),
            TaggedValue::object(token),
            TaggedValue::object(attempts),
        ],
    );
    let cache = heap.alloc_array(&[
        TaggedValue::object(session),
        TaggedValue::weak(user),
        TaggedValue::int(99),
    ]);
    let handler = heap.alloc_function("onSessionExpired", TaggedValue::object(session));

    vm.roots_mut().add_global(TaggedValue::object(cache));
    vm.roots_mut().add_global(TaggedValue::object(handler));
    vm
}

fn dump_json_text(vm: &mut VmContext, opt: &DumpSnapshotOption) -> String {
    let profiler = vm.get_or_new_heap_profile();
    let mut stream = VecStream::new();
    assert!(profiler.dump_heap_snapshot(vm, &mut stream, opt, None, None));
    String::from_utf8(stream.into_inner()).unwrap()
}

/// `(name, type, id)` for every node in a parsed snapshot.
fn ids_by_name(parsed: &Value) -> Vec<(String, u64, u64)> {
    let nodes = parsed["nodes"].as_array().unwrap();
    let strings = parsed["strings"].as_array().unwrap();
    nodes
        .chunks(NODE_FIELDS)
        .map(|chunk| {
            let name = strings[chunk[1].as_u64().unwrap() as usize]
                .as_str()
                .unwrap()
                .to_owned();
            (name, chunk[0].as_u64().unwrap(), chunk[2].as_u64().unwrap())
        })
        .collect()
}

/// Node id for the unique node with this name and wire type (2 = string,
/// 3 = object, 5 = closure). The type disambiguates an object from the
/// string node holding its class name.
fn id_of(parsed: &Value, name: &str, node_type: u64) -> u64 {
    let matches: Vec<u64> = ids_by_name(parsed)
        .into_iter()
        .filter(|(n, t, _)| n == name && *t == node_type)
        .map(|(_, _, id)| id)
        .collect();
    assert_eq!(
        matches.len(),
        1,
        "expected exactly one node named {name} of type {node_type}"
    );
    matches[0]
}

#[test]
fn test_id_consistency_across_dumps_and_gc() {
    let mut vm = populated_vm();
    let opt = DumpSnapshotOption::default();

    let first: Value = serde_json::from_str(&dump_json_text(&mut vm, &opt)).unwrap();

    // Relocate everything, then allocate fresh garbage between dumps.
    vm.collect_garbage();
    for i in 0..64 {
        vm.heap_mut().alloc_string(&format!("transient {i}"));
    }

    let second: Value = serde_json::from_str(&dump_json_text(&mut vm, &opt)).unwrap();

    for (name, node_type) in [
        ("persistent-user-name", 2),
        ("persistent-token-value", 2),
        ("onSessionExpired", 5),
        ("Session", 3),
    ] {
        assert_eq!(
            id_of(&first, name, node_type),
            id_of(&second, name, node_type),
            "node id for {name} must survive GC and redumping"
        );
    }

    // Object populations of consecutive dumps stay close.
    let count1 = first["snapshot"]["node_count"].as_u64().unwrap();
    let count2 = second["snapshot"]["node_count"].as_u64().unwrap();
    assert!(count2.abs_diff(count1) <= 500);
}

#[test]
fn test_id_striping_is_odd_with_step_two() {
    let mut vm = populated_vm();
    let parsed: Value =
        serde_json::from_str(&dump_json_text(&mut vm, &DumpSnapshotOption::default())).unwrap();
    let nodes = parsed["nodes"].as_array().unwrap();

    let mut ids: Vec<u64> = nodes
        .chunks(NODE_FIELDS)
        .map(|chunk| chunk[2].as_u64().unwrap())
        .collect();
    ids.sort_unstable();

    assert_eq!(ids[0], 1, "the synthetic root owns id 1");
    for id in &ids[1..] {
        assert!(*id >= 3, "no real node id below the genesis id");
        assert_eq!(*id % 2, 1, "ids are striped odd");
    }
    // Freshly assigned ids are dense: stride exactly 2.
    for pair in ids[1..].windows(2) {
        assert_eq!(pair[1] - pair[0], 2);
    }
}

#[test]
fn test_json_meta_counts_and_terminator() {
    let mut vm = populated_vm();
    let text = dump_json_text(&mut vm, &DumpSnapshotOption::default());
    assert_eq!(text.lines().last(), Some("}"));

    let parsed: Value = serde_json::from_str(&text).unwrap();
    let node_count = parsed["snapshot"]["node_count"].as_u64().unwrap() as usize;
    let edge_count = parsed["snapshot"]["edge_count"].as_u64().unwrap() as usize;
    assert_eq!(parsed["nodes"].as_array().unwrap().len(), node_count * NODE_FIELDS);
    assert_eq!(parsed["edges"].as_array().unwrap().len(), edge_count * EDGE_FIELDS);

    // Every edge target is a valid flattened node offset.
    for chunk in parsed["edges"].as_array().unwrap().chunks(EDGE_FIELDS) {
        let to = chunk[2].as_u64().unwrap() as usize;
        assert_eq!(to % NODE_FIELDS, 0);
        assert!(to / NODE_FIELDS < node_count);
    }
}

#[test]
fn test_private_dump_suppresses_strings() {
    let mut vm = populated_vm();
    let opt = DumpSnapshotOption {
        is_private: true,
        ..Default::default()
    };
    let parsed: Value = serde_json::from_str(&dump_json_text(&mut vm, &opt)).unwrap();
    let strings = parsed["strings"].as_array().unwrap();
    assert!(!strings
        .iter()
        .any(|s| s.as_str().unwrap().contains("persistent-token-value")));
}

#[test]
fn test_rawheap_round_trip_matches_live_dump() {
    for version in [RawHeapVersion::V1, RawHeapVersion::V2] {
        let mut vm = populated_vm();
        let profiler = vm.get_or_new_heap_profile();
        profiler.set_raw_heap_version(version);

        // Live JSON dump.
        let live: Value =
            serde_json::from_str(&dump_json_text(&mut vm, &DumpSnapshotOption::default()))
                .unwrap();

        // Binary dump, written to disk and converted back offline.
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("heap.rawheap");
        let json_path = dir.path().join("heap.heapsnapshot");
        {
            let mut stream =
                karst_engine::profiler::FileStream::new(&raw_path).unwrap();
            let opt = DumpSnapshotOption {
                dump_format: DumpFormat::Binary,
                ..Default::default()
            };
            assert!(profiler.dump_heap_snapshot(&mut vm, &mut stream, &opt, None, None));
        }
        HeapProfiler::generate_heap_snapshot(&raw_path, &json_path).unwrap();

        let converted: Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(converted["locations"].as_array().unwrap().len(), 0);

        let live_count = live["snapshot"]["node_count"].as_u64().unwrap();
        let converted_count = converted["snapshot"]["node_count"].as_u64().unwrap();
        assert!(
            live_count.abs_diff(converted_count) <= 500,
            "{version:?}: node counts diverged: live {live_count}, converted {converted_count}"
        );

        // The object graph's distinctive names survive the binary round trip.
        for (name, node_type) in [
            ("persistent-user-name", 2),
            ("Session", 3),
            ("onSessionExpired", 5),
        ] {
            assert_eq!(
                id_of(&live, name, node_type),
                id_of(&converted, name, node_type)
            );
        }
    }
}

#[test]
fn test_oom_dump_completes_in_process() {
    let mut vm = populated_vm();
    let profiler = vm.get_or_new_heap_profile();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("oom.rawheap");
    profiler.set_oom_dump_path(path.clone());

    // The OOM path must finish synchronously: output fully on disk by the
    // time the call returns, without any child process involved.
    let opt = DumpSnapshotOption {
        is_sync: false,
        is_dump_oom: true,
        ..Default::default()
    };
    assert!(profiler.dump_heap_snapshot_for_oom(&mut vm, &opt, false));
    let bytes = std::fs::read(&path).unwrap();
    assert!(!bytes.is_empty());
}

#[cfg(unix)]
#[test]
fn test_fork_dump_reports_success() {
    use karst_engine::DumpHeapSnapshotStatus;
    use std::sync::mpsc;
    use std::time::Duration;

    let mut vm = populated_vm();
    let profiler = vm.get_or_new_heap_profile();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forked.heapsnapshot");
    let mut stream = karst_engine::profiler::FileStream::new(&path).unwrap();

    let (tx, rx) = mpsc::channel();
    let opt = DumpSnapshotOption {
        is_sync: false,
        ..Default::default()
    };
    let callback = Box::new(move |status: DumpHeapSnapshotStatus| {
        let _ = tx.send(status);
    });
    assert!(profiler.dump_heap_snapshot(&mut vm, &mut stream, &opt, None, Some(callback)));

    let status = rx
        .recv_timeout(Duration::from_secs(30))
        .expect("watcher thread must report a status");
    assert_eq!(status, DumpHeapSnapshotStatus::Success);

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().last(), Some("}"));
    let parsed: Value = serde_json::from_str(&text).unwrap();
    assert!(parsed["snapshot"]["node_count"].as_u64().unwrap() > 0);
}

#[test]
fn test_tracking_timeline_records_growth() {
    let mut vm = populated_vm();
    let profiler = vm.get_or_new_heap_profile();

    assert!(profiler.start_heap_tracking(
        &mut vm,
        std::time::Duration::from_millis(20),
        false,
        false
    ));

    let mut keepers = Vec::new();
    for i in 0..8 {
        let s = vm.heap_mut().alloc_string(&format!("timeline object {i}"));
        vm.roots_mut().add_global(TaggedValue::object(s));
        keepers.push(s);
        let mut stream = VecStream::new();
        assert!(profiler.update_heap_tracking(&mut vm, Some(&mut stream as &mut dyn Stream)));
    }

    let mut out = VecStream::new();
    assert!(profiler.stop_heap_tracking(&mut vm, &mut out, None));
    let parsed: Value =
        serde_json::from_str(&String::from_utf8(out.into_inner()).unwrap()).unwrap();

    // One (timestamp, last_id) pair per update plus the final one.
    let samples = parsed["samples"].as_array().unwrap();
    assert_eq!(samples.len(), 2 * 9);
    // Later allocations show up as nodes in the final timeline snapshot.
    let names = ids_by_name(&parsed);
    assert!(names.iter().any(|(n, _, _)| n == "timeline object 7"));
}
