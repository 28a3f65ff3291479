//! Heap profiler
//!
//! The orchestrator over the snapshot machinery: owns the stable-id table
//! and the retained snapshots, drives full dumps (JSON and binary, on the
//! calling thread or in a forked child), heap-tracking timelines, and
//! statistical allocation sampling, and receives the collector's
//! allocation/move hooks so node identity survives GC compaction.

pub mod entry_id_map;
pub mod marker;
pub mod output;
pub mod rawheap;
pub mod sampling;
pub mod snapshot;
pub mod stream;
pub mod string_table;
pub mod tracker;

pub use entry_id_map::{EntryIdMap, NodeId, SEQ_STEP};
pub use marker::{HeapMarker, ObjectMarker, RootMarker};
pub use output::HeapSnapshotJsonSerializer;
pub use rawheap::{decode_rawheap, RawHeapDumpV1, RawHeapDumpV2, RawHeapError};
pub use sampling::{HeapSampling, SamplingInfo};
pub use snapshot::{HeapSnapshot, NodeType};
pub use stream::{FileStream, Stream, VecStream};
pub use string_table::StringTable;
pub use tracker::HeapTracker;

use crate::vm::gc::{GcListener, HeapCounters};
use crate::vm::safepoint::{StopReason, SuspendAllScope};
use crate::vm::value::ObjAddr;
use crate::vm::VmContext;
use parking_lot::Mutex;
use rawheap::decode::translate_rawheap;
use rawheap::RawHeapVersion;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Retained snapshots are ring-evicted beyond this count.
pub const MAX_NUM_HPROF: usize = 5;

/// How long the parent waits for a forked dump child before escalating.
#[cfg(unix)]
const FORK_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(unix)]
const FORK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// On-disk format of a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum DumpFormat {
    #[default]
    Json,
    Binary,
    Other,
}

/// Dump configuration, recognized by every dump entry point.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DumpSnapshotOption {
    pub dump_format: DumpFormat,
    pub is_vm_mode: bool,
    /// Suppress string contents in the emitted snapshot.
    pub is_private: bool,
    pub capture_numeric_value: bool,
    /// Force a full collection before walking the heap.
    pub is_full_gc: bool,
    pub is_simplify: bool,
    /// Dump on the calling thread instead of a forked child.
    pub is_sync: bool,
    /// Commit node ids for the whole reachable set before forking, so the
    /// parent and the child agree on identity.
    pub is_before_fill: bool,
    /// The dump runs from an OOM handler: never fork, never force GC.
    pub is_dump_oom: bool,
}

impl Default for DumpSnapshotOption {
    fn default() -> Self {
        Self {
            dump_format: DumpFormat::Json,
            is_vm_mode: true,
            is_private: false,
            capture_numeric_value: false,
            is_full_gc: true,
            is_simplify: false,
            is_sync: true,
            is_before_fill: true,
            is_dump_oom: false,
        }
    }
}

/// Outcome reported through the dump status callback.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpHeapSnapshotStatus {
    Success = 0,
    FailedToWait = 1,
    WaitForkProcessTimeout = 2,
    ForkFailed = 3,
}

/// Status callback for asynchronous dumps; invoked from the watcher thread.
pub type DumpCallback = Box<dyn Fn(DumpHeapSnapshotStatus) + Send>;

/// Dump progress reporting.
pub trait Progress {
    fn report_progress(&mut self, done: u32, total: u32);
}

struct TrackingSession {
    snapshot: Box<HeapSnapshot>,
    tracker: HeapTracker,
}

/// State behind the profiler's mutex: everything the GC move hook touches.
struct ProfilerInner {
    entry_id_map: EntryIdMap,
    hprofs: Vec<Box<HeapSnapshot>>,
    tracking: Option<TrackingSession>,
}

/// Per-VM heap profiler. Attach through
/// [`VmContext::get_or_new_heap_profile`]; all entry points take `&self`
/// and synchronize internally, since the GC hooks arrive from collector
/// context.
pub struct HeapProfiler {
    inner: Mutex<ProfilerInner>,
    sampling: Mutex<Option<HeapSampling>>,
    /// Set once any profiling session or dump has happened; gates the GC
    /// hooks' fast path.
    is_profiling: AtomicBool,
    raw_heap_version: Mutex<RawHeapVersion>,
    oom_dump_path: Mutex<PathBuf>,
    counters: Arc<HeapCounters>,
}

impl HeapProfiler {
    pub fn new(counters: Arc<HeapCounters>) -> Self {
        Self {
            inner: Mutex::new(ProfilerInner {
                entry_id_map: EntryIdMap::new(),
                hprofs: Vec::new(),
                tracking: None,
            }),
            sampling: Mutex::new(None),
            is_profiling: AtomicBool::new(false),
            raw_heap_version: Mutex::new(RawHeapVersion::V2),
            oom_dump_path: Mutex::new(std::env::temp_dir().join("karst_oom.rawheap")),
            counters,
        }
    }

    /// Select the binary dump wire version (V2 by default).
    pub fn set_raw_heap_version(&self, version: RawHeapVersion) {
        *self.raw_heap_version.lock() = version;
    }

    /// Where OOM dumps land.
    pub fn set_oom_dump_path(&self, path: PathBuf) {
        *self.oom_dump_path.lock() = path;
    }

    /// Number of addresses with assigned node ids.
    pub fn get_id_count(&self) -> usize {
        self.inner.lock().entry_id_map.size()
    }

    /// Retained snapshot count (tracking and dump history).
    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().hprofs.len()
    }

    // ── Full dumps ─────────────────────────────────────────────────────

    /// Dump a heap snapshot into `stream`.
    ///
    /// Synchronous dumps stop the world and block until the stream is
    /// fully written. Asynchronous dumps freeze the mutators, commit node
    /// ids, fork, and write from the child while a watcher thread guards
    /// the wait with a timeout; the outcome arrives via `callback`.
    pub fn dump_heap_snapshot(
        &self,
        vm: &mut VmContext,
        stream: &mut dyn Stream,
        opt: &DumpSnapshotOption,
        progress: Option<&mut dyn Progress>,
        callback: Option<DumpCallback>,
    ) -> bool {
        if opt.is_sync || opt.is_dump_oom {
            let ok = self.dump_sync(vm, stream, opt, progress, false);
            if ok {
                if let Some(cb) = callback {
                    cb(DumpHeapSnapshotStatus::Success);
                }
            }
            return ok;
        }
        self.dump_fork(vm, stream, opt, callback)
    }

    /// OOM-handler dump: always in-process (the process may be too
    /// memory-constrained to fork), binary format for compactness except
    /// on 32-bit ARM where the tooling still wants JSON.
    pub fn dump_heap_snapshot_for_oom(
        &self,
        vm: &mut VmContext,
        opt: &DumpSnapshotOption,
        from_shared_gc: bool,
    ) -> bool {
        log::error!(
            "OOM heap dump requested at {} allocated bytes",
            self.counters
                .allocated_bytes
                .load(Ordering::Relaxed)
        );
        let mut oom_opt = opt.clone();
        oom_opt.is_dump_oom = true;
        oom_opt.is_sync = true;
        oom_opt.is_full_gc = false;
        oom_opt.dump_format = if cfg!(target_arch = "arm") {
            DumpFormat::Json
        } else {
            DumpFormat::Binary
        };

        let path = self.oom_dump_path.lock().clone();
        let mut stream = match FileStream::new(&path) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("cannot open OOM dump file {}: {e}", path.display());
                return false;
            }
        };
        self.dump_sync(vm, &mut stream, &oom_opt, None, from_shared_gc)
    }

    fn dump_sync(
        &self,
        vm: &mut VmContext,
        stream: &mut dyn Stream,
        opt: &DumpSnapshotOption,
        mut progress: Option<&mut dyn Progress>,
        already_suspended: bool,
    ) -> bool {
        let _scope = if already_suspended {
            None
        } else {
            Some(SuspendAllScope::new(vm.safepoint(), StopReason::HeapDump))
        };
        self.is_profiling.store(true, Ordering::Release);

        if opt.is_full_gc && !opt.is_dump_oom {
            vm.collect_garbage_in_pause();
        }

        let total = vm.heap().object_count() as u32;
        if let Some(p) = progress.as_deref_mut() {
            p.report_progress(0, total);
        }

        let ok = match opt.dump_format {
            DumpFormat::Json => self.dump_json(vm, stream, opt),
            DumpFormat::Binary | DumpFormat::Other => self.dump_binary(vm, stream),
        };

        if let Some(p) = progress {
            p.report_progress(total, total);
        }
        ok && stream.good()
    }

    fn dump_json(&self, vm: &VmContext, stream: &mut dyn Stream, opt: &DumpSnapshotOption) -> bool {
        let mut inner = self.inner.lock();
        let mut snapshot = Box::new(HeapSnapshot::new(
            opt.is_private,
            opt.capture_numeric_value,
            opt.is_simplify,
            false,
        ));
        snapshot.build_up(vm.heap(), vm.roots(), &mut inner.entry_id_map);
        Self::update_entry_id_map(&mut inner.entry_id_map, &snapshot);

        let ok = HeapSnapshotJsonSerializer::serialize(&snapshot, stream);
        inner.hprofs.push(snapshot);
        if inner.hprofs.len() > MAX_NUM_HPROF {
            inner.hprofs.remove(0);
        }
        ok
    }

    fn dump_binary(&self, vm: &VmContext, stream: &mut dyn Stream) -> bool {
        let mut inner = self.inner.lock();
        let version = *self.raw_heap_version.lock();
        let result = match version {
            RawHeapVersion::V1 => {
                RawHeapDumpV1::dump(vm.heap(), vm.roots(), &mut inner.entry_id_map, stream)
            }
            RawHeapVersion::V2 => {
                RawHeapDumpV2::dump(vm.heap(), vm.roots(), &mut inner.entry_id_map, stream)
            }
        };

        // Reclaim ids of objects that died since the last pass.
        let mut marker = HeapMarker::new();
        let seeds = RootMarker::mark(vm.roots(), &mut marker);
        ObjectMarker::traverse(vm.heap(), &mut marker, seeds);
        inner.entry_id_map.remove_unmarked_objects(&marker);

        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("raw heap dump failed: {e}");
                false
            }
        }
    }

    /// Drop id-map entries for addresses that produced no node, keeping
    /// ids comparable across consecutive dumps.
    fn update_entry_id_map(ids: &mut EntryIdMap, snapshot: &HeapSnapshot) {
        let mut marker = HeapMarker::new();
        for node in snapshot.nodes() {
            if node.address != 0 {
                marker.mark(node.address);
            }
        }
        ids.remove_unmarked_objects(&marker);
    }

    #[cfg(unix)]
    fn dump_fork(
        &self,
        vm: &mut VmContext,
        stream: &mut dyn Stream,
        opt: &DumpSnapshotOption,
        callback: Option<DumpCallback>,
    ) -> bool {
        let _scope = SuspendAllScope::new(vm.safepoint(), StopReason::HeapDump);
        self.is_profiling.store(true, Ordering::Release);

        if opt.is_full_gc {
            vm.collect_garbage_in_pause();
        }
        if opt.is_before_fill {
            // Commit ids while both processes still share the heap image.
            let mut inner = self.inner.lock();
            let mut marker = HeapMarker::new();
            let seeds = RootMarker::mark(vm.roots(), &mut marker);
            ObjectMarker::traverse(vm.heap(), &mut marker, seeds);
            marker.iterate_marked(|addr| {
                inner.entry_id_map.find_or_insert_id(addr);
            });
        }

        // SAFETY: every mutator is parked and no profiler lock is held, so
        // the child inherits a quiescent heap image.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            log::error!("fork for heap dump failed");
            if let Some(cb) = callback {
                cb(DumpHeapSnapshotStatus::ForkFailed);
            }
            return false;
        }
        if pid == 0 {
            // Child: write the dump from the private copy, then exit
            // without running any parent-owned destructors.
            let ok = match opt.dump_format {
                DumpFormat::Json => self.dump_json(vm, stream, opt),
                DumpFormat::Binary | DumpFormat::Other => self.dump_binary(vm, stream),
            };
            // SAFETY: terminating the forked child.
            unsafe { libc::_exit(if ok && stream.good() { 0 } else { 1 }) };
        }

        // Parent: detach a watcher for the child.
        let spawned = std::thread::Builder::new()
            .name("karst-dump-watcher".into())
            .spawn(move || Self::wait_process(pid, callback));
        if let Err(e) = spawned {
            log::error!("cannot spawn dump watcher: {e}");
            return false;
        }
        true
    }

    #[cfg(not(unix))]
    fn dump_fork(
        &self,
        vm: &mut VmContext,
        stream: &mut dyn Stream,
        opt: &DumpSnapshotOption,
        callback: Option<DumpCallback>,
    ) -> bool {
        // No process isolation on this target; fall back to a synchronous
        // dump and say so through the status callback.
        log::warn!("fork-based dump unavailable on this platform, dumping synchronously");
        if let Some(cb) = &callback {
            cb(DumpHeapSnapshotStatus::ForkFailed);
        }
        self.dump_sync(vm, stream, opt, None, false)
    }

    #[cfg(unix)]
    fn wait_process(pid: libc::pid_t, callback: Option<DumpCallback>) {
        let deadline = std::time::Instant::now() + FORK_WAIT_TIMEOUT;
        let status = loop {
            let mut wstatus: libc::c_int = 0;
            // SAFETY: pid names the child forked above.
            let r = unsafe { libc::waitpid(pid, &mut wstatus, libc::WNOHANG) };
            if r == pid {
                if libc::WIFEXITED(wstatus) && libc::WEXITSTATUS(wstatus) == 0 {
                    break DumpHeapSnapshotStatus::Success;
                }
                break DumpHeapSnapshotStatus::FailedToWait;
            }
            if r < 0 {
                log::error!("waitpid for dump child {pid} failed");
                break DumpHeapSnapshotStatus::FailedToWait;
            }
            if std::time::Instant::now() >= deadline {
                log::error!("dump child {pid} timed out, sending SIGTERM");
                // SAFETY: see above.
                unsafe { libc::kill(pid, libc::SIGTERM) };
                break DumpHeapSnapshotStatus::WaitForkProcessTimeout;
            }
            std::thread::sleep(FORK_POLL_INTERVAL);
        };
        if let Some(cb) = callback {
            cb(status);
        }
    }

    // ── Heap tracking ──────────────────────────────────────────────────

    /// Begin a heap-timeline session. Refused while one is active.
    pub fn start_heap_tracking(
        &self,
        vm: &mut VmContext,
        time_interval: Duration,
        trace_allocation: bool,
        new_thread: bool,
    ) -> bool {
        let _scope = SuspendAllScope::new(vm.safepoint(), StopReason::HeapDump);
        let mut inner = self.inner.lock();
        if inner.tracking.is_some() {
            log::warn!("heap tracking is already active");
            return false;
        }
        let mut snapshot = Box::new(HeapSnapshot::new(false, false, false, trace_allocation));
        snapshot.build_up(vm.heap(), vm.roots(), &mut inner.entry_id_map);
        inner.tracking = Some(TrackingSession {
            snapshot,
            tracker: HeapTracker::new(time_interval, new_thread),
        });
        self.is_profiling.store(true, Ordering::Release);
        true
    }

    /// Refresh the tracked snapshot and append a timeline sample. Forces a
    /// full collection first to get a stable live-object baseline.
    pub fn update_heap_tracking(
        &self,
        vm: &mut VmContext,
        mut stream: Option<&mut dyn Stream>,
    ) -> bool {
        vm.collect_garbage();
        let _scope = SuspendAllScope::new(vm.safepoint(), StopReason::HeapDump);
        let mut inner = self.inner.lock();
        let ProfilerInner {
            entry_id_map,
            tracking,
            ..
        } = &mut *inner;
        let Some(session) = tracking.as_mut() else {
            log::warn!("heap tracking is not active");
            return false;
        };

        let timestamp_us = session.tracker.elapsed_us();
        session.snapshot.update_nodes(vm.heap(), entry_id_map, false);
        session
            .snapshot
            .add_time_stamp(vm.heap(), timestamp_us, entry_id_map);

        if let Some(stream) = stream.as_deref_mut() {
            if !session.tracker.flush_stats(stream) {
                return false;
            }
            if !stream.update_last_seen_object_id(entry_id_map.get_last_id(), timestamp_us) {
                return false;
            }
        }
        true
    }

    /// Finish the timeline: final node refresh, edge rebuild, and
    /// serialization into `stream`.
    pub fn stop_heap_tracking(
        &self,
        vm: &mut VmContext,
        stream: &mut dyn Stream,
        progress: Option<&mut dyn Progress>,
    ) -> bool {
        vm.collect_garbage();
        let _scope = SuspendAllScope::new(vm.safepoint(), StopReason::HeapDump);
        let mut inner = self.inner.lock();
        let ProfilerInner {
            entry_id_map,
            tracking,
            hprofs,
        } = &mut *inner;
        let Some(mut session) = tracking.take() else {
            log::warn!("heap tracking is not active");
            return false;
        };

        let total = vm.heap().object_count() as u32;
        if let Some(p) = progress {
            p.report_progress(total, total);
        }

        let timestamp_us = session.tracker.elapsed_us();
        session.snapshot.update_nodes(vm.heap(), entry_id_map, true);
        session
            .snapshot
            .add_time_stamp(vm.heap(), timestamp_us, entry_id_map);

        let ok = HeapSnapshotJsonSerializer::serialize(&session.snapshot, stream);
        hprofs.push(session.snapshot);
        if hprofs.len() > MAX_NUM_HPROF {
            hprofs.remove(0);
        }
        ok
    }

    // ── Allocation sampling ────────────────────────────────────────────

    /// Start statistical allocation sampling. Refused while a sampler is
    /// active.
    pub fn start_heap_sampling(&self, sampling_interval: u64, stack_depth: usize) -> bool {
        let mut sampling = self.sampling.lock();
        if sampling.is_some() {
            log::warn!("heap sampling is already in progress");
            return false;
        }
        *sampling = Some(HeapSampling::new(sampling_interval, stack_depth));
        self.is_profiling.store(true, Ordering::Release);
        true
    }

    pub fn stop_heap_sampling(&self) {
        self.sampling.lock().take();
    }

    /// Current sampling profile, if a sampler is active.
    pub fn get_allocation_profile(&self) -> Option<SamplingInfo> {
        self.sampling
            .lock()
            .as_ref()
            .map(|s| s.get_allocation_profile())
    }

    // ── Offline conversion ─────────────────────────────────────────────

    /// Batch-convert a raw-heap binary file into a JSON heapsnapshot.
    pub fn generate_heap_snapshot(input: &Path, output: &Path) -> Result<(), RawHeapError> {
        let bytes = std::fs::read(input)?;
        let snapshot = translate_rawheap(&bytes)?;
        let mut stream = FileStream::new(output)?;
        if !HeapSnapshotJsonSerializer::serialize(&snapshot, &mut stream) {
            return Err(RawHeapError::StreamWrite(stream.get_size() as u32));
        }
        Ok(())
    }
}

impl GcListener for HeapProfiler {
    /// Runs on the allocating thread; forwards to the active sessions.
    /// Must not allocate on the managed heap or trigger a collection.
    fn allocation_event(&self, _addr: ObjAddr, size: usize) {
        if !self.is_profiling.load(Ordering::Relaxed) {
            return;
        }
        if let Some(sampling) = self.sampling.lock().as_ref() {
            sampling.allocation(size);
        }
        if let Some(session) = self.inner.lock().tracking.as_ref() {
            session.tracker.allocation_event(size);
        }
    }

    /// Runs inside the GC pause, once per relocated object. The pause is
    /// single-threaded already; the mutex covers callers that are not.
    fn move_event(&self, from: ObjAddr, to: ObjAddr, size: usize) {
        if !self.is_profiling.load(Ordering::Relaxed) {
            return;
        }
        let mut inner = self.inner.lock();
        // A move of a never-registered address is tolerated and dropped.
        inner.entry_id_map.move_entry(from, to);
        if let Some(session) = inner.tracking.as_mut() {
            session.snapshot.move_node(from, to, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::TaggedValue;

    fn profiled_vm() -> (VmContext, Arc<HeapProfiler>) {
        let mut vm = VmContext::new();
        let profiler = vm.get_or_new_heap_profile();
        (vm, profiler)
    }

    #[test]
    fn test_sync_json_dump_smoke() {
        let (mut vm, profiler) = profiled_vm();
        let s = vm.heap_mut().alloc_string("dump me");
        vm.roots_mut().add_global(TaggedValue::object(s));

        let mut stream = VecStream::new();
        let opt = DumpSnapshotOption::default();
        assert!(profiler.dump_heap_snapshot(&mut vm, &mut stream, &opt, None, None));
        let text = String::from_utf8(stream.into_inner()).unwrap();
        assert_eq!(text.lines().last(), Some("}"));
        assert!(profiler.get_id_count() > 0);
        assert_eq!(profiler.snapshot_count(), 1);
    }

    #[test]
    fn test_snapshot_ring_eviction() {
        let (mut vm, profiler) = profiled_vm();
        let s = vm.heap_mut().alloc_string("retained");
        vm.roots_mut().add_global(TaggedValue::object(s));

        let opt = DumpSnapshotOption::default();
        for _ in 0..MAX_NUM_HPROF + 2 {
            let mut stream = VecStream::new();
            assert!(profiler.dump_heap_snapshot(&mut vm, &mut stream, &opt, None, None));
        }
        assert_eq!(profiler.snapshot_count(), MAX_NUM_HPROF);
    }

    #[test]
    fn test_sampling_session_refuses_double_start() {
        let (_vm, profiler) = profiled_vm();
        assert!(profiler.start_heap_sampling(512, 64));
        assert!(!profiler.start_heap_sampling(512, 64));
        profiler.stop_heap_sampling();
        assert!(profiler.start_heap_sampling(256, 32));
        profiler.stop_heap_sampling();
        assert!(profiler.get_allocation_profile().is_none());
    }

    #[test]
    fn test_sampling_sees_allocations() {
        let (mut vm, profiler) = profiled_vm();
        assert!(profiler.start_heap_sampling(1, 64));
        for i in 0..32 {
            vm.heap_mut().alloc_number(i as f64);
        }
        let profile = profiler.get_allocation_profile().unwrap();
        assert!(profile.total_allocated >= 32 * 16);
        assert!(!profile.samples.is_empty());
        profiler.stop_heap_sampling();
    }

    #[test]
    fn test_tracking_session_lifecycle() {
        let (mut vm, profiler) = profiled_vm();
        let s = vm.heap_mut().alloc_string("baseline");
        vm.roots_mut().add_global(TaggedValue::object(s));

        assert!(profiler.start_heap_tracking(&mut vm, Duration::from_millis(50), false, false));
        assert!(!profiler.start_heap_tracking(&mut vm, Duration::from_millis(50), false, false));

        let extra = vm.heap_mut().alloc_string("allocated during tracking");
        vm.roots_mut().add_global(TaggedValue::object(extra));
        let mut stream = VecStream::new();
        assert!(profiler.update_heap_tracking(&mut vm, Some(&mut stream as &mut dyn Stream)));
        assert!(stream.last_seen_id().is_some());

        let mut out = VecStream::new();
        assert!(profiler.stop_heap_tracking(&mut vm, &mut out, None));
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert_eq!(text.lines().last(), Some("}"));
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(!parsed["samples"].as_array().unwrap().is_empty());

        // Session is gone; a new one may start.
        assert!(profiler.start_heap_tracking(&mut vm, Duration::from_millis(50), false, false));
        let mut out = VecStream::new();
        assert!(profiler.stop_heap_tracking(&mut vm, &mut out, None));
    }

    #[test]
    fn test_oom_dump_writes_binary_file() {
        let (mut vm, profiler) = profiled_vm();
        let s = vm.heap_mut().alloc_string("oom payload");
        vm.roots_mut().add_global(TaggedValue::object(s));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oom.rawheap");
        profiler.set_oom_dump_path(path.clone());

        let opt = DumpSnapshotOption::default();
        assert!(profiler.dump_heap_snapshot_for_oom(&mut vm, &opt, false));
        let bytes = std::fs::read(&path).unwrap();
        assert!(!bytes.is_empty());
        if !cfg!(target_arch = "arm") {
            // Binary format: decodes as a raw heap.
            assert!(decode_rawheap(&bytes).is_ok());
        }
    }

    #[test]
    fn test_binary_dump_version_selection() {
        let (mut vm, profiler) = profiled_vm();
        let s = vm.heap_mut().alloc_string("versioned");
        vm.roots_mut().add_global(TaggedValue::object(s));

        let opt = DumpSnapshotOption {
            dump_format: DumpFormat::Binary,
            ..Default::default()
        };

        profiler.set_raw_heap_version(RawHeapVersion::V1);
        let mut stream = VecStream::new();
        assert!(profiler.dump_heap_snapshot(&mut vm, &mut stream, &opt, None, None));
        assert_eq!(&stream.as_slice()[0..8], &rawheap::VERSION_V1);

        profiler.set_raw_heap_version(RawHeapVersion::V2);
        let mut stream = VecStream::new();
        assert!(profiler.dump_heap_snapshot(&mut vm, &mut stream, &opt, None, None));
        assert_eq!(&stream.as_slice()[0..8], &rawheap::VERSION_V2);
    }

    #[test]
    fn test_move_event_keeps_ids_stable_across_gc() {
        let (mut vm, profiler) = profiled_vm();
        let s = vm.heap_mut().alloc_string("stable identity");
        vm.roots_mut().add_global(TaggedValue::object(s));

        // Skip the pre-dump GC so ids are keyed at the current addresses.
        let opt = DumpSnapshotOption {
            is_full_gc: false,
            ..Default::default()
        };
        let mut stream = VecStream::new();
        assert!(profiler.dump_heap_snapshot(&mut vm, &mut stream, &opt, None, None));

        let id_before = {
            let inner = profiler.inner.lock();
            inner.entry_id_map.find_id(s).1
        };
        assert!(profiler.inner.lock().entry_id_map.contains(s));

        // Compaction relocates the string; the move hook re-keys its id.
        vm.collect_garbage();
        let mut new_addr = 0;
        vm.roots().visit(|v| new_addr = v.heap_addr().unwrap());
        assert_ne!(new_addr, s);
        let (found, id_after) = profiler.inner.lock().entry_id_map.find_id(new_addr);
        assert!(found);
        assert_eq!(id_after, id_before);
    }

    #[test]
    fn test_progress_reported() {
        struct Recorder(Vec<(u32, u32)>);
        impl Progress for Recorder {
            fn report_progress(&mut self, done: u32, total: u32) {
                self.0.push((done, total));
            }
        }

        let (mut vm, profiler) = profiled_vm();
        let s = vm.heap_mut().alloc_string("progress");
        vm.roots_mut().add_global(TaggedValue::object(s));

        let mut recorder = Recorder(Vec::new());
        let mut stream = VecStream::new();
        let opt = DumpSnapshotOption::default();
        assert!(profiler.dump_heap_snapshot(
            &mut vm,
            &mut stream,
            &opt,
            Some(&mut recorder as &mut dyn Progress),
            None
        ));
        assert_eq!(recorder.0.len(), 2);
        assert_eq!(recorder.0[0].0, 0);
        assert_eq!(recorder.0[1].0, recorder.0[1].1);
    }
}
