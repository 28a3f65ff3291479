//! Karst VM Engine
//!
//! A slice of a managed-runtime VM built around its heap-profiling
//! subsystem:
//! - **VM**: tagged values, the object model, the region heap, the
//!   mark-compact collector, and stop-the-world coordination (`vm` module)
//! - **Profiler**: stable node identity, snapshot graph construction,
//!   Chrome DevTools JSON output, the raw-heap binary dump protocol with
//!   its offline decoder, heap tracking, and allocation sampling
//!   (`profiler` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use karst_engine::vm::{TaggedValue, VmContext};
//! use karst_engine::profiler::{DumpSnapshotOption, FileStream};
//!
//! let mut vm = VmContext::new();
//! let s = vm.heap_mut().alloc_string("hello");
//! vm.roots_mut().add_global(TaggedValue::object(s));
//!
//! let profiler = vm.get_or_new_heap_profile();
//! let mut stream = FileStream::new("heap.heapsnapshot".as_ref())?;
//! profiler.dump_heap_snapshot(
//!     &mut vm,
//!     &mut stream,
//!     &DumpSnapshotOption::default(),
//!     None,
//!     None,
//! );
//! ```

#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// VM module: values, object model, GC heap, safepoints
pub mod vm;

/// Profiler module: snapshots, serializers, dump orchestration
pub mod profiler;

// ============================================================================
// Re-exports
// ============================================================================

pub use profiler::{
    DumpFormat, DumpHeapSnapshotStatus, DumpSnapshotOption, HeapProfiler, HeapSnapshot,
    Progress, Stream,
};
pub use vm::{TaggedValue, VmContext};
