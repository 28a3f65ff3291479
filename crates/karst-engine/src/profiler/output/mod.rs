//! Snapshot output formats.

pub mod heapsnapshot;

pub use heapsnapshot::HeapSnapshotJsonSerializer;
