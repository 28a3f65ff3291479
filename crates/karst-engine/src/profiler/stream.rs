//! Streaming sinks for dump output
//!
//! The serializers only know [`Stream`]: binary block writes plus the
//! tracking-mode callbacks. Concrete sinks are a buffered file writer with
//! a 4 GiB cap, a raw file-descriptor writer for fault-log integration on
//! unix, and an in-memory buffer for tests.

use super::entry_id_map::NodeId;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Dump files are capped at 4 GiB; crossing the cap is a hard I/O failure.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// One bucket of the tracking-mode statistics stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStatsUpdate {
    /// Time-interval index this bucket belongs to.
    pub index: u32,
    /// Objects allocated in the interval.
    pub count: u32,
    /// Bytes allocated in the interval.
    pub size: u32,
}

/// Byte sink consumed by the snapshot serializers.
pub trait Stream {
    /// Write one block; false on failure (the stream turns bad).
    fn write_bin_block(&mut self, data: &[u8]) -> bool;

    /// Whether the stream is still writable.
    fn good(&self) -> bool;

    /// Flush and finish the stream.
    fn end_of_stream(&mut self) {}

    /// Bytes written so far.
    fn get_size(&self) -> usize;

    /// Tracking mode: push allocation statistics buckets.
    fn update_heap_stats(&mut self, _stats: &[HeapStatsUpdate]) -> bool {
        true
    }

    /// Tracking mode: report the highest node id assigned so far.
    fn update_last_seen_object_id(&mut self, _id: NodeId, _timestamp_us: u64) -> bool {
        true
    }
}

/// Buffered file sink.
pub struct FileStream {
    writer: Option<BufWriter<File>>,
    written: u64,
    good: bool,
}

impl FileStream {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            written: 0,
            good: true,
        })
    }
}

impl Stream for FileStream {
    fn write_bin_block(&mut self, data: &[u8]) -> bool {
        if !self.good {
            return false;
        }
        if self.written + data.len() as u64 > MAX_FILE_SIZE {
            log::error!(
                "dump exceeds the {} byte file cap at offset {}",
                MAX_FILE_SIZE,
                self.written
            );
            self.good = false;
            return false;
        }
        match self.writer.as_mut() {
            Some(w) => match w.write_all(data) {
                Ok(()) => {
                    self.written += data.len() as u64;
                    true
                }
                Err(e) => {
                    log::error!("dump write failed: {e}");
                    self.good = false;
                    false
                }
            },
            None => false,
        }
    }

    fn good(&self) -> bool {
        self.good
    }

    fn end_of_stream(&mut self) {
        if let Some(mut w) = self.writer.take() {
            if let Err(e) = w.flush() {
                log::error!("dump flush failed: {e}");
                self.good = false;
            }
        }
    }

    fn get_size(&self) -> usize {
        self.written as usize
    }
}

/// Raw file-descriptor sink for OOM fault-log integration. The descriptor
/// is borrowed, not owned; the caller closes it.
#[cfg(unix)]
pub struct FileDescriptorStream {
    fd: std::os::unix::io::RawFd,
    written: usize,
    good: bool,
}

#[cfg(unix)]
impl FileDescriptorStream {
    pub fn new(fd: std::os::unix::io::RawFd) -> Self {
        Self {
            fd,
            written: 0,
            good: fd >= 0,
        }
    }
}

#[cfg(unix)]
impl Stream for FileDescriptorStream {
    fn write_bin_block(&mut self, data: &[u8]) -> bool {
        if !self.good {
            return false;
        }
        let mut off = 0;
        while off < data.len() {
            // SAFETY: fd is a caller-supplied open descriptor and the
            // buffer range is in bounds.
            let n = unsafe {
                libc::write(
                    self.fd,
                    data[off..].as_ptr() as *const libc::c_void,
                    data.len() - off,
                )
            };
            if n <= 0 {
                log::error!("fd write failed at offset {}", self.written + off);
                self.good = false;
                return false;
            }
            off += n as usize;
        }
        self.written += data.len();
        true
    }

    fn good(&self) -> bool {
        self.good
    }

    fn get_size(&self) -> usize {
        self.written
    }
}

/// In-memory sink, used by tests and the offline converter.
#[derive(Default)]
pub struct VecStream {
    buf: Vec<u8>,
    stats: Vec<HeapStatsUpdate>,
    last_seen_id: Option<(NodeId, u64)>,
}

impl VecStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Tracking callbacks received so far (test observability).
    pub fn heap_stats(&self) -> &[HeapStatsUpdate] {
        &self.stats
    }

    pub fn last_seen_id(&self) -> Option<(NodeId, u64)> {
        self.last_seen_id
    }
}

impl Stream for VecStream {
    fn write_bin_block(&mut self, data: &[u8]) -> bool {
        self.buf.extend_from_slice(data);
        true
    }

    fn good(&self) -> bool {
        true
    }

    fn get_size(&self) -> usize {
        self.buf.len()
    }

    fn update_heap_stats(&mut self, stats: &[HeapStatsUpdate]) -> bool {
        self.stats.extend_from_slice(stats);
        true
    }

    fn update_last_seen_object_id(&mut self, id: NodeId, timestamp_us: u64) -> bool {
        self.last_seen_id = Some((id, timestamp_us));
        true
    }
}
