//! Heap tracking time series
//!
//! Bookkeeping for the "heap timeline" session: allocations are counted
//! into fixed time buckets, which the profiler flushes to the tracking
//! stream on every update. A ticker thread rolls the current bucket at the
//! configured interval so the timeline keeps moving even while the
//! application is idle; without the thread, buckets roll lazily from the
//! allocation hook's timestamps.

use super::stream::{HeapStatsUpdate, Stream};
use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct Buckets {
    /// Closed buckets awaiting a flush.
    pending: Vec<HeapStatsUpdate>,
    /// Open bucket.
    current: HeapStatsUpdate,
}

struct Shared {
    buckets: Mutex<Buckets>,
    start: Instant,
    interval: Duration,
}

impl Shared {
    /// Close buckets up to the one containing `now`.
    fn roll_to_now(&self) {
        let index = (self.start.elapsed().as_micros() / self.interval.as_micros().max(1)) as u32;
        let mut buckets = self.buckets.lock();
        while buckets.current.index < index {
            let closed = buckets.current;
            buckets.pending.push(closed);
            buckets.current = HeapStatsUpdate {
                index: closed.index + 1,
                count: 0,
                size: 0,
            };
        }
    }
}

/// Allocation time-series recorder for heap-tracking sessions.
pub struct HeapTracker {
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl HeapTracker {
    /// Start tracking with the given bucket interval. When `new_thread` is
    /// set, a ticker thread rolls buckets on the interval.
    pub fn new(interval: Duration, new_thread: bool) -> Self {
        let shared = Arc::new(Shared {
            buckets: Mutex::new(Buckets {
                pending: Vec::new(),
                current: HeapStatsUpdate {
                    index: 0,
                    count: 0,
                    size: 0,
                },
            }),
            start: Instant::now(),
            interval,
        });

        let (stop_tx, ticker) = if new_thread {
            let (tx, rx) = bounded::<()>(1);
            let thread_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("karst-heap-tracker".into())
                .spawn(move || loop {
                    match rx.recv_timeout(thread_shared.interval) {
                        Ok(()) | Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                            thread_shared.roll_to_now();
                        }
                    }
                })
                .expect("failed to spawn tracker thread");
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Self {
            shared,
            stop_tx,
            ticker,
        }
    }

    /// Allocation hook: count into the current bucket. Must not allocate
    /// beyond bucket bookkeeping.
    pub fn allocation_event(&self, size: usize) {
        self.shared.roll_to_now();
        let mut buckets = self.shared.buckets.lock();
        buckets.current.count += 1;
        buckets.current.size += size as u32;
    }

    /// Flush closed buckets into the tracking stream.
    pub fn flush_stats(&self, stream: &mut dyn Stream) -> bool {
        self.shared.roll_to_now();
        let pending: Vec<HeapStatsUpdate> = {
            let mut buckets = self.shared.buckets.lock();
            std::mem::take(&mut buckets.pending)
        };
        if pending.is_empty() {
            return true;
        }
        stream.update_heap_stats(&pending)
    }

    /// Microseconds since tracking started.
    pub fn elapsed_us(&self) -> u64 {
        self.shared.start.elapsed().as_micros() as u64
    }
}

impl Drop for HeapTracker {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
    }
}
