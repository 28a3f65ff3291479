//! Statistical allocation sampling
//!
//! A Poisson-process sampler over the allocation byte stream: instead of
//! recording every allocation, the next sample fires after an
//! exponentially distributed number of bytes with the configured mean
//! interval, which makes the collected profile an unbiased estimate of
//! allocation volume at a fraction of the cost. Runs concurrently with
//! normal execution; the allocation hook only decrements a byte budget.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// One recorded allocation sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Sample {
    /// Allocation size in bytes.
    pub size: usize,
    /// Number of sampled allocations of this size.
    pub count: u32,
    /// Microseconds since sampling started, for the latest hit.
    pub timestamp_us: u64,
}

/// Aggregated result returned by [`HeapSampling::get_allocation_profile`].
/// Serializable so embedders can export the profile as JSON.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SamplingInfo {
    /// Mean sampling interval in bytes.
    pub sample_interval: u64,
    /// Configured maximum stack depth (carried for API compatibility; the
    /// VM records no interpreter stacks).
    pub stack_depth: usize,
    /// Samples aggregated by allocation size.
    pub samples: Vec<Sample>,
    /// Total bytes seen by the hook, sampled or not.
    pub total_allocated: u64,
}

struct SamplingState {
    /// Bytes remaining until the next sample fires.
    until_next: i64,
    samples: Vec<Sample>,
    total_allocated: u64,
}

/// Poisson-spaced statistical allocation profiler.
pub struct HeapSampling {
    enabled: AtomicBool,
    sample_interval: u64,
    stack_depth: usize,
    start: Instant,
    state: Mutex<SamplingState>,
}

impl HeapSampling {
    pub fn new(sample_interval: u64, stack_depth: usize) -> Self {
        let sampler = Self {
            enabled: AtomicBool::new(true),
            sample_interval: sample_interval.max(1),
            stack_depth,
            start: Instant::now(),
            state: Mutex::new(SamplingState {
                until_next: 0,
                samples: Vec::new(),
                total_allocated: 0,
            }),
        };
        sampler.state.lock().until_next = sampler.next_interval();
        sampler
    }

    /// Exponentially distributed byte distance to the next sample.
    fn next_interval(&self) -> i64 {
        let u: f64 = rand::thread_rng().gen_range(f64::MIN_POSITIVE..1.0);
        let interval = -(u.ln()) * self.sample_interval as f64;
        interval.max(1.0) as i64
    }

    /// Allocation hook. Cheap when the sample budget has not run out.
    pub fn allocation(&self, size: usize) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.state.lock();
        state.total_allocated += size as u64;
        state.until_next -= size as i64;
        if state.until_next > 0 {
            return;
        }
        let timestamp_us = self.start.elapsed().as_micros() as u64;
        match state.samples.iter_mut().find(|s| s.size == size) {
            Some(sample) => {
                sample.count += 1;
                sample.timestamp_us = timestamp_us;
            }
            None => state.samples.push(Sample {
                size,
                count: 1,
                timestamp_us,
            }),
        }
        state.until_next = self.next_interval();
    }

    /// Stop sampling; already-collected samples stay readable.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Current aggregated profile.
    pub fn get_allocation_profile(&self) -> SamplingInfo {
        let state = self.state.lock();
        SamplingInfo {
            sample_interval: self.sample_interval,
            stack_depth: self.stack_depth,
            samples: state.samples.clone(),
            total_allocated: state.total_allocated,
        }
    }
}
