//! Process-level samples taken at pipeline entry and exit.
//!
//! The live-task count comes from the current tokio runtime; the cumulative
//! allocation counter comes from [`TrackingAllocator`], which the host opts
//! into by installing it as the global allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: xrayhq::runtime::TrackingAllocator = xrayhq::runtime::TrackingAllocator;
//! ```
//!
//! Without it the counter stays at zero and memory-spike detection is
//! simply inert. Both reads are infallible; a missing runtime or allocator
//! degrades the sample, never the request.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

static ALLOCATED: AtomicU64 = AtomicU64::new(0);

/// A counting wrapper over the system allocator. The counter is cumulative:
/// it only ever grows, mirroring a "total bytes ever allocated" reading.
pub struct TrackingAllocator;

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            ALLOCATED.fetch_add(layout.size() as u64, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            ALLOCATED.fetch_add(layout.size() as u64, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            ALLOCATED.fetch_add(new_size as u64, Ordering::Relaxed);
        }
        new_ptr
    }
}

/// Cumulative bytes allocated through [`TrackingAllocator`]; zero when the
/// host has not installed it.
pub fn total_allocated() -> u64 {
    ALLOCATED.load(Ordering::Relaxed)
}

/// A point-in-time process sample.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSample {
    /// Live tasks in the current tokio runtime; zero outside a runtime.
    pub tasks: usize,
    /// Cumulative allocation counter; zero without the tracking allocator.
    pub allocated: u64,
}

pub fn sample() -> ProcessSample {
    let tasks = tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks())
        .unwrap_or(0);
    ProcessSample {
        tasks,
        allocated: total_allocated(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_outside_runtime_reads_zero_tasks() {
        let s = sample();
        assert_eq!(s.tasks, 0);
    }

    #[tokio::test]
    async fn sample_inside_runtime_does_not_panic() {
        let before = sample();
        let handle = tokio::spawn(async { std::future::pending::<()>().await });
        let during = sample();
        assert!(during.tasks >= before.tasks);
        handle.abort();
    }
}
