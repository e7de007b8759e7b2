use serde_derive::Serialize;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Event counters bumped on the hot path.
#[derive(Default)]
pub struct Counters {
    pub reentrant_thunk_executions: AtomicU64,
    pub thunk_stack_exhaustions: AtomicU64,
    pub buffer_requests_failed: AtomicU64,
    pub events_captured: AtomicU64,
    pub exception_unwindings: AtomicU64,
    pub thread_teardowns: AtomicU64,
    pub failed_preallocation_pool_allocations: AtomicU64,
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStatistics {
    pub free: usize,
    pub dirty: usize,
    pub collected: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadDataStatistics {
    pub free_preallocation_pool_size: usize,
    pub failed_preallocation_pool_allocations: u64,
}

/// Point-in-time view of an initialized engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub patch_count: usize,
    pub buffers: BufferStatistics,
    pub thread_data: ThreadDataStatistics,
    pub reentrant_thunk_executions: u64,
    pub thunk_stack_exhaustions: u64,
    pub buffer_requests_failed: u64,
    pub events_captured: u64,
    pub exception_unwindings: u64,
    pub thread_teardowns: u64,
}

impl Counters {
    /// Fills the counter part of a snapshot; the caller provides the rest.
    #[must_use]
    pub fn snapshot(
        &self,
        patch_count: usize,
        buffers: BufferStatistics,
        free_preallocation_pool_size: usize,
    ) -> Statistics {
        Statistics {
            patch_count,
            buffers,
            thread_data: ThreadDataStatistics {
                free_preallocation_pool_size,
                failed_preallocation_pool_allocations: read(
                    &self.failed_preallocation_pool_allocations,
                ),
            },
            reentrant_thunk_executions: read(&self.reentrant_thunk_executions),
            thunk_stack_exhaustions: read(&self.thunk_stack_exhaustions),
            buffer_requests_failed: read(&self.buffer_requests_failed),
            events_captured: read(&self.events_captured),
            exception_unwindings: read(&self.exception_unwindings),
            thread_teardowns: read(&self.thread_teardowns),
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "patches: {}", self.patch_count)?;
        writeln!(
            f,
            "buffers: {} free, {} dirty, {} collected",
            self.buffers.free, self.buffers.dirty, self.buffers.collected
        )?;
        writeln!(
            f,
            "thread data: {} preallocated, {} failed allocations",
            self.thread_data.free_preallocation_pool_size,
            self.thread_data.failed_preallocation_pool_allocations
        )?;
        writeln!(f, "events: {}", self.events_captured)?;
        writeln!(f, "failed buffer requests: {}", self.buffer_requests_failed)?;
        writeln!(f, "stack exhaustions: {}", self.thunk_stack_exhaustions)?;
        writeln!(f, "reentrant executions: {}", self.reentrant_thunk_executions)?;
        writeln!(f, "unwindings: {}", self.exception_unwindings)?;
        write!(f, "thread teardowns: {}", self.thread_teardowns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let counters = Counters::default();
        bump(&counters.events_captured);
        bump(&counters.events_captured);
        bump(&counters.thread_teardowns);

        let stats = counters.snapshot(
            3,
            BufferStatistics {
                free: 1,
                dirty: 2,
                collected: 5,
            },
            4,
        );
        assert_eq!(stats.patch_count, 3);
        assert_eq!(stats.events_captured, 2);
        assert_eq!(stats.thread_teardowns, 1);
        assert_eq!(stats.thread_data.free_preallocation_pool_size, 4);
        assert!(stats.to_string().contains("buffers: 1 free, 2 dirty, 5 collected"));
    }

    #[test]
    fn test_statistics_serialize() {
        let json = serde_json::to_value(Statistics::default()).expect("json");
        assert_eq!(json["buffers"]["dirty"], 0);
        assert_eq!(json["thread_data"]["failed_preallocation_pool_allocations"], 0);
    }
}
