use std::time::Duration;

/// Tuning knobs of the log server.
///
/// One instance is shared by every component of a process; there are no
/// ambient globals.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Commits stall while `bytes_input - bytes_durable` is at or above
    /// this, yielding to the spiller.
    ///
    /// Default: 1.5GiB
    pub buffer_hard_limit_bytes: u64,
    /// The spiller starts draining an active generation once
    /// `bytes_input - bytes_durable` reaches this.
    ///
    /// Default: 256MiB
    pub target_volatile_bytes: u64,
    /// Combined message-byte weight of one spill batch.
    ///
    /// Default: 1MiB
    pub spill_batch_bytes: u64,
    /// Reference-spill rows are flushed to the store once the accumulated
    /// entries reach this many bytes.
    ///
    /// Default: 16KiB
    pub reference_spill_batch_bytes: usize,
    /// Desired size of a peek reply; assembly stops once accumulated
    /// message bytes reach this.
    ///
    /// Default: 150KB
    pub peek_reply_bytes: usize,
    /// Process-wide budget for in-flight peek reads from the store and
    /// queue.
    ///
    /// Default: 2MiB
    pub peek_memory_bytes: usize,
    /// How long the spiller sleeps between checks of an active generation.
    ///
    /// Default: 100ms
    pub update_storage_interval: Duration,
    /// During recovery replay, a spill is forced whenever
    /// `bytes_input - bytes_durable` exceeds this.
    ///
    /// Default: 256MiB
    pub recovery_memory_limit_bytes: u64,
    /// Peek sequence trackers expire after this much inactivity; waiting
    /// consumers then fail with `timed_out`.
    ///
    /// Default: 600s
    pub peek_tracker_expiration: Duration,
    /// Upper bound on a single serialized team block.
    ///
    /// Default: 10MiB
    pub max_message_bytes: usize,
    /// A queue commit slower than this emits a telemetry warning.
    ///
    /// Default: 5s
    pub queue_commit_warn: Duration,
    /// Consecutive queue-commit failures tolerated before the process
    /// declares itself degraded and stops accepting work.
    ///
    /// Default: 3
    pub queue_commit_failure_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buffer_hard_limit_bytes: 1536 * 1024 * 1024,
            target_volatile_bytes: 256 * 1024 * 1024,
            spill_batch_bytes: 1024 * 1024,
            reference_spill_batch_bytes: 16 * 1024,
            peek_reply_bytes: 150_000,
            peek_memory_bytes: 2 * 1024 * 1024,
            update_storage_interval: Duration::from_millis(100),
            recovery_memory_limit_bytes: 256 * 1024 * 1024,
            peek_tracker_expiration: Duration::from_secs(600),
            max_message_bytes: 10 * 1024 * 1024,
            queue_commit_warn: Duration::from_secs(5),
            queue_commit_failure_limit: 3,
        }
    }
}

impl Settings {
    /// A configuration with tiny limits, so tests can exercise spilling
    /// and back-pressure with small payloads.
    pub fn small_for_tests() -> Self {
        Self {
            buffer_hard_limit_bytes: 64 * 1024,
            target_volatile_bytes: 4 * 1024,
            spill_batch_bytes: 2 * 1024,
            reference_spill_batch_bytes: 256,
            peek_reply_bytes: 32 * 1024,
            peek_memory_bytes: 256 * 1024,
            update_storage_interval: Duration::from_millis(5),
            recovery_memory_limit_bytes: 16 * 1024,
            peek_tracker_expiration: Duration::from_millis(500),
            ..Self::default()
        }
    }
}
