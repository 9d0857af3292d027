//! The durable queue: an append-only byte log with crash-safe framing.
//!
//! Every committed batch of the log server is pushed here before anything
//! else happens to it. The queue hands out monotonic byte locations, makes
//! pushed data durable on [`DurableQueue::commit`], serves random-access
//! reads of previously committed records, and releases storage from the
//! front when consumers have moved past it.
//!
//! On disk the queue is a sequence of segment files, each named by the
//! location of its first byte. Popping releases whole segments; the segment
//! currently open for writing is never released.

use std::io;

use bytes::Bytes;

mod queue;
mod record;
mod storage;

pub mod fs;
#[cfg(any(test, feature = "test"))]
pub mod mem;

pub use queue::DiskQueue;
pub use record::{Record, FRAMING_LEN, RECORD_VALID};
pub use storage::{FileLike, Storage};

/// A byte offset into the queue, counted from the beginning of the log's
/// lifetime. Locations are monotonic: they never decrease, and survive
/// segment rotation and popping.
pub type Location = u64;

/// One record yielded by the sequential recovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredRecord {
    /// Location of the first byte of the record's frame.
    pub begin: Location,
    /// Location one past the last byte of the frame.
    pub end: Location,
    /// The record payload, without framing.
    pub payload: Bytes,
}

/// [`DiskQueue`] options.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// The size in bytes beyond which a new segment file is started.
    ///
    /// Default: 1GiB
    pub max_segment_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_segment_size: 1024 * 1024 * 1024,
        }
    }
}

/// Object-safe interface of the durable queue, as consumed by the log
/// server core.
///
/// Writes are buffered: a [`Self::push`] assigns locations immediately, but
/// only a prefix of pushed bytes is durable (and readable via
/// [`Self::read`]) after [`Self::commit`] returns.
pub trait DurableQueue: Send {
    /// Append a framed record containing `payload`.
    ///
    /// Returns the end location of the frame; the frame begins at the value
    /// [`Self::next_push_location`] held before the call.
    fn push(&mut self, payload: &[u8]) -> io::Result<Location>;

    /// Make all previously pushed records durable.
    fn commit(&mut self) -> io::Result<()>;

    /// Release storage strictly before `location`.
    ///
    /// Storage is reclaimed at segment granularity: only segments that lie
    /// entirely below `location` are removed.
    fn pop(&mut self, location: Location) -> io::Result<()>;

    /// Random-access read of the record whose frame starts at `location`
    /// and spans `length` bytes (including framing). Returns the payload.
    ///
    /// Only records covered by a preceding [`Self::commit`] may be read.
    fn read(&self, location: Location, length: u32) -> io::Result<Bytes>;

    /// Position the recovery cursor at `recover_at` (or the oldest retained
    /// location, if `recover_at` has been popped).
    ///
    /// Returns `true` if there is nothing to replay.
    fn initialize_recovery(&mut self, recover_at: Location) -> io::Result<bool>;

    /// Sequentially read the next record during recovery.
    ///
    /// Returns `None` once the end of the log is reached. A record with an
    /// invalid flag or a truncated frame marks the tail: the rest of the
    /// incomplete record is zero-filled on the next [`Self::push`], so
    /// subsequent reads see a clean boundary.
    fn read_next(&mut self) -> io::Result<Option<RecoveredRecord>>;

    /// Location the next [`Self::read_next`] would return data for.
    fn next_read_location(&self) -> Location;

    /// Location the next [`Self::push`] frame would begin at.
    fn next_push_location(&self) -> Location;

    /// Bytes of storage currently held by un-popped segments.
    fn storage_bytes(&self) -> u64;
}
