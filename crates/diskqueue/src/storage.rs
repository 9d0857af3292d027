//! Segment storage backend abstraction.

use std::io;

/// File-like operations beyond the std I/O traits.
pub trait FileLike {
    fn fsync(&mut self) -> io::Result<()>;
}

/// A repository of queue segments.
///
/// Mainly an internal trait to allow testing against an in-memory
/// representation; the production backend is [`crate::fs::Fs`].
pub trait Storage: Clone {
    /// The type of segments managed by this backend, which must behave
    /// like a file opened for reading and writing: writes land at the
    /// current position, overwriting existing bytes and extending the
    /// segment past its end.
    type Segment: io::Read + io::Write + io::Seek + FileLike + Send;

    /// Create a new segment whose first byte is at queue location
    /// `location`.
    ///
    /// Must return [`io::ErrorKind::AlreadyExists`] if a non-empty segment
    /// with that location already exists.
    fn create_segment(&self, location: u64) -> io::Result<Self::Segment>;

    /// Open the existing segment starting at `location`.
    ///
    /// Must return [`io::ErrorKind::NotFound`] if no such segment exists.
    fn open_segment(&self, location: u64) -> io::Result<Self::Segment>;

    /// Remove the segment starting at `location`.
    fn remove_segment(&self, location: u64) -> io::Result<()>;

    /// Starting locations of all existing segments, ascending.
    fn existing_locations(&self) -> io::Result<Vec<u64>>;

    /// Size in bytes of the segment starting at `location`.
    fn segment_len(&self, location: u64) -> io::Result<u64>;
}
