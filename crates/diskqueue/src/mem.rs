//! In-memory segment storage, for tests.

use std::{
    collections::{btree_map, BTreeMap},
    fmt, io,
    sync::{Arc, RwLock, RwLockWriteGuard},
};

use crate::storage::{FileLike, Storage};

type SharedLock<T> = Arc<RwLock<T>>;
type SharedBytes = SharedLock<Vec<u8>>;

/// A queue segment backed by a `Vec<u8>`.
///
/// Writing behaves like a file opened for reading and writing:
/// [`io::Write::write`] lands at the current position, overwriting
/// existing bytes and extending the segment past its end. The initial
/// position is zero.
#[derive(Clone, Debug, Default)]
pub struct Segment {
    pos: u64,
    buf: SharedBytes,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.buf.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Obtain mutable access to the underlying buffer.
    ///
    /// This is intended for tests which deliberately corrupt segment data.
    pub fn buf_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.buf.write().unwrap()
    }
}

impl From<SharedBytes> for Segment {
    fn from(buf: SharedBytes) -> Self {
        Self { pos: 0, buf }
    }
}

impl FileLike for Segment {
    fn fsync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for Segment {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.buf.write().unwrap();
        let pos = self.pos as usize;
        if pos > inner.len() {
            // Writing past the end implicitly fills the gap, as a file
            // would.
            inner.resize(pos, 0);
        }
        let overlap = (inner.len() - pos).min(buf.len());
        inner[pos..pos + overlap].copy_from_slice(&buf[..overlap]);
        inner.extend_from_slice(&buf[overlap..]);
        self.pos += buf.len() as u64;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Segment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self.buf.read().unwrap();
        let pos = self.pos as usize;
        if pos > inner.len() {
            // Bad file descriptor
            return Err(io::Error::from_raw_os_error(9));
        }
        let n = io::Read::read(&mut &inner[pos..], buf)?;
        self.pos += n as u64;

        Ok(n)
    }
}

impl io::Seek for Segment {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (base_pos, offset) = match pos {
            io::SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            io::SeekFrom::End(n) => (self.len() as u64, n),
            io::SeekFrom::Current(n) => (self.pos, n),
        };
        match base_pos.checked_add_signed(offset) {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

/// In-memory implementation of [`Storage`].
#[derive(Clone, Debug, Default)]
pub struct Memory(SharedLock<BTreeMap<u64, SharedBytes>>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<memory>")
    }
}

impl Storage for Memory {
    type Segment = Segment;

    fn create_segment(&self, location: u64) -> io::Result<Self::Segment> {
        let mut inner = self.0.write().unwrap();
        match inner.entry(location) {
            btree_map::Entry::Occupied(entry) => {
                let entry = entry.get();
                let read_guard = entry.read().unwrap();
                if read_guard.is_empty() {
                    Ok(Segment::from(Arc::clone(entry)))
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("segment {location} already exists"),
                    ))
                }
            }
            btree_map::Entry::Vacant(entry) => {
                let segment = entry.insert(Default::default());
                Ok(Segment::from(Arc::clone(segment)))
            }
        }
    }

    fn open_segment(&self, location: u64) -> io::Result<Self::Segment> {
        let inner = self.0.read().unwrap();
        let Some(buf) = inner.get(&location) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("segment {location} does not exist"),
            ));
        };
        Ok(Segment::from(Arc::clone(buf)))
    }

    fn remove_segment(&self, location: u64) -> io::Result<()> {
        let mut inner = self.0.write().unwrap();
        if inner.remove(&location).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("segment {location} does not exist"),
            ));
        }

        Ok(())
    }

    fn existing_locations(&self) -> io::Result<Vec<u64>> {
        Ok(self.0.read().unwrap().keys().copied().collect())
    }

    fn segment_len(&self, location: u64) -> io::Result<u64> {
        self.open_segment(location).map(|s| s.len() as u64)
    }
}
