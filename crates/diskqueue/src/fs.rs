//! Filesystem-backed segment storage.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;

use log::debug;

use crate::storage::{FileLike, Storage};

const SEGMENT_FILE_EXT: &str = ".dq";

/// A [`Storage`] which keeps each segment in an ordinary file named by its
/// starting location.
#[derive(Clone, Debug)]
pub struct Fs {
    /// The base directory within which segment files are stored.
    root: PathBuf,
}

impl Fs {
    /// Create a segment storage rooted at `root`, creating the directory if
    /// necessary.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn segment_path(&self, location: u64) -> PathBuf {
        self.root.join(format!("{location:020}{SEGMENT_FILE_EXT}"))
    }
}

impl fmt::Display for Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

impl FileLike for File {
    fn fsync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

impl Storage for Fs {
    type Segment = File;

    fn create_segment(&self, location: u64) -> io::Result<Self::Segment> {
        File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.segment_path(location))
            .or_else(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    debug!("segment {location} already exists");
                    // If the segment is completely empty, we can resume
                    // writing to it.
                    let file = self.open_segment(location)?;
                    if file.metadata()?.len() == 0 {
                        return Ok(file);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("queue {}: segment {} already exists and is non-empty", self, location),
                    ));
                }

                Err(e)
            })
    }

    fn open_segment(&self, location: u64) -> io::Result<Self::Segment> {
        File::options()
            .read(true)
            .write(true)
            .open(self.segment_path(location))
    }

    fn remove_segment(&self, location: u64) -> io::Result<()> {
        fs::remove_file(self.segment_path(location))
    }

    fn existing_locations(&self) -> io::Result<Vec<u64>> {
        let mut segments = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let path = entry.path();
                let name = path.file_name().unwrap_or_default().to_string_lossy();
                let Some(file_name) = name.strip_suffix(SEGMENT_FILE_EXT) else {
                    continue;
                };
                let Ok(location) = file_name.parse::<u64>() else {
                    continue;
                };

                segments.push(location);
            }
        }

        segments.sort_unstable();

        Ok(segments)
    }

    fn segment_len(&self, location: u64) -> io::Result<u64> {
        fs::metadata(self.segment_path(location)).map(|m| m.len())
    }
}
