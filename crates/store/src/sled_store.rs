//! sled-backed implementation of [`PersistentStore`].

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sled::Mode::HighThroughput;

use crate::{KeyValue, Op, PersistentStore};

pub struct SledStore {
    db: sled::Db,
    path: PathBuf,
    staged: Vec<Op>,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let config = sled::Config::default()
            .path(&path)
            // Durability is driven by `commit`, not a background timer.
            .flush_every_ms(None)
            .mode(HighThroughput);
        let db = config.open().map_err(sled_err)?;
        Ok(Self {
            db,
            path,
            staged: Vec::new(),
        })
    }
}

fn sled_err(e: sled::Error) -> io::Error {
    io::Error::other(e)
}

impl PersistentStore for SledStore {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.staged.push(Op::Set(key.to_vec(), Bytes::copy_from_slice(value)));
    }

    fn clear(&mut self, key: &[u8]) {
        self.staged.push(Op::Clear(key.to_vec()));
    }

    fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        self.staged.push(Op::ClearRange(begin.to_vec(), end.to_vec()));
    }

    fn read_value(&self, key: &[u8]) -> io::Result<Option<Bytes>> {
        let val = self.db.get(key).map_err(sled_err)?;
        Ok(val.map(|v| Bytes::from(v.to_vec())))
    }

    fn read_range(&self, begin: &[u8], end: &[u8], limit: usize, byte_limit: usize) -> io::Result<Vec<KeyValue>> {
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for pair in self.db.range(begin..end) {
            let (k, v) = pair.map_err(sled_err)?;
            if out.len() >= limit || bytes >= byte_limit {
                break;
            }
            bytes += v.len();
            out.push(KeyValue {
                key: Bytes::from(k.to_vec()),
                value: Bytes::from(v.to_vec()),
            });
        }
        Ok(out)
    }

    fn commit(&mut self) -> io::Result<()> {
        for op in self.staged.drain(..) {
            match op {
                Op::Set(k, v) => {
                    self.db.insert(k, v.to_vec()).map_err(sled_err)?;
                }
                Op::Clear(k) => {
                    self.db.remove(k).map_err(sled_err)?;
                }
                Op::ClearRange(begin, end) => {
                    let doomed: Result<Vec<_>, _> = self.db.range(begin..end).map(|kv| kv.map(|(k, _)| k)).collect();
                    for k in doomed.map_err(sled_err)? {
                        self.db.remove(k).map_err(sled_err)?;
                    }
                }
            }
        }
        self.db.flush().map_err(sled_err)?;
        Ok(())
    }

    fn storage_bytes(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    fn dispose(&mut self) -> io::Result<()> {
        self.staged.clear();
        self.db.clear().map_err(sled_err)?;
        self.db.flush().map_err(sled_err)?;
        log::info!("disposed sled store at {}", self.path.display());
        Ok(())
    }
}
