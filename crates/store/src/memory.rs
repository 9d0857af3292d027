//! In-memory implementation of [`PersistentStore`].
//!
//! The durable image is shared between handles, which lets tests model a
//! crash: drop the store (losing staged mutations), then [`MemoryStorage::open`]
//! a fresh handle over the surviving committed state.

use std::{
    collections::BTreeMap,
    io,
    ops::Bound,
    sync::{Arc, RwLock},
};

use bytes::Bytes;

use crate::{KeyValue, Op, PersistentStore};

type Image = BTreeMap<Vec<u8>, Bytes>;

/// The durable image backing one or more [`MemoryStore`] handles.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage(Arc<RwLock<Image>>);

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store handle over this image.
    pub fn open(&self) -> MemoryStore {
        MemoryStore {
            durable: self.clone(),
            staged: Vec::new(),
        }
    }

    /// `true` if the committed image holds no keys.
    pub fn is_empty(&self) -> bool {
        self.0.read().unwrap().is_empty()
    }
}

/// See [`MemoryStorage`].
#[derive(Debug)]
pub struct MemoryStore {
    durable: MemoryStorage,
    staged: Vec<Op>,
}

impl PersistentStore for MemoryStore {
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
        Ok(self.durable.0.read().unwrap().get(key).cloned())
    }

    fn read_range(&self, begin: &[u8], end: &[u8], limit: usize, byte_limit: usize) -> io::Result<Vec<KeyValue>> {
        let image = self.durable.0.read().unwrap();
        let mut out = Vec::new();
        let mut bytes = 0usize;
        let range = (Bound::Included(begin.to_vec()), Bound::Excluded(end.to_vec()));
        for (k, v) in image.range(range) {
            if out.len() >= limit || bytes >= byte_limit {
                break;
            }
            bytes += v.len();
            out.push(KeyValue {
                key: Bytes::copy_from_slice(k),
                value: v.clone(),
            });
        }
        Ok(out)
    }

    fn commit(&mut self) -> io::Result<()> {
        let mut image = self.durable.0.write().unwrap();
        for op in self.staged.drain(..) {
            match op {
                Op::Set(k, v) => {
                    image.insert(k, v);
                }
                Op::Clear(k) => {
                    image.remove(&k);
                }
                Op::ClearRange(begin, end) => {
                    let doomed: Vec<_> = image
                        .range((Bound::Included(begin), Bound::Excluded(end)))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in doomed {
                        image.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }

    fn storage_bytes(&self) -> u64 {
        let image = self.durable.0.read().unwrap();
        image.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
    }

    fn dispose(&mut self) -> io::Result<()> {
        self.staged.clear();
        self.durable.0.write().unwrap().clear();
        Ok(())
    }
}
