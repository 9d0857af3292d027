//! Per-storage-team in-memory message buffer.

use std::collections::BTreeMap;

use bytes::Bytes;
use ledgerd_primitives::{StorageTeamId, Tag, Version};
use smallvec::SmallVec;

/// Accounting overhead charged per buffered `(version, team)` row, on top
/// of the payload bytes.
pub const PER_VERSION_OVERHEAD: u64 = 64;

/// One storage team's slice of a generation: its tag set, buffered
/// messages, and popped-version bookkeeping.
#[derive(Debug)]
pub struct TeamData {
    pub team: StorageTeamId,
    pub tags: SmallVec<[Tag; 2]>,
    /// version → header-stripped message block. Blocks share the arena of
    /// the commit that produced them.
    pub messages: BTreeMap<Version, Bytes>,
    /// Greatest version this team has acknowledged consuming.
    pub popped: Version,
    /// The popped version as last flushed to the spill store.
    pub persistent_popped: Version,
    /// No rows for this team have ever been spilled.
    pub nothing_persistent: bool,
    /// `popped` changed since the last flush.
    pub popped_recently: bool,
}

impl TeamData {
    pub fn new(team: StorageTeamId, tags: impl IntoIterator<Item = Tag>, popped: Version) -> Self {
        Self {
            team,
            tags: tags.into_iter().collect(),
            messages: BTreeMap::new(),
            popped,
            persistent_popped: 0,
            nothing_persistent: true,
            popped_recently: popped > 0,
        }
    }

    /// `true` if this team carries system-transaction state, which is
    /// always spilled by value.
    pub fn is_txs(&self) -> bool {
        self.tags.iter().any(|tag| tag.is_txs())
    }

    /// Accounted size of one buffered row.
    pub fn buffered_bytes(block: &Bytes) -> u64 {
        block.len() as u64 + PER_VERSION_OVERHEAD
    }

    /// Remove all rows with version `<= to`; returns the accounted bytes
    /// freed.
    pub fn erase_up_to(&mut self, to: Version) -> u64 {
        if to == Version::MAX {
            let freed = self.messages.values().map(Self::buffered_bytes).sum();
            self.messages.clear();
            return freed;
        }
        let keep = self.messages.split_off(&(to + 1));
        let freed = self.messages.values().map(Self::buffered_bytes).sum();
        self.messages = keep;
        freed
    }

    /// Oldest buffered version, if any.
    pub fn first_buffered(&self) -> Option<Version> {
        self.messages.keys().next().copied()
    }

    /// Newest buffered version, if any.
    pub fn last_buffered(&self) -> Option<Version> {
        self.messages.keys().next_back().copied()
    }
}
