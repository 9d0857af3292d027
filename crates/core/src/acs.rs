//! Accumulative checksums.
//!
//! Each producer (commit proxy or resolver) rolls the per-mutation
//! checksums of a tag into a running value in commit order, and
//! periodically emits a special mutation carrying the rolled-up state.
//! Consumers replay the same fold and compare when the special mutation
//! arrives; a mismatch means mutations were corrupted, reordered, or lost
//! somewhere along the commit→log→storage path, and the consuming process
//! must restart.
//!
//! The `txs` tag is exempt.

use std::collections::HashMap;

use ledgerd_primitives::buf::{BufReader, BufWriter, DecodeError};
use ledgerd_primitives::{LogEpoch, Tag, Version};
use tracing::{error, info};

use crate::error::{Result, TLogError};
use crate::mutation::Mutation;

/// Starting value of a fresh accumulation.
pub const INITIAL_ACS: u32 = 0;

/// Fold one mutation checksum into the running value.
pub fn mix(acs: u32, checksum: u32) -> u32 {
    crc32c::crc32c_append(acs, &checksum.to_le_bytes())
}

/// Rolling checksum state for one `(producer, tag)` stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcsState {
    /// Identifies the producer.
    pub acs_index: u16,
    /// The rolled-up value.
    pub acs: u32,
    /// Commit version of the last folded mutation.
    pub version: Version,
    /// Recovery epoch the state belongs to.
    pub epoch: LogEpoch,
}

impl AcsState {
    pub fn to_value(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + 4 + 8 + 8);
        buf.put_u16(self.acs_index);
        buf.put_u32(self.acs);
        buf.put_u64(self.version);
        buf.put_u64(self.epoch);
        buf
    }

    pub fn from_value(value: &[u8]) -> std::result::Result<Self, DecodeError> {
        let mut rd = value;
        Ok(Self {
            acs_index: rd.get_u16()?,
            acs: rd.get_u32()?,
            version: rd.get_u64()?,
            epoch: rd.get_u64()?,
        })
    }
}

/// `true` if mutations for `tag` participate in accumulative checksumming.
pub fn tag_supports_acs(tag: Tag) -> bool {
    !tag.is_txs()
}

/// Producer side: folds mutation checksums per tag.
#[derive(Debug)]
pub struct AcsBuilder {
    acs_index: u16,
    table: HashMap<Tag, AcsState>,
    current_version: Version,
}

impl AcsBuilder {
    pub fn new(acs_index: u16) -> Self {
        Self {
            acs_index,
            table: HashMap::new(),
            current_version: 0,
        }
    }

    pub fn acs_index(&self) -> u16 {
        self.acs_index
    }

    /// Fold `mutation` (which must carry a checksum) into the state of
    /// `tag` at `version`.
    pub fn add_mutation(&mut self, mutation: &Mutation, tag: Tag, epoch: LogEpoch, version: Version) {
        if !tag_supports_acs(tag) {
            return;
        }
        let checksum = mutation.checksum.expect("producer populates checksums before folding");
        assert!(version >= self.current_version, "mutations fold in commit order");

        let state = self
            .table
            .entry(tag)
            .and_modify(|state| {
                assert!(version >= state.version);
                state.acs = mix(state.acs, checksum);
                state.version = version;
                state.epoch = epoch;
            })
            .or_insert(AcsState {
                acs_index: self.acs_index,
                acs: mix(INITIAL_ACS, checksum),
                version,
                epoch,
            });
        debug_assert_eq!(state.acs_index, self.acs_index);
        self.current_version = version;
    }

    /// The rolled-up state for `tag`, to be emitted as an ACS mutation.
    pub fn state(&self, tag: Tag) -> Option<AcsState> {
        self.table.get(&tag).copied()
    }

    /// Forget `tag`, e.g. when its storage server is replaced.
    pub fn new_tag(&mut self, tag: Tag) {
        self.table.remove(&tag);
    }
}

/// Counters exposed by the [`AcsValidator`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcsCounters {
    pub checked_mutations: u64,
    pub checked_versions: u64,
    pub total_mutations: u64,
    pub total_acs_mutations: u64,
    pub total_added_mutations: u64,
}

/// Consumer side: replays mutation checksums and verifies emitted states.
#[derive(Debug, Default)]
pub struct AcsValidator {
    table: HashMap<u16, AcsState>,
    /// Mutations folded since the last ACS mutation.
    buffer: Vec<u32>,
    counters: AcsCounters,
}

impl AcsValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a previously persisted state, e.g. on storage recovery.
    pub fn restore(&mut self, state: AcsState) {
        self.table.insert(state.acs_index, state);
    }

    /// Buffer one regular mutation for the next comparison.
    pub fn add_mutation(&mut self, mutation: &Mutation, tag: Tag) {
        self.counters.total_mutations += 1;
        if !tag_supports_acs(tag) {
            return;
        }
        let (Some(checksum), Some(_)) = (mutation.checksum, mutation.acs_index) else {
            return;
        };
        if !mutation.validate_checksum() {
            // Body corruption is caught right here rather than at the next
            // rollup, with the mutation still at hand for diagnostics.
            error!(?tag, "mutation checksum mismatch");
            self.buffer.clear();
            self.buffer.push(!checksum);
            return;
        }
        self.buffer.push(checksum);
        self.counters.total_added_mutations += 1;
    }

    /// Process an ACS mutation's rolled-up `state` observed at
    /// `consumer_version` for `tag`.
    ///
    /// Returns the state to persist, or `None` if the mutation was stale
    /// and dropped. A comparison mismatch is fatal.
    pub fn process_acs(&mut self, state: AcsState, tag: Tag, consumer_version: Version) -> Result<Option<AcsState>> {
        self.counters.total_acs_mutations += 1;
        let acs_index = state.acs_index;

        let Some(stored) = self.table.get(&acs_index).copied() else {
            // First contact with this producer: accept and store.
            self.table.insert(acs_index, state);
            self.buffer.clear();
            info!(acs_index, ?tag, version = state.version, "accepted initial checksum state");
            return Ok(Some(state));
        };

        if state.version < stored.version || state.epoch < stored.epoch {
            self.buffer.clear();
            info!(
                acs_index,
                ?tag,
                version = state.version,
                stored_version = stored.version,
                "dropped stale checksum rollup"
            );
            return Ok(None);
        }

        // A newer epoch restarts the accumulation.
        let cleared = state.epoch > stored.epoch;
        let from = if cleared { INITIAL_ACS } else { stored.acs };
        let computed = self.buffer.iter().fold(from, |acs, &sum| mix(acs, sum));
        self.counters.checked_mutations += self.buffer.len() as u64;
        self.counters.checked_versions += 1;
        self.buffer.clear();

        if computed != state.acs {
            error!(
                acs_index,
                ?tag,
                consumer_version,
                expected = state.acs,
                computed,
                cleared,
                "accumulative checksum mismatch"
            );
            return Err(TLogError::IntegrityFailure(format!(
                "accumulative checksum mismatch for producer {acs_index} tag {tag}: expected {:#x}, computed {computed:#x}",
                state.acs
            )));
        }

        self.table.insert(acs_index, state);
        Ok(Some(state))
    }

    pub fn counters(&self) -> AcsCounters {
        self.counters
    }

    /// `true` if mutations are buffered but not yet covered by a rollup.
    pub fn has_unchecked(&self) -> bool {
        !self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mutation::MutationType;

    fn mutation(key: &str, value: &str, acs_index: u16) -> Mutation {
        let mut m = Mutation {
            mutation_type: MutationType::SetValue,
            param1: Bytes::from(key.to_owned()),
            param2: Bytes::from(value.to_owned()),
            checksum: None,
            acs_index: Some(acs_index),
        };
        m.populate_checksum();
        m
    }

    const TAG: Tag = Tag::new(0, 1);

    #[test]
    fn builder_and_validator_agree() {
        let mut builder = AcsBuilder::new(1);
        let mut validator = AcsValidator::new();

        for (version, key) in [(10, "a"), (10, "b"), (12, "c")] {
            let m = mutation(key, "value", 1);
            builder.add_mutation(&m, TAG, 0, version);
            validator.add_mutation(&m, TAG);
        }

        let state = builder.state(TAG).unwrap();
        let stored = validator.process_acs(state, TAG, 12).unwrap();
        assert_eq!(stored, Some(state));
        // First rollup for an index is accepted without comparison.
        assert_eq!(validator.counters().checked_mutations, 0);

        // A second round must actually compare.
        for (version, key) in [(14, "d"), (15, "e")] {
            let m = mutation(key, "value", 1);
            builder.add_mutation(&m, TAG, 0, version);
            validator.add_mutation(&m, TAG);
        }
        let state = builder.state(TAG).unwrap();
        assert_eq!(validator.process_acs(state, TAG, 15).unwrap(), Some(state));
        assert_eq!(validator.counters().checked_mutations, 2);
        assert_eq!(validator.counters().checked_versions, 1);
    }

    #[test]
    fn reordered_stream_is_fatal() {
        let mut builder = AcsBuilder::new(1);
        let mut validator = AcsValidator::new();

        let first = mutation("a", "1", 1);
        let second = mutation("b", "2", 1);
        builder.add_mutation(&first, TAG, 0, 10);
        builder.add_mutation(&second, TAG, 0, 11);
        validator.add_mutation(&first, TAG);
        validator.add_mutation(&second, TAG);
        let state = builder.state(TAG).unwrap();
        validator.process_acs(state, TAG, 11).unwrap();

        // Consumer sees the next two mutations in the wrong order.
        let third = mutation("c", "3", 1);
        let fourth = mutation("d", "4", 1);
        builder.add_mutation(&third, TAG, 0, 12);
        builder.add_mutation(&fourth, TAG, 0, 13);
        validator.add_mutation(&fourth, TAG);
        validator.add_mutation(&third, TAG);

        let state = builder.state(TAG).unwrap();
        let err = validator.process_acs(state, TAG, 13).unwrap_err();
        assert!(matches!(err, TLogError::IntegrityFailure(_)));
    }

    #[test]
    fn stale_rollup_is_dropped() {
        let mut validator = AcsValidator::new();
        let newer = AcsState {
            acs_index: 1,
            acs: 7,
            version: 100,
            epoch: 1,
        };
        validator.process_acs(newer, TAG, 100).unwrap();

        let stale = AcsState {
            acs_index: 1,
            acs: 3,
            version: 50,
            epoch: 1,
        };
        assert_eq!(validator.process_acs(stale, TAG, 100).unwrap(), None);
    }

    #[test]
    fn newer_epoch_resets_accumulation() {
        let mut builder_old = AcsBuilder::new(1);
        let mut validator = AcsValidator::new();

        let m = mutation("a", "1", 1);
        builder_old.add_mutation(&m, TAG, 1, 10);
        validator.add_mutation(&m, TAG);
        validator.process_acs(builder_old.state(TAG).unwrap(), TAG, 10).unwrap();

        // A new producer epoch starts from scratch.
        let mut builder_new = AcsBuilder::new(1);
        let m = mutation("b", "2", 1);
        builder_new.add_mutation(&m, TAG, 2, 20);
        validator.add_mutation(&m, TAG);
        let state = builder_new.state(TAG).unwrap();
        assert_eq!(validator.process_acs(state, TAG, 20).unwrap(), Some(state));
    }

    #[test]
    fn txs_tag_is_exempt() {
        let mut builder = AcsBuilder::new(1);
        let m = mutation("a", "1", 1);
        builder.add_mutation(&m, Tag::TXS, 0, 10);
        assert_eq!(builder.state(Tag::TXS), None);
        assert!(!tag_supports_acs(Tag::TXS));
    }
}
