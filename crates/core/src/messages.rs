//! Wire messages of the log server, and the durable commit-entry codec.
//!
//! Transport is out of scope: collaborators call the [`crate::TLogServer`]
//! methods directly with these types. The one format that must be stable
//! is [`CommitEntry`], which is what actually lands in the durable queue;
//! its payload is version-prefixed for forward compatibility.

use bytes::Bytes;
use ledgerd_primitives::buf::{BufReader, BufWriter, Decode, DecodeError, Encode};
use ledgerd_primitives::{GenerationId, GroupId, LogEpoch, StorageTeamId, Tag, Version};

use crate::generation::SpillType;

/// A batch of mutations from one commit proxy at one version.
#[derive(Clone, Debug)]
pub struct CommitRequest {
    pub group: GroupId,
    /// The version of the previous batch; used to order and deduplicate.
    pub prev_version: Version,
    pub version: Version,
    pub known_committed_version: Version,
    pub min_known_committed_version: Version,
    /// Serialized team blocks, including the fixed block header.
    pub messages: Vec<(StorageTeamId, Bytes)>,
    /// Teams to add to the generation before this batch's messages apply.
    pub added_teams: Vec<(StorageTeamId, Vec<Tag>)>,
    /// Teams to retire after this batch.
    pub removed_teams: Vec<StorageTeamId>,
    pub debug_id: Option<u64>,
}

impl CommitRequest {
    pub fn new(group: GroupId, prev_version: Version, version: Version) -> Self {
        Self {
            group,
            prev_version,
            version,
            known_committed_version: 0,
            min_known_committed_version: 0,
            messages: Vec::new(),
            added_teams: Vec::new(),
            removed_teams: Vec::new(),
            debug_id: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitReply {
    pub durable_known_committed_version: Version,
}

#[derive(Clone, Debug)]
pub struct PeekRequest {
    pub group: GroupId,
    pub team: StorageTeamId,
    pub begin_version: Version,
    /// Exclusive upper bound; unbounded if absent.
    pub end_version: Option<Version>,
    /// Reply `end_of_stream` instead of waiting for data.
    pub return_if_blocked: bool,
    /// `(peek_id, sequence)` for sequence-tracked streams.
    pub sequence: Option<(u64, u32)>,
    /// Tag the requesting log router consumes; informational.
    pub log_router_tag: Option<Tag>,
    pub debug_id: Option<u64>,
}

impl PeekRequest {
    pub fn new(group: GroupId, team: StorageTeamId, begin_version: Version) -> Self {
        Self {
            group,
            team,
            begin_version,
            end_version: None,
            return_if_blocked: false,
            sequence: None,
            log_router_tag: None,
            debug_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeekReply {
    /// First version covered by `data` (or the popped watermark).
    pub begin_version: Version,
    /// The version the consumer should request next.
    pub end_version: Version,
    /// Per-version frames; see [`crate::mutation::decode_version_blocks`].
    pub data: Bytes,
    /// Set if the requested range starts below the team's popped
    /// watermark; no data below it will ever be returned.
    pub popped: Option<Version>,
    pub max_known_version: Version,
    pub min_known_committed_version: Version,
    /// The reply was served entirely from the spill store, and more
    /// spilled data remains.
    pub only_spilled: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct PopRequest {
    pub group: GroupId,
    pub team: StorageTeamId,
    pub to_version: Version,
    pub durable_known_committed_version: Version,
}

/// State of one group at the moment a lock took effect.
#[derive(Clone, Debug)]
pub struct GroupLockState {
    pub group: GroupId,
    pub generation: GenerationId,
    /// `version` at the moment of the lock; nothing later was accepted.
    pub end_version: Version,
    pub known_committed_version: Version,
    pub teams: Vec<(StorageTeamId, Vec<Tag>)>,
}

#[derive(Clone, Debug)]
pub struct LockReply {
    pub groups: Vec<GroupLockState>,
}

/// Describes the previous log system a recruited generation recovers from.
#[derive(Clone, Copy, Debug)]
pub struct RecoverFrom {
    /// Peeks below this version must await recovery-complete.
    pub unrecovered_before: Version,
    /// The recovery orchestrator replays history up to here; the
    /// generation is caught up once its durable version reaches it.
    pub recover_at: Version,
}

#[derive(Clone, Debug)]
pub struct RecruitGroup {
    pub group: GroupId,
    pub teams: Vec<(StorageTeamId, Vec<Tag>)>,
}

/// Creates one generation across a set of groups on this process.
#[derive(Clone, Debug)]
pub struct RecruitmentRequest {
    pub recruitment_id: u64,
    pub epoch: LogEpoch,
    pub generation: GenerationId,
    pub locality: i8,
    pub spill_type: SpillType,
    pub groups: Vec<RecruitGroup>,
    pub recover_from: Option<RecoverFrom>,
}

/// Announcement sent to the recovery controller until acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RejoinRequest {
    pub interface_id: u64,
}

const COMMIT_ENTRY_FORMAT: u8 = 1;

/// What one durable-queue record holds: one proxy batch at one version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitEntry {
    pub generation: GenerationId,
    pub version: Version,
    pub known_committed_version: Version,
    /// Serialized team blocks, including the fixed block header.
    pub messages: Vec<(StorageTeamId, Bytes)>,
}

impl CommitEntry {
    pub fn encode(&self) -> Vec<u8> {
        let payload: usize = self.messages.iter().map(|(_, block)| 8 + 4 + block.len()).sum();
        let mut buf = Vec::with_capacity(1 + 8 + 8 + 8 + 4 + payload);
        buf.put_u8(COMMIT_ENTRY_FORMAT);
        self.generation.encode(&mut buf);
        buf.put_u64(self.version);
        buf.put_u64(self.known_committed_version);
        buf.put_u32(self.messages.len() as u32);
        for (team, block) in &self.messages {
            team.encode(&mut buf);
            buf.put_u32(block.len() as u32);
            buf.put_slice(block);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut rd = payload;
        let format = rd.get_u8()?;
        if format != COMMIT_ENTRY_FORMAT {
            return Err(DecodeError::InvalidTag {
                tag: format,
                kind: "commit entry format",
            });
        }
        let generation = GenerationId::decode(&mut rd)?;
        let version = rd.get_u64()?;
        let known_committed_version = rd.get_u64()?;
        let count = rd.get_u32()? as usize;
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            let team = StorageTeamId::decode(&mut rd)?;
            let len = rd.get_u32()? as usize;
            messages.push((team, Bytes::copy_from_slice(rd.get_slice(len)?)));
        }
        Ok(Self {
            generation,
            version,
            known_committed_version,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn commit_entry_roundtrip() {
        let entry = CommitEntry {
            generation: GenerationId(3),
            version: 150,
            known_committed_version: 120,
            messages: vec![
                (StorageTeamId(1), Bytes::from_static(b"block one")),
                (StorageTeamId(2), Bytes::from_static(b"two")),
            ],
        };

        let encoded = entry.encode();
        assert_eq!(CommitEntry::decode(&encoded).unwrap(), entry);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let entry = CommitEntry {
            generation: GenerationId(1),
            version: 1,
            known_committed_version: 0,
            messages: vec![],
        };
        let mut encoded = entry.encode();
        encoded[0] = 99;
        assert!(CommitEntry::decode(&encoded).is_err());
    }
}
