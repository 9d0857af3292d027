//! One generation of a log group.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ledgerd_diskqueue::Location;
use ledgerd_primitives::buf::DecodeError;
use ledgerd_primitives::{GenerationId, GroupId, LogEpoch, StorageTeamId, Tag, Version};
use parking_lot::Mutex;

use crate::notify::{Flag, Notifier};
use crate::team::TeamData;

/// The server protocol generation persisted with each log generation.
pub const PROTOCOL_VERSION: u64 = 3;

/// How a generation moves aged data out of memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SpillType {
    /// Copy message bytes into the spill store.
    Value = 0,
    /// Store only references into the durable queue.
    Reference = 1,
}

impl SpillType {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            0 => Ok(SpillType::Value),
            1 => Ok(SpillType::Reference),
            tag => Err(DecodeError::InvalidTag {
                tag,
                kind: "spill type",
            }),
        }
    }
}

/// Where in the durable queue one version's commit entry lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub begin: Location,
    pub end: Location,
    /// Total message bytes across all teams at this version; the weight
    /// used for spill batching.
    pub payload_bytes: u32,
}

/// The mutable state of a generation, guarded by one lock and only ever
/// mutated between suspension points.
#[derive(Debug, Default)]
pub struct GenerationState {
    /// version → durable-queue location of the commit entry.
    pub version_index: BTreeMap<Version, IndexEntry>,
    /// Per-team buffers.
    pub teams: HashMap<StorageTeamId, TeamData>,
    /// The configured storage-team → tag-set map.
    pub team_tags: BTreeMap<StorageTeamId, Vec<Tag>>,
    pub known_committed_version: Version,
    pub min_known_committed_version: Version,
    /// Known-committed version as of the last durable queue commit; what
    /// commit replies carry.
    pub durable_known_committed_version: Version,
    pub queue_committing_version: Version,
    /// Everything at or below this has been written to the spill store.
    pub persistent_data_version: Version,
    /// Everything at or below this is durable in the spill store.
    pub persistent_durable_version: Version,
    /// Peeks below this must await recovery-complete.
    pub unrecovered_before: Version,
    /// Set once the generation is stopped; the version at that moment.
    pub stop_version: Option<Version>,
}

impl GenerationState {
    /// The team buffer for `team`, created on first touch with the
    /// configured tags (empty if the team is not configured).
    pub fn get_or_create_team(&mut self, team: StorageTeamId) -> &mut TeamData {
        let tags = self.team_tags.get(&team).cloned().unwrap_or_default();
        self.teams.entry(team).or_insert_with(|| TeamData::new(team, tags, 0))
    }

    /// The configured teams with their tag sets, for lock replies and
    /// persistence.
    pub fn team_list(&self) -> Vec<(StorageTeamId, Vec<Tag>)> {
        self.team_tags.iter().map(|(team, tags)| (*team, tags.clone())).collect()
    }
}

/// One instantiation of a log for a given group, created by one recovery
/// round.
#[derive(Debug)]
pub struct Generation {
    pub id: GenerationId,
    pub group_id: GroupId,
    /// The recovery epoch that created this generation.
    pub recovery_count: LogEpoch,
    pub protocol_version: u64,
    pub spill_type: SpillType,
    pub locality: i8,
    pub state: Mutex<GenerationState>,
    /// The newest version accepted by the commit path.
    pub version: Notifier,
    /// The newest version known durable in the queue.
    pub queue_committed_version: Notifier,
    pub stopped: Flag,
    pub removed: Flag,
    pub recovery_complete: Flag,
}

impl Generation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: GenerationId,
        group_id: GroupId,
        recovery_count: LogEpoch,
        spill_type: SpillType,
        locality: i8,
        initial_version: Version,
        teams: &[(StorageTeamId, Vec<Tag>)],
    ) -> Arc<Self> {
        let mut state = GenerationState {
            persistent_data_version: initial_version,
            persistent_durable_version: initial_version,
            ..Default::default()
        };
        for (team, tags) in teams {
            state.team_tags.insert(*team, tags.clone());
        }

        Arc::new(Self {
            id,
            group_id,
            recovery_count,
            protocol_version: PROTOCOL_VERSION,
            spill_type,
            locality,
            state: Mutex::new(state),
            version: Notifier::new(initial_version),
            queue_committed_version: Notifier::new(initial_version),
            stopped: Flag::new(),
            removed: Flag::new(),
            recovery_complete: Flag::new(),
        })
    }

    /// `true` if rows of `team` are copied into the spill store rather
    /// than referenced in place.
    pub fn spills_by_value(&self, team: &TeamData) -> bool {
        self.spill_type == SpillType::Value || team.is_txs()
    }

    /// Stop the generation: no further commits are accepted. Returns the
    /// version at the moment of the stop. Idempotent.
    pub fn stop(&self) -> Version {
        let mut state = self.state.lock();
        let stop_version = *state.stop_version.get_or_insert_with(|| self.version.get());
        drop(state);
        self.stopped.set();
        stop_version
    }

    /// The last version this generation will ever hold, if stopped.
    pub fn stop_version(&self) -> Option<Version> {
        self.state.lock().stop_version
    }
}
