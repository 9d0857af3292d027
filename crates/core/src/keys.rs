//! Key and value schema of the persistent spill store.
//!
//! All keys are a fixed ASCII prefix followed by big-endian identifiers, so
//! that range reads iterate generations, teams and versions in order. All
//! values go through the workspace buffer codec (little-endian).

use ledgerd_primitives::buf::{BufReader, BufWriter, Decode, DecodeError, Encode};
use ledgerd_primitives::{GenerationId, StorageTeamId, Tag, Version};

/// Identifies the on-disk schema. An unknown value aborts recovery.
pub const FORMAT_KEY: &[u8] = b"Format";
pub const FORMAT_VALUE: &[u8] = b"ledgerd/LogServer/3/0";

/// Queue location at which this group may safely begin re-reading on the
/// next restart.
pub const RECOVERY_LOCATION_KEY: &[u8] = b"recoveryLocation";

pub const VERSION_PREFIX: &[u8] = b"version/";
pub const KNOWN_COMMITTED_PREFIX: &[u8] = b"knownCommitted/";
pub const RECOVERY_COUNT_PREFIX: &[u8] = b"DbRecoveryCount/";
pub const PROTOCOL_VERSION_PREFIX: &[u8] = b"ProtocolVersion/";
pub const SPILL_TYPE_PREFIX: &[u8] = b"TLogSpillType/";
pub const LOCALITY_PREFIX: &[u8] = b"Locality/";
pub const STORAGE_TEAMS_PREFIX: &[u8] = b"StorageTeam/";
pub const UNRECOVERED_BEFORE_PREFIX: &[u8] = b"UnrecoveredBefore/";
pub const TAG_MSG_PREFIX: &[u8] = b"TagMsg/";
pub const TAG_MSG_REF_PREFIX: &[u8] = b"TagMsgRef/";
pub const TAG_POP_PREFIX: &[u8] = b"TagPop/";

fn with_generation(prefix: &[u8], generation: GenerationId) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&generation.0.to_be_bytes());
    key
}

fn with_generation_team(prefix: &[u8], generation: GenerationId, team: StorageTeamId) -> Vec<u8> {
    let mut key = with_generation(prefix, generation);
    key.extend_from_slice(&team.0.to_be_bytes());
    key
}

fn with_generation_team_version(
    prefix: &[u8],
    generation: GenerationId,
    team: StorageTeamId,
    version: Version,
) -> Vec<u8> {
    let mut key = with_generation_team(prefix, generation, team);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

pub fn version_key(generation: GenerationId) -> Vec<u8> {
    with_generation(VERSION_PREFIX, generation)
}

pub fn known_committed_key(generation: GenerationId) -> Vec<u8> {
    with_generation(KNOWN_COMMITTED_PREFIX, generation)
}

pub fn recovery_count_key(generation: GenerationId) -> Vec<u8> {
    with_generation(RECOVERY_COUNT_PREFIX, generation)
}

pub fn protocol_version_key(generation: GenerationId) -> Vec<u8> {
    with_generation(PROTOCOL_VERSION_PREFIX, generation)
}

pub fn spill_type_key(generation: GenerationId) -> Vec<u8> {
    with_generation(SPILL_TYPE_PREFIX, generation)
}

pub fn locality_key(generation: GenerationId) -> Vec<u8> {
    with_generation(LOCALITY_PREFIX, generation)
}

pub fn storage_teams_key(generation: GenerationId) -> Vec<u8> {
    with_generation(STORAGE_TEAMS_PREFIX, generation)
}

pub fn unrecovered_before_key(generation: GenerationId) -> Vec<u8> {
    with_generation(UNRECOVERED_BEFORE_PREFIX, generation)
}

/// `TagMsg/<gen>/<team>/<version BE>` → concatenated serialized messages
/// at that version (spill-by-value).
pub fn tag_msg_key(generation: GenerationId, team: StorageTeamId, version: Version) -> Vec<u8> {
    with_generation_team_version(TAG_MSG_PREFIX, generation, team, version)
}

/// `TagMsgRef/<gen>/<team>/<lastVersion BE>` → batch of [`SpilledData`]
/// (spill-by-reference).
pub fn tag_msg_ref_key(generation: GenerationId, team: StorageTeamId, last_version: Version) -> Vec<u8> {
    with_generation_team_version(TAG_MSG_REF_PREFIX, generation, team, last_version)
}

pub fn tag_pop_key(generation: GenerationId, team: StorageTeamId) -> Vec<u8> {
    with_generation_team(TAG_POP_PREFIX, generation, team)
}

/// Parse the trailing big-endian version out of a `TagMsg`/`TagMsgRef`
/// key produced by the builders above.
pub fn version_from_spill_key(key: &[u8]) -> Result<Version, DecodeError> {
    if key.len() < 8 {
        return Err(DecodeError::BufferLength {
            expected: 8,
            given: key.len(),
        });
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&key[key.len() - 8..]);
    Ok(Version::from_be_bytes(arr))
}

/// Parse the generation id following `prefix` in a metadata key.
pub fn generation_from_key(prefix: &[u8], key: &[u8]) -> Result<GenerationId, DecodeError> {
    let suffix = key.strip_prefix(prefix).ok_or(DecodeError::InvalidTag {
        tag: 0,
        kind: "generation key prefix",
    })?;
    if suffix.len() != 8 {
        return Err(DecodeError::BufferLength {
            expected: 8,
            given: suffix.len(),
        });
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(suffix);
    Ok(GenerationId(u64::from_be_bytes(arr)))
}

/// Parse the team id following `prefix ++ generation` in a per-team key.
pub fn team_from_key(prefix: &[u8], key: &[u8]) -> Result<StorageTeamId, DecodeError> {
    let suffix = key.strip_prefix(prefix).ok_or(DecodeError::InvalidTag {
        tag: 0,
        kind: "team key prefix",
    })?;
    if suffix.len() < 16 {
        return Err(DecodeError::BufferLength {
            expected: 16,
            given: suffix.len(),
        });
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&suffix[8..16]);
    Ok(StorageTeamId(u64::from_be_bytes(arr)))
}

pub fn encode_u64(val: u64) -> Vec<u8> {
    val.to_le_bytes().to_vec()
}

pub fn decode_u64(value: &[u8]) -> Result<u64, DecodeError> {
    let mut rd = value;
    rd.get_u64()
}

pub fn encode_i8(val: i8) -> Vec<u8> {
    val.to_le_bytes().to_vec()
}

pub fn decode_i8(value: &[u8]) -> Result<i8, DecodeError> {
    let mut rd = value;
    rd.get_i8()
}

const TAG_POP_FORMAT: u8 = 1;

/// Versioned `(tag-set, popped_version)` value stored under `TagPop/`.
pub fn encode_tag_pop(tags: &[Tag], popped: Version) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 4 + tags.len() * 5 + 8);
    buf.put_u8(TAG_POP_FORMAT);
    buf.put_u32(tags.len() as u32);
    for tag in tags {
        tag.encode(&mut buf);
    }
    buf.put_u64(popped);
    buf
}

pub fn decode_tag_pop(value: &[u8]) -> Result<(Vec<Tag>, Version), DecodeError> {
    let mut rd = value;
    let format = rd.get_u8()?;
    if format != TAG_POP_FORMAT {
        return Err(DecodeError::InvalidTag {
            tag: format,
            kind: "tag pop format",
        });
    }
    let n = rd.get_u32()? as usize;
    let mut tags = Vec::with_capacity(n);
    for _ in 0..n {
        tags.push(Tag::decode(&mut rd)?);
    }
    let popped = rd.get_u64()?;
    Ok((tags, popped))
}

/// Value stored under `StorageTeam/<gen>`: the generation's full
/// storage-team to tag-set map.
pub fn encode_storage_teams(teams: &[(StorageTeamId, Vec<Tag>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u32(teams.len() as u32);
    for (team, tags) in teams {
        team.encode(&mut buf);
        buf.put_u32(tags.len() as u32);
        for tag in tags {
            tag.encode(&mut buf);
        }
    }
    buf
}

pub fn decode_storage_teams(value: &[u8]) -> Result<Vec<(StorageTeamId, Vec<Tag>)>, DecodeError> {
    let mut rd = value;
    let n = rd.get_u32()? as usize;
    let mut teams = Vec::with_capacity(n);
    for _ in 0..n {
        let team = StorageTeamId::decode(&mut rd)?;
        let tag_count = rd.get_u32()? as usize;
        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            tags.push(Tag::decode(&mut rd)?);
        }
        teams.push((team, tags));
    }
    Ok(teams)
}

/// One entry of a `TagMsgRef/` batch: where in the durable queue the
/// messages of `version` live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpilledData {
    pub version: Version,
    /// Queue location where the commit entry's frame begins.
    pub begin: u64,
    /// Length of the frame, including framing.
    pub length: u32,
    /// Serialized message bytes this team contributed at `version`.
    pub mutation_bytes: u32,
}

impl SpilledData {
    pub const ENCODED_LEN: usize = 8 + 8 + 4 + 4;
}

/// `u32 count | count × SpilledData`, the value format of `TagMsgRef/`.
pub fn encode_spilled_batch(batch: &[SpilledData]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + batch.len() * SpilledData::ENCODED_LEN);
    buf.put_u32(batch.len() as u32);
    for entry in batch {
        buf.put_u64(entry.version);
        buf.put_u64(entry.begin);
        buf.put_u32(entry.length);
        buf.put_u32(entry.mutation_bytes);
    }
    buf
}

pub fn decode_spilled_batch(value: &[u8]) -> Result<Vec<SpilledData>, DecodeError> {
    let mut rd = value;
    let n = rd.get_u32()? as usize;
    let mut batch = Vec::with_capacity(n);
    for _ in 0..n {
        batch.push(SpilledData {
            version: rd.get_u64()?,
            begin: rd.get_u64()?,
            length: rd.get_u32()?,
            mutation_bytes: rd.get_u32()?,
        });
    }
    Ok(batch)
}

/// Clear every per-generation row of `generation`, staging into `store`.
pub fn clear_generation(store: &mut dyn ledgerd_store::PersistentStore, generation: GenerationId) {
    for prefix in [
        VERSION_PREFIX,
        KNOWN_COMMITTED_PREFIX,
        RECOVERY_COUNT_PREFIX,
        PROTOCOL_VERSION_PREFIX,
        SPILL_TYPE_PREFIX,
        LOCALITY_PREFIX,
        STORAGE_TEAMS_PREFIX,
        UNRECOVERED_BEFORE_PREFIX,
    ] {
        store.clear(&with_generation(prefix, generation));
    }
    for prefix in [TAG_MSG_PREFIX, TAG_MSG_REF_PREFIX, TAG_POP_PREFIX] {
        let begin = with_generation(prefix, generation);
        let end = with_generation(prefix, GenerationId(generation.0 + 1));
        store.clear_range(&begin, &end);
    }
}
