//! Recovery replay: rebuilding in-memory state from the persistent
//! devices after a restart.

use std::sync::Arc;

use ledgerd_diskqueue::DurableQueue;
use ledgerd_primitives::{GenerationId, GroupId, Version};
use ledgerd_store::{prefix_end, PersistentStore};
use tracing::{debug, info, warn};

use crate::error::{Result, TLogError};
use crate::generation::{Generation, IndexEntry, SpillType};
use crate::group::Group;
use crate::keys;
use crate::messages::CommitEntry;
use crate::mutation::TEAM_BLOCK_HEADER_LEN;
use crate::notify::Flag;
use crate::settings::Settings;
use crate::spill;
use crate::team::TeamData;

/// The persistent devices of one group, as handed to recovery by the
/// hosting worker.
pub struct GroupDevices {
    pub group: GroupId,
    pub store: Box<dyn PersistentStore>,
    pub queue: Box<dyn DurableQueue>,
}

/// Restore one group from its devices.
///
/// All recovered generations come back stopped: they serve peeks, pops
/// and spilling, but only a new recruitment accepts commits.
pub async fn restore_group(
    settings: Arc<Settings>,
    degraded: Arc<Flag>,
    devices: GroupDevices,
) -> Result<Arc<Group>> {
    let GroupDevices { group: group_id, store, queue } = devices;

    // Format gate.
    match store.read_value(keys::FORMAT_KEY)? {
        None => {
            // An empty store means this worker was removed while down and
            // holds nothing worth recovering.
            return Err(TLogError::WorkerRemoved);
        }
        Some(format) if format.as_ref() != keys::FORMAT_VALUE => {
            return Err(TLogError::Storage(format!(
                "unsupported store format {:?}",
                String::from_utf8_lossy(&format)
            )));
        }
        Some(_) => {}
    }

    let group = Group::new(group_id, settings.clone(), store, queue, degraded);

    // Per-generation metadata.
    let version_rows = {
        let store = group.store.lock();
        store.read_range(keys::VERSION_PREFIX, &prefix_end(keys::VERSION_PREFIX), usize::MAX, usize::MAX)?
    };
    let mut recovered: Vec<(GenerationId, Version)> = Vec::with_capacity(version_rows.len());
    for row in version_rows {
        let generation = keys::generation_from_key(keys::VERSION_PREFIX, &row.key)?;
        let version = keys::decode_u64(&row.value)?;
        recovered.push((generation, version));
    }

    for (generation_id, persisted_version) in recovered {
        let generation = restore_generation(&group, generation_id, persisted_version)?;
        debug!(
            group = %group.id,
            generation = %generation.id,
            version = persisted_version,
            "restored generation metadata"
        );
        group.add_generation(generation);
    }
    // Oldest generations spill and pop first.
    {
        let mut generations = group.generations.lock();
        generations.list.sort_by_key(|g| (g.recovery_count, g.id));
        let order: Vec<GenerationId> = generations.list.iter().map(|g| g.id).collect();
        generations.spill_order = order.iter().copied().collect();
        generations.pop_order = order.into_iter().collect();
    }

    replay_queue(&group).await?;

    for generation in group.generations_snapshot() {
        generation.stopped.set();
        {
            // The stop point of a recovered generation is wherever replay
            // ended.
            let mut state = generation.state.lock();
            let version = generation.version.get();
            state.stop_version.get_or_insert(version);
        }
        generation.recovery_complete.set();
    }

    info!(group = %group.id, "group recovered");
    Ok(group)
}

fn restore_generation(
    group: &Arc<Group>,
    generation_id: GenerationId,
    persisted_version: Version,
) -> Result<Arc<Generation>> {
    let store = group.store.lock();

    let read_u64 = |key: Vec<u8>| -> Result<Option<u64>> {
        Ok(match store.read_value(&key)? {
            Some(value) => Some(keys::decode_u64(&value)?),
            None => None,
        })
    };

    let known_committed = read_u64(keys::known_committed_key(generation_id))?.unwrap_or(0);
    let recovery_count = read_u64(keys::recovery_count_key(generation_id))?.ok_or_else(|| {
        TLogError::Storage(format!("generation {generation_id} has no recovery count"))
    })?;
    let unrecovered_before = read_u64(keys::unrecovered_before_key(generation_id))?.unwrap_or(0);
    let spill_type = match store.read_value(&keys::spill_type_key(generation_id))? {
        Some(value) if !value.is_empty() => SpillType::from_u8(value[0])?,
        _ => SpillType::Value,
    };
    let locality = match store.read_value(&keys::locality_key(generation_id))? {
        Some(value) => keys::decode_i8(&value)?,
        None => 0,
    };
    let teams = match store.read_value(&keys::storage_teams_key(generation_id))? {
        Some(value) => keys::decode_storage_teams(&value)?,
        None => Vec::new(),
    };

    let generation = Generation::new(
        generation_id,
        group.id,
        recovery_count,
        spill_type,
        locality,
        persisted_version,
        &teams,
    );
    {
        let mut state = generation.state.lock();
        state.known_committed_version = known_committed;
        state.durable_known_committed_version = known_committed;
        state.unrecovered_before = unrecovered_before;
    }

    // Pop watermarks that made it to the store. Pops newer than the last
    // spill cycle were lost with memory and will be re-issued by the
    // consumers.
    let pop_prefix = {
        let mut prefix = keys::TAG_POP_PREFIX.to_vec();
        prefix.extend_from_slice(&generation_id.0.to_be_bytes());
        prefix
    };
    let pop_rows = store.read_range(&pop_prefix, &prefix_end(&pop_prefix), usize::MAX, usize::MAX)?;
    {
        let mut state = generation.state.lock();
        for row in pop_rows {
            let team = keys::team_from_key(keys::TAG_POP_PREFIX, &row.key)?;
            let (tags, popped) = keys::decode_tag_pop(&row.value)?;
            let mut data = TeamData::new(team, tags, popped);
            data.persistent_popped = popped;
            data.popped_recently = false;
            data.nothing_persistent = false;
            state.teams.insert(team, data);
        }
    }

    Ok(generation)
}

/// Replay the durable queue into the recovered generations, advancing
/// their versions past the last spill cycle.
async fn replay_queue(group: &Arc<Group>) -> Result<()> {
    let recovery_location = {
        let store = group.store.lock();
        match store.read_value(keys::RECOVERY_LOCATION_KEY)? {
            Some(value) => keys::decode_u64(&value)?,
            None => 0,
        }
    };

    let finished = group.queue.lock().initialize_recovery(recovery_location)?;
    if finished {
        debug!(group = %group.id, "queue has nothing to replay");
        return Ok(());
    }

    let mut replayed = 0u64;
    loop {
        let record = group.queue.lock().read_next()?;
        let Some(record) = record else { break };

        let entry = match CommitEntry::decode(&record.payload) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(group = %group.id, error = %e, begin = record.begin, "skipping undecodable queue entry");
                continue;
            }
        };
        let Some(generation) = group.generation(entry.generation) else {
            // A generation that was fully retired; its entries are just
            // queue garbage awaiting reclamation.
            continue;
        };
        if entry.version <= generation.version.get() {
            // Already covered by the spill store.
            continue;
        }

        let mut added = 0u64;
        {
            let mut state = generation.state.lock();
            let mut payload_bytes = 0u32;
            for (team, block) in &entry.messages {
                if block.len() < TEAM_BLOCK_HEADER_LEN {
                    continue;
                }
                let payload = block.slice(TEAM_BLOCK_HEADER_LEN..);
                let data = state.get_or_create_team(*team);
                if data.popped >= entry.version {
                    continue;
                }
                added += TeamData::buffered_bytes(&payload);
                payload_bytes += payload.len() as u32;
                data.messages.insert(entry.version, payload);
            }
            state.known_committed_version = state.known_committed_version.max(entry.known_committed_version);
            state.durable_known_committed_version = state.known_committed_version;
            state.version_index.insert(
                entry.version,
                IndexEntry {
                    begin: record.begin,
                    end: record.end,
                    payload_bytes,
                },
            );
        }
        generation.version.set(entry.version);
        generation.queue_committed_version.set(entry.version);
        group.bytes_input.add(added);
        replayed += 1;

        // Replay of a large backlog must not blow the memory budget.
        if group.volatile_bytes() >= group.settings.recovery_memory_limit_bytes {
            if let Some(batch_end) = select_replay_spill(&generation) {
                spill::update_persistent_data(group, &generation, batch_end).await?;
            }
        }
    }

    info!(group = %group.id, replayed, "queue replay complete");
    Ok(())
}

/// During replay, spill everything read so far for the generation under
/// pressure.
fn select_replay_spill(generation: &Arc<Generation>) -> Option<Version> {
    let state = generation.state.lock();
    let last = state.version_index.keys().next_back().copied()?;
    (last > state.persistent_data_version).then_some(last)
}
