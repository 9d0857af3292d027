//! The spiller: moves aged message data from team buffers into the spill
//! store, and releases the durable-queue prefix nothing needs anymore.

use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;

use ledgerd_diskqueue::Location;
use ledgerd_primitives::{StorageTeamId, Version};
use tracing::{debug, error, info, trace};

use crate::error::{Result, TLogError};
use crate::generation::Generation;
use crate::group::Group;
use crate::keys::{self, SpilledData};

/// Drive spilling for `group` until the process shuts down.
///
/// Generations drain oldest-first. A stopped generation is drained
/// aggressively until everything it holds is in the spill store; the
/// active generation is drained lazily, only while the group is over its
/// volatile-memory target.
pub async fn run_spiller(group: Arc<Group>) {
    loop {
        let front = { group.generations.lock().spill_order.front().copied() };
        let Some(generation_id) = front else {
            let epoch = group.generation_epoch.get();
            group.generation_epoch.wait_for(epoch + 1).await;
            continue;
        };
        let Some(generation) = group.generation(generation_id) else {
            let mut generations = group.generations.lock();
            if generations.spill_order.front() == Some(&generation_id) {
                generations.spill_order.pop_front();
            }
            continue;
        };

        if generation.stopped.is_set() {
            if let Err(e) = drain_stopped(&group, &generation).await {
                error!(group = %group.id, error = %e, "spiller failed; process is degraded");
                group.degraded.set();
                return;
            }
            {
                let mut generations = group.generations.lock();
                if generations.spill_order.front() == Some(&generation_id) {
                    generations.spill_order.pop_front();
                }
            }
            if let Err(e) = retire_done_generations(&group).await {
                error!(group = %group.id, error = %e, "retirement failed; process is degraded");
                group.degraded.set();
                return;
            }
            continue;
        }

        // Active generation: drain lazily.
        let result = if group.volatile_bytes() >= group.settings.target_volatile_bytes {
            spill_batch(&group, &generation).await
        } else {
            Ok(false)
        };
        match result {
            Ok(true) => {
                // Keep draining, but let commits and peeks interleave.
                tokio::task::yield_now().await;
            }
            Ok(false) => {
                if let Err(e) = pop_disk_queue(&group) {
                    error!(group = %group.id, error = %e, "queue reclamation failed");
                    group.degraded.set();
                    return;
                }
                // Pops may have made an old generation removable.
                if let Err(e) = retire_done_generations(&group).await {
                    error!(group = %group.id, error = %e, "retirement failed; process is degraded");
                    group.degraded.set();
                    return;
                }
                let stats = group.counters.snapshot();
                trace!(
                    group = %group.id,
                    commits = stats.commits_accepted,
                    queue_commits = stats.queue_commits,
                    spills = stats.spill_cycles,
                    peeks = stats.peeks_served,
                    peeks_from_store = stats.peeks_from_store,
                    pops = stats.pops_applied,
                    bytes_input = group.bytes_input.get(),
                    bytes_durable = group.bytes_durable.get(),
                    "group activity"
                );
                tokio::select! {
                    _ = tokio::time::sleep(group.settings.update_storage_interval) => {}
                    _ = generation.stopped.wait() => {}
                }
            }
            Err(e) => {
                error!(group = %group.id, error = %e, "spiller failed; process is degraded");
                group.degraded.set();
                return;
            }
        }
    }
}

/// Drain a stopped generation until everything is durable in the store.
async fn drain_stopped(group: &Arc<Group>, generation: &Arc<Generation>) -> Result<()> {
    loop {
        let target = generation.version.get();
        {
            let state = generation.state.lock();
            if state.persistent_durable_version >= target {
                return Ok(());
            }
        }
        let batch_end = select_batch(group, generation).unwrap_or(target);
        generation.queue_committed_version.wait_for(batch_end).await;
        update_persistent_data(group, generation, batch_end).await?;
        tokio::task::yield_now().await;
    }
}

/// Spill one batch off the front of `generation`'s unspilled range.
///
/// Returns `false` if there was nothing eligible.
async fn spill_batch(group: &Arc<Group>, generation: &Arc<Generation>) -> Result<bool> {
    let Some(batch_end) = select_batch(group, generation) else {
        return Ok(false);
    };
    generation.queue_committed_version.wait_for(batch_end).await;
    update_persistent_data(group, generation, batch_end).await?;
    Ok(true)
}

/// Choose the last version of the next spill batch: consecutive indexed
/// versions after `persistent_data_version` whose combined message weight
/// stays within the batch budget.
fn select_batch(group: &Arc<Group>, generation: &Arc<Generation>) -> Option<Version> {
    let state = generation.state.lock();
    let pdv = state.persistent_data_version;
    let mut total = 0u64;
    let mut end = pdv;
    for (&version, entry) in state.version_index.range((Excluded(pdv), Unbounded)) {
        if total > 0 && total + entry.payload_bytes as u64 > group.settings.spill_batch_bytes {
            break;
        }
        total += entry.payload_bytes as u64;
        end = version;
    }
    (end > pdv).then_some(end)
}

/// Move everything in `(persistent_data_version, new_version]` into the
/// spill store, in one store commit, then evict it from memory.
pub(crate) async fn update_persistent_data(
    group: &Arc<Group>,
    generation: &Arc<Generation>,
    new_version: Version,
) -> Result<()> {
    let _commit_lock = group.persistent_data_commit_lock.lock().await;

    {
        let state = generation.state.lock();
        if new_version <= state.persistent_data_version {
            return Ok(());
        }
        debug_assert_eq!(
            state.persistent_data_version, state.persistent_durable_version,
            "no spill cycle in flight"
        );
    }
    debug_assert!(new_version <= generation.queue_committed_version.get());

    {
        let mut store_guard = group.store.lock();
        let store = &mut **store_guard;
        let mut state = generation.state.lock();
        let pdv = state.persistent_data_version;

        // Flush popped watermarks first, clearing rows the consumers have
        // moved past.
        let team_ids: Vec<StorageTeamId> = state.teams.keys().copied().collect();
        for team in &team_ids {
            let data = state.teams.get_mut(team).expect("team id just enumerated");
            if data.popped_recently {
                store.set(
                    &keys::tag_pop_key(generation.id, *team),
                    &keys::encode_tag_pop(&data.tags, data.popped),
                );
                // Rows the consumers moved past. Everything below the
                // previously flushed watermark is already gone.
                if !data.nothing_persistent && data.popped > data.persistent_popped {
                    store.clear_range(
                        &keys::tag_msg_key(generation.id, *team, data.persistent_popped),
                        &keys::tag_msg_key(generation.id, *team, data.popped),
                    );
                    store.clear_range(
                        &keys::tag_msg_ref_key(generation.id, *team, data.persistent_popped),
                        &keys::tag_msg_ref_key(generation.id, *team, data.popped),
                    );
                }
                data.persistent_popped = data.popped;
                data.popped_recently = false;
            }
        }

        // Write the batch: copied bytes for value-spilled teams, queue
        // references for the rest.
        let mut spilled_teams: Vec<StorageTeamId> = Vec::new();
        for (team, data) in &state.teams {
            let by_value = generation.spills_by_value(data);
            let mut wrote = false;
            if by_value {
                for (&version, block) in data.messages.range((Excluded(pdv), Included(new_version))) {
                    store.set(&keys::tag_msg_key(generation.id, *team, version), block);
                    wrote = true;
                }
            } else {
                let mut batch: Vec<SpilledData> = Vec::new();
                for (&version, block) in data.messages.range((Excluded(pdv), Included(new_version))) {
                    let entry = state
                        .version_index
                        .get(&version)
                        .expect("buffered version is indexed");
                    batch.push(SpilledData {
                        version,
                        begin: entry.begin,
                        length: (entry.end - entry.begin) as u32,
                        mutation_bytes: block.len() as u32,
                    });
                    wrote = true;
                    if batch.len() * SpilledData::ENCODED_LEN >= group.settings.reference_spill_batch_bytes {
                        flush_reference_batch(store, generation, *team, &mut batch);
                    }
                }
                flush_reference_batch(store, generation, *team, &mut batch);
            }
            if wrote {
                spilled_teams.push(*team);
            }
        }
        for team in spilled_teams {
            state.teams.get_mut(&team).expect("spilled team exists").nothing_persistent = false;
        }

        // The version row lands in the same commit as its backing rows.
        store.set(&keys::version_key(generation.id), &keys::encode_u64(new_version));
        store.set(
            &keys::known_committed_key(generation.id),
            &keys::encode_u64(state.known_committed_version),
        );
        drop(state);

        let recovery_location = compute_recovery_location(group, generation, new_version);
        store.set(keys::RECOVERY_LOCATION_KEY, &keys::encode_u64(recovery_location));
    }

    // Store commits are slow, blocking I/O; run on a worker thread. A
    // failure here is fatal for the process.
    let store = group.store.clone();
    match tokio::task::spawn_blocking(move || store.lock().commit()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(join) => return Err(TLogError::Storage(join.to_string())),
    }

    let freed = {
        let mut state = generation.state.lock();
        state.persistent_data_version = new_version;
        state.persistent_durable_version = new_version;
        let mut freed = 0u64;
        for data in state.teams.values_mut() {
            freed += data.erase_up_to(new_version);
        }
        freed
    };
    group.bytes_durable.add(freed);
    group.counters.record_spill_cycle();
    trace!(
        group = %group.id,
        generation = %generation.id,
        version = new_version,
        freed,
        "spilled"
    );

    pop_disk_queue(group)?;

    Ok(())
}

fn flush_reference_batch(
    store: &mut dyn ledgerd_store::PersistentStore,
    generation: &Arc<Generation>,
    team: StorageTeamId,
    batch: &mut Vec<SpilledData>,
) {
    if batch.is_empty() {
        return;
    }
    let last = batch.last().expect("non-empty batch").version;
    store.set(
        &keys::tag_msg_ref_key(generation.id, team, last),
        &keys::encode_spilled_batch(batch),
    );
    batch.clear();
}

/// The queue location where re-reading must begin on the next restart:
/// the oldest commit entry some generation has not yet spilled.
fn compute_recovery_location(group: &Arc<Group>, spilling: &Arc<Generation>, new_version: Version) -> Location {
    let mut location: Option<Location> = None;
    for generation in group.generations_snapshot() {
        let state = generation.state.lock();
        let from = if generation.id == spilling.id {
            new_version
        } else {
            state.persistent_data_version
        };
        if let Some((_, entry)) = state.version_index.range((Excluded(from), Unbounded)).next() {
            location = Some(location.map_or(entry.begin, |l| l.min(entry.begin)));
        }
    }
    location.unwrap_or_else(|| group.queue.lock().next_push_location())
}

/// Release the durable-queue prefix no generation needs: everything below
/// the oldest entry that is either unspilled, or reference-spilled and not
/// yet popped by every one of its teams.
pub(crate) fn pop_disk_queue(group: &Arc<Group>) -> Result<()> {
    // Snapshot the safe upper bound before inspecting indexes, so entries
    // pushed concurrently are never released. The read location also bounds
    // this during recovery replay, protecting records not yet re-read.
    let safe_end = group.queue.lock().next_read_location();
    let mut pop_to = safe_end;

    for generation in group.generations_snapshot() {
        let mut state = generation.state.lock();
        let mut queue_popped = state.persistent_data_version;
        for data in state.teams.values() {
            if !generation.spills_by_value(data) {
                queue_popped = queue_popped.min(data.popped);
            }
        }
        // Index entries at or below the queue-popped version are no longer
        // addressed by anything.
        let keep = state.version_index.split_off(&(queue_popped + 1));
        state.version_index = keep;
        if let Some((_, entry)) = state.version_index.iter().next() {
            pop_to = pop_to.min(entry.begin);
        }
    }

    let mut queue = group.queue.lock();
    queue.pop(pop_to)?;
    debug!(group = %group.id, pop_to, "queue reclaimed");
    Ok(())
}

/// A stopped generation whose data is fully spilled and fully consumed is
/// removed: its store rows are erased and it disappears from the group.
pub(crate) async fn retire_done_generations(group: &Arc<Group>) -> Result<()> {
    for generation in group.generations_snapshot() {
        if !generation_done(&generation) {
            continue;
        }
        {
            let mut store_guard = group.store.lock();
            keys::clear_generation(&mut **store_guard, generation.id);
        }
        let store = group.store.clone();
        match tokio::task::spawn_blocking(move || store.lock().commit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(join) => return Err(TLogError::Storage(join.to_string())),
        }
        group.remove_generation(generation.id);
        generation.removed.set();
        info!(group = %group.id, generation = %generation.id, "generation retired");
    }
    Ok(())
}

fn generation_done(generation: &Arc<Generation>) -> bool {
    if !generation.stopped.is_set() {
        return false;
    }
    let last = generation.version.get();
    let state = generation.state.lock();
    state.persistent_durable_version >= last
        && state.team_tags.keys().all(|team| {
            state
                .teams
                .get(team)
                .map(|data| data.popped >= last)
                .unwrap_or(false)
        })
}
