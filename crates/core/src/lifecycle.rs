//! Generation lifecycle: recruitment, lock/stop, initial persistence.

use std::sync::Arc;

use ledgerd_primitives::Version;
use tracing::info;

use crate::error::{Result, TLogError};
use crate::generation::Generation;
use crate::group::Group;
use crate::keys;
use crate::messages::{GroupLockState, RecoverFrom};

/// Stop `generation` and wait until everything it accepted is durable in
/// the queue. Returns the version at the stop point.
///
/// Peek waiters beyond the stop version unblock with `end_of_stream`; the
/// generation continues to serve peeks, pops and spilling until it is
/// retired.
pub async fn stop_generation(group: &Arc<Group>, generation: &Arc<Generation>) -> Result<Version> {
    let stop_version = generation.stop();
    info!(group = %group.id, generation = %generation.id, stop_version, "generation stopped");
    generation.queue_committed_version.wait_for(stop_version).await;
    Ok(stop_version)
}

/// Lock state of one group: stop its current generation (if any) and
/// report the stop point.
pub async fn lock_group(group: &Arc<Group>) -> Result<Option<GroupLockState>> {
    let Some(generation) = group.newest_generation() else {
        return Ok(None);
    };
    let end_version = stop_generation(group, &generation).await?;
    let state = generation.state.lock();
    Ok(Some(GroupLockState {
        group: group.id,
        generation: generation.id,
        end_version,
        known_committed_version: state.known_committed_version,
        teams: state.team_list(),
    }))
}

/// Write the immutable-after-init metadata of a freshly recruited
/// generation, in one store commit.
pub async fn init_persistent_state(group: &Arc<Group>, generation: &Arc<Generation>) -> Result<()> {
    {
        let mut store = group.store.lock();
        let state = generation.state.lock();
        store.set(keys::FORMAT_KEY, keys::FORMAT_VALUE);
        store.set(&keys::version_key(generation.id), &keys::encode_u64(generation.version.get()));
        store.set(
            &keys::known_committed_key(generation.id),
            &keys::encode_u64(state.known_committed_version),
        );
        store.set(
            &keys::recovery_count_key(generation.id),
            &keys::encode_u64(generation.recovery_count),
        );
        store.set(
            &keys::protocol_version_key(generation.id),
            &keys::encode_u64(generation.protocol_version),
        );
        store.set(
            &keys::spill_type_key(generation.id),
            &[generation.spill_type.to_u8()],
        );
        store.set(&keys::locality_key(generation.id), &keys::encode_i8(generation.locality));
        store.set(
            &keys::storage_teams_key(generation.id),
            &keys::encode_storage_teams(&state.team_list()),
        );
        if state.unrecovered_before > 0 {
            store.set(
                &keys::unrecovered_before_key(generation.id),
                &keys::encode_u64(state.unrecovered_before),
            );
        }
    }

    let store = group.store.clone();
    match tokio::task::spawn_blocking(move || store.lock().commit()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(join) => Err(TLogError::Storage(join.to_string())),
    }
}

/// Wire a recovering generation's catch-up: once the queue has made the
/// replayed history through `recover_at` durable, peeks below the
/// unrecovered marker may proceed.
pub fn apply_recover_from(generation: &Arc<Generation>, recover_from: Option<RecoverFrom>) {
    match recover_from {
        Some(RecoverFrom {
            unrecovered_before,
            recover_at,
        }) => {
            generation.state.lock().unrecovered_before = unrecovered_before;
            let generation = generation.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = generation.queue_committed_version.wait_for(recover_at) => {
                        generation.recovery_complete.set();
                        info!(generation = %generation.id, recover_at, "caught up to previous log system");
                    }
                    _ = generation.removed.wait() => {}
                }
            });
        }
        None => generation.recovery_complete.set(),
    }
}
