//! The pop service: advancing per-team popped watermarks.

use std::sync::Arc;

use ledgerd_primitives::{StorageTeamId, Version};
use tracing::trace;

use crate::error::Result;
use crate::group::Group;
use crate::spill;

/// Apply a pop of `team` through `to_version` to every generation of the
/// group. Idempotent: popping backwards is a no-op.
///
/// Rows at or below the watermark that are still only in memory are
/// erased immediately; spilled rows are cleared by the next spill cycle,
/// which also persists the new watermark.
pub async fn pop(group: &Arc<Group>, team: StorageTeamId, to_version: Version) -> Result<()> {
    for generation in group.generations_snapshot() {
        let freed = {
            let mut state = generation.state.lock();
            if !state.team_tags.contains_key(&team) && !state.teams.contains_key(&team) {
                continue;
            }
            let pdv = state.persistent_data_version;
            let data = state.get_or_create_team(team);
            if to_version <= data.popped {
                continue;
            }
            data.popped = to_version;
            data.popped_recently = true;
            if to_version > pdv {
                // Unspilled rows die right here; nothing else refers to
                // them.
                data.erase_up_to(to_version)
            } else {
                0
            }
        };
        if freed > 0 {
            group.bytes_durable.add(freed);
        }
        trace!(group = %group.id, generation = %generation.id, team = %team, to_version, "popped");
    }

    group.counters.record_pop();

    // A pop can unpin queue segments and whole generations.
    spill::pop_disk_queue(group)?;
    spill::retire_done_generations(group).await?;

    Ok(())
}
