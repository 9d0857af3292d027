//! The commit path: accepting proxy batches into the log.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Result, TLogError};
use crate::generation::{Generation, IndexEntry};
use crate::group::Group;
use crate::messages::{CommitEntry, CommitReply, CommitRequest};
use crate::mutation::TEAM_BLOCK_HEADER_LEN;
use crate::team::TeamData;

/// Apply one [`CommitRequest`] to the group's current generation.
///
/// Requests are ordered by `prev_version`: a request waits until the
/// generation has caught up to it, and a request whose version is already
/// known is treated as a retry and only waits for durability. The region
/// from the version check through publishing the new version contains no
/// suspension point, which is what keeps the version sequence gap-free.
pub async fn commit(group: &Arc<Group>, req: CommitRequest) -> Result<CommitReply> {
    let Some(generation) = group.current_generation() else {
        return Err(TLogError::TLogStopped);
    };
    if req.version <= req.prev_version {
        return Err(TLogError::OperationObsolete);
    }

    // Wait until this request's predecessor has been processed.
    tokio::select! {
        biased;
        _ = generation.version.wait_for(req.prev_version) => {}
        _ = generation.stopped.wait() => return Err(TLogError::TLogStopped),
    }

    wait_for_memory(group, &generation).await;

    if generation.stopped.is_set() {
        return Err(TLogError::TLogStopped);
    }

    let version = req.version;
    let new_bytes = apply(group, &generation, req)?;
    group.counters.record_commit(new_bytes.is_none());
    if let Some(new_bytes) = new_bytes {
        generation.version.set(version);
        group.bytes_input.add(new_bytes);
    } else {
        trace!(version, "duplicate commit");
    }

    // Wait until the queue committer has fsynced through this version.
    tokio::select! {
        biased;
        _ = generation.queue_committed_version.wait_for(version) => {}
        _ = generation.stopped.wait() => {
            if generation.queue_committed_version.get() < version {
                return Err(TLogError::TLogStopped);
            }
        }
    }

    let state = generation.state.lock();
    Ok(CommitReply {
        durable_known_committed_version: state.durable_known_committed_version,
    })
}

/// Back-pressure: while the group is over its memory hard limit, yield to
/// the spiller rather than buffering more.
async fn wait_for_memory(group: &Arc<Group>, generation: &Arc<Generation>) {
    loop {
        // Subscribe before checking, so spill progress between the check
        // and the wait is never missed.
        let mut durable = group.bytes_durable.subscribe();
        if group.volatile_bytes() < group.settings.buffer_hard_limit_bytes || generation.stopped.is_set() {
            return;
        }
        debug!(
            group = %group.id,
            volatile = group.volatile_bytes(),
            "commit waiting for spill progress"
        );
        tokio::select! {
            _ = durable.changed() => {}
            _ = generation.stopped.wait() => {}
        }
    }
}

/// The critical region: dedup check, team deltas, buffer insert, queue
/// push, index update. Holds the generation lock throughout and never
/// yields.
///
/// Returns the accounted bytes added, or `None` for a duplicate.
fn apply(group: &Arc<Group>, generation: &Arc<Generation>, req: CommitRequest) -> Result<Option<u64>> {
    let mut state = generation.state.lock();

    let current = generation.version.get();
    if current >= req.version {
        // A retry of a commit we already have.
        return Ok(None);
    }
    debug_assert_eq!(current, req.prev_version, "commit requests are serialized by version");

    // Team deltas apply before this batch's messages, so an added team
    // receives them.
    for (team, tags) in &req.added_teams {
        state.team_tags.insert(*team, tags.clone());
        state.get_or_create_team(*team);
    }
    let mut freed = 0u64;
    for team in &req.removed_teams {
        state.team_tags.remove(team);
        if let Some(mut data) = state.teams.remove(team) {
            freed += data.erase_up_to(u64::MAX);
        }
    }

    let mut added = 0u64;
    let mut payload_bytes = 0u32;
    for (team, block) in &req.messages {
        if block.len() < TEAM_BLOCK_HEADER_LEN {
            return Err(TLogError::Storage(format!("malformed team block for team {team}")));
        }
        if block.len() > group.settings.max_message_bytes {
            return Err(TLogError::Storage(format!("team block for team {team} exceeds message limit")));
        }
        let payload = block.slice(TEAM_BLOCK_HEADER_LEN..);
        let data = state.get_or_create_team(*team);
        if data.popped >= req.version {
            // Consumers have already moved past this version.
            continue;
        }
        added += TeamData::buffered_bytes(&payload);
        payload_bytes += payload.len() as u32;
        data.messages.insert(req.version, payload);
    }

    state.known_committed_version = state.known_committed_version.max(req.known_committed_version);
    state.min_known_committed_version = state.min_known_committed_version.max(req.min_known_committed_version);

    // Log the batch to the durable queue, to be fsynced by the committer.
    let entry = CommitEntry {
        generation: generation.id,
        version: req.version,
        known_committed_version: state.known_committed_version,
        messages: req.messages,
    };
    let encoded = entry.encode();
    let (begin, end) = {
        let mut queue = group.queue.lock();
        let begin = queue.next_push_location();
        let end = queue.push(&encoded)?;
        (begin, end)
    };
    state.version_index.insert(
        req.version,
        IndexEntry {
            begin,
            end,
            payload_bytes,
        },
    );

    drop(state);
    if freed > 0 {
        group.bytes_durable.add(freed);
    }

    Ok(Some(added))
}
