//! The peek service: range-of-version reads for storage servers and log
//! routers, merging the in-memory team buffers with the spill store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ledgerd_primitives::{StorageTeamId, Version};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, trace};

use crate::error::{Result, TLogError};
use crate::generation::Generation;
use crate::group::Group;
use crate::keys;
use crate::messages::{CommitEntry, PeekReply, PeekRequest};
use crate::mutation::{append_version_block, TEAM_BLOCK_HEADER_LEN};

/// Remembers, per consumer stream, where the previous peek ended, so the
/// next sequence number resumes exactly there even when requests race.
pub struct PeekTracker {
    expiration: Duration,
    inner: Mutex<HashMap<u64, TrackedPeek>>,
}

struct TrackedPeek {
    last_active: Instant,
    slots: HashMap<u32, Slot>,
}

enum Slot {
    /// The begin version for this sequence number is known.
    Ready(Version),
    /// Requests arrived out of order; they wait for the predecessor.
    Waiting(Vec<oneshot::Sender<Version>>),
}

impl PeekTracker {
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the begin version of `(peek_id, sequence)`, waiting for the
    /// predecessor request if necessary.
    async fn begin_for(&self, peek_id: u64, sequence: u32, first_begin: Version) -> Result<Version> {
        if sequence == 0 {
            self.touch(peek_id);
            return Ok(first_begin);
        }
        let rx = {
            let mut inner = self.inner.lock();
            let tracked = inner.entry(peek_id).or_insert_with(|| TrackedPeek {
                last_active: Instant::now(),
                slots: HashMap::new(),
            });
            tracked.last_active = Instant::now();
            match tracked.slots.get_mut(&sequence) {
                Some(Slot::Ready(version)) => return Ok(*version),
                Some(Slot::Waiting(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    tracked.slots.insert(sequence, Slot::Waiting(vec![tx]));
                    rx
                }
            }
        };
        match tokio::time::timeout(self.expiration, rx).await {
            Ok(Ok(version)) => Ok(version),
            _ => Err(TLogError::TimedOut),
        }
    }

    fn touch(&self, peek_id: u64) {
        let mut inner = self.inner.lock();
        inner
            .entry(peek_id)
            .or_insert_with(|| TrackedPeek {
                last_active: Instant::now(),
                slots: HashMap::new(),
            })
            .last_active = Instant::now();
    }

    /// Record where sequence `sequence` should begin.
    fn record(&self, peek_id: u64, sequence: u32, begin: Version) {
        let mut inner = self.inner.lock();
        let Some(tracked) = inner.get_mut(&peek_id) else {
            return;
        };
        tracked.last_active = Instant::now();
        if let Some(Slot::Waiting(waiters)) = tracked.slots.insert(sequence, Slot::Ready(begin)) {
            for waiter in waiters {
                let _ = waiter.send(begin);
            }
        }
    }

    /// Forget a stream whose request failed; successors restart with a
    /// fresh id rather than wait out the expiration.
    fn fail(&self, peek_id: u64) {
        self.inner.lock().remove(&peek_id);
    }

    /// Drop trackers idle beyond the expiration, failing their waiters.
    pub fn expire_idle(&self) {
        let mut inner = self.inner.lock();
        let expiration = self.expiration;
        inner.retain(|_, tracked| tracked.last_active.elapsed() < expiration);
    }
}

/// Serve one peek against `group`.
pub async fn peek(
    group: &Arc<Group>,
    tracker: &PeekTracker,
    limiter: &Arc<Semaphore>,
    req: PeekRequest,
) -> Result<PeekReply> {
    let begin = match req.sequence {
        Some((peek_id, sequence)) => tracker.begin_for(peek_id, sequence, req.begin_version).await?,
        None => req.begin_version,
    };

    let result = peek_inner(group, limiter, &req, begin).await;
    if let Some((peek_id, sequence)) = req.sequence {
        match &result {
            Ok(reply) => tracker.record(peek_id, sequence + 1, reply.end_version),
            Err(_) => tracker.fail(peek_id),
        }
    }
    result
}

async fn peek_inner(group: &Arc<Group>, limiter: &Arc<Semaphore>, req: &PeekRequest, begin: Version) -> Result<PeekReply> {
    let Some(generation) = group.find_peek_generation(begin) else {
        return Err(TLogError::TLogStopped);
    };

    {
        let state = generation.state.lock();
        if !state.team_tags.contains_key(&req.team) && !state.teams.contains_key(&req.team) {
            return Err(TLogError::StorageTeamNotFound(req.team));
        }
    }

    // Data below the unrecovered marker exists only once recovery from the
    // previous log system has finished.
    let unrecovered_before = generation.state.lock().unrecovered_before;
    if begin < unrecovered_before && !generation.recovery_complete.is_set() {
        if req.return_if_blocked {
            return Err(TLogError::EndOfStream);
        }
        tokio::select! {
            _ = generation.recovery_complete.wait() => {}
            _ = generation.stopped.wait() => return Err(TLogError::EndOfStream),
        }
    }

    if generation.version.get() < begin {
        if req.return_if_blocked {
            return Err(TLogError::EndOfStream);
        }
        tokio::select! {
            biased;
            _ = generation.version.wait_for(begin) => {}
            _ = generation.stopped.wait() => {
                if generation.version.get() < begin {
                    return Err(TLogError::EndOfStream);
                }
            }
        }
    }

    let max_known_version = generation.version.get();
    let end_limit = req.end_version.unwrap_or(Version::MAX).min(max_known_version + 1);

    let (popped, by_value, nothing_persistent, pdv, min_kcv) = {
        let mut state = generation.state.lock();
        let (popped, by_value, nothing_persistent) = {
            let data = state.get_or_create_team(req.team);
            (data.popped, generation.spills_by_value(data), data.nothing_persistent)
        };
        (
            popped,
            by_value,
            nothing_persistent,
            state.persistent_data_version,
            state.min_known_committed_version,
        )
    };

    if popped > begin {
        trace!(team = %req.team, begin, popped, "peek below popped watermark");
        group.counters.record_peek(false);
        return Ok(PeekReply {
            begin_version: popped,
            end_version: popped,
            data: Bytes::new(),
            popped: Some(popped),
            max_known_version,
            min_known_committed_version: min_kcv,
            only_spilled: false,
        });
    }

    let budget = group.settings.peek_reply_bytes;
    let mut out: Vec<u8> = Vec::new();
    let mut first_version: Option<Version> = None;
    let mut last_version: Option<Version> = None;
    let mut budget_exhausted = false;
    let mut only_spilled = false;
    let mut permit = None;

    // Assemble spilled data first, then memory. The spiller may advance
    // the spilled frontier while the store reads are in flight, evicting
    // rows we have not covered; the frontier is therefore re-checked
    // atomically with the memory read, and the spilled read repeated for
    // any versions that moved out from under us.
    let mut spill_cursor = begin;
    let mut spill_upper = pdv;
    // A team that has never spilled needs no store reads at all.
    let mut may_have_spill = !nothing_persistent;
    loop {
        if may_have_spill && spill_cursor <= spill_upper && spill_cursor < end_limit {
            if permit.is_none() {
                let reserve = budget.min(group.settings.peek_memory_bytes) as u32;
                permit = Some(
                    limiter
                        .acquire_many(reserve)
                        .await
                        .expect("peek limiter is never closed"),
                );
            }
            let spill_end = spill_upper.min(end_limit - 1);
            budget_exhausted = if by_value {
                read_value_spilled(
                    group,
                    &generation,
                    req.team,
                    spill_cursor,
                    spill_end,
                    budget,
                    &mut out,
                    &mut first_version,
                    &mut last_version,
                )
                .await?
            } else {
                read_reference_spilled(
                    group,
                    &generation,
                    req.team,
                    spill_cursor,
                    spill_end,
                    budget,
                    &mut out,
                    &mut first_version,
                    &mut last_version,
                )
                .await?
            };
            if budget_exhausted {
                only_spilled = true;
                break;
            }
            spill_cursor = spill_end + 1;
        }

        let state = generation.state.lock();
        let current_pdv = state.persistent_data_version;
        let still_nothing = state
            .teams
            .get(&req.team)
            .map(|data| data.nothing_persistent)
            .unwrap_or(true);
        if !still_nothing && current_pdv > spill_upper && spill_cursor <= current_pdv && spill_cursor < end_limit {
            may_have_spill = true;
            spill_upper = current_pdv;
            drop(state);
            continue;
        }
        if let Some(data) = state.teams.get(&req.team) {
            for (&version, block) in data.messages.range(spill_cursor.max(begin)..end_limit) {
                if out.len() >= budget {
                    budget_exhausted = true;
                    break;
                }
                append_version_block(&mut out, version, block);
                first_version.get_or_insert(version);
                last_version = Some(version);
            }
        }
        break;
    }
    let touched_store = permit.is_some();
    drop(permit);

    let end_version = if budget_exhausted {
        last_version.expect("budget exhaustion implies data") + 1
    } else {
        end_limit
    };

    group.counters.record_peek(touched_store);
    debug!(
        team = %req.team,
        begin,
        end = end_version,
        bytes = out.len(),
        only_spilled,
        "peek served"
    );

    Ok(PeekReply {
        begin_version: first_version.unwrap_or(begin),
        end_version,
        data: Bytes::from(out),
        popped: None,
        max_known_version,
        min_known_committed_version: min_kcv,
        only_spilled,
    })
}

/// Read value-spilled rows of `[begin, end]` from the store.
///
/// Returns `true` if the reply budget was reached with spilled data still
/// remaining.
#[allow(clippy::too_many_arguments)]
async fn read_value_spilled(
    group: &Arc<Group>,
    generation: &Arc<Generation>,
    team: StorageTeamId,
    begin: Version,
    end: Version,
    budget: usize,
    out: &mut Vec<u8>,
    first_version: &mut Option<Version>,
    last_version: &mut Option<Version>,
) -> Result<bool> {
    if end < begin {
        return Ok(false);
    }
    let begin_key = keys::tag_msg_key(generation.id, team, begin);
    let end_key = keys::tag_msg_key(generation.id, team, end.saturating_add(1));
    let store = group.store.clone();
    let rows = tokio::task::spawn_blocking(move || {
        store.lock().read_range(&begin_key, &end_key, usize::MAX, budget.max(1))
    })
    .await
    .map_err(|join| TLogError::Storage(join.to_string()))??;

    for row in rows {
        let version = keys::version_from_spill_key(&row.key)?;
        append_version_block(out, version, &row.value);
        first_version.get_or_insert(version);
        *last_version = Some(version);
        if out.len() >= budget {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Read reference-spilled rows of `[begin, end]`: the store yields queue
/// locations, the queue yields the commit entries, and the team's block is
/// extracted from each.
#[allow(clippy::too_many_arguments)]
async fn read_reference_spilled(
    group: &Arc<Group>,
    generation: &Arc<Generation>,
    team: StorageTeamId,
    begin: Version,
    end: Version,
    budget: usize,
    out: &mut Vec<u8>,
    first_version: &mut Option<Version>,
    last_version: &mut Option<Version>,
) -> Result<bool> {
    if end < begin {
        return Ok(false);
    }
    // Batches are keyed by their last version, so the first relevant row
    // is the first key at or after `begin`.
    let begin_key = keys::tag_msg_ref_key(generation.id, team, begin);
    let end_key = keys::tag_msg_ref_key(generation.id, team, Version::MAX);
    let store = group.store.clone();
    let rows = tokio::task::spawn_blocking(move || {
        store.lock().read_range(&begin_key, &end_key, usize::MAX, usize::MAX)
    })
    .await
    .map_err(|join| TLogError::Storage(join.to_string()))??;

    // Budget the queue reads before issuing them.
    let mut wanted = Vec::new();
    let mut want_bytes = 0usize;
    let mut capped = false;
    'rows: for row in rows {
        for entry in keys::decode_spilled_batch(&row.value)? {
            if entry.version < begin {
                continue;
            }
            if entry.version > end {
                break 'rows;
            }
            if want_bytes >= budget {
                capped = true;
                break 'rows;
            }
            want_bytes += entry.mutation_bytes as usize;
            wanted.push(entry);
        }
    }
    if wanted.is_empty() {
        return Ok(false);
    }

    let queue = group.queue.clone();
    let payloads: Vec<(keys::SpilledData, Bytes)> = tokio::task::spawn_blocking(move || {
        let queue = queue.lock();
        wanted
            .into_iter()
            .map(|entry| queue.read(entry.begin, entry.length).map(|payload| (entry, payload)))
            .collect::<std::io::Result<Vec<_>>>()
    })
    .await
    .map_err(|join| TLogError::Storage(join.to_string()))??;

    for (entry, payload) in payloads {
        let commit_entry = CommitEntry::decode(&payload)?;
        debug_assert_eq!(commit_entry.version, entry.version);
        let Some((_, block)) = commit_entry.messages.iter().find(|(t, _)| *t == team) else {
            return Err(TLogError::IntegrityFailure(format!(
                "spilled reference for team {team} at version {} points at an entry without that team",
                entry.version
            )));
        };
        let stripped = block.slice(TEAM_BLOCK_HEADER_LEN..);
        append_version_block(out, entry.version, &stripped);
        first_version.get_or_insert(entry.version);
        *last_version = Some(entry.version);
    }

    Ok(capped || out.len() >= budget)
}
