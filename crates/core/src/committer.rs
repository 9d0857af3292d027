//! The queue committer: one background loop per group that fsyncs the
//! durable queue and publishes the durable version.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::generation::Generation;
use crate::group::Group;

/// Drive queue commits for `group` until the process shuts down.
///
/// At most one generation per group accepts commits at a time; the loop
/// serves that generation until it is stopped and fully flushed, then
/// waits for the next one.
pub async fn run_queue_committer(group: Arc<Group>) {
    let mut consecutive_failures = 0u32;
    loop {
        let Some(generation) = group.newest_generation().filter(|g| !fully_flushed(g)) else {
            let epoch = group.generation_epoch.get();
            group.generation_epoch.wait_for(epoch + 1).await;
            continue;
        };

        serve_generation(&group, &generation, &mut consecutive_failures).await;
        if group.degraded.is_set() {
            error!(group = %group.id, "queue committer exiting; process is degraded");
            return;
        }

        // The generation is stopped and flushed; wait for a successor.
        let epoch = group.generation_epoch.get();
        group.generation_epoch.wait_for(epoch + 1).await;
    }
}

fn fully_flushed(generation: &Arc<Generation>) -> bool {
    generation.stopped.is_set() && generation.queue_committed_version.get() >= generation.version.get()
}

async fn serve_generation(group: &Arc<Group>, generation: &Arc<Generation>, consecutive_failures: &mut u32) {
    loop {
        let version = generation.version.get();
        let committed = generation.queue_committed_version.get();

        if version > committed {
            let (snapshot, known_committed) = {
                let mut state = generation.state.lock();
                state.queue_committing_version = version;
                (version, state.known_committed_version)
            };

            let started = Instant::now();
            let queue = group.queue.clone();
            let result = tokio::task::spawn_blocking(move || queue.lock().commit()).await;
            let elapsed = started.elapsed();
            if elapsed >= group.settings.queue_commit_warn {
                warn!(group = %group.id, ?elapsed, "slow queue commit");
            }

            match result {
                Ok(Ok(())) => {
                    *consecutive_failures = 0;
                    {
                        let mut state = generation.state.lock();
                        state.durable_known_committed_version = known_committed;
                    }
                    generation.queue_committed_version.advance_to(snapshot);
                    group.counters.record_queue_commit();
                    debug!(group = %group.id, version = snapshot, "queue committed");
                }
                Ok(Err(e)) => {
                    *consecutive_failures += 1;
                    error!(group = %group.id, error = %e, failures = *consecutive_failures, "queue commit failed");
                    if *consecutive_failures >= group.settings.queue_commit_failure_limit {
                        group.degraded.set();
                        return;
                    }
                }
                Err(join) => {
                    error!(group = %group.id, error = %join, "queue commit task panicked");
                    group.degraded.set();
                    return;
                }
            }
            continue;
        }

        if generation.stopped.is_set() {
            // Final flush already published; no waiter is stranded.
            debug!(group = %group.id, generation = %generation.id, "queue committer done with stopped generation");
            return;
        }

        tokio::select! {
            _ = generation.version.wait_for(version + 1) => {}
            _ = generation.stopped.wait() => {}
        }
    }
}
