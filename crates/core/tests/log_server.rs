//! End-to-end protocol tests: commit, peek, pop, lock, sequences.

mod common;

use std::time::Duration;

use common::*;
use ledgerd_core::messages::{PeekRequest, PopRequest, RecruitGroup, RecruitmentRequest};
use ledgerd_core::mutation::encode_team_block;
use ledgerd_core::{SpillType, TLogError};
use ledgerd_primitives::{GenerationId, StorageTeamId, Tag};
use pretty_assertions::assert_eq;
use rand::seq::SliceRandom;

#[tokio::test]
async fn commit_then_peek_single_team() {
    let cluster = start_cluster(SpillType::Value).await;

    let sent = set_messages(150, 16);
    let reply = cluster.commit_team(0, 150, &sent).await.unwrap();
    assert_eq!(reply.durable_known_committed_version, 0);

    let peek = cluster.peek_team(150).await.unwrap();
    let got = reply_messages(&peek);
    assert_eq!(got.len(), 1);
    let (version, messages) = &got[0];
    assert_eq!(*version, 150);
    assert_eq!(messages, &sent);
    let subsequences: Vec<u32> = messages.iter().map(|m| m.subsequence).collect();
    assert_eq!(subsequences, (1..=16).collect::<Vec<_>>());
    assert_eq!(peek.begin_version, 150);
    assert_eq!(peek.end_version, 151);

    let stats = cluster.server.group(GROUP).unwrap().counters.snapshot();
    assert_eq!(stats.commits_accepted, 1);
    assert!(stats.queue_commits >= 1);
    assert_eq!(stats.peeks_served, 1);
    assert_eq!(stats.peeks_from_store, 0);
}

#[tokio::test]
async fn shuffled_commits_surface_in_version_order() {
    let cluster = start_cluster(SpillType::Value).await;

    // Ten versions with random gaps, dispatched in random order; the
    // prev-version chain forces serialization inside the server.
    let mut versions = Vec::new();
    let mut version = 0u64;
    for _ in 0..10 {
        let prev = version;
        version += 5 + (rand::random::<u64>() % 11);
        versions.push((prev, version));
    }
    let expected: Vec<u64> = versions.iter().map(|(_, v)| *v).collect();

    let mut shuffled = versions.clone();
    shuffled.shuffle(&mut rand::rng());
    let mut handles = Vec::new();
    for (prev, ver) in shuffled {
        let server = cluster.server.clone();
        let messages = set_messages(ver, 2);
        handles.push(tokio::spawn(async move {
            server.commit(team_commit(prev, ver, &messages)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Poll peeks from version 0 until the whole history has been seen.
    let mut seen = Vec::new();
    let mut cursor = 0;
    while seen.len() < expected.len() {
        let mut req = PeekRequest::new(GROUP, TEAM, cursor);
        req.return_if_blocked = true;
        match cluster.server.peek(req).await {
            Ok(reply) => {
                for (version, _) in reply_messages(&reply) {
                    seen.push(version);
                }
                cursor = reply.end_version;
            }
            Err(TLogError::EndOfStream) => tokio::time::sleep(Duration::from_millis(2)).await,
            Err(e) => panic!("unexpected peek error: {e}"),
        }
    }
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn duplicate_commit_is_idempotent() {
    let cluster = start_cluster(SpillType::Value).await;

    let messages = set_messages(10, 4);
    cluster.commit_team(0, 10, &messages).await.unwrap();
    // Retry with identical (prev, version, payload).
    cluster.commit_team(0, 10, &messages).await.unwrap();

    let peek = cluster.peek_team(1).await.unwrap();
    let got = reply_messages(&peek);
    assert_eq!(got.len(), 1, "duplicate must not create a second copy");
    assert_eq!(got[0].1, messages);
}

#[tokio::test]
async fn commit_with_future_prev_version_blocks_until_filled() {
    let cluster = start_cluster(SpillType::Value).await;

    let late = {
        let server = cluster.server.clone();
        let messages = set_messages(20, 1);
        tokio::spawn(async move { server.commit(team_commit(10, 20, &messages)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!late.is_finished(), "commit with future prev_version must wait");

    cluster.commit_team(0, 10, &set_messages(10, 1)).await.unwrap();
    late.await.unwrap().unwrap();

    let versions: Vec<u64> = reply_messages(&cluster.peek_team(1).await.unwrap())
        .into_iter()
        .map(|(v, _)| v)
        .collect();
    assert_eq!(versions, vec![10, 20]);
}

#[tokio::test]
async fn peek_below_popped_returns_watermark() {
    let cluster = start_cluster(SpillType::Value).await;

    let mut prev = 0;
    for version in (10..=100).step_by(10) {
        cluster.commit_team(prev, version, &set_messages(version, 2)).await.unwrap();
        prev = version;
    }

    cluster
        .server
        .pop(PopRequest {
            group: GROUP,
            team: TEAM,
            to_version: 80,
            durable_known_committed_version: 0,
        })
        .await
        .unwrap();

    let reply = cluster.peek_team(50).await.unwrap();
    assert_eq!(reply.popped, Some(80));
    assert_eq!(reply.begin_version, 80);
    assert_eq!(reply.end_version, 80);
    assert!(reply.data.is_empty());

    // Resuming at the watermark serves only later versions.
    let reply = cluster.peek_team(80).await.unwrap();
    let versions: Vec<u64> = reply_messages(&reply).into_iter().map(|(v, _)| v).collect();
    assert_eq!(versions, vec![90, 100]);
}

#[tokio::test]
async fn pop_beyond_version_is_accepted() {
    let cluster = start_cluster(SpillType::Value).await;
    cluster.commit_team(0, 10, &set_messages(10, 1)).await.unwrap();

    cluster
        .server
        .pop(PopRequest {
            group: GROUP,
            team: TEAM,
            to_version: 1000,
            durable_known_committed_version: 0,
        })
        .await
        .unwrap();

    let reply = cluster.peek_team(10).await.unwrap();
    assert_eq!(reply.popped, Some(1000));
}

#[tokio::test]
async fn deferred_pops_apply_on_enable() {
    let cluster = start_cluster(SpillType::Value).await;
    let mut prev = 0;
    for version in [10, 20, 30] {
        cluster.commit_team(prev, version, &set_messages(version, 1)).await.unwrap();
        prev = version;
    }

    cluster.server.disable_pops();
    cluster
        .server
        .pop(PopRequest {
            group: GROUP,
            team: TEAM,
            to_version: 20,
            durable_known_committed_version: 0,
        })
        .await
        .unwrap();

    // The watermark must not have moved yet.
    let reply = cluster.peek_team(1).await.unwrap();
    assert_eq!(reply.popped, None);
    assert_eq!(reply_messages(&reply).len(), 3);

    cluster.server.enable_pops().await.unwrap();
    let reply = cluster.peek_team(1).await.unwrap();
    assert_eq!(reply.popped, Some(20));
}

#[tokio::test]
async fn lock_fails_waiting_peeks_and_rejects_commits() {
    let cluster = start_cluster(SpillType::Value).await;
    cluster.commit_team(0, 42, &set_messages(42, 1)).await.unwrap();

    // A peek waiting for a version beyond the current one.
    let waiting = {
        let server = cluster.server.clone();
        tokio::spawn(async move { server.peek(PeekRequest::new(GROUP, TEAM, 100)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiting.is_finished());

    let lock = cluster.server.lock().await.unwrap();
    assert_eq!(lock.groups.len(), 1);
    assert_eq!(lock.groups[0].end_version, 42);
    assert_eq!(lock.groups[0].teams, vec![(TEAM, vec![TAG])]);

    assert_eq!(waiting.await.unwrap().unwrap_err(), TLogError::EndOfStream);

    let err = cluster.commit_team(42, 50, &set_messages(50, 1)).await.unwrap_err();
    assert_eq!(err, TLogError::TLogStopped);

    // The locked generation still serves reads.
    let reply = cluster.peek_team(1).await.unwrap();
    assert_eq!(reply_messages(&reply).len(), 1);
}

#[tokio::test]
async fn recruitment_stops_the_prior_generation() {
    let mut cluster = start_cluster(SpillType::Value).await;
    cluster.commit_team(0, 10, &set_messages(10, 2)).await.unwrap();

    cluster
        .recruit(RecruitmentRequest {
            recruitment_id: 2,
            epoch: 2,
            generation: GenerationId(2),
            locality: 0,
            spill_type: SpillType::Value,
            groups: vec![RecruitGroup {
                group: GROUP,
                teams: vec![(TEAM, vec![TAG])],
            }],
            recover_from: None,
        })
        .await
        .unwrap();

    // The old generation is stopped at its last version.
    let group = cluster.server.group(GROUP).unwrap();
    let old = group.generation(GenerationId(1)).unwrap();
    assert!(old.stopped.is_set());
    assert_eq!(old.stop_version(), Some(10));

    // The new generation starts a fresh version chain and accepts commits.
    cluster.commit_team(0, 100, &set_messages(100, 1)).await.unwrap();
    assert_eq!(group.newest_generation().unwrap().id, GenerationId(2));

    // Old data is still peekable after the handoff.
    let reply = cluster.peek_team(1).await.unwrap();
    assert!(reply_messages(&reply).iter().any(|(v, _)| *v == 10));
}

#[tokio::test]
async fn peek_for_unknown_team_errors() {
    let cluster = start_cluster(SpillType::Value).await;
    cluster.commit_team(0, 5, &set_messages(5, 1)).await.unwrap();

    let err = cluster
        .server
        .peek(PeekRequest::new(GROUP, StorageTeamId(999), 1))
        .await
        .unwrap_err();
    assert_eq!(err, TLogError::StorageTeamNotFound(StorageTeamId(999)));
}

#[tokio::test]
async fn peek_return_if_blocked_reports_end_of_stream() {
    let cluster = start_cluster(SpillType::Value).await;

    let mut req = PeekRequest::new(GROUP, TEAM, 10);
    req.return_if_blocked = true;
    let err = cluster.server.peek(req).await.unwrap_err();
    assert_eq!(err, TLogError::EndOfStream);
}

#[tokio::test]
async fn added_team_receives_its_batch_and_removed_team_disappears() {
    let cluster = start_cluster(SpillType::Value).await;
    let new_team = StorageTeamId(8);
    let new_tag = Tag::new(0, 2);

    // The team delta and its first messages arrive in one request.
    let messages = set_messages(10, 3);
    let mut req = commit_with_blocks(0, 10, vec![(new_team, encode_team_block(&messages))]);
    req.added_teams = vec![(new_team, vec![new_tag])];
    cluster.server.commit(req).await.unwrap();

    let reply = cluster.server.peek(PeekRequest::new(GROUP, new_team, 1)).await.unwrap();
    assert_eq!(reply_messages(&reply), vec![(10, messages)]);

    let mut req = commit_with_blocks(10, 20, vec![]);
    req.removed_teams = vec![new_team];
    cluster.server.commit(req).await.unwrap();

    let err = cluster
        .server
        .peek(PeekRequest::new(GROUP, new_team, 1))
        .await
        .unwrap_err();
    assert_eq!(err, TLogError::StorageTeamNotFound(new_team));
}

#[tokio::test]
async fn sequence_tracked_peeks_resume_where_the_last_ended() {
    let cluster = start_cluster(SpillType::Value).await;
    let mut prev = 0;
    for version in [10, 20, 30, 40] {
        cluster.commit_team(prev, version, &set_messages(version, 1)).await.unwrap();
        prev = version;
    }

    let peek_id = 77;
    let mut req = PeekRequest::new(GROUP, TEAM, 1);
    req.end_version = Some(21);
    req.sequence = Some((peek_id, 0));
    let first = cluster.server.peek(req).await.unwrap();
    let first_versions: Vec<u64> = reply_messages(&first).into_iter().map(|(v, _)| v).collect();
    assert_eq!(first_versions, vec![10, 20]);

    // Sequence 1 ignores its own begin_version and resumes at the end of
    // sequence 0.
    let mut req = PeekRequest::new(GROUP, TEAM, 9999);
    req.sequence = Some((peek_id, 1));
    let second = cluster.server.peek(req).await.unwrap();
    let second_versions: Vec<u64> = reply_messages(&second).into_iter().map(|(v, _)| v).collect();
    assert_eq!(second_versions, vec![30, 40]);
}

#[tokio::test]
async fn out_of_order_sequence_waits_for_predecessor() {
    let cluster = start_cluster(SpillType::Value).await;
    let mut prev = 0;
    for version in [10, 20] {
        cluster.commit_team(prev, version, &set_messages(version, 1)).await.unwrap();
        prev = version;
    }

    let peek_id = 5;
    // Sequence 1 arrives first and must wait.
    let early = {
        let server = cluster.server.clone();
        tokio::spawn(async move {
            let mut req = PeekRequest::new(GROUP, TEAM, 0);
            req.sequence = Some((peek_id, 1));
            server.peek(req).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!early.is_finished());

    let mut req = PeekRequest::new(GROUP, TEAM, 1);
    req.end_version = Some(11);
    req.sequence = Some((peek_id, 0));
    cluster.server.peek(req).await.unwrap();

    let reply = early.await.unwrap().unwrap();
    let versions: Vec<u64> = reply_messages(&reply).into_iter().map(|(v, _)| v).collect();
    assert_eq!(versions, vec![20]);
}

#[tokio::test]
async fn expired_sequence_times_out() {
    let cluster = start_cluster(SpillType::Value).await;
    cluster.commit_team(0, 10, &set_messages(10, 1)).await.unwrap();

    // Sequence 3 without its predecessors can never be resolved; the
    // tracker expires it.
    let mut req = PeekRequest::new(GROUP, TEAM, 0);
    req.sequence = Some((123, 3));
    let err = cluster.server.peek(req).await.unwrap_err();
    assert_eq!(err, TLogError::TimedOut);
}
