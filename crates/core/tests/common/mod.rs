//! Shared harness: a log server over in-memory devices, surviving
//! simulated crashes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ledgerd_core::messages::{CommitReply, CommitRequest, PeekReply, PeekRequest, RecruitGroup, RecruitmentRequest};
use ledgerd_core::mutation::{decode_messages, decode_version_blocks, encode_team_block, Message, Mutation};
use ledgerd_core::{GroupDevices, Result, Settings, SpillType, TLogServer};
use ledgerd_diskqueue::{mem::Memory, DiskQueue, DurableQueue, Options};
use ledgerd_primitives::{GenerationId, GroupId, StorageTeamId, Tag, Version};
use ledgerd_store::{MemoryStorage, PersistentStore};

pub const GROUP: GroupId = GroupId(1);
pub const TEAM: StorageTeamId = StorageTeamId(7);
pub const TAG: Tag = Tag::new(0, 1);

/// Small segments so pops actually release storage in tests.
const QUEUE_OPTIONS: Options = Options { max_segment_size: 1024 };

pub struct TestCluster {
    pub server: Arc<TLogServer>,
    pub stores: HashMap<GroupId, MemoryStorage>,
    pub queues: HashMap<GroupId, Memory>,
    pub generation: GenerationId,
}

/// Recruit a fresh single-group, single-team cluster.
pub async fn start_cluster(spill_type: SpillType) -> TestCluster {
    start_cluster_with_teams(spill_type, vec![(TEAM, vec![TAG])]).await
}

pub async fn start_cluster_with_teams(
    spill_type: SpillType,
    teams: Vec<(StorageTeamId, Vec<Tag>)>,
) -> TestCluster {
    let server = TLogServer::new(Settings::small_for_tests());
    let mut cluster = TestCluster {
        server,
        stores: HashMap::new(),
        queues: HashMap::new(),
        generation: GenerationId(1),
    };
    cluster
        .recruit(RecruitmentRequest {
            recruitment_id: 1,
            epoch: 1,
            generation: GenerationId(1),
            locality: 0,
            spill_type,
            groups: vec![RecruitGroup { group: GROUP, teams }],
            recover_from: None,
        })
        .await
        .unwrap();
    cluster
}

impl TestCluster {
    pub async fn recruit(&mut self, req: RecruitmentRequest) -> Result<()> {
        self.generation = req.generation;
        let stores = &mut self.stores;
        let queues = &mut self.queues;
        let mut make_devices = |group: GroupId| {
            let storage = stores.entry(group).or_insert_with(MemoryStorage::new).clone();
            let queue_storage = queues.entry(group).or_insert_with(Memory::new).clone();
            devices_for(&storage, &queue_storage)
        };
        let server = self.server.clone();
        server.recruit(req, &mut make_devices).await
    }

    /// Simulate a crash: drop the server (losing all volatile state) and
    /// recover a fresh one from the surviving device contents.
    pub async fn restart(self) -> TestCluster {
        let TestCluster {
            server,
            stores,
            queues,
            generation,
        } = self;
        drop(server);

        let server = TLogServer::new(Settings::small_for_tests());
        let mut devices = Vec::new();
        for (group, storage) in &stores {
            let queue_storage = queues.get(group).expect("paired devices");
            let (store, queue) = devices_for(storage, queue_storage);
            devices.push(GroupDevices {
                group: *group,
                store,
                queue,
            });
        }
        server.recover(devices).await.unwrap();

        TestCluster {
            server,
            stores,
            queues,
            generation,
        }
    }

    /// Commit `messages` for [`TEAM`] at `version`.
    pub async fn commit_team(&self, prev: Version, version: Version, messages: &[Message]) -> Result<CommitReply> {
        self.server.commit(team_commit(prev, version, messages)).await
    }

    pub async fn peek_team(&self, begin: Version) -> Result<PeekReply> {
        self.server.peek(PeekRequest::new(GROUP, TEAM, begin)).await
    }
}

fn devices_for(storage: &MemoryStorage, queue_storage: &Memory) -> (Box<dyn PersistentStore>, Box<dyn DurableQueue>) {
    (
        Box::new(storage.open()),
        Box::new(DiskQueue::open(queue_storage.clone(), QUEUE_OPTIONS).unwrap()),
    )
}

/// `count` SET mutations with subsequences `1..=count`.
pub fn set_messages(version: Version, count: u32) -> Vec<Message> {
    (1..=count)
        .map(|subsequence| Message {
            subsequence,
            mutation: {
                let mut m = Mutation::set(
                    format!("key/{version}/{subsequence}"),
                    format!("value/{version}/{subsequence}"),
                );
                m.populate_checksum();
                m
            },
        })
        .collect()
}

pub fn team_commit(prev: Version, version: Version, messages: &[Message]) -> CommitRequest {
    let mut req = CommitRequest::new(GROUP, prev, version);
    req.messages = vec![(TEAM, encode_team_block(messages))];
    req
}

pub fn commit_with_blocks(prev: Version, version: Version, blocks: Vec<(StorageTeamId, Bytes)>) -> CommitRequest {
    let mut req = CommitRequest::new(GROUP, prev, version);
    req.messages = blocks;
    req
}

/// Decode a peek reply into `(version, messages)` pairs.
pub fn reply_messages(reply: &PeekReply) -> Vec<(Version, Vec<Message>)> {
    decode_version_blocks(&reply.data)
        .unwrap()
        .into_iter()
        .map(|(version, block)| (version, decode_messages(&block).unwrap()))
        .collect()
}

/// Poll until `condition` holds or a generous timeout elapses.
pub async fn eventually(condition: impl Fn() -> bool, what: &str) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for: {what}");
}
