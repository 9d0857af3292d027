//! Shared state of one log group across its generations.

use std::collections::VecDeque;
use std::sync::Arc;

use ledgerd_diskqueue::DurableQueue;
use ledgerd_primitives::{GenerationId, GroupId, Version};
use ledgerd_store::PersistentStore;
use parking_lot::Mutex;

use crate::counters::GroupCounters;
use crate::generation::Generation;
use crate::notify::{Flag, Notifier};
use crate::settings::Settings;

pub type SharedStore = Arc<Mutex<Box<dyn PersistentStore>>>;
pub type SharedQueue = Arc<Mutex<Box<dyn DurableQueue>>>;

/// Generation bookkeeping of a group.
///
/// `list` is ordered oldest-first; `spill_order` and `pop_order` list
/// generation ids oldest-first. The spiller always drains the front of
/// `spill_order`; the queue is popped on behalf of the front of
/// `pop_order`.
#[derive(Debug, Default)]
pub struct GroupGenerations {
    pub list: Vec<Arc<Generation>>,
    pub spill_order: VecDeque<GenerationId>,
    pub pop_order: VecDeque<GenerationId>,
}

/// One log group: its persistent devices, byte accounting, and the
/// generations multiplexed over them.
pub struct Group {
    pub id: GroupId,
    pub settings: Arc<Settings>,
    pub store: SharedStore,
    pub queue: SharedQueue,
    /// Message bytes accepted into team buffers, plus overhead.
    pub bytes_input: Notifier,
    /// Message bytes since evicted from team buffers (spilled or popped).
    pub bytes_durable: Notifier,
    pub generations: Mutex<GroupGenerations>,
    /// Serializes spill-store commit cycles.
    pub persistent_data_commit_lock: tokio::sync::Mutex<()>,
    /// Bumped whenever a generation is added; wakes the group loops.
    pub generation_epoch: Notifier,
    /// Shared process-degraded flag; set after repeated device failures.
    pub degraded: Arc<Flag>,
    pub counters: GroupCounters,
}

impl Group {
    pub fn new(
        id: GroupId,
        settings: Arc<Settings>,
        store: Box<dyn PersistentStore>,
        queue: Box<dyn DurableQueue>,
        degraded: Arc<Flag>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            settings,
            store: Arc::new(Mutex::new(store)),
            queue: Arc::new(Mutex::new(queue)),
            bytes_input: Notifier::new(0),
            bytes_durable: Notifier::new(0),
            generations: Mutex::new(GroupGenerations::default()),
            persistent_data_commit_lock: tokio::sync::Mutex::new(()),
            generation_epoch: Notifier::new(0),
            degraded,
            counters: GroupCounters::default(),
        })
    }

    /// Bytes currently buffered in memory across all generations.
    pub fn volatile_bytes(&self) -> u64 {
        self.bytes_input.get().saturating_sub(self.bytes_durable.get())
    }

    /// The newest generation, if it is accepting commits.
    pub fn current_generation(&self) -> Option<Arc<Generation>> {
        let generations = self.generations.lock();
        generations
            .list
            .last()
            .filter(|generation| !generation.stopped.is_set())
            .cloned()
    }

    /// The newest generation, stopped or not.
    pub fn newest_generation(&self) -> Option<Arc<Generation>> {
        self.generations.lock().list.last().cloned()
    }

    pub fn generation(&self, id: GenerationId) -> Option<Arc<Generation>> {
        let generations = self.generations.lock();
        generations.list.iter().find(|g| g.id == id).cloned()
    }

    /// All generations, oldest first.
    pub fn generations_snapshot(&self) -> Vec<Arc<Generation>> {
        self.generations.lock().list.clone()
    }

    /// Register a new generation as the current one.
    pub fn add_generation(&self, generation: Arc<Generation>) {
        {
            let mut generations = self.generations.lock();
            generations.spill_order.push_back(generation.id);
            generations.pop_order.push_back(generation.id);
            generations.list.push(generation);
        }
        self.generation_epoch.add(1);
    }

    /// Drop a retired generation from all bookkeeping.
    pub fn remove_generation(&self, id: GenerationId) {
        let mut generations = self.generations.lock();
        generations.list.retain(|g| g.id != id);
        generations.spill_order.retain(|g| *g != id);
        generations.pop_order.retain(|g| *g != id);
    }

    /// The generation a peek beginning at `begin` should be served from:
    /// the oldest one whose version range still covers `begin`, falling
    /// back to the newest.
    pub fn find_peek_generation(&self, begin: Version) -> Option<Arc<Generation>> {
        let list = self.generations_snapshot();
        for generation in &list {
            match generation.stop_version() {
                Some(stop) if begin > stop => continue,
                _ => return Some(generation.clone()),
            }
        }
        list.last().cloned()
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("bytes_input", &self.bytes_input.get())
            .field("bytes_durable", &self.bytes_durable.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use ledgerd_diskqueue::{mem::Memory, DiskQueue};
    use ledgerd_primitives::{StorageTeamId, Tag};
    use ledgerd_store::MemoryStorage;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::generation::SpillType;

    fn test_group() -> Arc<Group> {
        Group::new(
            GroupId(1),
            Arc::new(Settings::small_for_tests()),
            Box::new(MemoryStorage::new().open()),
            Box::new(DiskQueue::open(Memory::new(), Default::default()).unwrap()),
            Arc::new(Flag::new()),
        )
    }

    fn generation(id: u64) -> Arc<Generation> {
        Generation::new(
            GenerationId(id),
            GroupId(1),
            id,
            SpillType::Value,
            0,
            0,
            &[(StorageTeamId(1), vec![Tag::new(0, 1)])],
        )
    }

    #[test]
    fn current_generation_skips_stopped() {
        let group = test_group();
        assert!(group.current_generation().is_none());

        let old = generation(1);
        group.add_generation(old.clone());
        assert_eq!(group.current_generation().unwrap().id, old.id);

        old.stop();
        assert!(group.current_generation().is_none());

        let new = generation(2);
        group.add_generation(new.clone());
        assert_eq!(group.current_generation().unwrap().id, new.id);
    }

    #[test]
    fn peek_routing_prefers_the_oldest_covering_generation() {
        let group = test_group();
        let old = generation(1);
        old.version.set(100);
        old.stop();
        group.add_generation(old.clone());

        let new = generation(2);
        new.version.set(150);
        group.add_generation(new.clone());

        assert_eq!(group.find_peek_generation(50).unwrap().id, old.id);
        assert_eq!(group.find_peek_generation(100).unwrap().id, old.id);
        assert_eq!(group.find_peek_generation(101).unwrap().id, new.id);
    }
}
