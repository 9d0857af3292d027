//! The log server: hosts multiple groups and routes requests to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ledgerd_diskqueue::DurableQueue;
use ledgerd_primitives::{GroupId, StorageTeamId, Version};
use ledgerd_store::PersistentStore;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::commit;
use crate::committer;
use crate::error::{Result, TLogError};
use crate::generation::Generation;
use crate::group::Group;
use crate::lifecycle;
use crate::messages::{
    CommitReply, CommitRequest, LockReply, PeekReply, PeekRequest, PopRequest, RecruitmentRequest, RejoinRequest,
};
use crate::notify::{Flag, Notifier};
use crate::peek::{self, PeekTracker};
use crate::pop;
use crate::recovery::{self, GroupDevices};
use crate::settings::Settings;
use crate::spill;

static NEXT_INTERFACE_ID: AtomicU64 = AtomicU64::new(1);

/// One log-server process: the group multiplexer plus process-wide
/// services (peek tracking, the peek memory limiter, pop deferral, and
/// the degraded flag).
pub struct TLogServer {
    pub settings: Arc<Settings>,
    interface_id: u64,
    groups: Mutex<HashMap<GroupId, Arc<Group>>>,
    peek_tracker: PeekTracker,
    peek_limiter: Arc<Semaphore>,
    /// While `Some`, pops are recorded here instead of applied (backup
    /// snapshot window).
    deferred_pops: Mutex<Option<HashMap<(GroupId, StorageTeamId), Version>>>,
    /// Bumped whenever a group is installed; early peeks wait on this.
    groups_epoch: Notifier,
    degraded: Arc<Flag>,
    rejoin_acknowledged: Flag,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TLogServer {
    pub fn new(settings: Settings) -> Arc<Self> {
        let settings = Arc::new(settings);
        let server = Arc::new(Self {
            peek_tracker: PeekTracker::new(settings.peek_tracker_expiration),
            peek_limiter: Arc::new(Semaphore::new(settings.peek_memory_bytes)),
            settings,
            interface_id: NEXT_INTERFACE_ID.fetch_add(1, Ordering::Relaxed),
            groups: Mutex::new(HashMap::new()),
            deferred_pops: Mutex::new(None),
            groups_epoch: Notifier::new(0),
            degraded: Arc::new(Flag::new()),
            rejoin_acknowledged: Flag::new(),
            tasks: Mutex::new(Vec::new()),
        });

        // Expire idle peek trackers in the background. The task holds a
        // weak reference so dropping the server tears everything down.
        {
            let weak = Arc::downgrade(&server);
            let interval = server.settings.peek_tracker_expiration / 4;
            let task = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let Some(server) = weak.upgrade() else { return };
                    server.peek_tracker.expire_idle();
                }
            });
            server.tasks.lock().push(task);
        }

        server
    }

    pub fn interface_id(&self) -> u64 {
        self.interface_id
    }

    /// `true` once a persistent device has failed often enough that this
    /// process should be restarted.
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_set()
    }

    pub fn group(&self, id: GroupId) -> Result<Arc<Group>> {
        self.groups.lock().get(&id).cloned().ok_or(TLogError::GroupNotFound(id))
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.lock().keys().copied().collect()
    }

    fn install_group(self: &Arc<Self>, group: Arc<Group>) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(committer::run_queue_committer(group.clone())));
        tasks.push(tokio::spawn(spill::run_spiller(group.clone())));
        self.groups.lock().insert(group.id, group);
        self.groups_epoch.add(1);
    }

    /// Accept one commit batch.
    pub async fn commit(&self, req: CommitRequest) -> Result<CommitReply> {
        if self.degraded.is_set() {
            return Err(TLogError::TLogStopped);
        }
        let group = self.group(req.group)?;
        commit::commit(&group, req).await
    }

    /// Serve one peek.
    ///
    /// Peeks may arrive before recovery has installed any group; those
    /// wait for the first installation rather than failing.
    pub async fn peek(&self, req: PeekRequest) -> Result<PeekReply> {
        let group = loop {
            match self.group(req.group) {
                Ok(group) => break group,
                Err(e) => {
                    if !self.groups.lock().is_empty() {
                        return Err(e);
                    }
                    let epoch = self.groups_epoch.get();
                    self.groups_epoch.wait_for(epoch + 1).await;
                }
            }
        };
        peek::peek(&group, &self.peek_tracker, &self.peek_limiter, req).await
    }

    /// Advance a team's popped watermark.
    pub async fn pop(&self, req: PopRequest) -> Result<()> {
        {
            let mut deferred = self.deferred_pops.lock();
            if let Some(recorded) = deferred.as_mut() {
                let slot = recorded.entry((req.group, req.team)).or_insert(0);
                *slot = (*slot).max(req.to_version);
                return Ok(());
            }
        }
        let group = self.group(req.group)?;
        pop::pop(&group, req.team, req.to_version).await
    }

    /// Stop applying pops; record them instead (backup snapshot window).
    pub fn disable_pops(&self) {
        let mut deferred = self.deferred_pops.lock();
        if deferred.is_none() {
            *deferred = Some(HashMap::new());
            info!("pops deferred");
        }
    }

    /// Re-enable pops, applying everything recorded while disabled.
    pub async fn enable_pops(&self) -> Result<()> {
        let recorded = self.deferred_pops.lock().take();
        let Some(recorded) = recorded else { return Ok(()) };
        info!(count = recorded.len(), "applying deferred pops");
        for ((group_id, team), to_version) in recorded {
            match self.group(group_id) {
                Ok(group) => pop::pop(&group, team, to_version).await?,
                Err(_) => warn!(group = %group_id, "deferred pop for a group that no longer exists"),
            }
        }
        Ok(())
    }

    /// Lock every group on this process: stop current generations, wait
    /// for their queues to drain, and report the stop points.
    pub async fn lock(&self) -> Result<LockReply> {
        let groups: Vec<Arc<Group>> = self.groups.lock().values().cloned().collect();
        let mut reply = LockReply { groups: Vec::new() };
        for group in groups {
            if let Some(state) = lifecycle::lock_group(&group).await? {
                reply.groups.push(state);
            }
        }
        Ok(reply)
    }

    /// Create the generation described by `req` across its groups,
    /// stopping all prior generations on this process first.
    ///
    /// `make_devices` supplies the persistent devices for groups this
    /// process does not already host.
    pub async fn recruit(
        self: &Arc<Self>,
        req: RecruitmentRequest,
        make_devices: &mut dyn FnMut(GroupId) -> (Box<dyn PersistentStore>, Box<dyn DurableQueue>),
    ) -> Result<()> {
        if self.degraded.is_set() {
            return Err(TLogError::RecruitmentFailed("process is degraded".into()));
        }

        // A recruitment supersedes everything currently accepting commits.
        let existing: Vec<Arc<Group>> = self.groups.lock().values().cloned().collect();
        for group in &existing {
            if let Some(generation) = group.current_generation() {
                lifecycle::stop_generation(group, &generation).await?;
            }
        }

        for recruit in &req.groups {
            let group = match self.group(recruit.group) {
                Ok(group) => group,
                Err(_) => {
                    let (store, queue) = make_devices(recruit.group);
                    let group = Group::new(
                        recruit.group,
                        self.settings.clone(),
                        store,
                        queue,
                        self.degraded.clone(),
                    );
                    self.install_group(group.clone());
                    group
                }
            };

            let generation = Generation::new(
                req.generation,
                recruit.group,
                req.epoch,
                req.spill_type,
                req.locality,
                0,
                &recruit.teams,
            );
            lifecycle::apply_recover_from(&generation, req.recover_from);
            lifecycle::init_persistent_state(&group, &generation).await?;
            group.add_generation(generation);
            info!(
                group = %recruit.group,
                generation = %req.generation,
                epoch = req.epoch,
                "generation recruited"
            );
        }

        Ok(())
    }

    /// Recover groups from their persistent devices after a restart.
    pub async fn recover(self: &Arc<Self>, devices: Vec<GroupDevices>) -> Result<()> {
        for device_set in devices {
            let group = recovery::restore_group(self.settings.clone(), self.degraded.clone(), device_set).await?;
            self.install_group(group);
        }
        Ok(())
    }

    /// The announcement this process repeats to the recovery controller
    /// until [`Self::acknowledge_rejoin`].
    pub fn rejoin_request(&self) -> Option<RejoinRequest> {
        (!self.rejoin_acknowledged.is_set()).then_some(RejoinRequest {
            interface_id: self.interface_id,
        })
    }

    pub fn acknowledge_rejoin(&self) {
        self.rejoin_acknowledged.set();
    }
}

impl Drop for TLogServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
