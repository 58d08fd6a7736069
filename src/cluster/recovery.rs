//! Ending an epoch: lock the prior generation's replicas, compute a safe
//! recovery version under the replication policy, and publish a frozen log
//! system for the new epoch to recruit on top of.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::cell::{Notifier, ObservableCell, Shutdown, TaskSet};
use crate::cluster::failure::FailureObserver;
use crate::cluster::interface::{
    DebugId, LockReply, RejoinReply, RejoinRequest, ReplicaError, ReplicaId, ServerCell,
};
use crate::cluster::log_set::LogSet;
use crate::cluster::log_system::{LogSystem, LogSystemParts, OldGeneration};
use crate::cluster::snapshot::CoreState;
use crate::config::Config;
use crate::core::{all_combinations_invalid, LocalityData, LocalityGroup, TagLocality, Version};
use crate::error::FaultDomain;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    /// A log server of the current epoch is gone; the epoch must end.
    #[error("log server failed")]
    LogServerFailed,

    /// Recruiting or initializing the new epoch failed.
    #[error("recovery failed")]
    RecoveryFailed,

    #[error("recovery cancelled")]
    Cancelled,

    #[error("internal recovery invariant violated: {0}")]
    Internal(String),
}

impl RecoveryError {
    pub fn fault_domain(&self) -> FaultDomain {
        match self {
            // A failed recruitment ends this attempt; the surrounding system
            // runs a fresh recovery.
            RecoveryError::LogServerFailed
            | RecoveryError::RecoveryFailed
            | RecoveryError::Internal(_) => FaultDomain::Epoch,
            RecoveryError::Cancelled => FaultDomain::Cancelled,
        }
    }
}

/// One replica's lock reply slot, filled by its background lock task.
pub type LockSlot = Arc<Mutex<Option<Result<LockReply, ReplicaError>>>>;

/// Lock state for one set: the replies gathered so far plus the epoch-end
/// bound the set is known to carry (`MAX` while current).
#[derive(Clone)]
pub struct LogLockInfo {
    pub epoch_end: Version,
    pub is_current: bool,
    pub set: Arc<LogSet>,
    pub replies: Vec<LockSlot>,
}

impl LogLockInfo {
    fn for_set(set: Arc<LogSet>, epoch_end: Version, is_current: bool) -> Self {
        let replies = set
            .servers
            .iter()
            .map(|_| Arc::new(Mutex::new(None)))
            .collect();
        Self {
            epoch_end,
            is_current,
            set,
            replies,
        }
    }
}

fn spawn_lock_task(
    tasks: &TaskSet,
    cell: ServerCell,
    slot: LockSlot,
    progress: Sender<()>,
    config: Config,
) {
    let shutdown = tasks.shutdown().clone();
    tasks.spawn("lock-replica", move || {
        while !shutdown.is_triggered() {
            let seen = cell.generation();
            let endpoint = cell.get();
            match endpoint.client {
                Some(client) => match client.lock() {
                    Ok(reply) => {
                        info!(replica = %endpoint.id, end = %reply.end, "log server locked");
                        *slot.lock().expect("lock slot poisoned") = Some(Ok(reply));
                        let _ = progress.send(());
                        return;
                    }
                    Err(ReplicaError::Cancelled) => return,
                    Err(err) => {
                        debug!(replica = %endpoint.id, %err, "lock attempt failed; retrying");
                        cell.wait_change(seen, config.replica_timeout());
                    }
                },
                None => {
                    cell.wait_change(seen, config.replica_timeout());
                }
            }
        }
    });
}

/// Compute the recovery tuple `(known_committed, end)` for one locked set,
/// or `None` while the replies gathered so far cannot support a safe
/// proposal.
///
/// With N replicas, anti-quorum W and replication factor R, consistency
/// requires that the servers outside the write quorum plus the servers
/// outside the read quorum stay strictly below R; the read quorum floor is
/// therefore `N + 1 - R + W`. A prior proposal `last_end` gates acceptance:
/// recovery may only move downward as more is learned.
pub fn get_durable_version(
    dbgid: DebugId,
    lock_info: &LogLockInfo,
    failed: Option<&[Arc<AtomicBool>]>,
    last_end: Option<Version>,
    config: &Config,
) -> Option<(Version, Version)> {
    let set = &lock_info.set;
    let n = set.server_count();
    if n == 0 {
        return None;
    }
    let required = n + 1 - set.replication_factor + set.write_anti_quorum;
    debug_assert!(required >= 1 && required <= n);

    let mut results: Vec<LockReply> = Vec::new();
    let mut available: Vec<LocalityData> = Vec::new();
    let mut unresponsive = LocalityGroup::new();
    for t in 0..n {
        let ready = lock_info.replies[t]
            .lock()
            .expect("lock slot poisoned")
            .clone();
        let marked_failed = failed
            .and_then(|flags| flags.get(t))
            .is_some_and(|flag| flag.load(Ordering::SeqCst));
        match ready {
            Some(Ok(reply)) if !marked_failed => {
                results.push(reply);
                available.push(set.localities[t].clone());
            }
            _ => unresponsive.add(set.localities[t].clone()),
        }
    }

    // Too few replies to clear the anti-quorum.
    let mut too_many_failures = results.len() <= set.write_anti_quorum;

    // The failed servers alone could satisfy the policy: a commit may be
    // durable only on them.
    too_many_failures = too_many_failures
        || (unresponsive.len() >= set.replication_factor && unresponsive.validate(&set.policy));

    // With an anti-quorum, W of the responders may hold unacknowledged
    // writes; if any such combination plus the failed servers validates the
    // policy, the proposal is unsafe.
    if !too_many_failures
        && set.write_anti_quorum > 0
        && !all_combinations_invalid(
            &unresponsive,
            &set.policy,
            &available,
            set.write_anti_quorum,
        )
    {
        debug!(dbgid = ?dbgid, required, present = results.len(), "anti-quorum combination validates");
        too_many_failures = true;
    }

    if too_many_failures {
        debug!(dbgid = ?dbgid, required, present = results.len(), "durable version waiting on more replies");
        return None;
    }

    results.sort_by_key(|reply| reply.end);
    let absent = n - results.len();
    let new_safe_begin = std::cmp::min(set.write_anti_quorum, results.len() - 1);
    let safe_range_end = set.replication_factor as i64 - absent as i64;

    let accept = match last_end {
        None => true,
        Some(last) => {
            safe_range_end > 0
                && (safe_range_end as usize) <= results.len()
                && results[safe_range_end as usize - 1].end < last
        }
    };
    if !accept {
        debug!(dbgid = ?dbgid, required, present = results.len(), "proposal would not move downward");
        return None;
    }

    let proposal = results[new_safe_begin].end;
    let mut known_committed =
        proposal.saturating_sub(config.max_read_transaction_life_versions);
    for reply in &results {
        known_committed = std::cmp::max(known_committed, reply.known_committed);
    }
    info!(
        dbgid = ?dbgid,
        required,
        present = results.len(),
        end = %proposal,
        known_committed = %known_committed,
        "durable version proposal"
    );
    Some((known_committed, proposal))
}

/// Listen for rejoin requests from the replicas being recovered, refreshing
/// their handles so subsequent requests route to the new endpoints.
fn track_rejoins(
    dbgid: DebugId,
    servers: Vec<ServerCell>,
    rejoins: Receiver<RejoinRequest>,
    notifier: Arc<Notifier>,
    progress: Sender<()>,
    shutdown: Shutdown,
) {
    let mut last_reply: BTreeMap<ReplicaId, Sender<RejoinReply>> = BTreeMap::new();
    loop {
        if shutdown.is_triggered() {
            break;
        }
        let req = match rejoins.recv_timeout(Duration::from_millis(200)) {
            Ok(req) => req,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        };

        let id = req.endpoint.id;
        let cell = servers.iter().find(|cell| cell.get().id == id);
        match cell {
            Some(cell) => {
                info!(dbgid = ?dbgid, replica = %id, address = ?req.endpoint.address, "log server rejoined");
                let current = cell.get();
                if !current.is_present() || current.address != req.endpoint.address {
                    cell.set(req.endpoint.clone());
                    notifier.trigger();
                    let _ = progress.send(());
                }
                if let Some(prev) = last_reply.insert(id, req.reply) {
                    let _ = prev.send(RejoinReply::Acknowledged);
                }
            }
            None => {
                warn!(dbgid = ?dbgid, replica = %id, "unknown log server rejoined; releasing");
                let _ = req.reply.send(RejoinReply::Release);
            }
        }
    }
    for (_, reply) in last_reply {
        let _ = reply.send(RejoinReply::Release);
    }
}

/// Owner of an in-flight epoch-end recovery. Frozen log systems are
/// published to [`EpochEndHandle::log_system_cell`] with decreasing recovery
/// versions until the handle is dropped, which cancels the recovery.
pub struct EpochEndHandle {
    out: Arc<ObservableCell<Option<Arc<LogSystem>>>>,
    _tasks: TaskSet,
}

impl EpochEndHandle {
    pub fn log_system_cell(&self) -> Arc<ObservableCell<Option<Arc<LogSystem>>>> {
        Arc::clone(&self.out)
    }

    pub fn latest(&self) -> Option<Arc<LogSystem>> {
        self.out.get()
    }

    /// Wait for the first (or a newer) published frozen system.
    pub fn wait_published(&self, timeout: Duration) -> Option<Arc<LogSystem>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let seen = self.out.generation();
            if let Some(system) = self.out.get() {
                return Some(system);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            self.out.wait_change(seen, deadline - now);
        }
    }
}

/// Stop a co-quorum of the previous epoch's replicas and publish the frozen
/// prior log system; publishing repeats with decreasing recovery versions as
/// more lock replies arrive. Never completes on its own: dropping the handle
/// is the signal that a new epoch has been started.
pub fn epoch_end(
    dbgid: DebugId,
    prev: &CoreState,
    rejoins: Receiver<RejoinRequest>,
    locality: LocalityData,
    config: Config,
) -> EpochEndHandle {
    let shutdown = Shutdown::new();
    let tasks = TaskSet::new(shutdown.clone());
    let out: Arc<ObservableCell<Option<Arc<LogSystem>>>> = Arc::new(ObservableCell::new(None));

    if prev.log_sets.is_empty() {
        // Brand new database: an empty, already-stopped log system.
        let mut parts = LogSystemParts::empty(dbgid, locality, config);
        parts.stopped = true;
        parts.epoch_end = Some(Version::ZERO);
        out.set(Some(LogSystem::from_parts(parts)));
        return EpochEndHandle { out, _tasks: tasks };
    }

    let current_sets: Vec<Arc<LogSet>> = prev
        .log_sets
        .iter()
        .map(|core_set| Arc::new(core_set.to_log_set()))
        .collect();
    let old_generations: Vec<Arc<OldGeneration>> = prev
        .old
        .iter()
        .map(|old| {
            Arc::new(OldGeneration::new(
                old.log_sets
                    .iter()
                    .map(|core_set| Arc::new(core_set.to_log_set()))
                    .collect(),
                old.log_router_tags,
                old.epoch_end,
            ))
        })
        .collect();

    let (progress_tx, progress_rx) = unbounded::<()>();
    let observer = FailureObserver::new();
    let notifier = Arc::new(Notifier::new());

    // Failure flags per current-set replica, consulted by the durable
    // version computation.
    let mut failure_flags: Vec<Vec<Arc<AtomicBool>>> = Vec::new();
    let mut all_servers: Vec<ServerCell> = Vec::new();
    for set in &current_sets {
        let mut flags = Vec::new();
        for cell in &set.servers {
            flags.push(observer.watch(Arc::clone(cell), &tasks, &config));
            all_servers.push(Arc::clone(cell));
        }
        failure_flags.push(flags);
    }
    for old in &old_generations {
        for set in old.log_sets() {
            for cell in &set.servers {
                all_servers.push(Arc::clone(cell));
            }
        }
    }

    {
        let rejoin_servers = all_servers.clone();
        let notifier = Arc::clone(&notifier);
        let progress = progress_tx.clone();
        let shutdown = shutdown.clone();
        tasks.spawn("track-rejoins", move || {
            track_rejoins(dbgid, rejoin_servers, rejoins, notifier, progress, shutdown);
        });
    }

    // Lock every replica of every current set.
    let mut lock_results: Vec<LogLockInfo> = Vec::new();
    let mut locked_localities: BTreeSet<i8> = BTreeSet::new();
    let mut found_special = false;
    for set in &current_sets {
        if set.locality == TagLocality::SPECIAL || set.locality == TagLocality::UPGRADED {
            found_special = true;
        }
        locked_localities.insert(set.locality.get());
        let info = LogLockInfo::for_set(Arc::clone(set), Version::MAX, true);
        for (cell, slot) in set.servers.iter().zip(&info.replies) {
            spawn_lock_task(
                &tasks,
                Arc::clone(cell),
                Arc::clone(slot),
                progress_tx.clone(),
                config.clone(),
            );
        }
        lock_results.push(info);
    }

    // Extend locking into historical generations whose locality is not yet
    // covered, so durable versions exist for old-router peeking. A special
    // locality subsumes all and makes the extension unnecessary.
    'extension: for old in &old_generations {
        if found_special {
            break;
        }
        for set in old.log_sets() {
            if set.locality == TagLocality::SPECIAL || set.locality == TagLocality::UPGRADED {
                found_special = true;
                break 'extension;
            }
            if locked_localities.insert(set.locality.get()) {
                debug!(dbgid = ?dbgid, locality = ?set.locality, "locking old generation for version information");
                let info = LogLockInfo::for_set(Arc::clone(&set), old.epoch_end, false);
                for (cell, slot) in set.servers.iter().zip(&info.replies) {
                    spawn_lock_task(
                        &tasks,
                        Arc::clone(cell),
                        Arc::clone(slot),
                        progress_tx.clone(),
                        config.clone(),
                    );
                }
                lock_results.push(info);
            }
        }
    }

    {
        let out = Arc::clone(&out);
        let shutdown = shutdown.clone();
        let log_router_tags = prev.log_router_tags;
        tasks.spawn("epoch-end", move || {
            let mut last_end: Option<Version> = None;
            let mut known_committed = Version::ZERO;
            loop {
                if shutdown.is_triggered() {
                    return;
                }

                let mut min_end = Version::MAX;
                let mut max_end = Version::ZERO;
                for (idx, set) in current_sets.iter().enumerate() {
                    if !set.is_local || !set.has_servers() {
                        continue;
                    }
                    if let Some((kcv, end)) = get_durable_version(
                        dbgid,
                        &lock_results[idx],
                        Some(&failure_flags[idx]),
                        last_end,
                        &config,
                    ) {
                        known_committed = std::cmp::max(known_committed, kcv);
                        max_end = std::cmp::max(max_end, end);
                        min_end = std::cmp::min(min_end, end);
                    }
                }

                if max_end > Version::ZERO && last_end.map_or(true, |last| max_end < last) {
                    last_end = Some(min_end);
                    info!(dbgid = ?dbgid, epoch_end = %min_end, known_committed = %known_committed, "publishing frozen log system");

                    let mut parts =
                        LogSystemParts::empty(dbgid, locality.clone(), config.clone());
                    parts.sets = current_sets.clone();
                    parts.old = old_generations.clone();
                    parts.log_router_tags = log_router_tags;
                    parts.stopped = true;
                    parts.epoch_end = Some(min_end);
                    parts.known_committed = known_committed;
                    parts.lock_results = lock_results.clone();
                    parts.remote_logs_written = true;
                    out.set(Some(LogSystem::from_parts(parts)));
                }

                match progress_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(()) => {}
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                }
            }
        });
    }

    EpochEndHandle { out, _tasks: tasks }
}
