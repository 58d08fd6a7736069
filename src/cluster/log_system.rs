//! The log system value: current sets, historical generations, and the
//! liveness/recovery state shared by push, peek, pop, and recruitment.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::unbounded;
use rand::Rng;
use tracing::debug;

use crate::cluster::cell::{Notifier, ObservableCell, Shutdown, TaskSet};
use crate::cluster::failure::FailureObserver;
use crate::cluster::interface::{DebugId, RecruitmentId, ReplicaError};
use crate::cluster::log_set::LogSet;
use crate::cluster::pop::PopTable;
use crate::cluster::recovery::{LogLockInfo, RecoveryError};
use crate::config::Config;
use crate::core::{LocalityData, LocalityGroup, Tag, Version};

/// A historical generation: its log sets, router-tag count, and the
/// exclusive upper bound of the versions it carries.
pub struct OldGeneration {
    sets: Mutex<Vec<Arc<LogSet>>>,
    pub log_router_tags: usize,
    pub epoch_end: Version,
}

impl OldGeneration {
    pub fn new(sets: Vec<Arc<LogSet>>, log_router_tags: usize, epoch_end: Version) -> Self {
        Self {
            sets: Mutex::new(sets),
            log_router_tags,
            epoch_end,
        }
    }

    pub fn log_sets(&self) -> Vec<Arc<LogSet>> {
        self.sets.lock().expect("generation lock poisoned").clone()
    }

    pub(crate) fn push_set(&self, set: Arc<LogSet>) {
        self.sets
            .lock()
            .expect("generation lock poisoned")
            .push(set);
    }

    /// Max start version among local sets: the earliest version this
    /// generation fully covers.
    pub fn local_begin(&self) -> Version {
        self.log_sets()
            .iter()
            .filter(|set| set.is_local)
            .map(|set| set.start_version)
            .max()
            .unwrap_or(Version::ZERO)
    }
}

/// Progress of a recovery phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseState {
    Pending,
    Done,
    Failed(RecoveryError),
}

impl PhaseState {
    pub fn is_ready(&self) -> bool {
        !matches!(self, PhaseState::Pending)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, PhaseState::Done)
    }
}

pub(crate) struct LogSystemParts {
    pub dbgid: DebugId,
    pub locality: LocalityData,
    pub config: Config,
    pub sets: Vec<Arc<LogSet>>,
    pub old: Vec<Arc<OldGeneration>>,
    pub log_router_tags: usize,
    pub expected_log_sets: usize,
    pub recruitment_id: RecruitmentId,
    pub stopped: bool,
    pub epoch_end: Option<Version>,
    pub known_committed: Version,
    pub lock_results: Vec<LogLockInfo>,
    pub remote_logs_written: bool,
}

impl LogSystemParts {
    pub fn empty(dbgid: DebugId, locality: LocalityData, config: Config) -> Self {
        Self {
            dbgid,
            locality,
            config,
            sets: Vec::new(),
            old: Vec::new(),
            log_router_tags: 0,
            expected_log_sets: 0,
            recruitment_id: RecruitmentId::nil(),
            stopped: false,
            epoch_end: None,
            known_committed: Version::ZERO,
            lock_results: Vec::new(),
            remote_logs_written: false,
        }
    }
}

/// The tag-partitioned log system.
///
/// Exclusively owns its sets and history; replica handles inside them are
/// shared cells refreshed by the rejoin handler. Dropping the system cancels
/// every owned background task.
pub struct LogSystem {
    dbgid: DebugId,
    locality: LocalityData,
    config: Config,
    sets: Mutex<Vec<Arc<LogSet>>>,
    old: Mutex<Vec<Arc<OldGeneration>>>,
    pub log_router_tags: usize,
    pub expected_log_sets: usize,
    recruitment_id: Mutex<RecruitmentId>,
    pub stopped: bool,
    pub epoch_end: Option<Version>,
    pub known_committed: Version,
    lock_results: Mutex<Vec<LogLockInfo>>,
    pub(crate) recovery_complete: ObservableCell<PhaseState>,
    pub(crate) remote_recovery: ObservableCell<PhaseState>,
    pub(crate) remote_recovery_complete: ObservableCell<PhaseState>,
    has_remote_servers: AtomicBool,
    pub(crate) recovery_complete_written: AtomicBool,
    pub(crate) remote_logs_written: AtomicBool,
    pop_entries: PopTable,
    config_changed: Arc<Notifier>,
    observer: FailureObserver,
    tasks: TaskSet,
}

impl LogSystem {
    pub(crate) fn from_parts(parts: LogSystemParts) -> Arc<Self> {
        let shutdown = Shutdown::new();
        Arc::new(Self {
            dbgid: parts.dbgid,
            locality: parts.locality,
            config: parts.config,
            sets: Mutex::new(parts.sets),
            old: Mutex::new(parts.old),
            log_router_tags: parts.log_router_tags,
            expected_log_sets: parts.expected_log_sets,
            recruitment_id: Mutex::new(parts.recruitment_id),
            stopped: parts.stopped,
            epoch_end: parts.epoch_end,
            known_committed: parts.known_committed,
            lock_results: Mutex::new(parts.lock_results),
            recovery_complete: ObservableCell::new(PhaseState::Pending),
            remote_recovery: ObservableCell::new(PhaseState::Pending),
            remote_recovery_complete: ObservableCell::new(PhaseState::Pending),
            has_remote_servers: AtomicBool::new(false),
            recovery_complete_written: AtomicBool::new(false),
            remote_logs_written: AtomicBool::new(parts.remote_logs_written),
            pop_entries: PopTable::default(),
            config_changed: Arc::new(Notifier::new()),
            observer: FailureObserver::new(),
            tasks: TaskSet::new(shutdown),
        })
    }

    pub fn dbgid(&self) -> DebugId {
        self.dbgid
    }

    pub fn locality(&self) -> &LocalityData {
        &self.locality
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    pub fn shutdown_token(&self) -> Shutdown {
        self.tasks.shutdown().clone()
    }

    pub fn failure_observer(&self) -> &FailureObserver {
        &self.observer
    }

    pub(crate) fn pop_table(&self) -> PopTable {
        Arc::clone(&self.pop_entries)
    }

    pub(crate) fn config_changed(&self) -> Arc<Notifier> {
        Arc::clone(&self.config_changed)
    }

    pub fn recruitment_id(&self) -> RecruitmentId {
        *self.recruitment_id.lock().expect("recruitment id poisoned")
    }

    pub(crate) fn set_recruitment_id(&self, id: RecruitmentId) {
        *self.recruitment_id.lock().expect("recruitment id poisoned") = id;
    }

    pub fn current_sets(&self) -> Vec<Arc<LogSet>> {
        self.sets.lock().expect("log sets lock poisoned").clone()
    }

    /// Sets participating in push, in location-counter order.
    pub fn local_sets(&self) -> Vec<Arc<LogSet>> {
        self.current_sets()
            .into_iter()
            .filter(|set| set.is_local)
            .collect()
    }

    pub(crate) fn push_current_set(&self, set: Arc<LogSet>) {
        self.sets.lock().expect("log sets lock poisoned").push(set);
        self.config_changed.trigger();
    }

    pub fn old_generations(&self) -> Vec<Arc<OldGeneration>> {
        self.old.lock().expect("history lock poisoned").clone()
    }

    pub(crate) fn lock_results(&self) -> Vec<LogLockInfo> {
        self.lock_results
            .lock()
            .expect("lock results poisoned")
            .clone()
    }

    pub fn has_remote_logs(&self) -> bool {
        self.log_router_tags > 0
    }

    pub(crate) fn set_has_remote_servers(&self, value: bool) {
        self.has_remote_servers.store(value, Ordering::SeqCst);
    }

    pub fn has_remote_servers(&self) -> bool {
        self.has_remote_servers.load(Ordering::SeqCst)
    }

    pub fn get_random_router_tag(&self) -> Option<Tag> {
        if self.log_router_tags == 0 {
            return None;
        }
        let id = rand::thread_rng().gen_range(0..self.log_router_tags);
        Some(Tag::log_router(id as u16))
    }

    /// Exclusive end of this (frozen) system's versions.
    pub fn get_end(&self) -> Option<Version> {
        self.epoch_end.map(Version::next)
    }

    pub(crate) fn peek_end(&self) -> Version {
        self.get_end().unwrap_or(Version::MAX)
    }

    /// The total number of push locations across local sets.
    pub fn push_location_count(&self) -> usize {
        self.local_sets()
            .iter()
            .map(|set| set.server_count())
            .sum()
    }

    /// Flat push locations for `tags`, indexing the replica array the push
    /// path walks over all local sets in order.
    pub fn get_push_locations(&self, tags: &[Tag], out: &mut Vec<usize>) {
        let mut offset = 0;
        for set in self.local_sets() {
            if set.has_servers() {
                set.get_push_locations(tags, offset, out);
                offset += set.server_count();
            }
        }
    }

    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, set) in self.current_sets().iter().enumerate() {
            let _ = write!(out, "{i}: ");
            let ids: Vec<String> = set
                .server_ids()
                .iter()
                .map(|id| id.to_string())
                .collect();
            let _ = write!(out, "{}", ids.join(", "));
            out.push(' ');
        }
        out
    }

    /// Wait for the next change to the public log-system config (router
    /// recruitment, rejoin handle refresh, set installation).
    pub fn wait_config_change(&self, timeout: Duration) -> bool {
        let token = self.config_changed.subscribe();
        self.config_changed.wait(token, timeout)
    }

    /// Confirm that pushes in the current epoch are still possible: every
    /// local set must produce a policy-validating group of running replicas.
    ///
    /// Observing `Stopped` from any replica is proof the epoch has ended;
    /// the call then parks until the system is dropped, surfacing
    /// `Cancelled` — the never-ready future of the protocol.
    pub fn confirm_epoch_live(&self, debug_id: Option<DebugId>) -> Result<(), RecoveryError> {
        for set in self.local_sets() {
            if set.has_servers() {
                self.confirm_set_live(&set, debug_id)?;
            }
        }
        Ok(())
    }

    fn confirm_set_live(
        &self,
        set: &Arc<LogSet>,
        debug_id: Option<DebugId>,
    ) -> Result<(), RecoveryError> {
        let shutdown = self.tasks.shutdown().clone();
        let (tx, rx) = unbounded::<(usize, Result<(), ReplicaError>)>();
        let mut present = 0usize;
        for (idx, cell) in set.servers.iter().enumerate() {
            let endpoint = cell.get();
            let Some(client) = endpoint.client else {
                continue;
            };
            present += 1;
            let tx = tx.clone();
            std::thread::spawn(move || {
                let _ = tx.send((idx, client.confirm_running(debug_id)));
            });
        }
        drop(tx);

        let first_gate = std::cmp::min(
            set.replication_factor,
            present.saturating_sub(set.write_anti_quorum),
        );

        let mut group = LocalityGroup::new();
        let mut successes = 0usize;
        let mut outstanding = present;
        loop {
            if successes >= first_gate {
                // Anti-quorums are intentionally not considered here; the
                // policy check over actual responders is the gate.
                let quorum = group.validate(&set.policy)
                    || (set.replication_factor == 1 && !group.is_empty());
                if quorum {
                    return Ok(());
                }
            }
            if outstanding == 0 {
                // No further replies can arrive; nothing left to wait on.
                shutdown.park();
                return Err(RecoveryError::Cancelled);
            }
            match rx.recv() {
                Ok((idx, Ok(()))) => {
                    outstanding -= 1;
                    successes += 1;
                    group.add(set.localities[idx].clone());
                }
                Ok((_, Err(ReplicaError::Stopped))) => {
                    // All commits go to all replicas; a stopped replica means
                    // our epoch has ended.
                    debug!(dbgid = ?self.dbgid, "confirm saw stopped log server");
                    shutdown.park();
                    return Err(RecoveryError::Cancelled);
                }
                Ok((_, Err(_))) => {
                    outstanding -= 1;
                }
                Err(_) => {
                    shutdown.park();
                    return Err(RecoveryError::Cancelled);
                }
            }
        }
    }

    /// Wait for the next core-state-relevant transition: local recovery
    /// completing, remote recruitment starting, or remote recovery
    /// completing. Returns false on timeout.
    pub fn wait_core_state_change(&self, timeout: Duration) -> bool {
        let local = self.recovery_complete.get();
        let remote = self.remote_recovery.get();
        let remote_complete = self.remote_recovery_complete.get();

        if local.is_ready() && remote.is_ready() {
            if !remote_complete.is_ready() {
                let seen = self.remote_recovery_complete.generation();
                return self.remote_recovery_complete.wait_change(seen, timeout);
            }
            // Fully recovered: nothing further will change.
            self.tasks.shutdown().wait(timeout);
            return false;
        }
        if remote.is_ready() {
            let seen = self.recovery_complete.generation();
            return self.recovery_complete.wait_change(seen, timeout);
        }
        if local.is_ready() {
            let seen = self.remote_recovery.generation();
            return self.remote_recovery.wait_change(seen, timeout);
        }

        // Either phase may move first; poll both cells.
        let local_seen = self.recovery_complete.generation();
        let remote_seen = self.remote_recovery.generation();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let step = Duration::from_millis(20);
            if self.recovery_complete.wait_change(local_seen, step)
                || self.remote_recovery.wait_change(remote_seen, Duration::ZERO)
            {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::interface::ReplicaError;
    use crate::cluster::testutil::{fake_set, system_with, FakeLogServer};
    use crate::core::TagLocality;

    const DC0: TagLocality = TagLocality::new(0);

    #[test]
    fn confirm_epoch_live_validates_the_policy_over_responders() {
        let replicas: Vec<_> = (0..3).map(|_| FakeLogServer::new(Version::ZERO)).collect();
        let system = system_with(|parts| {
            parts.sets = vec![fake_set(&replicas, 3, 0, DC0, true, Version::ZERO)];
        });
        system.confirm_epoch_live(None).unwrap();
    }

    #[test]
    fn confirm_epoch_live_parks_on_a_stopped_replica() {
        let replicas: Vec<_> = (0..2).map(|_| FakeLogServer::new(Version::ZERO)).collect();
        replicas[0].state.lock().unwrap().confirm_error = Some(ReplicaError::Stopped);
        replicas[1].state.lock().unwrap().confirm_error = Some(ReplicaError::Stopped);
        let system = system_with(|parts| {
            parts.sets = vec![fake_set(&replicas, 2, 0, DC0, true, Version::ZERO)];
        });

        let worker = {
            let system = Arc::clone(&system);
            std::thread::spawn(move || system.confirm_epoch_live(None))
        };
        // The call must not complete; it parks until the system shuts down.
        std::thread::sleep(Duration::from_millis(100));
        assert!(!worker.is_finished());
        system.shutdown_token().trigger();
        assert_eq!(worker.join().unwrap(), Err(RecoveryError::Cancelled));
    }

    #[test]
    fn random_router_tags_stay_in_range() {
        let system = system_with(|parts| {
            parts.log_router_tags = 4;
        });
        for _ in 0..32 {
            let tag = system.get_random_router_tag().unwrap();
            assert_eq!(tag.locality, crate::core::TagLocality::LOG_ROUTER);
            assert!((tag.id as usize) < 4);
        }
        let none = system_with(|_| {});
        assert!(none.get_random_router_tag().is_none());
        assert!(!none.has_remote_logs());
    }

    #[test]
    fn push_locations_walk_local_sets_with_a_running_offset() {
        let primary: Vec<_> = (0..2).map(|_| FakeLogServer::new(Version::ZERO)).collect();
        let satellite: Vec<_> = (0..2).map(|_| FakeLogServer::new(Version::ZERO)).collect();
        let system = system_with(|parts| {
            parts.sets = vec![
                fake_set(&primary, 2, 0, DC0, true, Version::ZERO),
                fake_set(&satellite, 2, 0, TagLocality::INVALID, false, Version::ZERO),
            ];
        });
        assert_eq!(system.push_location_count(), 4);

        let mut locations = Vec::new();
        system.get_push_locations(&[Tag::new(DC0, 0)], &mut locations);
        // Both sets contribute, the second offset past the first.
        assert!(locations.iter().any(|&loc| loc < 2));
        assert!(locations.iter().any(|&loc| loc >= 2));
    }

    #[test]
    fn describe_lists_replicas_per_set() {
        let replicas: Vec<_> = (0..2).map(|_| FakeLogServer::new(Version::ZERO)).collect();
        let system = system_with(|parts| {
            parts.sets = vec![fake_set(&replicas, 2, 0, DC0, true, Version::ZERO)];
        });
        let text = system.describe();
        assert!(text.starts_with("0: "));
        assert!(text.contains(", "));
    }
}
