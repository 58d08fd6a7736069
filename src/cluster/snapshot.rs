//! Serialising the log system: the persisted core state committed by the
//! external coordinator, and the public descriptor handed to recruits and
//! consumers.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cluster::interface::{server_cell, OptionalEndpoint, RecruitmentId, ReplicaId};
use crate::cluster::log_set::{LogSet, LogSetParams};
use crate::cluster::log_system::{LogSystem, LogSystemParts, OldGeneration};
use crate::cluster::recovery::RecoveryError;
use crate::config::Config;
use crate::core::{LocalityData, ReplicationPolicy, TagLocality, Version};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("core state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One set as persisted in the core state: ids and shape, no endpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoreLogSet {
    pub servers: Vec<ReplicaId>,
    pub localities: Vec<LocalityData>,
    pub replication_factor: usize,
    pub write_anti_quorum: usize,
    pub policy: ReplicationPolicy,
    pub is_local: bool,
    pub has_best_policy: bool,
    pub locality: TagLocality,
    pub start_version: Version,
}

impl CoreLogSet {
    pub(crate) fn to_log_set(&self) -> LogSet {
        let endpoints = self
            .servers
            .iter()
            .zip(&self.localities)
            .map(|(&id, locality)| OptionalEndpoint::known(id, locality.clone()))
            .collect();
        LogSet::new_unchecked(LogSetParams {
            endpoints,
            localities: self.localities.clone(),
            replication_factor: self.replication_factor,
            write_anti_quorum: self.write_anti_quorum,
            policy: self.policy.clone(),
            locality: self.locality,
            is_local: self.is_local,
            has_best_policy: self.has_best_policy,
            start_version: self.start_version,
        })
    }

    fn from_log_set(set: &LogSet) -> Self {
        Self {
            servers: set.server_ids(),
            localities: set.localities.clone(),
            replication_factor: set.replication_factor,
            write_anti_quorum: set.write_anti_quorum,
            policy: set.policy.clone(),
            is_local: set.is_local,
            has_best_policy: set.has_best_policy,
            locality: set.locality,
            start_version: set.start_version,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OldCoreState {
    pub log_sets: Vec<CoreLogSet>,
    pub log_router_tags: usize,
    pub epoch_end: Version,
}

/// The value the external coordination layer commits atomically.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreState {
    pub log_sets: Vec<CoreLogSet>,
    pub old: Vec<OldCoreState>,
    pub log_router_tags: usize,
}

/// One set in the public descriptor, endpoints included.
#[derive(Clone)]
pub struct LogSetConfig {
    pub servers: Vec<OptionalEndpoint>,
    pub routers: Vec<OptionalEndpoint>,
    pub localities: Vec<LocalityData>,
    pub replication_factor: usize,
    pub write_anti_quorum: usize,
    pub policy: ReplicationPolicy,
    pub is_local: bool,
    pub has_best_policy: bool,
    pub locality: TagLocality,
    pub start_version: Version,
}

impl LogSetConfig {
    fn from_log_set(set: &LogSet) -> Self {
        Self {
            servers: set.servers.iter().map(|cell| cell.get()).collect(),
            routers: set.routers().iter().map(|cell| cell.get()).collect(),
            localities: set.localities.clone(),
            replication_factor: set.replication_factor,
            write_anti_quorum: set.write_anti_quorum,
            policy: set.policy.clone(),
            is_local: set.is_local,
            has_best_policy: set.has_best_policy,
            locality: set.locality,
            start_version: set.start_version,
        }
    }

    fn to_log_set(&self) -> Arc<LogSet> {
        let set = LogSet::new_unchecked(LogSetParams {
            endpoints: self.servers.clone(),
            localities: self.localities.clone(),
            replication_factor: self.replication_factor,
            write_anti_quorum: self.write_anti_quorum,
            policy: self.policy.clone(),
            locality: self.locality,
            is_local: self.is_local,
            has_best_policy: self.has_best_policy,
            start_version: self.start_version,
        });
        set.set_routers(self.routers.iter().cloned().map(server_cell).collect());
        Arc::new(set)
    }
}

#[derive(Clone)]
pub struct OldLogSetsConfig {
    pub sets: Vec<LogSetConfig>,
    pub log_router_tags: usize,
    pub epoch_end: Version,
}

/// Public descriptor of a running log system, including router endpoints.
#[derive(Clone, Default)]
pub struct LogSystemConfig {
    pub sets: Vec<LogSetConfig>,
    pub old: Vec<OldLogSetsConfig>,
    pub log_router_tags: usize,
    pub expected_log_sets: usize,
    pub recruitment_id: Option<RecruitmentId>,
    pub stopped: bool,
}

/// Entry of the public `logs` value: id plus last-known address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogsValueEntry {
    pub id: ReplicaId,
    pub address: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogsValue {
    pub logs: Vec<LogsValueEntry>,
    pub old_logs: Vec<LogsValueEntry>,
}

impl LogSystem {
    /// Write this system to the persisted core-state form. History is
    /// included only while local or remote recovery is still incomplete;
    /// once both are confirmed the coordinator may discard it.
    pub fn to_core_state(&self) -> Result<CoreState, RecoveryError> {
        if let crate::cluster::log_system::PhaseState::Failed(err) = self.recovery_complete.get()
        {
            return Err(err);
        }
        if let crate::cluster::log_system::PhaseState::Failed(err) =
            self.remote_recovery_complete.get()
        {
            return Err(err);
        }

        let mut state = CoreState {
            log_sets: Vec::new(),
            old: Vec::new(),
            log_router_tags: self.log_router_tags,
        };
        for set in self.current_sets() {
            if set.has_servers() {
                state.log_sets.push(CoreLogSet::from_log_set(&set));
            }
        }

        let fully_recovered = self.recovery_complete.get().is_ready()
            && self.remote_recovery_complete.get().is_ready();
        if !fully_recovered {
            for old in self.old_generations() {
                let mut entry = OldCoreState {
                    log_sets: Vec::new(),
                    log_router_tags: old.log_router_tags,
                    epoch_end: old.epoch_end,
                };
                for set in old.log_sets() {
                    if set.has_servers() {
                        entry.log_sets.push(CoreLogSet::from_log_set(&set));
                    }
                }
                state.old.push(entry);
            }
        }
        Ok(state)
    }

    /// Observe that `state` was committed: latch the flags that gate future
    /// snapshots so a discarded history is never advertised again.
    pub fn core_state_written(&self, state: &CoreState) {
        if state.old.is_empty() {
            self.recovery_complete_written.store(true, Ordering::SeqCst);
        }
        if state.log_sets.iter().any(|set| !set.is_local) {
            info!(dbgid = ?self.dbgid(), "remote logs written to core state");
            self.remote_logs_written.store(true, Ordering::SeqCst);
        }
    }

    pub fn recovery_complete_written(&self) -> bool {
        self.recovery_complete_written.load(Ordering::SeqCst)
    }

    pub fn remote_logs_written(&self) -> bool {
        self.remote_logs_written.load(Ordering::SeqCst)
    }

    /// The public descriptor equivalent of [`LogSystem::to_core_state`].
    pub fn get_log_system_config(&self) -> LogSystemConfig {
        let remote_written = self.remote_logs_written();
        let mut conf = LogSystemConfig {
            sets: Vec::new(),
            old: Vec::new(),
            log_router_tags: self.log_router_tags,
            expected_log_sets: self.expected_log_sets,
            recruitment_id: Some(self.recruitment_id()),
            stopped: self.stopped,
        };
        for set in self.current_sets() {
            if set.is_local || remote_written {
                conf.sets.push(LogSetConfig::from_log_set(&set));
            }
        }
        if !self.recovery_complete_written() {
            for old in self.old_generations() {
                conf.old.push(OldLogSetsConfig {
                    sets: old.log_sets().iter().map(|s| LogSetConfig::from_log_set(s)).collect(),
                    log_router_tags: old.log_router_tags,
                    epoch_end: old.epoch_end,
                });
            }
        }
        conf
    }

    /// The serialized public value at the `logs` system key: `(id, address)`
    /// pairs for current plus historical replicas.
    pub fn logs_value(&self) -> Result<Vec<u8>, SnapshotError> {
        let remote_written = self.remote_logs_written();
        let mut value = LogsValue::default();
        for set in self.current_sets() {
            if set.is_local || remote_written {
                for cell in &set.servers {
                    let endpoint = cell.get();
                    value.logs.push(LogsValueEntry {
                        id: endpoint.id,
                        address: endpoint.address,
                    });
                }
            }
        }
        if !self.recovery_complete_written() {
            for old in self.old_generations() {
                for set in old.log_sets() {
                    for cell in &set.servers {
                        let endpoint = cell.get();
                        value.old_logs.push(LogsValueEntry {
                            id: endpoint.id,
                            address: endpoint.address,
                        });
                    }
                }
            }
        }
        Ok(serde_json::to_vec(&value)?)
    }
}

/// Reconstruct a running view from a public descriptor.
pub fn from_log_system_config(
    dbgid: crate::cluster::interface::DebugId,
    locality: LocalityData,
    conf: &LogSystemConfig,
    exclude_remote: bool,
    config: Config,
) -> Arc<LogSystem> {
    let mut parts = LogSystemParts::empty(dbgid, locality, config);
    parts.log_router_tags = conf.log_router_tags;
    parts.expected_log_sets = conf.expected_log_sets;
    parts.recruitment_id = conf.recruitment_id.unwrap_or_else(RecruitmentId::nil);
    parts.stopped = conf.stopped;
    for set in &conf.sets {
        if !exclude_remote || set.is_local {
            parts.sets.push(set.to_log_set());
        }
    }
    for old in &conf.old {
        parts.old.push(Arc::new(OldGeneration::new(
            old.sets.iter().map(|s| s.to_log_set()).collect(),
            old.log_router_tags,
            old.epoch_end,
        )));
    }
    LogSystem::from_parts(parts)
}

/// Reconstruct a frozen predecessor: the descriptor's most recent history
/// entry becomes the current sets, and the system is marked stopped.
pub fn from_old_log_system_config(
    dbgid: crate::cluster::interface::DebugId,
    locality: LocalityData,
    conf: &LogSystemConfig,
    config: Config,
) -> Arc<LogSystem> {
    let mut parts = LogSystemParts::empty(dbgid, locality, config);
    parts.stopped = true;
    if let Some(newest) = conf.old.first() {
        parts.sets = newest.sets.iter().map(|s| s.to_log_set()).collect();
        parts.log_router_tags = newest.log_router_tags;
        for old in &conf.old[1..] {
            parts.old.push(Arc::new(OldGeneration::new(
                old.sets.iter().map(|s| s.to_log_set()).collect(),
                old.log_router_tags,
                old.epoch_end,
            )));
        }
    }
    LogSystem::from_parts(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::log_system::{OldGeneration, PhaseState};
    use crate::cluster::testutil::{fake_set, system_with, FakeLogServer};
    use crate::core::TagLocality;

    const DC0: TagLocality = TagLocality::new(0);

    fn system_with_history() -> Arc<LogSystem> {
        let current = FakeLogServer::new(Version::new(200));
        let old = FakeLogServer::new(Version::new(100));
        system_with(|parts| {
            parts.sets = vec![fake_set(&[current], 1, 0, DC0, true, Version::new(100))];
            parts.old = vec![Arc::new(OldGeneration::new(
                vec![fake_set(&[old], 1, 0, DC0, true, Version::ZERO)],
                0,
                Version::new(100),
            ))];
            parts.log_router_tags = 2;
        })
    }

    #[test]
    fn core_state_round_trips_through_serde() {
        let system = system_with_history();
        let state = system.to_core_state().unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let parsed: CoreState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn history_is_included_while_recovery_is_incomplete() {
        let system = system_with_history();
        let state = system.to_core_state().unwrap();
        assert_eq!(state.log_sets.len(), 1);
        assert_eq!(state.old.len(), 1);
        assert_eq!(state.log_router_tags, 2);
    }

    #[test]
    fn history_is_elided_once_both_recoveries_are_confirmed() {
        let system = system_with_history();
        system.recovery_complete.set(PhaseState::Done);
        system.remote_recovery.set(PhaseState::Done);
        system.remote_recovery_complete.set(PhaseState::Done);

        let state = system.to_core_state().unwrap();
        assert!(state.old.is_empty());

        // Latching: once an empty history and a non-local set have been
        // committed, later snapshots never advertise history again.
        system.core_state_written(&state);
        assert!(system.recovery_complete_written());
        assert!(system.get_log_system_config().old.is_empty());
    }

    #[test]
    fn remote_sets_appear_in_the_descriptor_only_after_commit() {
        let system = system_with_history();
        let remote = FakeLogServer::new(Version::new(300));
        let remote_set = fake_set(&[remote], 1, 0, TagLocality::new(1), true, Version::new(100));
        // fake_set builds local sets; flag the remote one by hand.
        let mut state = system.to_core_state().unwrap();
        let mut core_remote = CoreLogSet::from_log_set(&remote_set);
        core_remote.is_local = false;
        state.log_sets.push(core_remote);

        assert!(!system.remote_logs_written());
        system.core_state_written(&state);
        assert!(system.remote_logs_written());
    }

    #[test]
    fn failed_recovery_surfaces_through_to_core_state() {
        let system = system_with_history();
        system
            .recovery_complete
            .set(PhaseState::Failed(RecoveryError::RecoveryFailed));
        let err = system.to_core_state().unwrap_err();
        assert_eq!(err, RecoveryError::RecoveryFailed);
    }

    #[test]
    fn logs_value_lists_current_and_historical_replicas() {
        let system = system_with_history();
        let bytes = system.logs_value().unwrap();
        let value: LogsValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value.logs.len(), 1);
        assert_eq!(value.old_logs.len(), 1);
        assert!(value.logs[0].address.is_some());
    }

    #[test]
    fn old_config_restore_shifts_history_into_current() {
        let system = system_with_history();
        let conf = system.get_log_system_config();
        assert_eq!(conf.old.len(), 1);

        let restored = from_old_log_system_config(
            system.dbgid(),
            system.locality().clone(),
            &conf,
            crate::cluster::testutil::test_config(),
        );
        assert!(restored.stopped);
        assert_eq!(restored.current_sets().len(), 1);
        assert_eq!(
            restored.current_sets()[0].start_version,
            Version::ZERO
        );
        assert!(restored.old_generations().is_empty());
    }

    #[test]
    fn running_restore_preserves_shape() {
        let system = system_with_history();
        let conf = system.get_log_system_config();
        let restored = from_log_system_config(
            system.dbgid(),
            system.locality().clone(),
            &conf,
            false,
            crate::cluster::testutil::test_config(),
        );
        assert!(!restored.stopped);
        assert_eq!(restored.log_router_tags, 2);
        assert_eq!(restored.current_sets().len(), 1);
        assert_eq!(restored.old_generations().len(), 1);
        // Endpoints survive the descriptor round trip.
        assert!(restored.current_sets()[0].servers[0].get().is_present());
    }
}
