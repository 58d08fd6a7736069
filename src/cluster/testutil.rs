//! In-memory fakes shared by the control-plane unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::cluster::interface::{
    CommitRequest, DebugId, LockReply, LogMessage, LogServerClient, OptionalEndpoint, PeekReply,
    PeekRequest, PopRequest, ReplicaError, ReplicaId,
};
use crate::cluster::log_set::{LogSet, LogSetParams};
use crate::cluster::log_system::{LogSystem, LogSystemParts};
use crate::config::Config;
use crate::core::{LocalityData, ReplicationPolicy, Tag, TagLocality, Version};

#[derive(Default)]
pub(crate) struct FakeState {
    pub messages: BTreeMap<Tag, Vec<LogMessage>>,
    pub end: Version,
    pub known_committed: Version,
    pub commits: Vec<CommitRequest>,
    pub pops: Vec<(Tag, Version)>,
    pub locked: bool,
    pub commit_error: Option<ReplicaError>,
    pub confirm_error: Option<ReplicaError>,
}

pub(crate) struct FakeLogServer {
    pub id: ReplicaId,
    pub state: Mutex<FakeState>,
}

impl FakeLogServer {
    pub fn new(end: Version) -> Arc<Self> {
        Arc::new(Self {
            id: ReplicaId::random(),
            state: Mutex::new(FakeState {
                end,
                ..FakeState::default()
            }),
        })
    }

    pub fn with_messages(end: Version, tag: Tag, messages: Vec<LogMessage>) -> Arc<Self> {
        let server = Self::new(end);
        server
            .state
            .lock()
            .unwrap()
            .messages
            .insert(tag, messages);
        server
    }

    pub fn endpoint(self: &Arc<Self>, locality: LocalityData) -> OptionalEndpoint {
        OptionalEndpoint::present(
            self.id,
            locality,
            format!("fake:{}", self.id),
            Arc::clone(self) as Arc<dyn LogServerClient>,
        )
    }

    pub fn pops(&self) -> Vec<(Tag, Version)> {
        self.state.lock().unwrap().pops.clone()
    }
}

impl LogServerClient for FakeLogServer {
    fn commit(&self, req: &CommitRequest) -> Result<(), ReplicaError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.commit_error {
            return Err(err.clone());
        }
        state.commits.push(req.clone());
        Ok(())
    }

    fn peek(&self, req: &PeekRequest) -> Result<PeekReply, ReplicaError> {
        let state = self.state.lock().unwrap();
        let messages = state
            .messages
            .get(&req.tag)
            .map(|all| {
                all.iter()
                    .filter(|m| m.version >= req.begin)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(PeekReply {
            messages,
            end: state.end,
            popped_to: Version::ZERO,
        })
    }

    fn pop(&self, req: &PopRequest) -> Result<(), ReplicaError> {
        self.state.lock().unwrap().pops.push((req.tag, req.up_to));
        Ok(())
    }

    fn lock(&self) -> Result<LockReply, ReplicaError> {
        let mut state = self.state.lock().unwrap();
        state.locked = true;
        Ok(LockReply {
            end: state.end,
            known_committed: state.known_committed,
        })
    }

    fn confirm_running(&self, _debug_id: Option<DebugId>) -> Result<(), ReplicaError> {
        let state = self.state.lock().unwrap();
        match &state.confirm_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn recovery_finished(&self) -> Result<(), ReplicaError> {
        Ok(())
    }

    fn wait_failure(&self, window: Duration) -> Result<(), ReplicaError> {
        std::thread::sleep(window);
        Ok(())
    }
}

pub(crate) fn zone(name: &str) -> LocalityData {
    LocalityData::for_zone("dc1", name, "m0")
}

pub(crate) fn message(version: u64, sub: u32, tag: Tag) -> LogMessage {
    LogMessage {
        version: Version::new(version),
        sub,
        tags: vec![tag],
        payload: Bytes::from_static(b"m"),
    }
}

/// A local set backed by fake replicas, one per zone.
pub(crate) fn fake_set(
    servers: &[Arc<FakeLogServer>],
    replication_factor: usize,
    write_anti_quorum: usize,
    locality: TagLocality,
    has_best_policy: bool,
    start_version: Version,
) -> Arc<LogSet> {
    let localities: Vec<LocalityData> =
        (0..servers.len()).map(|i| zone(&format!("z{i}"))).collect();
    let endpoints: Vec<OptionalEndpoint> = servers
        .iter()
        .zip(&localities)
        .map(|(server, locality)| server.endpoint(locality.clone()))
        .collect();
    Arc::new(
        LogSet::new(LogSetParams {
            endpoints,
            localities,
            replication_factor,
            write_anti_quorum,
            policy: ReplicationPolicy::across_zones(replication_factor).unwrap(),
            locality,
            is_local: true,
            has_best_policy,
            start_version,
        })
        .unwrap(),
    )
}

pub(crate) fn test_config() -> Config {
    Config {
        pop_batch_delay_ms: 20,
        router_pop_batch_delay_ms: 0,
        replica_timeout_ms: 100,
        ..Config::default()
    }
}

pub(crate) fn system_with(parts_mutator: impl FnOnce(&mut LogSystemParts)) -> Arc<LogSystem> {
    let mut parts = LogSystemParts::empty(
        DebugId::random(),
        LocalityData::for_zone("dc1", "z0", "m0"),
        test_config(),
    );
    parts_mutator(&mut parts);
    LogSystem::from_parts(parts)
}
