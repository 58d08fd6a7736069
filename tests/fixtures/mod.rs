//! In-memory replicas and workers backing the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use taglog::config::Config;
use taglog::{
    CommitRequest, CoreState, DebugId, InitializeLogRouterRequest, InitializeLogServerRequest,
    LockReply, LogMessage, LogServerClient, OptionalEndpoint, PeekReply, PeekRequest, PopRequest,
    ReplicaError, ReplicaId, WorkerClient,
};
use taglog::cluster::snapshot::{CoreLogSet, LogSetConfig, LogSystemConfig, OldLogSetsConfig};
use taglog::{LocalityData, ReplicationPolicy, Tag, TagLocality, Version};

#[derive(Default)]
pub struct ReplicaState {
    pub messages: BTreeMap<Tag, Vec<LogMessage>>,
    pub end: Version,
    pub known_committed: Version,
    pub commits: Vec<CommitRequest>,
    pub pops: Vec<(Tag, Version)>,
    pub locked: bool,
    pub recovery_finished: bool,
    pub init_request: Option<InitRecord>,
}

/// What a worker was asked to host, for assertions.
#[derive(Clone)]
pub enum InitRecord {
    LogServer {
        start_version: Version,
        recover_at: Version,
        is_primary: bool,
        recover_tags: Vec<Tag>,
        locality: TagLocality,
        log_router_tags: usize,
    },
    LogRouter {
        router_tag: Tag,
        start_version: Version,
        locality: TagLocality,
    },
}

pub struct Replica {
    pub id: ReplicaId,
    pub state: Mutex<ReplicaState>,
}

impl Replica {
    pub fn new(end: u64) -> Arc<Self> {
        Self::with_known_committed(end, 0)
    }

    pub fn with_known_committed(end: u64, known_committed: u64) -> Arc<Self> {
        Arc::new(Self {
            id: ReplicaId::random(),
            state: Mutex::new(ReplicaState {
                end: Version::new(end),
                known_committed: Version::new(known_committed),
                ..ReplicaState::default()
            }),
        })
    }

    pub fn add_messages(&self, tag: Tag, versions: &[u64]) {
        let mut state = self.state.lock().unwrap();
        let entries = state.messages.entry(tag).or_default();
        for &version in versions {
            entries.push(LogMessage {
                version: Version::new(version),
                sub: 0,
                tags: vec![tag],
                payload: Bytes::from_static(b"payload"),
            });
        }
    }

    pub fn endpoint(self: &Arc<Self>, locality: LocalityData) -> OptionalEndpoint {
        OptionalEndpoint::present(
            self.id,
            locality,
            format!("fake:{}", self.id),
            Arc::clone(self) as Arc<dyn LogServerClient>,
        )
    }

    pub fn locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    pub fn pops(&self) -> Vec<(Tag, Version)> {
        self.state.lock().unwrap().pops.clone()
    }
}

impl LogServerClient for Replica {
    fn commit(&self, req: &CommitRequest) -> Result<(), ReplicaError> {
        self.state.lock().unwrap().commits.push(req.clone());
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
        Ok(())
    }

    fn recovery_finished(&self) -> Result<(), ReplicaError> {
        self.state.lock().unwrap().recovery_finished = true;
        Ok(())
    }

    fn wait_failure(&self, window: Duration) -> Result<(), ReplicaError> {
        std::thread::sleep(window);
        Ok(())
    }
}

/// A worker that hosts fresh in-memory replicas on demand.
pub struct Worker {
    pub locality: LocalityData,
    pub hosted: Mutex<Vec<Arc<Replica>>>,
}

impl Worker {
    pub fn new(zone: &str) -> Arc<Self> {
        Arc::new(Self {
            locality: LocalityData::for_zone("dc1", zone, "m0"),
            hosted: Mutex::new(Vec::new()),
        })
    }

    pub fn hosted(&self) -> Vec<Arc<Replica>> {
        self.hosted.lock().unwrap().clone()
    }
}

impl WorkerClient for Worker {
    fn locality(&self) -> LocalityData {
        self.locality.clone()
    }

    fn initialize_log_server(
        &self,
        req: InitializeLogServerRequest,
    ) -> Result<OptionalEndpoint, ReplicaError> {
        let replica = Replica::new(0);
        replica.state.lock().unwrap().init_request = Some(InitRecord::LogServer {
            start_version: req.start_version,
            recover_at: req.recover_at,
            is_primary: req.is_primary,
            recover_tags: req.recover_tags.clone(),
            locality: req.locality,
            log_router_tags: req.log_router_tags,
        });
        self.hosted.lock().unwrap().push(Arc::clone(&replica));
        Ok(replica.endpoint(self.locality.clone()))
    }

    fn initialize_log_router(
        &self,
        req: InitializeLogRouterRequest,
    ) -> Result<OptionalEndpoint, ReplicaError> {
        let replica = Replica::new(0);
        replica.state.lock().unwrap().init_request = Some(InitRecord::LogRouter {
            router_tag: req.router_tag,
            start_version: req.start_version,
            locality: req.locality,
        });
        self.hosted.lock().unwrap().push(Arc::clone(&replica));
        Ok(replica.endpoint(self.locality.clone()))
    }
}

pub fn zone(name: &str) -> LocalityData {
    LocalityData::for_zone("dc1", name, "m0")
}

pub fn test_config() -> Config {
    Config {
        pop_batch_delay_ms: 20,
        router_pop_batch_delay_ms: 0,
        replica_timeout_ms: 100,
        ..Config::default()
    }
}

/// A single-zone-per-replica local set descriptor over `replicas`.
pub fn set_config(
    replicas: &[Arc<Replica>],
    replication_factor: usize,
    write_anti_quorum: usize,
    locality: TagLocality,
    has_best_policy: bool,
    start_version: u64,
) -> LogSetConfig {
    let localities: Vec<LocalityData> =
        (0..replicas.len()).map(|i| zone(&format!("z{i}"))).collect();
    LogSetConfig {
        servers: replicas
            .iter()
            .zip(&localities)
            .map(|(replica, locality)| replica.endpoint(locality.clone()))
            .collect(),
        routers: Vec::new(),
        localities,
        replication_factor,
        write_anti_quorum,
        policy: ReplicationPolicy::across_zones(replication_factor).unwrap(),
        is_local: true,
        has_best_policy,
        locality,
        start_version: Version::new(start_version),
    }
}

pub fn system_config(sets: Vec<LogSetConfig>, old: Vec<OldLogSetsConfig>) -> LogSystemConfig {
    LogSystemConfig {
        sets,
        old,
        log_router_tags: 0,
        expected_log_sets: 1,
        recruitment_id: None,
        stopped: false,
    }
}

/// The persisted shape of a single-set cluster, for epoch-end tests.
pub fn core_state(replicas: &[Arc<Replica>], replication_factor: usize, write_anti_quorum: usize) -> CoreState {
    let localities: Vec<LocalityData> =
        (0..replicas.len()).map(|i| zone(&format!("z{i}"))).collect();
    CoreState {
        log_sets: vec![CoreLogSet {
            servers: replicas.iter().map(|r| r.id).collect(),
            localities: localities.clone(),
            replication_factor,
            write_anti_quorum,
            policy: ReplicationPolicy::across_zones(replication_factor).unwrap(),
            is_local: true,
            has_best_policy: true,
            locality: TagLocality::new(0),
            start_version: Version::ZERO,
        }],
        old: Vec::new(),
        log_router_tags: 0,
    }
}

pub fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !cond() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(cond(), "timed out waiting for {what}");
}
