//! Replica endpoints and the request/reply surface of the log system.
//!
//! The transport is an external collaborator: it appears here only as the
//! [`LogServerClient`] and [`WorkerClient`] traits plus the message structs
//! they exchange. Each replica handle is an observable cell; the rejoin
//! handler is its single writer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cluster::cell::ObservableCell;
use crate::cluster::snapshot::LogSystemConfig;
use crate::config::Config;
use crate::core::{LocalityData, ReplicationPolicy, Tag, TagLocality, Version};
use crate::error::FaultDomain;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.simple().to_string();
        write!(f, "{}", &text[..8.min(text.len())])
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebugId(Uuid);

impl DebugId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for DebugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecruitmentId(Uuid);

impl RecruitmentId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl fmt::Debug for RecruitmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One tagged message in the stream. `sub` orders messages that share a
/// commit version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMessage {
    pub version: Version,
    pub sub: u32,
    pub tags: Vec<Tag>,
    pub payload: Bytes,
}

#[derive(Clone, Debug)]
pub struct CommitRequest {
    pub prev_version: Version,
    pub version: Version,
    pub known_committed: Version,
    pub messages: Bytes,
    pub debug_id: Option<DebugId>,
}

#[derive(Clone, Debug)]
pub struct PeekRequest {
    pub tag: Tag,
    pub begin: Version,
}

#[derive(Clone, Debug)]
pub struct PeekReply {
    pub messages: Vec<LogMessage>,
    /// First version not covered by this reply.
    pub end: Version,
    pub popped_to: Version,
}

#[derive(Clone, Debug)]
pub struct PopRequest {
    pub up_to: Version,
    pub known_committed: Version,
    pub tag: Tag,
}

#[derive(Clone, Copy, Debug)]
pub struct LockReply {
    /// Exclusive end of the versions this replica holds.
    pub end: Version,
    pub known_committed: Version,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    /// The remote endpoint is gone; its reply promise was dropped.
    #[error("endpoint reply promise broken")]
    BrokenPromise,

    /// The replica was stopped by a newer epoch.
    #[error("log server stopped")]
    Stopped,

    #[error("request timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Io(String),
}

impl ReplicaError {
    pub fn fault_domain(&self) -> FaultDomain {
        match self {
            // The endpoint may come back through rejoin; the next request
            // re-routes on its own.
            ReplicaError::BrokenPromise | ReplicaError::Timeout | ReplicaError::Io(_) => {
                FaultDomain::Replica
            }
            // A stopped replica is proof a newer epoch exists.
            ReplicaError::Stopped => FaultDomain::Epoch,
            ReplicaError::Cancelled => FaultDomain::Cancelled,
        }
    }
}

/// Addressable endpoint of one log replica.
///
/// Every call blocks for at most the transport's own deadline and returns a
/// single reply. Implementations must be safe to call from multiple threads.
pub trait LogServerClient: Send + Sync {
    fn commit(&self, req: &CommitRequest) -> Result<(), ReplicaError>;
    fn peek(&self, req: &PeekRequest) -> Result<PeekReply, ReplicaError>;
    fn pop(&self, req: &PopRequest) -> Result<(), ReplicaError>;
    fn lock(&self) -> Result<LockReply, ReplicaError>;
    fn confirm_running(&self, debug_id: Option<DebugId>) -> Result<(), ReplicaError>;
    fn recovery_finished(&self) -> Result<(), ReplicaError>;

    /// Block for up to `window` while the replica stays healthy. `Ok` means
    /// still alive; an error means the replica failed or the call cannot be
    /// made.
    fn wait_failure(&self, window: Duration) -> Result<(), ReplicaError>;
}

/// A replica slot: the id is always known, the endpoint only while the
/// replica is reachable.
#[derive(Clone)]
pub struct OptionalEndpoint {
    pub id: ReplicaId,
    pub locality: LocalityData,
    pub address: Option<String>,
    pub client: Option<Arc<dyn LogServerClient>>,
}

impl OptionalEndpoint {
    /// A slot whose replica has not been recruited yet.
    pub fn vacant() -> Self {
        Self {
            id: ReplicaId::nil(),
            locality: LocalityData::new(),
            address: None,
            client: None,
        }
    }

    /// A known id with no reachable endpoint (restored from core state).
    pub fn known(id: ReplicaId, locality: LocalityData) -> Self {
        Self {
            id,
            locality,
            address: None,
            client: None,
        }
    }

    pub fn present(
        id: ReplicaId,
        locality: LocalityData,
        address: impl Into<String>,
        client: Arc<dyn LogServerClient>,
    ) -> Self {
        Self {
            id,
            locality,
            address: Some(address.into()),
            client: Some(client),
        }
    }

    pub fn is_present(&self) -> bool {
        self.client.is_some()
    }
}

impl fmt::Debug for OptionalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionalEndpoint")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("present", &self.is_present())
            .finish()
    }
}

/// Shared, rejoin-refreshable replica handle.
pub type ServerCell = Arc<ObservableCell<OptionalEndpoint>>;

pub fn server_cell(endpoint: OptionalEndpoint) -> ServerCell {
    Arc::new(ObservableCell::new(endpoint))
}

/// Durable store backing a recruited log server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    Memory,
    Ssd,
}

#[derive(Clone)]
pub struct InitializeLogServerRequest {
    pub recruitment_id: RecruitmentId,
    pub store_type: StoreType,
    pub recover_from: LogSystemConfig,
    pub recover_at: Version,
    pub known_committed: Version,
    pub epoch: u64,
    pub locality: TagLocality,
    pub remote_tag: Option<Tag>,
    pub is_primary: bool,
    pub all_tags: Vec<Tag>,
    pub start_version: Version,
    pub log_router_tags: usize,
    pub recover_tags: Vec<Tag>,
}

#[derive(Clone)]
pub struct InitializeLogRouterRequest {
    pub recovery_count: u64,
    pub router_tag: Tag,
    pub start_version: Version,
    pub log_localities: Vec<LocalityData>,
    pub log_policy: ReplicationPolicy,
    pub has_best_policy: bool,
    pub locality: TagLocality,
}

/// A worker process that can host a new log server or log router.
pub trait WorkerClient: Send + Sync {
    fn locality(&self) -> LocalityData;

    fn initialize_log_server(
        &self,
        req: InitializeLogServerRequest,
    ) -> Result<OptionalEndpoint, ReplicaError>;

    fn initialize_log_router(
        &self,
        req: InitializeLogRouterRequest,
    ) -> Result<OptionalEndpoint, ReplicaError>;
}

/// Reply to a rejoining log server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejoinReply {
    /// Interface installed (or superseded); keep running.
    Acknowledged,
    /// Unknown or obsolete; shut down.
    Release,
}

/// Inbound rejoin from a log server that reconnected with a fresh endpoint.
pub struct RejoinRequest {
    pub endpoint: OptionalEndpoint,
    pub reply: Sender<RejoinReply>,
}

/// Retry a replica call once the endpoint appears, waiting up to
/// `config.replica_timeout()` for an absent endpoint to be refreshed.
pub(crate) fn with_endpoint<T>(
    cell: &ServerCell,
    config: &Config,
    call: impl Fn(&Arc<dyn LogServerClient>) -> Result<T, ReplicaError>,
) -> Result<T, ReplicaError> {
    let seen = cell.generation();
    let endpoint = cell.get();
    match endpoint.client {
        Some(client) => call(&client),
        None => {
            if cell.wait_change(seen, config.replica_timeout()) {
                let endpoint = cell.get();
                match endpoint.client {
                    Some(client) => call(&client),
                    None => Err(ReplicaError::BrokenPromise),
                }
            } else {
                Err(ReplicaError::BrokenPromise)
            }
        }
    }
}
