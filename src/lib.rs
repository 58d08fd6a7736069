#![forbid(unsafe_code)]

pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod telemetry;

pub use error::{Error, FaultDomain};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    all_combinations_invalid, LocalityData, LocalityGroup, LocalityKey, PolicyError,
    ReplicationPolicy, Tag, TagLocality, Version,
};

pub use crate::cluster::{
    CommitRequest, CoreState, Cursor, DebugId, EpochEndHandle, InitializeLogRouterRequest,
    InitializeLogServerRequest, LockReply, LogMessage, LogServerClient, LogSet, LogSystem,
    LogSystemConfig, NewEpochRequest, OptionalEndpoint, PeekError, PeekReply, PeekRequest,
    PopRequest, PushData, PushError, RecoveryError, RecruitmentId, RejoinReply, RejoinRequest,
    ReplicaError, ReplicaId, ServerCell, SnapshotError, StoreType, WorkerClient,
};
