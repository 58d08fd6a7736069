//! The log system control plane: replica handles, sets, cursors, the
//! push/pop paths, and the epoch lifecycle.

pub mod cell;
pub mod failure;
pub mod interface;
pub mod log_set;
pub mod log_system;
pub mod peek;
pub mod pop;
pub mod push;
pub mod recovery;
pub mod recruit;
pub mod snapshot;
#[cfg(test)]
pub(crate) mod testutil;

pub use cell::{Notifier, ObservableCell, Shutdown, TaskSet};
pub use failure::FailureObserver;
pub use interface::{
    server_cell, CommitRequest, DebugId, InitializeLogRouterRequest, InitializeLogServerRequest,
    LockReply, LogMessage, LogServerClient, OptionalEndpoint, PeekReply, PeekRequest, PopRequest,
    RecruitmentId, RejoinReply, RejoinRequest, ReplicaError, ReplicaId, ServerCell, StoreType,
    WorkerClient,
};
pub use log_set::{LogSet, LogSetError, LogSetParams};
pub use log_system::{LogSystem, OldGeneration, PhaseState};
pub use peek::{Cursor, PeekError};
pub use push::{PushData, PushError};
pub use recovery::{
    epoch_end, get_durable_version, EpochEndHandle, LogLockInfo, RecoveryError,
};
pub use recruit::{
    new_epoch, DatabaseConfig, NewEpochRequest, Recruits, RemoteRecruits, TierConfig,
};
pub use snapshot::{
    from_log_system_config, from_old_log_system_config, CoreLogSet, CoreState, LogSetConfig,
    LogSystemConfig, LogsValue, LogsValueEntry, OldCoreState, OldLogSetsConfig, SnapshotError,
};
