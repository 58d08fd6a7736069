use thiserror::Error;

use crate::cluster::{
    LogSetError, PeekError, PushError, RecoveryError, ReplicaError, SnapshotError,
};
use crate::core::PolicyError;

/// What an error means for the epoch that produced it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultDomain {
    /// Confined to one replica; a rejoin or the next request may clear it.
    Replica,
    /// The epoch (or the recovery attempt on top of it) cannot continue
    /// as-is; the surrounding system must end it and recover.
    Epoch,
    /// The owning system was dropped mid-operation; not a fault.
    Cancelled,
}

impl FaultDomain {
    /// Replica-scoped faults are absorbed and implicitly retried through
    /// the failure tracker and rejoin path.
    pub fn is_replica_scoped(self) -> bool {
        matches!(self, FaultDomain::Replica)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the canonical module errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    LogSet(#[from] LogSetError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    Peek(#[from] PeekError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl Error {
    pub fn fault_domain(&self) -> FaultDomain {
        match self {
            // Bad parameters or a bad persisted descriptor: nothing a
            // running epoch can do about either.
            Error::Policy(_) | Error::LogSet(_) | Error::Snapshot(_) => FaultDomain::Epoch,
            Error::Replica(e) => e.fault_domain(),
            Error::Peek(e) => e.fault_domain(),
            Error::Push(e) => e.fault_domain(),
            Error::Recovery(e) => e.fault_domain(),
        }
    }
}
