//! Commit fan-out: one batched commit to every local set, each collecting an
//! anti-quorum of acknowledgments.

use bytes::Bytes;
use crossbeam::channel::unbounded;
use thiserror::Error;
use tracing::{error, warn};

use crate::cluster::interface::{CommitRequest, DebugId, ReplicaError};
use crate::cluster::log_system::LogSystem;
use crate::core::Version;
use crate::error::FaultDomain;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    /// A replica's reply promise broke: the log-server quorum is gone.
    #[error("log server failed during commit")]
    LogServerFailed,

    /// A set can no longer reach its anti-quorum.
    #[error("commit quorum unreachable for set {set}")]
    QuorumUnreachable { set: usize },

    #[error("push cancelled")]
    Cancelled,
}

impl PushError {
    pub fn fault_domain(&self) -> FaultDomain {
        match self {
            PushError::LogServerFailed | PushError::QuorumUnreachable { .. } => {
                FaultDomain::Epoch
            }
            PushError::Cancelled => FaultDomain::Cancelled,
        }
    }
}

/// Per-location payload slices, addressed by the monotone location counter
/// advanced over all local sets in iteration order.
#[derive(Clone, Debug, Default)]
pub struct PushData {
    slices: Vec<Bytes>,
}

impl PushData {
    pub fn new(locations: usize) -> Self {
        Self {
            slices: vec![Bytes::new(); locations],
        }
    }

    pub fn set(&mut self, location: usize, payload: Bytes) {
        if location >= self.slices.len() {
            self.slices.resize(location + 1, Bytes::new());
        }
        self.slices[location] = payload;
    }

    pub fn get(&self, location: usize) -> Bytes {
        self.slices.get(location).cloned().unwrap_or_default()
    }
}

impl LogSystem {
    /// Send a batched commit to every replica of every local set and wait
    /// until each set has at least `N - W` acknowledgments.
    ///
    /// A broken reply promise marks the whole push failed (the epoch has
    /// lost a log server); other errors are logged and absorbed as missing
    /// acknowledgments.
    pub fn push(
        &self,
        prev_version: Version,
        version: Version,
        known_committed: Version,
        data: &PushData,
        debug_id: Option<DebugId>,
    ) -> Result<(), PushError> {
        struct SetProgress {
            needed: usize,
            acked: usize,
            outstanding: usize,
        }

        let (tx, rx) = unbounded::<(usize, crate::cluster::interface::ReplicaId, Result<(), ReplicaError>)>();
        let mut sets: Vec<SetProgress> = Vec::new();
        let mut location = 0usize;

        for set in self.local_sets() {
            if !set.has_servers() {
                continue;
            }
            let set_idx = sets.len();
            let n = set.server_count();
            sets.push(SetProgress {
                needed: n - set.write_anti_quorum,
                acked: 0,
                outstanding: n,
            });
            for cell in &set.servers {
                let req = CommitRequest {
                    prev_version,
                    version,
                    known_committed,
                    messages: data.get(location),
                    debug_id,
                };
                location += 1;
                let cell = std::sync::Arc::clone(cell);
                let tx = tx.clone();
                std::thread::spawn(move || {
                    let endpoint = cell.get();
                    let result = match &endpoint.client {
                        Some(client) => client.commit(&req),
                        None => Err(ReplicaError::BrokenPromise),
                    };
                    let _ = tx.send((set_idx, endpoint.id, result));
                });
            }
        }
        drop(tx);

        let mut broken_promise = false;
        while let Ok((set_idx, replica, result)) = rx.recv() {
            let progress = &mut sets[set_idx];
            progress.outstanding -= 1;
            match result {
                Ok(()) => progress.acked += 1,
                Err(ReplicaError::BrokenPromise) => {
                    broken_promise = true;
                    self.failure_observer().report(replica);
                }
                Err(ReplicaError::Cancelled) => return Err(PushError::Cancelled),
                Err(ReplicaError::Stopped) => {
                    // The epoch already ended; recovery will supersede us.
                    warn!(set = set_idx, "commit refused by stopped log server");
                }
                Err(err) => {
                    error!(set = set_idx, %err, "commit request failed");
                }
            }

            if progress.acked + progress.outstanding < progress.needed {
                return if broken_promise {
                    Err(PushError::LogServerFailed)
                } else {
                    Err(PushError::QuorumUnreachable { set: set_idx })
                };
            }
            if sets.iter().all(|s| s.acked >= s.needed) {
                return Ok(());
            }
        }

        if sets.iter().all(|s| s.acked >= s.needed) {
            Ok(())
        } else if broken_promise {
            Err(PushError::LogServerFailed)
        } else {
            Err(PushError::QuorumUnreachable {
                set: sets
                    .iter()
                    .position(|s| s.acked < s.needed)
                    .unwrap_or_default(),
            })
        }
    }
}
