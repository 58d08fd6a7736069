//! Per-replica presence tracking.
//!
//! One monitor thread per replica handle drives a shared `failed` flag from
//! the endpoint's failure stream; any confirmed failure is also surfaced on
//! the observer's channel, which the owner treats as subsystem-fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::cluster::cell::TaskSet;
use crate::cluster::interface::{ReplicaError, ReplicaId, ServerCell};
use crate::config::Config;

pub struct FailureObserver {
    tx: Sender<ReplicaId>,
    rx: Receiver<ReplicaId>,
}

impl Default for FailureObserver {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl FailureObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start monitoring `cell`; the returned flag is true while the replica
    /// is absent or failed. A rejoin that replaces the endpoint clears it.
    pub fn watch(&self, cell: ServerCell, tasks: &TaskSet, config: &Config) -> Arc<AtomicBool> {
        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        let tx = self.tx.clone();
        let shutdown = tasks.shutdown().clone();
        let window = config.replica_timeout();
        tasks.spawn("failure-monitor", move || {
            while !shutdown.is_triggered() {
                let seen = cell.generation();
                let endpoint = cell.get();
                match endpoint.client {
                    Some(client) => match client.wait_failure(window) {
                        Ok(()) => continue,
                        Err(ReplicaError::Cancelled) => break,
                        Err(err) => {
                            debug!(replica = %endpoint.id, %err, "replica failure observed");
                            flag.store(true, Ordering::SeqCst);
                            let _ = tx.send(endpoint.id);
                            wait_for_change(&cell, seen, &shutdown);
                            flag.store(false, Ordering::SeqCst);
                        }
                    },
                    None => {
                        flag.store(true, Ordering::SeqCst);
                        wait_for_change(&cell, seen, &shutdown);
                        flag.store(false, Ordering::SeqCst);
                    }
                }
            }
        });
        failed
    }

    /// Report a failure observed elsewhere (e.g. a broken commit promise).
    pub fn report(&self, replica: ReplicaId) {
        let _ = self.tx.send(replica);
    }

    pub fn failures(&self) -> Receiver<ReplicaId> {
        self.rx.clone()
    }

    /// Block until any watched replica fails, or `timeout` elapses.
    pub fn wait_any_failure(&self, timeout: Duration) -> Option<ReplicaId> {
        self.rx.recv_timeout(timeout).ok()
    }
}

fn wait_for_change(cell: &ServerCell, seen: u64, shutdown: &crate::cluster::cell::Shutdown) {
    while !shutdown.is_triggered() {
        if cell.wait_change(seen, Duration::from_millis(200)) {
            return;
        }
    }
}
