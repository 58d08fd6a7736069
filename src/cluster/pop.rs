//! Pop coalescing: watermark advancement batched per `(replica, tag)`.
//!
//! Each key gets one background sender that sleeps a small batch delay, then
//! sends the latest watermark. Data pops wait a second to batch; router pops
//! go out immediately because routers hold only a few seconds of data.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error};

use crate::cluster::cell::{Shutdown, TaskSet};
use crate::cluster::interface::{PopRequest, ReplicaError, ReplicaId, ServerCell};
use crate::cluster::log_system::LogSystem;
use crate::core::{Tag, TagLocality, Version};

#[derive(Clone, Copy, Debug)]
pub(crate) struct PopEntry {
    pub up_to: Version,
    pub known_committed: Version,
}

/// Outstanding watermarks keyed by `(replica, tag)`, shared with the sender
/// threads.
pub(crate) type PopTable = Arc<Mutex<BTreeMap<(ReplicaId, Tag), PopEntry>>>;

impl LogSystem {
    /// Advance the durable watermark for `tag`: messages at or below `up_to`
    /// may be discarded by the receiving replicas.
    ///
    /// Router tags (`REMOTE_LOG` locality) pop the routers of sets whose
    /// locality equals `pop_locality`, across current and historical
    /// generations. All other tags require `pop_locality == INVALID` and pop
    /// every replica of every current set.
    pub fn pop(&self, up_to: Version, tag: Tag, known_committed: Version, pop_locality: TagLocality) {
        if up_to == Version::ZERO {
            return;
        }
        if tag.locality == TagLocality::REMOTE_LOG {
            self.pop_log_router(up_to, tag, known_committed, pop_locality);
            return;
        }
        debug_assert_eq!(pop_locality, TagLocality::INVALID);
        for set in self.current_sets() {
            for cell in &set.servers {
                self.schedule_pop(cell, tag, up_to, known_committed, self.config().pop_batch_delay());
            }
        }
    }

    fn pop_log_router(
        &self,
        up_to: Version,
        tag: Tag,
        known_committed: Version,
        pop_locality: TagLocality,
    ) {
        let delay = self.config().router_pop_batch_delay();
        for set in self.current_sets() {
            if set.locality == pop_locality {
                for cell in set.routers() {
                    self.schedule_pop(&cell, tag, up_to, known_committed, delay);
                }
            }
        }
        for old in self.old_generations() {
            for set in old.log_sets() {
                if set.locality == pop_locality {
                    for cell in set.routers() {
                        self.schedule_pop(&cell, tag, up_to, known_committed, delay);
                    }
                }
            }
        }
    }

    fn schedule_pop(
        &self,
        cell: &ServerCell,
        tag: Tag,
        up_to: Version,
        known_committed: Version,
        delay: Duration,
    ) {
        let id = cell.get().id;
        let key = (id, tag);
        let table = self.pop_table();
        let mut entries = table.lock().expect("pop table lock poisoned");
        let prev = entries.get(&key).map(|e| e.up_to);
        if prev.map_or(true, |p| p < up_to) {
            entries.insert(
                key,
                PopEntry {
                    up_to,
                    known_committed,
                },
            );
        }
        let first = prev.is_none();
        drop(entries);

        if first {
            spawn_pop_sender(
                self.tasks(),
                Arc::clone(&table),
                Arc::clone(cell),
                key,
                delay,
            );
        }
    }
}

fn spawn_pop_sender(
    tasks: &TaskSet,
    table: PopTable,
    cell: ServerCell,
    key: (ReplicaId, Tag),
    delay: Duration,
) {
    let shutdown = tasks.shutdown().clone();
    tasks.spawn("pop-sender", move || {
        pop_sender_loop(table, cell, key, delay, shutdown);
    });
}

fn pop_sender_loop(
    table: PopTable,
    cell: ServerCell,
    key: (ReplicaId, Tag),
    delay: Duration,
    shutdown: Shutdown,
) {
    let mut last_sent = Version::ZERO;
    loop {
        if shutdown.wait(delay) {
            return;
        }

        let Some(entry) = table
            .lock()
            .expect("pop table lock poisoned")
            .get(&key)
            .copied()
        else {
            return;
        };

        if entry.up_to <= last_sent {
            table.lock().expect("pop table lock poisoned").remove(&key);
            return;
        }

        let endpoint = cell.get();
        let Some(client) = endpoint.client else {
            // Replica gone. Leave the entry in place so no further pops go
            // to it from this instance; the epoch will end or it rejoins.
            return;
        };

        let req = PopRequest {
            up_to: entry.up_to,
            known_committed: entry.known_committed,
            tag: key.1,
        };
        match client.pop(&req) {
            Ok(()) => {
                last_sent = entry.up_to;
            }
            Err(ReplicaError::Cancelled) => return,
            Err(ReplicaError::BrokenPromise) => {
                debug!(replica = %key.0, tag = %key.1, "pop target disappeared");
                return;
            }
            Err(err) => {
                error!(replica = %key.0, tag = %key.1, %err, "pop request failed");
                return;
            }
        }
    }
}
