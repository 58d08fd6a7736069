//! One replica group of the log system.

use std::sync::Mutex;

use thiserror::Error;

use crate::cluster::interface::{server_cell, OptionalEndpoint, ServerCell};
use crate::core::{LocalityData, LocalityGroup, ReplicationPolicy, Tag, TagLocality, Version};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogSetError {
    #[error("replication factor {replication_factor} out of range for {servers} servers")]
    ReplicationFactor {
        replication_factor: usize,
        servers: usize,
    },

    #[error("write anti-quorum {anti_quorum} out of range for {servers} servers")]
    AntiQuorum { anti_quorum: usize, servers: usize },

    #[error(
        "quorum intersection violated: ({servers} - {replication_factor}) + {anti_quorum} \
         must be < {replication_factor}"
    )]
    QuorumIntersection {
        servers: usize,
        replication_factor: usize,
        anti_quorum: usize,
    },

    #[error("{localities} localities for {servers} servers")]
    LocalityCount { localities: usize, servers: usize },
}

/// Construction parameters for a [`LogSet`].
#[derive(Clone)]
pub struct LogSetParams {
    pub endpoints: Vec<OptionalEndpoint>,
    pub localities: Vec<LocalityData>,
    pub replication_factor: usize,
    pub write_anti_quorum: usize,
    pub policy: ReplicationPolicy,
    pub locality: TagLocality,
    pub is_local: bool,
    pub has_best_policy: bool,
    pub start_version: Version,
}

/// One replica group: ordered replicas, write anti-quorum W, replication
/// factor R, declarative policy, per-replica localities, set-level locality
/// tag, start version, and log-router children.
#[derive(Debug)]
pub struct LogSet {
    pub servers: Vec<ServerCell>,
    routers: Mutex<Vec<ServerCell>>,
    pub localities: Vec<LocalityData>,
    pub replication_factor: usize,
    pub write_anti_quorum: usize,
    pub policy: ReplicationPolicy,
    pub locality: TagLocality,
    pub is_local: bool,
    pub has_best_policy: bool,
    pub start_version: Version,
}

impl LogSet {
    pub fn new(params: LogSetParams) -> Result<Self, LogSetError> {
        let servers = params.endpoints.len();
        if servers > 0 {
            if params.replication_factor < 1 || params.replication_factor > servers {
                return Err(LogSetError::ReplicationFactor {
                    replication_factor: params.replication_factor,
                    servers,
                });
            }
            if params.write_anti_quorum >= servers {
                return Err(LogSetError::AntiQuorum {
                    anti_quorum: params.write_anti_quorum,
                    servers,
                });
            }
            if (servers - params.replication_factor) + params.write_anti_quorum
                >= params.replication_factor
            {
                return Err(LogSetError::QuorumIntersection {
                    servers,
                    replication_factor: params.replication_factor,
                    anti_quorum: params.write_anti_quorum,
                });
            }
        }
        if params.localities.len() != servers {
            return Err(LogSetError::LocalityCount {
                localities: params.localities.len(),
                servers,
            });
        }

        Ok(Self {
            servers: params.endpoints.into_iter().map(server_cell).collect(),
            routers: Mutex::new(Vec::new()),
            localities: params.localities,
            replication_factor: params.replication_factor,
            write_anti_quorum: params.write_anti_quorum,
            policy: params.policy,
            locality: params.locality,
            is_local: params.is_local,
            has_best_policy: params.has_best_policy,
            start_version: params.start_version,
        })
    }

    /// Rebuild a set from already-validated state (a persisted core state or
    /// a public descriptor) without re-checking the quorum invariants.
    pub(crate) fn new_unchecked(params: LogSetParams) -> Self {
        Self {
            servers: params.endpoints.into_iter().map(server_cell).collect(),
            routers: Mutex::new(Vec::new()),
            localities: params.localities,
            replication_factor: params.replication_factor,
            write_anti_quorum: params.write_anti_quorum,
            policy: params.policy,
            locality: params.locality,
            is_local: params.is_local,
            has_best_policy: params.has_best_policy,
            start_version: params.start_version,
        }
    }

    /// A placeholder set carrying only routers for a historical locality.
    pub fn router_only(locality: TagLocality, start_version: Version) -> Self {
        Self {
            servers: Vec::new(),
            routers: Mutex::new(Vec::new()),
            localities: Vec::new(),
            replication_factor: 1,
            write_anti_quorum: 0,
            policy: ReplicationPolicy::One,
            locality,
            is_local: false,
            has_best_policy: false,
            start_version,
        }
    }

    pub fn has_servers(&self) -> bool {
        !self.servers.is_empty()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn routers(&self) -> Vec<ServerCell> {
        self.routers.lock().expect("router lock poisoned").clone()
    }

    pub fn has_routers(&self) -> bool {
        !self.routers.lock().expect("router lock poisoned").is_empty()
    }

    pub fn set_routers(&self, routers: Vec<ServerCell>) {
        *self.routers.lock().expect("router lock poisoned") = routers;
    }

    pub fn clear_routers(&self) {
        self.routers.lock().expect("router lock poisoned").clear();
    }

    /// The single canonical replica for `tag`, when this set has a best
    /// policy.
    pub fn best_location_for(&self, tag: Tag) -> Option<usize> {
        if self.has_best_policy && !self.servers.is_empty() {
            Some(tag.id as usize % self.servers.len())
        } else {
            None
        }
    }

    /// Read quorum size: enough replicas that any write quorum intersects.
    pub fn read_quorum(&self) -> usize {
        self.servers.len() + 1 - self.replication_factor
    }

    /// Replica indices that must receive a message for `tag`: the best
    /// location first (when one exists), then further replicas in ring order
    /// until the accumulated localities satisfy the policy.
    pub fn push_locations_for(&self, tag: Tag) -> Vec<usize> {
        let n = self.servers.len();
        if n == 0 {
            return Vec::new();
        }
        let start = tag.id as usize % n;
        let mut chosen = Vec::new();
        let mut group = LocalityGroup::new();
        for step in 0..n {
            let idx = (start + step) % n;
            chosen.push(idx);
            group.add(self.localities[idx].clone());
            if group.validate(&self.policy) {
                break;
            }
        }
        chosen
    }

    /// Append flat push locations for `tags`, offset by `base` into the
    /// system-wide replica array the push path walks.
    pub fn get_push_locations(&self, tags: &[Tag], base: usize, out: &mut Vec<usize>) {
        for &tag in tags {
            for idx in self.push_locations_for(tag) {
                let flat = base + idx;
                if !out.contains(&flat) {
                    out.push(flat);
                }
            }
        }
    }

    pub fn server_ids(&self) -> Vec<crate::cluster::interface::ReplicaId> {
        self.servers.iter().map(|cell| cell.get().id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Version;

    fn endpoints(n: usize) -> Vec<OptionalEndpoint> {
        (0..n)
            .map(|_| {
                OptionalEndpoint::known(
                    crate::cluster::interface::ReplicaId::random(),
                    LocalityData::new(),
                )
            })
            .collect()
    }

    fn localities(zones: &[&str]) -> Vec<LocalityData> {
        zones
            .iter()
            .map(|z| LocalityData::for_zone("dc1", z, "m"))
            .collect()
    }

    fn params(n: usize, r: usize, w: usize) -> LogSetParams {
        let zones: Vec<String> = (0..n).map(|i| format!("z{i}")).collect();
        let zone_refs: Vec<&str> = zones.iter().map(String::as_str).collect();
        LogSetParams {
            endpoints: endpoints(n),
            localities: localities(&zone_refs),
            replication_factor: r,
            write_anti_quorum: w,
            policy: ReplicationPolicy::across_zones(r).unwrap(),
            locality: TagLocality::new(0),
            is_local: true,
            has_best_policy: true,
            start_version: Version::ZERO,
        }
    }

    #[test]
    fn quorum_intersection_is_enforced() {
        // N=3, R=2, W=1: (3-2)+1 = 2 >= 2, no intersection guarantee.
        let err = LogSet::new(params(3, 2, 1)).unwrap_err();
        assert!(matches!(err, LogSetError::QuorumIntersection { .. }));

        // N=3, R=3, W=0 and N=3, R=3, W=1 are fine; W=3 is not.
        assert!(LogSet::new(params(3, 3, 0)).is_ok());
        assert!(LogSet::new(params(3, 3, 2)).is_ok());
        let err = LogSet::new(params(3, 3, 3)).unwrap_err();
        assert!(matches!(err, LogSetError::AntiQuorum { .. }));
    }

    #[test]
    fn locality_count_must_match_servers() {
        let mut bad = params(3, 3, 0);
        bad.localities.pop();
        let err = LogSet::new(bad).unwrap_err();
        assert!(matches!(err, LogSetError::LocalityCount { .. }));
    }

    #[test]
    fn best_location_hashes_by_tag_id() {
        let set = LogSet::new(params(3, 3, 0)).unwrap();
        let tag = Tag::new(TagLocality::new(0), 7);
        assert_eq!(set.best_location_for(tag), Some(7 % 3));

        let mut no_best = params(3, 3, 0);
        no_best.has_best_policy = false;
        let set = LogSet::new(no_best).unwrap();
        assert_eq!(set.best_location_for(tag), None);
    }

    #[test]
    fn push_locations_cover_the_policy() {
        // Three distinct zones, policy requires two: the best location plus
        // one more replica in ring order.
        let mut p = params(3, 3, 0);
        p.policy = ReplicationPolicy::across_zones(2).unwrap();
        p.replication_factor = 3;
        let set = LogSet::new(p).unwrap();
        let locations = set.push_locations_for(Tag::new(TagLocality::new(0), 1));
        assert_eq!(locations, vec![1, 2]);
    }

    #[test]
    fn flat_push_locations_are_offset_and_deduped() {
        let mut p = params(3, 3, 0);
        p.policy = ReplicationPolicy::across_zones(1).unwrap();
        let set = LogSet::new(p).unwrap();
        let mut out = Vec::new();
        let tag = Tag::new(TagLocality::new(0), 0);
        set.get_push_locations(&[tag, tag], 10, &mut out);
        assert_eq!(out, vec![10]);
    }
}
