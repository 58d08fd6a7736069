//! Declarative replication policies over locality multisets.
//!
//! A policy validates when a group of localities covers enough distinct
//! failure domains. The evaluator is pure; the cluster layer parameterises
//! its quorum decisions on it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::locality::{LocalityData, LocalityKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("replication count must be > 0, got {count}")]
    ZeroCount { count: usize },
}

/// Declarative predicate over a multiset of [`LocalityData`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationPolicy {
    /// At least one entry.
    One,
    /// At least `count` entries with distinct values of `key`, each subgroup
    /// satisfying `inner`.
    Across {
        count: usize,
        key: LocalityKey,
        inner: Box<ReplicationPolicy>,
    },
    /// All sub-policies hold.
    And(Vec<ReplicationPolicy>),
}

impl ReplicationPolicy {
    /// `Across(count, zoneid, One)` — the common data-center policy.
    pub fn across_zones(count: usize) -> Result<Self, PolicyError> {
        if count == 0 {
            return Err(PolicyError::ZeroCount { count });
        }
        Ok(ReplicationPolicy::Across {
            count,
            key: LocalityKey::zone_id(),
            inner: Box::new(ReplicationPolicy::One),
        })
    }

    fn validate_entries(&self, entries: &[&LocalityData]) -> bool {
        match self {
            ReplicationPolicy::One => !entries.is_empty(),
            ReplicationPolicy::Across { count, key, inner } => {
                let mut distinct: Vec<(&str, Vec<&LocalityData>)> = Vec::new();
                for entry in entries {
                    let Some(value) = entry.get(key) else {
                        continue;
                    };
                    match distinct.iter_mut().find(|(v, _)| *v == value) {
                        Some((_, group)) => group.push(entry),
                        None => distinct.push((value, vec![entry])),
                    }
                }
                distinct
                    .iter()
                    .filter(|(_, group)| inner.validate_entries(group))
                    .count()
                    >= *count
            }
            ReplicationPolicy::And(parts) => {
                parts.iter().all(|part| part.validate_entries(entries))
            }
        }
    }
}

/// Multiset of localities accumulated while counting responders.
#[derive(Clone, Debug, Default)]
pub struct LocalityGroup {
    entries: Vec<LocalityData>,
}

impl LocalityGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<LocalityData>) -> Self {
        Self { entries }
    }

    pub fn add(&mut self, entry: LocalityData) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn validate(&self, policy: &ReplicationPolicy) -> bool {
        let refs: Vec<&LocalityData> = self.entries.iter().collect();
        policy.validate_entries(&refs)
    }

    fn validate_with(&self, policy: &ReplicationPolicy, extra: &[&LocalityData]) -> bool {
        let mut refs: Vec<&LocalityData> = self.entries.iter().collect();
        refs.extend_from_slice(extra);
        policy.validate_entries(&refs)
    }
}

/// True iff no `k`-subset of `available`, unioned with `failed`, validates
/// `policy`.
///
/// The durable-version gate treats a validating combination as unsafe: those
/// `k` replicas may hold unacknowledged writes that together with the failed
/// set cover a commit the responders cannot see.
pub fn all_combinations_invalid(
    failed: &LocalityGroup,
    policy: &ReplicationPolicy,
    available: &[LocalityData],
    k: usize,
) -> bool {
    if k == 0 {
        return !failed.validate(policy);
    }
    if available.len() < k {
        return true;
    }
    let mut indices: Vec<usize> = (0..k).collect();
    loop {
        let combo: Vec<&LocalityData> = indices.iter().map(|&i| &available[i]).collect();
        if failed.validate_with(policy, &combo) {
            return false;
        }
        // Advance to the next k-combination in lexicographic order.
        let mut pos = k;
        loop {
            if pos == 0 {
                return true;
            }
            pos -= 1;
            if indices[pos] != pos + available.len() - k {
                break;
            }
        }
        indices[pos] += 1;
        for later in pos + 1..k {
            indices[later] = indices[later - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(name: &str) -> LocalityData {
        LocalityData::for_zone("dc1", name, "m0")
    }

    #[test]
    fn across_zones_counts_distinct_zones() {
        let policy = ReplicationPolicy::across_zones(2).unwrap();
        let mut group = LocalityGroup::new();
        group.add(zone("z1"));
        group.add(zone("z1"));
        assert!(!group.validate(&policy));
        group.add(zone("z2"));
        assert!(group.validate(&policy));
    }

    #[test]
    fn one_policy_needs_any_entry() {
        let mut group = LocalityGroup::new();
        assert!(!group.validate(&ReplicationPolicy::One));
        group.add(zone("z1"));
        assert!(group.validate(&ReplicationPolicy::One));
    }

    #[test]
    fn and_policy_requires_all_parts() {
        let policy = ReplicationPolicy::And(vec![
            ReplicationPolicy::across_zones(2).unwrap(),
            ReplicationPolicy::One,
        ]);
        let mut group = LocalityGroup::new();
        group.add(zone("z1"));
        assert!(!group.validate(&policy));
        group.add(zone("z2"));
        assert!(group.validate(&policy));
    }

    #[test]
    fn entries_missing_the_key_do_not_count() {
        let policy = ReplicationPolicy::across_zones(1).unwrap();
        let mut group = LocalityGroup::new();
        group.add(LocalityData::new());
        assert!(!group.validate(&policy));
    }

    #[test]
    fn combinations_detect_a_validating_union() {
        let policy = ReplicationPolicy::across_zones(3).unwrap();
        let mut failed = LocalityGroup::new();
        failed.add(zone("z1"));
        failed.add(zone("z2"));

        // One more distinct zone completes the policy: some 1-combination
        // validates, so the scan reports not-all-invalid.
        let available = vec![zone("z1"), zone("z3")];
        assert!(!all_combinations_invalid(&failed, &policy, &available, 1));

        // Only duplicate zones available: no 1-combination validates.
        let available = vec![zone("z1"), zone("z2")];
        assert!(all_combinations_invalid(&failed, &policy, &available, 1));
    }

    #[test]
    fn combinations_with_k_larger_than_available() {
        let policy = ReplicationPolicy::across_zones(2).unwrap();
        let failed = LocalityGroup::new();
        assert!(all_combinations_invalid(&failed, &policy, &[zone("z1")], 2));
    }

    #[test]
    fn zero_k_checks_the_failed_group_alone() {
        let policy = ReplicationPolicy::across_zones(1).unwrap();
        let mut failed = LocalityGroup::new();
        assert!(all_combinations_invalid(&failed, &policy, &[], 0));
        failed.add(zone("z1"));
        assert!(!all_combinations_invalid(&failed, &policy, &[], 0));
    }
}
