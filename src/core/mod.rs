//! Pure domain types: versions, tags, localities, replication policy.
//!
//! Nothing here touches a thread or an endpoint; the cluster layer builds
//! on these.

pub mod locality;
pub mod policy;
pub mod tag;
pub mod version;

pub use locality::{LocalityData, LocalityKey};
pub use policy::{all_combinations_invalid, LocalityGroup, PolicyError, ReplicationPolicy};
pub use tag::{Tag, TagLocality};
pub use version::Version;
