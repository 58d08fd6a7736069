//! Tags: `(locality, id)` destination selectors for log messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Placement class of a tag or a log set.
///
/// Non-negative values name data centers; the reserved negatives route
/// auxiliary streams.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagLocality(i8);

impl TagLocality {
    /// Matches any set locality.
    pub const SPECIAL: TagLocality = TagLocality(-1);
    /// Tags consumed by log routers.
    pub const LOG_ROUTER: TagLocality = TagLocality(-2);
    /// Tags addressed to remote log sets through routers.
    pub const REMOTE_LOG: TagLocality = TagLocality(-3);
    /// Compatibility locality from upgraded clusters; matches anything.
    pub const UPGRADED: TagLocality = TagLocality(-4);
    /// No locality; satellite sets and unset fields carry this.
    pub const INVALID: TagLocality = TagLocality(-99);

    pub const fn new(value: i8) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i8 {
        self.0
    }

    pub fn is_reserved(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Debug for TagLocality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TagLocality::SPECIAL => write!(f, "special"),
            TagLocality::LOG_ROUTER => write!(f, "log-router"),
            TagLocality::REMOTE_LOG => write!(f, "remote-log"),
            TagLocality::UPGRADED => write!(f, "upgraded"),
            TagLocality::INVALID => write!(f, "invalid"),
            TagLocality(v) => write!(f, "dc{v}"),
        }
    }
}

/// Destination selector for mutations within the log stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub locality: TagLocality,
    pub id: u16,
}

impl Tag {
    /// The transaction-subsystem tag, tolerated at end of history.
    pub const TXS: Tag = Tag {
        locality: TagLocality::SPECIAL,
        id: 1,
    };

    pub const fn new(locality: TagLocality, id: u16) -> Self {
        Self { locality, id }
    }

    pub const fn log_router(id: u16) -> Self {
        Self {
            locality: TagLocality::LOG_ROUTER,
            id,
        }
    }

    pub const fn remote_log(id: u16) -> Self {
        Self {
            locality: TagLocality::REMOTE_LOG,
            id,
        }
    }

    /// Whether a set with `set_locality` can serve as the best read source
    /// for this tag. Special and upgraded localities match everything, on
    /// either side.
    pub fn matches_set_locality(self, set_locality: TagLocality) -> bool {
        set_locality == self.locality
            || self.locality == TagLocality::SPECIAL
            || set_locality == TagLocality::SPECIAL
            || set_locality == TagLocality::UPGRADED
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.locality, self.id)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.locality.get(), self.id)
    }
}
