//! Service addresses and shard selection.
//!
//! A [`Router`] is a `(type, id)` pair. An empty string id addresses the type
//! itself. Every router maps to exactly one worker through [`shard`], which is
//! a pure function of the router and the worker count.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Instance part of a router: either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouterId {
    Num(u64),
    Str(String),
}

impl RouterId {
    /// True for the empty string id (type-level address).
    pub fn is_type_level(&self) -> bool {
        matches!(self, RouterId::Str(s) if s.is_empty())
    }
}

impl Default for RouterId {
    fn default() -> Self {
        RouterId::Str(String::new())
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterId::Num(n) => write!(f, "{}", n),
            RouterId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for RouterId {
    fn from(n: u64) -> Self {
        RouterId::Num(n)
    }
}

impl From<&str> for RouterId {
    fn from(s: &str) -> Self {
        RouterId::Str(s.to_string())
    }
}

impl From<String> for RouterId {
    fn from(s: String) -> Self {
        RouterId::Str(s)
    }
}

/// Address of a service instance or a service type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Router {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: RouterId,
}

impl Router {
    pub fn new(kind: impl Into<String>, id: impl Into<RouterId>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Type-level router (empty id).
    pub fn of_type(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: RouterId::default(),
        }
    }

    /// Same type, empty id.
    pub fn to_type_router(&self) -> Self {
        Self::of_type(self.kind.clone())
    }

    pub fn is_type_level(&self) -> bool {
        self.id.is_type_level()
    }
}

impl From<&str> for Router {
    /// `"type"` addresses the type, `"type/id"` a string-id instance.
    fn from(s: &str) -> Self {
        match s.split_once('/') {
            Some((kind, id)) => Router::new(kind, id),
            None => Router::of_type(s),
        }
    }
}

impl fmt::Display for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Shard hash of a router.
///
/// Numeric ids hash to themselves; an empty id hashes the type name; any other
/// id hashes the id string.
pub fn hash_router(router: &Router) -> u64 {
    match &router.id {
        RouterId::Num(n) => *n,
        RouterId::Str(s) if s.is_empty() => hash_str(&router.kind),
        RouterId::Str(s) => hash_str(s),
    }
}

/// 32-bit rolling `h * 31 + unit` over UTF-16 code units, shifted to be
/// non-negative by adding 2^31.
fn hash_str(s: &str) -> u64 {
    let mut hash: i32 = 0;
    for unit in s.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
    }
    (i64::from(hash) + (1_i64 << 31)) as u64
}

/// Index of the worker owning `router` in a pool of `workers`.
pub fn shard(router: &Router, workers: usize) -> usize {
    debug_assert!(workers > 0);
    (hash_router(router) % workers.max(1) as u64) as usize
}
