//! # Parameter Keys
//!
//! Several layers (and several shims) share one optimizer, so every parameter
//! is registered under a [`ParamKey`]: the identity of the object that owns it
//! plus the parameter's local name. Keys are compared structurally; there is
//! no string prefix to parse.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a parameter owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(pub u64);

impl Id {
    /// Allocate a fresh identity. Never returns the same value twice.
    pub fn next() -> Self {
        Id(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// `(owner, name)` key for optimizer-side parameter state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamKey {
    pub owner: Id,
    pub name: String,
}

impl ParamKey {
    pub fn new(owner: Id, name: impl Into<String>) -> Self {
        Self {
            owner,
            name: name.into(),
        }
    }

    /// The local name if this key belongs to `owner`.
    pub fn name_for(&self, owner: Id) -> Option<&str> {
        (self.owner == owner).then_some(self.name.as_str())
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}
