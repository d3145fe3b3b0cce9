//! Client identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique 64-bit identifier of one client process.
///
/// Stamped on every op the client emits so workers can tell their own
/// records from foreign ones. Rendered in hex, the same form used in
/// worker thread names.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Fresh random id for a starting client process.
    pub fn random() -> Self {
        Self(rand::random::<u64>())
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({:x})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
