//! The seam between the workers and the local map.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use thiserror::Error;

use crate::core::{ClientId, OP_PUT, OP_REMOVE_ANY};

/// One keyed op handed to the update handler.
#[derive(Clone, Debug)]
pub struct ReceivedUpdate<'a> {
    pub client_id: ClientId,
    pub op_id: u64,
    pub op_type: u8,
    pub key: &'a Bytes,
    pub expected_value: Option<&'a Bytes>,
    pub updated_value: Option<&'a Bytes>,
    /// Opaque merge-function payload; interpreted by the handler, not the
    /// workers.
    pub merge_function: Option<&'a Bytes>,
}

/// Receives the post-apply value of the touched key; `None` is the
/// tombstone marker.
#[derive(Debug, Default)]
pub struct ValueBox {
    value: Option<Bytes>,
}

impl ValueBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.value = None;
    }

    pub fn set(&mut self, value: Option<Bytes>) {
        self.value = value;
    }

    pub fn get(&self) -> Option<Bytes> {
        self.value.clone()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("update handler: {reason}")]
pub struct UpdateError {
    pub reason: String,
}

impl UpdateError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Applies received ops to the local map.
///
/// Returns `true` iff the op changed local state. `out` receives the
/// post-apply value for forwarding to the flush queue.
pub trait OpsUpdateHandler: Send {
    fn apply_received_update(
        &self,
        update: ReceivedUpdate<'_>,
        out: &mut ValueBox,
    ) -> Result<bool, UpdateError>;
}

/// The local replica of one partitioned map, shared between the owning
/// worker and external readers.
#[derive(Clone, Default)]
pub struct SharedMap {
    inner: Arc<Mutex<BTreeMap<Bytes, Bytes>>>,
}

impl SharedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<Bytes, Bytes> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Bytes, Bytes>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Standard handler over a [`SharedMap`].
///
/// Put with an expected value is conditional: it applies only when the
/// current value matches. Removes are unconditional.
pub struct MapUpdateHandler {
    map: SharedMap,
}

impl MapUpdateHandler {
    pub fn new(map: SharedMap) -> Self {
        Self { map }
    }

    pub fn map(&self) -> &SharedMap {
        &self.map
    }
}

impl OpsUpdateHandler for MapUpdateHandler {
    fn apply_received_update(
        &self,
        update: ReceivedUpdate<'_>,
        out: &mut ValueBox,
    ) -> Result<bool, UpdateError> {
        let mut map = self.map.lock();

        let updated = match update.op_type {
            OP_PUT => {
                let new = update
                    .updated_value
                    .ok_or_else(|| UpdateError::new("put without updated value"))?;
                let current = map.get(update.key);
                if let Some(expected) = update.expected_value
                    && current != Some(expected)
                {
                    false
                } else {
                    let changed = current != Some(new);
                    map.insert(update.key.clone(), new.clone());
                    changed
                }
            }
            OP_REMOVE_ANY => map.remove(update.key).is_some(),
            other => {
                return Err(UpdateError::new(format!(
                    "unsupported keyed op type: {}",
                    char::from(other)
                )));
            }
        };

        out.set(map.get(update.key).cloned());
        Ok(updated)
    }
}
