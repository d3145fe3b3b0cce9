//! Per-partition flush queue and the clean queue.
//!
//! The ops worker appends every applied op to its partition's flush queue;
//! a flush worker later collects a prefix of it into the compacted data
//! log and cleans what was flushed. Multi-producer single-consumer at this
//! interface: ops workers add, one flush worker collects and cleans.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender};

use crate::core::{OpMessage, TopicPartition};

/// A foreign flush notification forwarded to the flush worker so it can
/// drop already-flushed entries from the local queue.
#[derive(Clone, Debug)]
pub struct CleanRequest {
    pub partition: TopicPartition,
    pub op: OpMessage,
}

pub type CleanSender = Sender<CleanRequest>;
pub type CleanReceiver = Receiver<CleanRequest>;

pub fn clean_channel() -> (CleanSender, CleanReceiver) {
    crossbeam::channel::unbounded()
}

/// One buffered map update awaiting flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushEntry {
    pub key: Bytes,
    /// Post-apply value; `None` is a tombstone for the compacted log.
    pub value: Option<Bytes>,
    pub offset: i64,
    /// Marks an offset at which the flush worker should consider acting.
    pub flush_point: bool,
}

/// Ordered buffer of unflushed updates for one partition.
///
/// `add` must be called in offset order; `collect`/`clean` belong to the
/// flush worker. The queue never drops entries (a dropped entry would be
/// missing from the next flush); it warns once per episode when it grows
/// past the configured threshold, which means the flush worker is absent
/// or lagging.
#[derive(Clone)]
pub struct FlushQueue {
    partition: u32,
    warn_entries: usize,
    inner: Arc<Mutex<QueueState>>,
}

#[derive(Debug)]
struct QueueState {
    entries: VecDeque<FlushEntry>,
    max_add_offset: i64,
    clean_offset: i64,
    warned: bool,
}

/// Deduplicated updates collected for one flush, latest value per key.
pub type FlushBatch = BTreeMap<Bytes, Option<Bytes>>;

impl FlushQueue {
    pub fn new(partition: u32, warn_entries: usize) -> Self {
        Self {
            partition,
            warn_entries,
            inner: Arc::new(Mutex::new(QueueState {
                entries: VecDeque::new(),
                max_add_offset: -1,
                clean_offset: -1,
                warned: false,
            })),
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Records one applied op. Every ops record produces exactly one call,
    /// in offset order; only keyed ops that changed state are buffered,
    /// the rest just advance the tracked offsets.
    pub fn add(
        &self,
        key: Option<Bytes>,
        value: Option<Bytes>,
        offset: i64,
        updated: bool,
        flush_point: bool,
    ) {
        let mut state = self.lock();
        debug_assert!(offset > state.max_add_offset, "flush queue add out of order");
        state.max_add_offset = offset;

        if updated && let Some(key) = key {
            state.entries.push_back(FlushEntry {
                key,
                value,
                offset,
                flush_point,
            });
            if state.entries.len() > self.warn_entries && !state.warned {
                state.warned = true;
                tracing::warn!(
                    partition = self.partition,
                    entries = state.entries.len(),
                    threshold = self.warn_entries,
                    "flush queue over threshold, flush worker absent or lagging"
                );
            }
        }
    }

    /// Latest values for all buffered entries with offset at or below
    /// `max_offset`. Entries stay buffered until `clean`.
    pub fn collect(&self, max_offset: i64) -> FlushBatch {
        let state = self.lock();
        let mut batch = FlushBatch::new();
        for entry in state.entries.iter().take_while(|e| e.offset <= max_offset) {
            batch.insert(entry.key.clone(), entry.value.clone());
        }
        batch
    }

    /// Drops all entries with offset at or below `max_offset`. Returns the
    /// number of dropped entries. Idempotent.
    pub fn clean(&self, max_offset: i64) -> usize {
        let mut state = self.lock();
        let mut dropped = 0;
        while state.entries.front().is_some_and(|e| e.offset <= max_offset) {
            state.entries.pop_front();
            dropped += 1;
        }
        if max_offset > state.clean_offset {
            state.clean_offset = max_offset;
        }
        if state.entries.len() <= self.warn_entries {
            state.warned = false;
        }
        dropped
    }

    /// Highest ops offset this queue has seen via `add`, `-1` before the
    /// first add.
    pub fn max_add_offset(&self) -> i64 {
        self.lock().max_add_offset
    }

    pub fn clean_offset(&self) -> i64 {
        self.lock().clean_offset
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Snapshot of the buffered entries, oldest first.
    pub fn entries(&self) -> Vec<FlushEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
