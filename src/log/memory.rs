//! In-process log bus.
//!
//! A single-process broker with the same consumer/producer surface as a
//! real bus: manual assignment, seeks, blocking polls with wakeup, and
//! per-partition end offsets. Tests additionally get an end-offset
//! override so the stale-tail quirk of real log clients can be
//! reproduced deterministically.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::core::TopicPartition;
use crate::log::{ConsumerWaker, LogConsumer, LogError, LogProducer, LogRecord, RecordBatch};

const DEFAULT_MAX_POLL_RECORDS: usize = 500;

#[derive(Clone, Default)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BusState>,
    arrived: Condvar,
}

#[derive(Default)]
struct BusState {
    topics: BTreeMap<String, Vec<PartitionState>>,
}

#[derive(Default)]
struct PartitionState {
    records: Vec<StoredRecord>,
    end_offset_override: Option<i64>,
    end_offset_reports: VecDeque<i64>,
}

struct StoredRecord {
    key: Option<Bytes>,
    value: Option<Bytes>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `partitions` empty partitions for `topic`. Idempotent for an
    /// existing topic with the same partition count.
    pub fn create_topic(&self, topic: impl Into<String>, partitions: u32) {
        let mut state = self.lock_state();
        let parts = state.topics.entry(topic.into()).or_default();
        while parts.len() < partitions as usize {
            parts.push(PartitionState::default());
        }
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            shared: Arc::clone(&self.shared),
            assignment: Vec::new(),
            positions: BTreeMap::new(),
            woken: Arc::new(AtomicBool::new(false)),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
        }
    }

    /// Forces `end_offsets` for `part` to report `offset` instead of the
    /// real tail, until cleared with `None`. Reproduces transiently stale
    /// end offsets.
    pub fn set_end_offset_override(&self, part: &TopicPartition, offset: Option<i64>) {
        let mut state = self.lock_state();
        if let Some(p) = state.partition_mut(part) {
            p.end_offset_override = offset;
        }
    }

    /// Queues a one-shot `end_offsets` report for `part`; each queued value
    /// is served to exactly one query before falling back to the override
    /// or the real tail. Lets tests script an end offset that changes
    /// between two consecutive queries.
    pub fn push_end_offset_report(&self, part: &TopicPartition, offset: i64) {
        let mut state = self.lock_state();
        if let Some(p) = state.partition_mut(part) {
            p.end_offset_reports.push_back(offset);
        }
    }

    /// Snapshot of all records currently in `part`, oldest first.
    pub fn records(&self, part: &TopicPartition) -> Vec<LogRecord> {
        let state = self.lock_state();
        let Some(p) = state.partition(part) else {
            return Vec::new();
        };
        p.records
            .iter()
            .enumerate()
            .map(|(offset, rec)| LogRecord {
                partition: part.clone(),
                offset: offset as i64,
                key: rec.key.clone(),
                value: rec.value.clone(),
            })
            .collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.shared.lock_state()
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, BusState> {
        // Poisoning only happens if a holder panicked; the bus state is
        // append-only and stays coherent, so keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BusState {
    fn partition(&self, part: &TopicPartition) -> Option<&PartitionState> {
        self.topics
            .get(&part.topic)
            .and_then(|parts| parts.get(part.partition as usize))
    }

    fn partition_mut(&mut self, part: &TopicPartition) -> Option<&mut PartitionState> {
        self.topics
            .get_mut(&part.topic)
            .and_then(|parts| parts.get_mut(part.partition as usize))
    }

    fn reported_end_offset(&mut self, part: &TopicPartition) -> Result<i64, LogError> {
        let p = self
            .partition_mut(part)
            .ok_or_else(|| LogError::UnknownPartition(part.clone()))?;
        if let Some(report) = p.end_offset_reports.pop_front() {
            return Ok(report);
        }
        Ok(p.end_offset_override.unwrap_or(p.records.len() as i64))
    }
}

#[derive(Clone)]
pub struct MemoryProducer {
    shared: Arc<Shared>,
}

impl LogProducer for MemoryProducer {
    fn send(
        &self,
        topic: &str,
        partition: u32,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<i64, LogError> {
        let mut state = self.shared.lock_state();
        let part = TopicPartition::new(topic, partition);
        let p = state
            .partition_mut(&part)
            .ok_or_else(|| LogError::UnknownPartition(part))?;
        let offset = p.records.len() as i64;
        p.records.push(StoredRecord { key, value });
        drop(state);
        self.shared.arrived.notify_all();
        Ok(offset)
    }
}

pub struct MemoryConsumer {
    shared: Arc<Shared>,
    assignment: Vec<TopicPartition>,
    positions: BTreeMap<TopicPartition, i64>,
    woken: Arc<AtomicBool>,
    max_poll_records: usize,
}

impl MemoryConsumer {
    pub fn set_max_poll_records(&mut self, max: usize) {
        self.max_poll_records = max.max(1);
    }

    fn check_assigned(&self, part: &TopicPartition) -> Result<(), LogError> {
        if self.assignment.contains(part) {
            Ok(())
        } else {
            Err(LogError::NotAssigned(part.clone()))
        }
    }

    fn take_available(&mut self, state: &BusState) -> Result<RecordBatch, LogError> {
        let mut batch = RecordBatch::new();
        let mut taken = 0;

        for part in &self.assignment {
            if taken >= self.max_poll_records {
                break;
            }
            let p = state
                .partition(part)
                .ok_or_else(|| LogError::UnknownPartition(part.clone()))?;
            let position = self.positions.get(part).copied().unwrap_or(0);
            let start = usize::try_from(position).unwrap_or(0);
            let mut offset = position;

            for rec in p.records.iter().skip(start) {
                if taken >= self.max_poll_records {
                    break;
                }
                batch.push(LogRecord {
                    partition: part.clone(),
                    offset,
                    key: rec.key.clone(),
                    value: rec.value.clone(),
                });
                offset += 1;
                taken += 1;
            }
            if offset != position {
                self.positions.insert(part.clone(), offset);
            }
        }

        Ok(batch)
    }
}

impl LogConsumer for MemoryConsumer {
    fn assign(&mut self, parts: &[TopicPartition]) -> Result<(), LogError> {
        {
            let state = self.shared.lock_state();
            for part in parts {
                if state.partition(part).is_none() {
                    return Err(LogError::UnknownPartition(part.clone()));
                }
            }
        }
        self.assignment = parts.to_vec();
        self.positions.retain(|part, _| self.assignment.contains(part));
        for part in &self.assignment {
            self.positions.entry(part.clone()).or_insert(0);
        }
        Ok(())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.clone()
    }

    fn seek(&mut self, part: &TopicPartition, offset: i64) -> Result<(), LogError> {
        self.check_assigned(part)?;
        if offset < 0 {
            return Err(LogError::Transport(format!(
                "negative seek offset {offset} for {part}"
            )));
        }
        self.positions.insert(part.clone(), offset);
        Ok(())
    }

    fn seek_to_beginning(&mut self, part: &TopicPartition) -> Result<(), LogError> {
        self.check_assigned(part)?;
        self.positions.insert(part.clone(), 0);
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<RecordBatch, LogError> {
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock_state();

        loop {
            if self.woken.swap(false, Ordering::AcqRel) {
                return Err(LogError::WokenUp);
            }

            let batch = self.take_available(&state)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(RecordBatch::new());
            }
            let (guard, _timed_out) = shared
                .arrived
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    fn position(&self, part: &TopicPartition) -> Result<i64, LogError> {
        self.check_assigned(part)?;
        Ok(self.positions.get(part).copied().unwrap_or(0))
    }

    fn end_offsets(
        &self,
        parts: &[TopicPartition],
    ) -> Result<BTreeMap<TopicPartition, i64>, LogError> {
        let mut state = self.shared.lock_state();
        let mut offsets = BTreeMap::new();
        for part in parts {
            offsets.insert(part.clone(), state.reported_end_offset(part)?);
        }
        Ok(offsets)
    }

    fn waker(&self) -> Arc<dyn ConsumerWaker> {
        Arc::new(MemoryWaker {
            shared: Arc::clone(&self.shared),
            woken: Arc::clone(&self.woken),
        })
    }
}

struct MemoryWaker {
    shared: Arc<Shared>,
    woken: Arc<AtomicBool>,
}

impl ConsumerWaker for MemoryWaker {
    fn wakeup(&self) {
        self.woken.store(true, Ordering::Release);
        self.shared.arrived.notify_all();
    }
}
