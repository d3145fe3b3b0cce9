//! Partitioned-log client abstraction.
//!
//! The map core never talks to a concrete bus; it is written against these
//! traits. [`memory`] provides the in-process implementation used for tests
//! and single-process embedding.
//!
//! Offsets are `i64`: they are monotonically increasing and non-negative on
//! the log itself, but callers legitimately compute negative cursors (the
//! recovery probe walks its window below zero before clamping) and the
//! flush protocol uses `-1` as "no boundary yet".

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::core::TopicPartition;

/// One record read from a log partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: TopicPartition,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

/// Records returned by one poll, grouped per partition.
///
/// Partitions iterate in order; records within a partition are in offset
/// order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordBatch {
    by_partition: BTreeMap<TopicPartition, Vec<LogRecord>>,
}

impl RecordBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rec: LogRecord) {
        self.by_partition
            .entry(rec.partition.clone())
            .or_default()
            .push(rec);
    }

    pub fn is_empty(&self) -> bool {
        self.by_partition.is_empty()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &TopicPartition> {
        self.by_partition.keys()
    }

    pub fn records(&self, part: &TopicPartition) -> &[LogRecord] {
        self.by_partition.get(part).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn into_iter_partitions(self) -> impl Iterator<Item = (TopicPartition, Vec<LogRecord>)> {
        self.by_partition.into_iter()
    }
}

/// Cancels an in-flight [`LogConsumer::poll`] from another thread.
///
/// The woken poll (or the next one) fails with [`LogError::WokenUp`].
pub trait ConsumerWaker: Send + Sync {
    fn wakeup(&self);
}

/// Consumer side of a partitioned log.
///
/// Mirrors the narrow surface the workers need: manual assignment and
/// seeking, blocking polls, position and end-offset queries. `end_offsets`
/// may transiently under-report what is actually committed; callers must
/// validate against companion partitions instead of trusting it as a
/// strict upper bound.
pub trait LogConsumer {
    fn assign(&mut self, parts: &[TopicPartition]) -> Result<(), LogError>;

    fn assignment(&self) -> Vec<TopicPartition>;

    fn seek(&mut self, part: &TopicPartition, offset: i64) -> Result<(), LogError>;

    fn seek_to_beginning(&mut self, part: &TopicPartition) -> Result<(), LogError>;

    /// Blocks up to `timeout` for records on the assigned partitions.
    /// An empty batch is a legal result.
    fn poll(&mut self, timeout: Duration) -> Result<RecordBatch, LogError>;

    /// The offset of the next record this consumer would read.
    fn position(&self, part: &TopicPartition) -> Result<i64, LogError>;

    fn end_offsets(
        &self,
        parts: &[TopicPartition],
    ) -> Result<BTreeMap<TopicPartition, i64>, LogError>;

    /// A handle that cancels this consumer's polls; safe to call from any
    /// thread while the consumer itself stays single-threaded.
    fn waker(&self) -> Arc<dyn ConsumerWaker>;
}

/// Producer side of a partitioned log. Shared across workers.
///
/// `send` returns the offset the record landed at. The ops worker ignores
/// it (flush requests are fire-and-forget); the flush worker stamps it
/// into flush notifications.
pub trait LogProducer: Send + Sync {
    fn send(
        &self,
        topic: &str,
        partition: u32,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<i64, LogError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LogError {
    /// A waker fired; the current or next poll was cancelled.
    #[error("poll woken up")]
    WokenUp,
    #[error("consumer not assigned to {0}")]
    NotAssigned(TopicPartition),
    #[error("unknown topic or partition: {0}")]
    UnknownPartition(TopicPartition),
    #[error("log transport: {0}")]
    Transport(String),
}

impl LogError {
    pub fn is_wakeup(&self) -> bool {
        matches!(self, LogError::WokenUp)
    }
}

/// End offset of a single partition.
pub fn end_offset<C: LogConsumer + ?Sized>(
    consumer: &C,
    part: &TopicPartition,
) -> Result<i64, LogError> {
    let offsets = consumer.end_offsets(std::slice::from_ref(part))?;
    offsets
        .get(part)
        .copied()
        .ok_or_else(|| LogError::UnknownPartition(part.clone()))
}

/// Whether the consumer's position has reached the partition's end offset.
pub fn is_end_position<C: LogConsumer + ?Sized>(
    consumer: &C,
    part: &TopicPartition,
) -> Result<bool, LogError> {
    Ok(consumer.position(part)? >= end_offset(consumer, part)?)
}
