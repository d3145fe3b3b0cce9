//! The per-client ops worker.
//!
//! Bootstraps local state from the compacted data log up to the last flush
//! boundary, then tails the ops log and applies every op to the local map.
//! Along the way it triggers flushes on its own ops, forwards foreign
//! flush notifications to the clean queue, and completes the steady latch
//! once it has demonstrably caught up to the ops tail.

use std::collections::{BTreeMap, BTreeSet};
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::MapConfig;
use crate::core::{ClientId, OP_FLUSH_NOTIFICATION, OP_PUT, OP_REMOVE_ANY, OpMessage, TopicPartition};
use crate::error::MapError;
use crate::log::{
    LogConsumer, LogError, LogProducer, LogRecord, RecordBatch, end_offset, is_end_position,
};
use crate::worker::{WorkerHandle, decode_op};
use crate::worker::flush_queue::{CleanRequest, CleanSender, FlushQueue};
use crate::worker::handler::{OpsUpdateHandler, ReceivedUpdate, ValueBox};
use crate::worker::steady::{SteadyHandle, SteadyLatch};

/// Poll timeout while replaying data and probing for flush records.
const LOAD_POLL_TIMEOUT: Duration = Duration::from_millis(1);
/// Poll timeout while catching up to the ops tail.
const OPS_POLL_TIMEOUT: Duration = Duration::from_millis(3);
/// Poll timeout once steady; wide to cut idle spin.
const STEADY_POLL_TIMEOUT: Duration = Duration::from_secs(3);

/// A flush notification found on the ops log, with the offset it sits at.
#[derive(Clone, Debug)]
struct FlushRecordFound {
    offset: i64,
    op: OpMessage,
}

/// Outcome of one probe window scan.
enum FlushSearch {
    Found(FlushRecordFound),
    /// No notification in this window; an earlier window may hold one.
    NotFound,
    /// Searched from offset 0 and found nothing: no flush ever happened.
    NotExist,
}

pub struct OpsWorker<C, H> {
    client_id: ClientId,
    config: MapConfig,
    assigned_parts: BTreeSet<u32>,

    data_consumer: Option<C>,
    ops_consumer: C,
    flush_producer: Arc<dyn LogProducer>,

    flush_period_ops: i64,
    flush_queues: BTreeMap<u32, FlushQueue>,
    clean_queue: CleanSender,
    update_handler: H,

    steady: SteadyLatch,
    end_offsets_ops: Option<BTreeMap<TopicPartition, i64>>,
    max_allowed_steady_lag: i64,
    last_flush_notifications: BTreeMap<TopicPartition, OpMessage>,
}

/// A running ops worker.
pub struct OpsWorkerHandle {
    worker: WorkerHandle,
    steady: SteadyHandle,
}

impl OpsWorkerHandle {
    pub fn steady(&self) -> SteadyHandle {
        self.steady.clone()
    }

    /// Requests shutdown, wakes blocked polls, joins. Cancellation is not
    /// an error; a worker that already failed returns its terminal error.
    pub fn stop(self) -> Result<(), MapError> {
        self.worker.stop()
    }
}

impl<C, H> OpsWorker<C, H>
where
    C: LogConsumer + Send + 'static,
    H: OpsUpdateHandler + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: ClientId,
        config: MapConfig,
        assigned_parts: BTreeSet<u32>,
        data_consumer: C,
        ops_consumer: C,
        flush_producer: Arc<dyn LogProducer>,
        clean_queue: CleanSender,
        update_handler: H,
    ) -> Self {
        let flush_queues = assigned_parts
            .iter()
            .map(|&part| (part, FlushQueue::new(part, config.flush_queue_warn_entries)))
            .collect();
        let flush_period_ops = i64::from(config.flush_period_ops);

        Self {
            client_id,
            config,
            assigned_parts,
            data_consumer: Some(data_consumer),
            ops_consumer,
            flush_producer,
            flush_period_ops,
            flush_queues,
            clean_queue,
            update_handler,
            steady: SteadyLatch::new(),
            end_offsets_ops: None,
            max_allowed_steady_lag: 0,
            last_flush_notifications: BTreeMap::new(),
        }
    }

    pub fn steady_handle(&self) -> SteadyHandle {
        self.steady.handle()
    }

    /// The flush queue of one assigned partition, for sharing with a flush
    /// worker.
    pub fn flush_queue(&self, partition: u32) -> Option<FlushQueue> {
        self.flush_queues.get(&partition).cloned()
    }

    pub fn flush_queues(&self) -> Vec<FlushQueue> {
        self.flush_queues.values().cloned().collect()
    }

    /// Spawns the worker thread and returns its handle.
    pub fn start(self) -> Result<OpsWorkerHandle, MapError> {
        let steady = self.steady.handle();
        let mut wakers = vec![self.ops_consumer.waker()];
        if let Some(data_consumer) = &self.data_consumer {
            wakers.push(data_consumer.waker());
        }
        let name = format!(
            "mirrormap-ops-{}-{}",
            self.config.data_topic, self.client_id
        );

        let mut worker = self;
        let handle = WorkerHandle::spawn(name, wakers, move |shutdown| worker.run(&shutdown))?;

        Ok(OpsWorkerHandle {
            worker: handle,
            steady,
        })
    }

    fn run(&mut self, shutdown: &AtomicBool) -> Result<(), MapError> {
        match self.do_run(shutdown) {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancellation() => {
                tracing::debug!(client_id = %self.client_id, "ops worker cancelled");
                Ok(())
            }
            Err(err) => {
                // No-op if the latch already completed.
                self.steady.fail(err.clone());
                Err(err)
            }
        }
    }

    fn do_run(&mut self, shutdown: &AtomicBool) -> Result<(), MapError> {
        let ops_offsets = self.load_data(shutdown)?;
        self.seek_ops_offsets(&ops_offsets, shutdown)?;
        self.process_ops(shutdown)
    }

    /// Recovers every assigned partition from the compacted data log and
    /// returns the first unflushed ops offset per ops partition. The data
    /// consumer is released afterwards on every path; it is not needed in
    /// steady state.
    fn load_data(
        &mut self,
        shutdown: &AtomicBool,
    ) -> Result<BTreeMap<TopicPartition, i64>, MapError> {
        let Some(mut data_consumer) = self.data_consumer.take() else {
            return Err(MapError::Thread("data consumer already released".to_string()));
        };
        let result = self.load_data_inner(&mut data_consumer, shutdown);
        drop(data_consumer);
        result
    }

    fn load_data_inner(
        &mut self,
        data_consumer: &mut C,
        shutdown: &AtomicBool,
    ) -> Result<BTreeMap<TopicPartition, i64>, MapError> {
        let mut ops_offsets = BTreeMap::new();

        let parts: Vec<u32> = self.assigned_parts.iter().copied().collect();
        for part in parts {
            let data_part = self.config.data_partition(part);
            let ops_part = self.config.ops_partition(part);
            tracing::debug!(partition = %data_part, "loading data");

            let last_flush = self.find_last_flush_record(data_consumer, &data_part, &ops_part)?;

            // + 1 because recovery resumes at the first unflushed ops offset.
            let mut flush_offset_ops = 0;

            match last_flush {
                Some(found) => {
                    flush_offset_ops = found.op.flush_offset_ops + 1;
                    tracing::debug!(
                        partition = %ops_part,
                        offset = found.offset,
                        flush_offset_ops = found.op.flush_offset_ops,
                        flush_offset_data = found.op.flush_offset_data,
                        "found last flush record"
                    );
                    self.load_data_for_partition(
                        data_consumer,
                        &data_part,
                        found.op.flush_offset_data,
                    )?;
                    self.last_flush_notifications.insert(ops_part.clone(), found.op);
                }
                None => {
                    tracing::debug!(partition = %ops_part, "flush record does not exist");
                    let end_offset_data = end_offset(data_consumer, &data_part)?;
                    if end_offset_data > 0 {
                        // Replaying ops from 0 normally re-derives this data,
                        // but a compacted-away prefix would be lost.
                        tracing::warn!(
                            partition = %data_part,
                            end_offset = end_offset_data,
                            "no flush record found for a non-empty data partition"
                        );
                    }
                }
            }

            ops_offsets.insert(ops_part, flush_offset_ops);

            if shutdown.load(Ordering::Acquire) {
                return Err(MapError::Log(LogError::WokenUp));
            }
        }

        Ok(ops_offsets)
    }

    /// Replays `data_part` from the beginning up to and including
    /// `flush_offset_data`, applying each record to the local map.
    fn load_data_for_partition(
        &mut self,
        data_consumer: &mut C,
        data_part: &TopicPartition,
        flush_offset_data: i64,
    ) -> Result<usize, MapError> {
        data_consumer.assign(slice::from_ref(data_part))?;
        data_consumer.seek_to_beginning(data_part)?;

        let mut loaded = 0usize;
        let mut last_offset = -1;

        'outer: loop {
            let recs = data_consumer.poll(LOAD_POLL_TIMEOUT)?;

            if recs.is_empty() {
                let end_offset_data = end_offset(data_consumer, data_part)?;
                tracing::debug!(
                    partition = %data_part,
                    end_offset = end_offset_data,
                    flush_offset_data,
                    loaded,
                    last_offset,
                    "empty poll while loading data"
                );

                // flush_offset_data is inclusive, the end offset is exclusive.
                if end_offset_data <= flush_offset_data {
                    return Err(MapError::RecoveryCorrupted {
                        partition: data_part.clone(),
                        end_offset: end_offset_data,
                        flush_offset_data,
                    });
                }

                if data_consumer.position(data_part)? == end_offset_data {
                    break; // all available data records loaded
                }
            } else {
                for rec in recs.records(data_part) {
                    if rec.offset > flush_offset_data {
                        break 'outer;
                    }

                    loaded += 1;
                    last_offset = rec.offset;
                    tracing::trace!(partition = %data_part, offset = rec.offset, "loading data record");

                    self.apply_data_record(rec)?;

                    if rec.offset == flush_offset_data {
                        break 'outer; // that was the last record we need
                    }
                }
            }
        }

        tracing::debug!(partition = %data_part, loaded, "loaded data records");
        Ok(loaded)
    }

    fn apply_data_record(&mut self, rec: &LogRecord) -> Result<(), MapError> {
        let Some(key) = rec.key.as_ref() else {
            return Err(MapError::Codec {
                partition: rec.partition.clone(),
                offset: rec.offset,
                reason: "data record without key".to_string(),
            });
        };

        let op_type = if rec.value.is_none() {
            OP_REMOVE_ANY
        } else {
            OP_PUT
        };

        let mut out = ValueBox::new();
        self.update_handler.apply_received_update(
            ReceivedUpdate {
                client_id: ClientId::default(),
                op_id: 0,
                op_type,
                key,
                expected_value: None,
                updated_value: rec.value.as_ref(),
                merge_function: None,
            },
            &mut out,
        )?;
        Ok(())
    }

    /// Finds the most recent flush notification on `ops_part` whose data
    /// boundary actually exists on `data_part`. The ops end offset can
    /// under-report transiently, so an invalid candidate walks the window
    /// back by one flush period and retries. `None` means no flush has
    /// ever been published.
    fn find_last_flush_record(
        &mut self,
        data_consumer: &mut C,
        data_part: &TopicPartition,
        ops_part: &TopicPartition,
    ) -> Result<Option<FlushRecordFound>, MapError> {
        self.ops_consumer.assign(slice::from_ref(ops_part))?;
        let mut max_offset = end_offset(&self.ops_consumer, ops_part)?;

        loop {
            match self.try_find_last_flush_record(ops_part, max_offset)? {
                FlushSearch::NotExist => return Ok(None),
                FlushSearch::Found(found) => {
                    if self.is_valid_flush_record(data_consumer, data_part, &found)? {
                        return Ok(Some(found));
                    }
                }
                FlushSearch::NotFound => {}
            }

            // May go negative; the next scan clamps its seek at 0.
            max_offset -= self.flush_period_ops;
        }
    }

    fn is_valid_flush_record(
        &self,
        data_consumer: &C,
        data_part: &TopicPartition,
        found: &FlushRecordFound,
    ) -> Result<bool, MapError> {
        let end_offset_data = end_offset(data_consumer, data_part)?;
        if end_offset_data > found.op.flush_offset_data {
            return Ok(true);
        }

        tracing::warn!(
            partition = %data_part,
            end_offset = end_offset_data,
            flush_offset_ops = found.op.flush_offset_ops,
            flush_offset_data = found.op.flush_offset_data,
            "committed offset not found in data partition"
        );
        Ok(false)
    }

    /// Scans one window of `flush_period_ops` records ending at
    /// `max_offset` and returns the first flush notification in it.
    /// Flushes recur every `flush_period_ops` ops, so a window of that
    /// size must contain one if any exists at or below `max_offset`.
    fn try_find_last_flush_record(
        &mut self,
        ops_part: &TopicPartition,
        max_offset: i64,
    ) -> Result<FlushSearch, MapError> {
        let offset = (max_offset - self.flush_period_ops).max(0);
        tracing::debug!(
            partition = %ops_part,
            seek = offset,
            flush_period_ops = self.flush_period_ops,
            "searching for the last flush notification"
        );
        self.ops_consumer.seek(ops_part, offset)?;

        let mut processed = 0usize;
        let mut found = None;

        'outer: loop {
            let recs = self.ops_consumer.poll(LOAD_POLL_TIMEOUT)?;

            if recs.is_empty() {
                if is_end_position(&self.ops_consumer, ops_part)? {
                    break;
                }
                continue;
            }

            for rec in recs.records(ops_part) {
                processed += 1;
                let op = decode_op(rec)?;

                if op.op_type == OP_FLUSH_NOTIFICATION {
                    found = Some(FlushRecordFound {
                        offset: rec.offset,
                        op,
                    });
                    break 'outer;
                }

                if rec.offset > max_offset {
                    break 'outer;
                }
            }
        }

        tracing::debug!(
            partition = %ops_part,
            processed,
            found = found.is_some(),
            "flush notification search finished"
        );

        match found {
            Some(found) => Ok(FlushSearch::Found(found)),
            None if offset == 0 => Ok(FlushSearch::NotExist),
            None => Ok(FlushSearch::NotFound),
        }
    }

    fn seek_ops_offsets(
        &mut self,
        ops_offsets: &BTreeMap<TopicPartition, i64>,
        shutdown: &AtomicBool,
    ) -> Result<(), MapError> {
        debug_assert_eq!(ops_offsets.len(), self.assigned_parts.len());
        let parts: Vec<TopicPartition> = ops_offsets.keys().cloned().collect();
        self.ops_consumer.assign(&parts)?;

        for (part, &offset) in ops_offsets {
            tracing::debug!(partition = %part, offset, "seek ops consumer");
            self.ops_consumer.seek(part, offset)?;

            if shutdown.load(Ordering::Acquire) {
                return Err(MapError::Log(LogError::WokenUp));
            }
        }
        Ok(())
    }

    fn process_ops(&mut self, shutdown: &AtomicBool) -> Result<(), MapError> {
        let mut poll_timeout = OPS_POLL_TIMEOUT;

        while !shutdown.load(Ordering::Acquire) {
            let recs = match self.ops_consumer.poll(poll_timeout) {
                Ok(recs) => recs,
                Err(err) if err.is_wakeup() => {
                    tracing::debug!(topic = %self.config.ops_topic, "poll woken up");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            if self.process_ops_batch(recs)? {
                tracing::debug!(partitions = ?self.assigned_parts, "steady");
                poll_timeout = STEADY_POLL_TIMEOUT;
            }
        }
        Ok(())
    }

    /// Applies one poll's worth of records. Returns `true` only on the
    /// batch that completes the steady latch.
    fn process_ops_batch(&mut self, recs: RecordBatch) -> Result<bool, MapError> {
        for (part, part_recs) in recs.into_iter_partitions() {
            self.apply_ops_records(&part, &part_recs)?;
        }

        Ok(!self.steady.is_complete() && self.is_actually_steady()? && self.steady.complete())
    }

    /// Applies a consecutive same-partition slice of ops records in offset
    /// order. Every record produces exactly one flush-queue add, in that
    /// same order; a flush request for an offset is sent before any later
    /// record is enqueued.
    fn apply_ops_records(
        &mut self,
        ops_part: &TopicPartition,
        recs: &[LogRecord],
    ) -> Result<(), MapError> {
        let Some(flush_queue) = self.flush_queues.get(&ops_part.partition).cloned() else {
            return Err(LogError::NotAssigned(ops_part.clone()).into());
        };

        let last_index = recs.len().saturating_sub(1);
        let mut out = ValueBox::new();

        for (i, rec) in recs.iter().enumerate() {
            out.clear();
            tracing::trace!(
                partition = %ops_part,
                offset = rec.offset,
                steady = self.steady.is_complete(),
                "applying op"
            );

            let op = decode_op(rec)?;

            let mut updated = false;
            let mut need_clean = false;
            let need_flush = op.client_id == self.client_id
                && rec.offset > 0
                && rec.offset % self.flush_period_ops == 0;

            match rec.key.as_ref() {
                None => {
                    if op.op_type == OP_FLUSH_NOTIFICATION {
                        let old = self.last_flush_notifications.get(ops_part);
                        // Notifications can arrive out of order; ignore the
                        // outdated ones.
                        if old.is_none_or(|old| old.flush_offset_ops < op.flush_offset_ops) {
                            // Someone else flushed the data: our flush queue
                            // holds entries that are already durable.
                            need_clean = op.client_id != self.client_id;
                            tracing::debug!(
                                partition = %ops_part,
                                offset = rec.offset,
                                flush_offset_ops = op.flush_offset_ops,
                                flush_offset_data = op.flush_offset_data,
                                "received flush notification"
                            );
                            self.last_flush_notifications.insert(ops_part.clone(), op.clone());
                        }
                    } else {
                        // Forward compatibility: there may be new message types.
                        tracing::warn!(
                            partition = %ops_part,
                            offset = rec.offset,
                            op_type = %char::from(op.op_type),
                            "unexpected op type"
                        );
                    }
                }
                Some(key) => {
                    updated = self.update_handler.apply_received_update(
                        ReceivedUpdate {
                            client_id: op.client_id,
                            op_id: op.op_id,
                            op_type: op.op_type,
                            key,
                            expected_value: op.expected_value.as_ref(),
                            updated_value: op.updated_value.as_ref(),
                            merge_function: op.merge_function.as_ref(),
                        },
                        &mut out,
                    )?;
                }
            }

            flush_queue.add(
                rec.key.clone(),
                out.get(),
                rec.offset,
                updated,
                need_clean || need_flush || i == last_index,
            );

            if need_flush {
                let last_clean_offset_ops = self
                    .last_flush_notifications
                    .get(ops_part)
                    .map(|last| last.flush_offset_ops)
                    .unwrap_or(-1);
                self.send_flush_request(ops_part.partition, rec.offset, last_clean_offset_ops)?;
            } else if need_clean {
                self.send_clean_request(ops_part, rec, op);
            }
        }

        Ok(())
    }

    fn send_clean_request(&self, ops_part: &TopicPartition, rec: &LogRecord, op: OpMessage) {
        tracing::debug!(partition = %ops_part, offset = rec.offset, "sending clean request");
        // A dropped receiver only means no flush worker is running locally;
        // a remaining one will clean from its own notification stream.
        if self
            .clean_queue
            .send(CleanRequest {
                partition: ops_part.clone(),
                op,
            })
            .is_err()
        {
            tracing::debug!(partition = %ops_part, "clean queue disconnected");
        }
    }

    fn send_flush_request(
        &self,
        partition: u32,
        flush_offset_ops: i64,
        last_clean_offset_ops: i64,
    ) -> Result<(), MapError> {
        tracing::debug!(
            partition,
            flush_offset_ops,
            last_clean_offset_ops,
            "sending flush request"
        );
        let msg = OpMessage::flush_request(self.client_id, flush_offset_ops, last_clean_offset_ops);
        let value = msg
            .encode()
            .map_err(|err| MapError::codec(&self.config.flush_partition(partition), -1, err))?;

        // Fire and forget; acknowledgements are the flush worker's concern.
        self.flush_producer
            .send(&self.config.flush_topic, partition, None, Some(value))?;
        Ok(())
    }

    /// Two-shot steady confirmation.
    ///
    /// The first success must use a freshly fetched tail snapshot with zero
    /// tolerated lag: a restarting single writer expects every op it
    /// produced before start to be applied once start completes. Only after
    /// that bar clears once is `max_allowed_steady_lag` promoted so
    /// ongoing high-throughput streams can still declare steady.
    fn is_actually_steady(&mut self) -> Result<bool, MapError> {
        let mut fresh_end_offsets_fetched = false;

        loop {
            if self.end_offsets_ops.is_none() {
                let parts = self.ops_consumer.assignment();
                self.end_offsets_ops = Some(self.ops_consumer.end_offsets(&parts)?);
                fresh_end_offsets_fetched = true;
            }

            let mut total_lag = 0;
            if let Some(end_offsets) = &self.end_offsets_ops {
                for (part, &end) in end_offsets {
                    total_lag += end - self.ops_consumer.position(part)?;
                }
            }

            if total_lag <= self.max_allowed_steady_lag {
                // Either refresh the offsets and check once more, or clean
                // up before returning true.
                self.end_offsets_ops = None;

                if fresh_end_offsets_fetched {
                    return Ok(true);
                }

                self.max_allowed_steady_lag = self.flush_period_ops;
                continue;
            }

            return Ok(false);
        }
    }
}
