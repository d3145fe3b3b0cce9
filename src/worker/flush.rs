//! The flush worker.
//!
//! Services `FLUSH_REQUEST` messages for its assigned partitions: collects
//! the requested prefix of the partition's flush queue, materializes it
//! into the compacted data log, publishes a `FLUSH_NOTIFICATION` on the
//! ops log, and cleans the queue. Also drains the clean queue fed by
//! foreign flush notifications.
//!
//! Partition assignment is static configuration; at most one flush worker
//! may own a partition at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::MapConfig;
use crate::core::{ClientId, OP_FLUSH_REQUEST, OpMessage, TopicPartition};
use crate::error::MapError;
use crate::log::{LogConsumer, LogProducer};
use crate::worker::flush_queue::{CleanReceiver, FlushQueue};
use crate::worker::{WorkerHandle, decode_op};

/// Poll timeout on the flush topic; short enough that clean requests are
/// drained promptly between polls.
const FLUSH_POLL_TIMEOUT: Duration = Duration::from_millis(50);

pub struct FlushWorker<C> {
    client_id: ClientId,
    config: MapConfig,
    assigned_parts: BTreeSet<u32>,
    flush_consumer: C,
    producer: Arc<dyn LogProducer>,
    flush_queues: BTreeMap<u32, FlushQueue>,
    clean_queue: CleanReceiver,
}

/// A running flush worker.
pub struct FlushWorkerHandle {
    worker: WorkerHandle,
}

impl FlushWorkerHandle {
    pub fn stop(self) -> Result<(), MapError> {
        self.worker.stop()
    }
}

impl<C> FlushWorker<C>
where
    C: LogConsumer + Send + 'static,
{
    pub fn new(
        client_id: ClientId,
        config: MapConfig,
        flush_consumer: C,
        producer: Arc<dyn LogProducer>,
        flush_queues: Vec<FlushQueue>,
        clean_queue: CleanReceiver,
    ) -> Self {
        let flush_queues: BTreeMap<u32, FlushQueue> = flush_queues
            .into_iter()
            .map(|queue| (queue.partition(), queue))
            .collect();
        let assigned_parts = flush_queues.keys().copied().collect();

        Self {
            client_id,
            config,
            assigned_parts,
            flush_consumer,
            producer,
            flush_queues,
            clean_queue,
        }
    }

    pub fn start(self) -> Result<FlushWorkerHandle, MapError> {
        let wakers = vec![self.flush_consumer.waker()];
        let name = format!(
            "mirrormap-flush-{}-{}",
            self.config.data_topic, self.client_id
        );

        let mut worker = self;
        let handle = WorkerHandle::spawn(name, wakers, move |shutdown| worker.run(&shutdown))?;
        Ok(FlushWorkerHandle { worker: handle })
    }

    fn run(&mut self, shutdown: &AtomicBool) -> Result<(), MapError> {
        match self.do_run(shutdown) {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancellation() => {
                tracing::debug!(client_id = %self.client_id, "flush worker cancelled");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn do_run(&mut self, shutdown: &AtomicBool) -> Result<(), MapError> {
        let parts: Vec<TopicPartition> = self
            .assigned_parts
            .iter()
            .map(|&part| self.config.flush_partition(part))
            .collect();
        self.flush_consumer.assign(&parts)?;

        while !shutdown.load(Ordering::Acquire) {
            self.process_clean_requests();

            let recs = match self.flush_consumer.poll(FLUSH_POLL_TIMEOUT) {
                Ok(recs) => recs,
                Err(err) if err.is_wakeup() => {
                    tracing::debug!(topic = %self.config.flush_topic, "poll woken up");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            for (part, part_recs) in recs.into_iter_partitions() {
                // Requests recur every flush period; only the highest
                // boundary in the batch matters.
                let mut best: Option<OpMessage> = None;
                for rec in &part_recs {
                    let op = decode_op(rec)?;
                    if op.op_type != OP_FLUSH_REQUEST {
                        tracing::warn!(
                            partition = %part,
                            offset = rec.offset,
                            op_type = %char::from(op.op_type),
                            "unexpected op type on flush topic"
                        );
                        continue;
                    }
                    if best
                        .as_ref()
                        .is_none_or(|b| b.flush_offset_ops < op.flush_offset_ops)
                    {
                        best = Some(op);
                    }
                }

                if let Some(req) = best {
                    self.flush_up_to(part.partition, &req)?;
                }
            }
        }
        Ok(())
    }

    fn process_clean_requests(&mut self) {
        while let Ok(req) = self.clean_queue.try_recv() {
            let Some(queue) = self.flush_queues.get(&req.partition.partition) else {
                continue;
            };
            let dropped = queue.clean(req.op.flush_offset_ops);
            tracing::debug!(
                partition = %req.partition,
                flush_offset_ops = req.op.flush_offset_ops,
                dropped,
                "cleaned flush queue from foreign notification"
            );
        }
    }

    /// Materializes the queue prefix up to the requested ops offset into
    /// the data log and announces the new boundary on the ops log.
    fn flush_up_to(&mut self, partition: u32, req: &OpMessage) -> Result<(), MapError> {
        let Some(queue) = self.flush_queues.get(&partition) else {
            tracing::warn!(partition, "flush request for unassigned partition");
            return Ok(());
        };

        let flush_offset_ops = req.flush_offset_ops;
        if queue.max_add_offset() < flush_offset_ops {
            // The local ops worker has not applied up to the requested
            // boundary yet; a later request covers it.
            tracing::debug!(
                partition,
                flush_offset_ops,
                max_add_offset = queue.max_add_offset(),
                "skipping flush request, ops not yet applied locally"
            );
            return Ok(());
        }

        let batch = queue.collect(flush_offset_ops);
        if batch.is_empty() {
            tracing::debug!(partition, flush_offset_ops, "nothing to flush");
            return Ok(());
        }

        let mut flush_offset_data = -1;
        for (key, value) in &batch {
            flush_offset_data = self.producer.send(
                &self.config.data_topic,
                partition,
                Some(key.clone()),
                value.clone(),
            )?;
        }

        let note = OpMessage::flush_notification(self.client_id, flush_offset_ops, flush_offset_data);
        let value = note
            .encode()
            .map_err(|err| MapError::codec(&self.config.ops_partition(partition), -1, err))?;
        self.producer
            .send(&self.config.ops_topic, partition, None, Some(value))?;

        queue.clean(flush_offset_ops);
        tracing::debug!(
            partition,
            flush_offset_ops,
            flush_offset_data,
            records = batch.len(),
            "flushed"
        );
        Ok(())
    }
}
