#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use mirrormap::config::MapConfig;
use mirrormap::core::{ClientId, OpMessage};
use mirrormap::log::LogProducer;
use mirrormap::log::memory::{MemoryConsumer, MemoryLog};
use mirrormap::worker::{
    CleanReceiver, FlushQueue, MapUpdateHandler, OpsWorker, SharedMap, clean_channel,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// One in-process bus with the three aligned topics.
pub struct Cluster {
    pub bus: MemoryLog,
    pub config: MapConfig,
}

impl Cluster {
    pub fn new(partitions: u32, flush_period_ops: u32) -> Self {
        let config = MapConfig {
            data_topic: "data".to_string(),
            ops_topic: "ops".to_string(),
            flush_topic: "flush".to_string(),
            flush_period_ops,
            ..MapConfig::default()
        };
        config.validate().unwrap();

        let bus = MemoryLog::new();
        bus.create_topic(config.data_topic.clone(), partitions);
        bus.create_topic(config.ops_topic.clone(), partitions);
        bus.create_topic(config.flush_topic.clone(), partitions);

        Self { bus, config }
    }

    /// Builds an unstarted ops worker over a fresh map replica. The clean
    /// queue receiver is returned for inspection or for a flush worker.
    pub fn ops_worker(
        &self,
        client_id: ClientId,
        parts: impl IntoIterator<Item = u32>,
        map: SharedMap,
    ) -> (OpsWorker<MemoryConsumer, MapUpdateHandler>, CleanReceiver) {
        let (clean_tx, clean_rx) = clean_channel();
        let worker = OpsWorker::new(
            client_id,
            self.config.clone(),
            parts.into_iter().collect::<BTreeSet<u32>>(),
            self.bus.consumer(),
            self.bus.consumer(),
            Arc::new(self.bus.producer()),
            clean_tx,
            MapUpdateHandler::new(map),
        );
        (worker, clean_rx)
    }

    pub fn publish_op(&self, partition: u32, key: Option<&str>, op: &OpMessage) -> i64 {
        self.bus
            .producer()
            .send(
                &self.config.ops_topic,
                partition,
                key.map(bytes),
                Some(op.encode().unwrap()),
            )
            .unwrap()
    }

    pub fn publish_data(&self, partition: u32, key: &str, value: Option<&str>) -> i64 {
        self.bus
            .producer()
            .send(
                &self.config.data_topic,
                partition,
                Some(bytes(key)),
                value.map(bytes),
            )
            .unwrap()
    }

    /// Decoded op messages currently on one flush partition.
    pub fn flush_requests(&self, partition: u32) -> Vec<OpMessage> {
        self.bus
            .records(&self.config.flush_partition(partition))
            .iter()
            .map(|rec| OpMessage::decode(rec.value.as_ref().unwrap()).unwrap())
            .collect()
    }
}

pub fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Call at the top of a test and run with `RUST_LOG=mirrormap=trace` to
/// watch the workers.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Polls `cond` until it holds or the timeout elapses.
pub fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// The expected map after folding `(key, value-or-remove)` pairs in order.
pub fn fold(entries: &[(&str, Option<&str>)]) -> std::collections::BTreeMap<Bytes, Bytes> {
    let mut map = std::collections::BTreeMap::new();
    for (key, value) in entries {
        match value {
            Some(value) => {
                map.insert(bytes(key), bytes(value));
            }
            None => {
                map.remove(&bytes(key));
            }
        }
    }
    map
}

/// Keeps a clone of `queues` alive for post-hoc assertions.
pub fn queue_for(queues: &[FlushQueue], partition: u32) -> FlushQueue {
    queues
        .iter()
        .find(|queue| queue.partition() == partition)
        .cloned()
        .expect("flush queue for partition")
}
