//! Background workers and the surfaces they share.

pub mod flush;
pub mod flush_queue;
pub mod handler;
pub mod ops;
pub mod steady;

pub use flush::{FlushWorker, FlushWorkerHandle};
pub use flush_queue::{
    CleanReceiver, CleanRequest, CleanSender, FlushBatch, FlushEntry, FlushQueue, clean_channel,
};
pub use handler::{MapUpdateHandler, OpsUpdateHandler, ReceivedUpdate, SharedMap, UpdateError, ValueBox};
pub use ops::{OpsWorker, OpsWorkerHandle};
pub use steady::{SteadyHandle, SteadyLatch, SteadyState};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::core::OpMessage;
use crate::error::MapError;
use crate::log::{ConsumerWaker, LogRecord};

/// Decodes the op message carried by one control or ops record.
pub(crate) fn decode_op(rec: &LogRecord) -> Result<OpMessage, MapError> {
    let Some(value) = rec.value.as_ref() else {
        return Err(MapError::Codec {
            partition: rec.partition.clone(),
            offset: rec.offset,
            reason: "record without value".to_string(),
        });
    };
    OpMessage::decode(value).map_err(|err| MapError::codec(&rec.partition, rec.offset, err))
}

/// A running worker thread: shutdown flag, the wakers that cancel its
/// blocking polls, and the join handle.
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    wakers: Vec<Arc<dyn ConsumerWaker>>,
    join: Option<JoinHandle<Result<(), MapError>>>,
}

impl WorkerHandle {
    pub(crate) fn spawn<F>(
        name: String,
        wakers: Vec<Arc<dyn ConsumerWaker>>,
        run: F,
    ) -> Result<Self, MapError>
    where
        F: FnOnce(Arc<AtomicBool>) -> Result<(), MapError> + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || run(flag))
            .map_err(|err| MapError::Thread(err.to_string()))?;
        Ok(Self {
            shutdown,
            wakers,
            join: Some(join),
        })
    }

    /// Requests shutdown, wakes any blocked poll, and joins the thread.
    /// Returns the worker's terminal result; cancellation is not an error.
    pub fn stop(mut self) -> Result<(), MapError> {
        self.signal();
        self.join_inner()
    }

    fn signal(&self) {
        self.shutdown.store(true, Ordering::Release);
        for waker in &self.wakers {
            waker.wakeup();
        }
    }

    fn join_inner(&mut self) -> Result<(), MapError> {
        match self.join.take() {
            Some(join) => join
                .join()
                .unwrap_or_else(|_| Err(MapError::Thread("worker panicked".to_string()))),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.signal();
        }
    }
}
