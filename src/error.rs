use thiserror::Error;

use crate::core::{CodecError, TopicPartition};
use crate::log::LogError;
use crate::worker::UpdateError;

/// Terminal error of a worker.
///
/// The same value is observed through the steady latch and returned from
/// the worker thread, so every variant carries owned, cloneable data.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum MapError {
    /// The data partition holds less than a flush notification claims was
    /// committed. Unrecoverable inconsistency.
    #[error(
        "recovery corrupted: data partition {partition} end offset {end_offset} \
         at or below flush boundary {flush_offset_data}"
    )]
    RecoveryCorrupted {
        partition: TopicPartition,
        end_offset: i64,
        flush_offset_data: i64,
    },

    #[error(transparent)]
    Log(#[from] LogError),

    /// Op message codec failure; `offset` is `-1` on the produce side.
    #[error("op message codec failed at {partition} offset {offset}: {reason}")]
    Codec {
        partition: TopicPartition,
        offset: i64,
        reason: String,
    },

    #[error(transparent)]
    Apply(#[from] UpdateError),

    #[error("worker thread: {0}")]
    Thread(String),
}

impl MapError {
    pub(crate) fn codec(partition: &TopicPartition, offset: i64, err: CodecError) -> Self {
        MapError::Codec {
            partition: partition.clone(),
            offset,
            reason: err.to_string(),
        }
    }

    /// Whether this error only means the worker was asked to stop.
    /// Cancellation exits the worker cleanly and leaves the steady latch
    /// untouched.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MapError::Log(err) if err.is_wakeup())
    }
}

pub type Result<T> = std::result::Result<T, MapError>;
