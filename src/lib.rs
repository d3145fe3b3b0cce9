#![forbid(unsafe_code)]

//! Replicated in-memory key-value map backed by partitioned append-only
//! logs.
//!
//! Authoritative state lives in three aligned logs on a message bus: a
//! compacted `data` log, an append-only `ops` log, and a `flush` control
//! log. Each client tails `ops` to keep a local map replica consistent
//! with its peers, recovers from `data` up to the last flush boundary on
//! startup, and cooperates with flush workers through offset-stamped
//! notifications.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod worker;

pub use error::MapError;
pub type Result<T> = std::result::Result<T, MapError>;

pub use crate::config::{ConfigError, MapConfig};
pub use crate::core::{ClientId, CodecError, OpMessage, TopicPartition};
pub use crate::worker::{
    FlushQueue, FlushWorker, FlushWorkerHandle, MapUpdateHandler, OpsUpdateHandler, OpsWorker,
    OpsWorkerHandle, SharedMap, SteadyHandle, SteadyState,
};
