//! Map configuration with normative defaults.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::TopicPartition;

const DEFAULT_DATA_TOPIC: &str = "mirrormap-data";
const DEFAULT_OPS_TOPIC: &str = "mirrormap-ops";
const DEFAULT_FLUSH_TOPIC: &str = "mirrormap-flush";
const DEFAULT_FLUSH_PERIOD_OPS: u32 = 256;
const DEFAULT_FLUSH_QUEUE_WARN_ENTRIES: usize = 10_000;

/// Topic layout and cadence knobs shared by the workers.
///
/// `data_topic` is compacted (key to latest value, null value is a
/// tombstone); `ops_topic` is the uncompacted op log; `flush_topic` carries
/// flush requests, one partition per data partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub data_topic: String,
    pub ops_topic: String,
    pub flush_topic: String,

    /// One flush per this many ops per partition; also the scan stride of
    /// the recovery probe. Must be positive.
    pub flush_period_ops: u32,

    /// Flush queue size at which the queue starts warning about an absent
    /// or lagging flush worker. The queue never drops entries.
    pub flush_queue_warn_entries: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            data_topic: DEFAULT_DATA_TOPIC.to_string(),
            ops_topic: DEFAULT_OPS_TOPIC.to_string(),
            flush_topic: DEFAULT_FLUSH_TOPIC.to_string(),
            flush_period_ops: DEFAULT_FLUSH_PERIOD_OPS,
            flush_queue_warn_entries: DEFAULT_FLUSH_QUEUE_WARN_ENTRIES,
        }
    }
}

impl MapConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_period_ops == 0 {
            return Err(ConfigError::ZeroFlushPeriod);
        }
        for (name, topic) in [
            ("data_topic", &self.data_topic),
            ("ops_topic", &self.ops_topic),
            ("flush_topic", &self.flush_topic),
        ] {
            if topic.is_empty() {
                return Err(ConfigError::EmptyTopic(name));
            }
        }
        if self.data_topic == self.ops_topic
            || self.data_topic == self.flush_topic
            || self.ops_topic == self.flush_topic
        {
            return Err(ConfigError::TopicsNotDistinct);
        }
        Ok(())
    }

    pub fn data_partition(&self, partition: u32) -> TopicPartition {
        TopicPartition::new(self.data_topic.clone(), partition)
    }

    pub fn ops_partition(&self, partition: u32) -> TopicPartition {
        TopicPartition::new(self.ops_topic.clone(), partition)
    }

    pub fn flush_partition(&self, partition: u32) -> TopicPartition {
        TopicPartition::new(self.flush_topic.clone(), partition)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("flush_period_ops must be positive")]
    ZeroFlushPeriod,
    #[error("{0} must not be empty")]
    EmptyTopic(&'static str),
    #[error("data, ops and flush topics must be distinct")]
    TopicsNotDistinct,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MapConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_flush_period_rejected() {
        let config = MapConfig {
            flush_period_ops: 0,
            ..MapConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroFlushPeriod));
    }

    #[test]
    fn colliding_topics_rejected() {
        let config = MapConfig {
            ops_topic: DEFAULT_DATA_TOPIC.to_string(),
            ..MapConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::TopicsNotDistinct));
    }
}
