//! RuntimeConfig - 実行時設定
//!
//! JSON から読み込めるように serde の default を全項目に付けています。
//!
//! ```json
//! {
//!   "workers": 8,
//!   "request_timeouts": { "kind": "polling", "interval_ms": 20 },
//!   "transaction_timeouts": { "kind": "blocking" }
//! }
//! ```

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::timeout::{
    BlockingTimeoutProcessor, PollingTimeoutProcessor, TimeoutProcessor, TimeoutProcessorError,
};

/// Which timeout processor implementation to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeoutProcessorConfig {
    /// Dedicated thread sleeping until the next deadline.
    #[default]
    Blocking,
    /// Tokio task checking every `interval_ms`.
    Polling {
        #[serde(default = "default_poll_interval_ms")]
        interval_ms: u64,
    },
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl TimeoutProcessorConfig {
    pub fn start<E>(
        self,
        name: &str,
    ) -> Result<Arc<dyn TimeoutProcessor<E>>, TimeoutProcessorError>
    where
        E: Eq + Hash + Clone + Send + Sync + 'static,
    {
        let processor: Arc<dyn TimeoutProcessor<E>> = match self {
            TimeoutProcessorConfig::Blocking => Arc::new(BlockingTimeoutProcessor::start(name)?),
            TimeoutProcessorConfig::Polling { interval_ms } => Arc::new(
                PollingTimeoutProcessor::start(name, Duration::from_millis(interval_ms))?,
            ),
        };
        Ok(processor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker tasks running requests.
    pub workers: usize,
    pub request_timeouts: TimeoutProcessorConfig,
    pub transaction_timeouts: TimeoutProcessorConfig,
    /// How many timed-out transaction references are remembered for error reporting.
    pub timed_out_history: usize,
    /// How long a graceful shutdown waits for workers to drain.
    pub shutdown_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            request_timeouts: TimeoutProcessorConfig::Blocking,
            transaction_timeouts: TimeoutProcessorConfig::Blocking,
            timed_out_history: 1024,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
    }

    #[test]
    fn processor_kind_is_tagged() {
        let config = RuntimeConfig::from_json(
            r#"{ "workers": 2, "request_timeouts": { "kind": "polling" } }"#,
        )
        .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(
            config.request_timeouts,
            TimeoutProcessorConfig::Polling { interval_ms: 50 }
        );
        assert_eq!(config.transaction_timeouts, TimeoutProcessorConfig::Blocking);
    }

    #[test]
    fn unknown_processor_kind_is_rejected() {
        let parsed = RuntimeConfig::from_json(r#"{ "request_timeouts": { "kind": "wheel" } }"#);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn both_kinds_start() {
        let blocking = TimeoutProcessorConfig::Blocking.start::<u32>("a").unwrap();
        let polling = TimeoutProcessorConfig::Polling { interval_ms: 5 }
            .start::<u32>("b")
            .unwrap();
        assert_eq!(blocking.name(), "a");
        assert_eq!(polling.name(), "b");
        blocking.shutdown();
        polling.shutdown();
    }
}
