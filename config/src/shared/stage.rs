use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{RateLimitConfig, ValidationError};

/// Configuration of a single pipeline stage.
///
/// A stage runs `workers` concurrent workers that pull tasks from an input queue holding at
/// most `queue_capacity` items. Admission can additionally be throttled by a token bucket
/// (`rate_limit`) and by a cap on in-flight transforms (`max_in_flight`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StageConfig {
    /// Human readable name used in logs and metrics. Defaults to `stage-{index}`.
    #[serde(default)]
    pub name: Option<String>,
    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the stage input queue. Zero means direct hand-off between producer and worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Optional token bucket limiting the rate at which workers admit tasks.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Optional cap on the number of tasks being transformed at the same time.
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    /// Optional timeout, in milliseconds, applied to each transform call.
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
}

impl StageConfig {
    /// Default number of workers per stage.
    pub const DEFAULT_WORKERS: usize = 1;

    /// Default input queue capacity.
    pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

    /// Largest accepted `max_in_flight`, the permit limit of the tokio semaphore enforcing it.
    pub const MAX_IN_FLIGHT: usize = usize::MAX >> 3;

    /// Creates a stage configuration with `workers` workers and default settings otherwise.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Returns the per-task transform timeout, if configured.
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    /// Validates stage settings.
    ///
    /// Worker count, in-flight cap and timeout must be non-zero and the rate limit, if any,
    /// must be valid. The in-flight cap is bounded by [`StageConfig::MAX_IN_FLIGHT`]. A zero
    /// queue capacity is accepted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::Zero {
                field: "workers".to_string(),
            });
        }

        match self.max_in_flight {
            Some(0) => {
                return Err(ValidationError::Zero {
                    field: "max_in_flight".to_string(),
                });
            }
            Some(max_in_flight) if max_in_flight > Self::MAX_IN_FLIGHT => {
                return Err(ValidationError::InvalidFieldValue {
                    field: "max_in_flight".to_string(),
                    constraint: format!(
                        "must be at most {}, got {max_in_flight}",
                        Self::MAX_IN_FLIGHT
                    ),
                });
            }
            _ => {}
        }

        if self.task_timeout_ms == Some(0) {
            return Err(ValidationError::Zero {
                field: "task_timeout_ms".to_string(),
            });
        }

        if let Some(rate_limit) = &self.rate_limit {
            rate_limit
                .validate()
                .map_err(|err| err.nested("rate_limit"))?;
        }

        Ok(())
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: None,
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            rate_limit: None,
            max_in_flight: None,
            task_timeout_ms: None,
        }
    }
}

fn default_workers() -> usize {
    StageConfig::DEFAULT_WORKERS
}

fn default_queue_capacity() -> usize {
    StageConfig::DEFAULT_QUEUE_CAPACITY
}
