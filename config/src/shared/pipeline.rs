use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::{StageConfig, ValidationError};

/// Configuration for a conveyor pipeline.
///
/// Holds the capacity of the terminal output queue and an optional global task timeout. The
/// source queue is the input queue of the first stage and is sized by its `queue_capacity`.
/// `stages` may describe the stages up front so they can be paired positionally with
/// transforms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Capacity of the terminal output queue read by the caller.
    #[serde(default = "default_capacity")]
    pub output_capacity: usize,
    /// Optional deadline, in milliseconds from submission, applied to every task.
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
    /// Stage settings in pipeline order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Default capacity of the terminal output queue.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Returns the global task timeout, if configured.
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    /// Validates pipeline settings and every listed stage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.task_timeout_ms == Some(0) {
            return Err(ValidationError::Zero {
                field: "task_timeout_ms".to_string(),
            });
        }

        for (index, stage) in self.stages.iter().enumerate() {
            stage
                .validate()
                .map_err(|err| err.nested(&format!("stages[{index}]")))?;
        }

        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_capacity: default_capacity(),
            task_timeout_ms: None,
            stages: Vec::new(),
        }
    }
}

impl Config for PipelineConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

fn default_capacity() -> usize {
    PipelineConfig::DEFAULT_CAPACITY
}
