use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Token bucket parameters for admitting tasks into a stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Maximum number of tokens the bucket holds, i.e. the largest admitted burst.
    pub capacity: u32,
    /// Tokens added to the bucket per second.
    pub refill_rate_per_second: f64,
}

impl RateLimitConfig {
    pub fn new(capacity: u32, refill_rate_per_second: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_second,
        }
    }

    /// Validates the bucket parameters.
    ///
    /// The capacity must be non-zero and the refill rate positive and finite, otherwise a drained
    /// bucket would never admit another task.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.capacity == 0 {
            return Err(ValidationError::Zero {
                field: "capacity".to_string(),
            });
        }

        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second <= 0.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "refill_rate_per_second".to_string(),
                constraint: format!(
                    "must be a positive finite number, got {}",
                    self.refill_rate_per_second
                ),
            });
        }

        Ok(())
    }
}
