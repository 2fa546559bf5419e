//! Shared configuration types for conveyor pipelines.

mod base;
mod pipeline;
mod rate_limit;
mod stage;

pub use base::ValidationError;
pub use pipeline::PipelineConfig;
pub use rate_limit::RateLimitConfig;
pub use stage::StageConfig;
