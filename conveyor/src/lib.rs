//! Bounded concurrent pipeline execution engine.
//!
//! A [`pipeline::Pipeline`] runs typed tasks through an ordered list of stages. Each stage is a
//! pool of concurrent workers reading from a bounded input queue and writing into the input queue
//! of the next stage, so a slow stage slows down everything upstream of it instead of buffering
//! without limit. Stages can be throttled with a token bucket and capped in the number of
//! transforms running at once. A single cancellation token stops every worker and wakes every
//! blocked operation.
//!
//! ```no_run
//! use config::shared::{PipelineConfig, StageConfig};
//! use conveyor::pipeline::PipelineBuilder;
//!
//! # async fn run() -> conveyor::error::ConveyorResult<()> {
//! let mut pipeline = PipelineBuilder::<u32, _>::new(PipelineConfig::default())
//!     .stage(StageConfig::new(4), |x: u32| async move { Ok(x * 2) })
//!     .stage(StageConfig::new(1), |x: u32| async move { Ok(x.to_string()) })
//!     .build()?;
//!
//! let mut results = pipeline.results();
//! pipeline.start()?;
//!
//! let source = pipeline.source();
//! tokio::spawn(async move { source.feed(futures::stream::iter(0..100)).await });
//!
//! while let Some(result) = results.next().await {
//!     println!("{}: {:?}", result.seq, result.outcome);
//! }
//!
//! let stats = pipeline.wait().await?;
//! assert_eq!(stats.succeeded, 100);
//! # Ok(())
//! # }
//! ```

pub mod concurrency;
pub mod error;
mod macros;
pub mod metrics;
pub mod pipeline;
pub mod stage;
pub mod stats;
pub mod types;
pub mod workers;
