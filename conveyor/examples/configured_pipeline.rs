//! Runs a two stage pipeline configured from `conveyor/configuration`.
//!
//! The first stage simulates a rate limited remote call, the second one scores its output. Set
//! `CONVEYOR_PROFILE` to layer a profile file on top of `base.yaml`, and `RUST_LOG` to tune the
//! log output.

use std::path::Path;
use std::time::Duration;

use config::load::load_config_from;
use config::profile::Profile;
use config::shared::PipelineConfig;
use conveyor::conveyor_error;
use conveyor::error::ErrorKind;
use conveyor::pipeline::PipelineBuilder;
use rand::Rng;
use telemetry::metrics::init_metrics_handle;
use telemetry::tracing::init_tracing;
use tracing::{info, warn};

const TASKS: u64 = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("configured-pipeline")?;
    let metrics_handle = init_metrics_handle()?;

    let configuration_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("configuration");
    let config: PipelineConfig = load_config_from(&configuration_dir, Profile::load()?)?;
    info!(stages = config.stages.len(), "loaded pipeline configuration");

    let mut pipeline = PipelineBuilder::<u64, _>::new(config)
        .configured_stage(|id: u64| async move {
            let latency = rand::thread_rng().gen_range(5..50);
            tokio::time::sleep(Duration::from_millis(latency)).await;

            if id % 37 == 0 {
                return Err(conveyor_error!(
                    ErrorKind::TaskFailed,
                    "Remote call failed",
                    format!("record {id} is unavailable")
                ));
            }

            Ok((id, latency))
        })
        .configured_stage(|(id, latency): (u64, u64)| async move {
            // Slow records exceed the stage timeout.
            tokio::time::sleep(Duration::from_millis(latency * 5)).await;
            Ok(format!("record {id} scored {}", 1_000 / (latency + 1)))
        })
        .build()?;

    let mut results = pipeline.results();
    pipeline.start()?;

    let source = pipeline.source();
    let producer = tokio::spawn(async move { source.feed(futures::stream::iter(0..TASKS)).await });

    while let Some(result) = results.next().await {
        match result.outcome {
            Ok(scored) => info!(seq = result.seq, "{scored}"),
            Err(err) => warn!(seq = result.seq, stage = result.stage, error = %err, "task failed"),
        }
    }

    let submitted = producer.await??;
    let stats = pipeline.wait().await?;

    info!(
        submitted,
        succeeded = stats.succeeded,
        failed = stats.failed,
        cancelled = stats.cancelled,
        duration_ms = stats.duration.as_millis() as u64,
        "pipeline finished"
    );
    for stage in &stats.stages {
        info!(
            stage = %stage.name,
            succeeded = stage.succeeded,
            failed = stage.failed,
            cancelled = stage.cancelled,
            "stage statistics"
        );
    }

    println!("{}", metrics_handle.render());

    Ok(())
}
