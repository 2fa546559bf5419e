use std::time::Duration;

use config::shared::{PipelineConfig, RateLimitConfig, StageConfig};
use conveyor::pipeline::PipelineBuilder;
use telemetry::tracing::init_test_tracing;
use tokio::time::Instant;

mod common;

use common::{ConcurrencyProbe, collect_results};

#[tokio::test(start_paused = true)]
async fn workers_process_tasks_concurrently() {
    init_test_tracing();

    let task_duration = Duration::from_millis(100);
    let mut pipeline = PipelineBuilder::<u32, _>::new(PipelineConfig::default())
        .stage(
            StageConfig::new(3).with_queue_capacity(16),
            move |x: u32| async move {
                tokio::time::sleep(task_duration).await;
                Ok(x)
            },
        )
        .build()
        .unwrap();
    let results = pipeline.results();

    let source = pipeline.source();
    for x in 0..10 {
        source.submit(x).await.unwrap();
    }
    source.close();

    let started = Instant::now();
    pipeline.start().unwrap();
    let collected = collect_results(results).await;
    let elapsed = started.elapsed();
    let stats = pipeline.wait().await.unwrap();

    // Ten tasks on three workers take four rounds.
    assert_eq!(collected.len(), 10);
    assert!(elapsed >= task_duration * 4, "finished too early: {elapsed:?}");
    assert!(elapsed < task_duration * 5, "finished too late: {elapsed:?}");
    assert_eq!(stats.succeeded, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_run_in_parallel_on_runtime_threads() {
    init_test_tracing();

    // Blocking transforms only overlap when workers run on separate threads.
    let task_duration = Duration::from_millis(100);
    let mut pipeline = PipelineBuilder::<u32, _>::new(PipelineConfig::default())
        .stage(
            StageConfig::new(3).with_queue_capacity(16),
            move |x: u32| async move {
                std::thread::sleep(task_duration);
                Ok(x)
            },
        )
        .build()
        .unwrap();
    let results = pipeline.results();

    let source = pipeline.source();
    for x in 0..10 {
        source.submit(x).await.unwrap();
    }
    source.close();

    let started = Instant::now();
    pipeline.start().unwrap();
    let collected = collect_results(results).await;
    let elapsed = started.elapsed();
    pipeline.wait().await.unwrap();

    // Four rounds of three, far from the ten rounds of a sequential run.
    assert_eq!(collected.len(), 10);
    assert!(elapsed >= task_duration * 4, "finished too early: {elapsed:?}");
    assert!(elapsed < task_duration * 8, "finished too late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn in_flight_cap_limits_concurrent_transforms() {
    init_test_tracing();

    let probe = ConcurrencyProbe::default();
    let transform_probe = probe.clone();
    let mut pipeline = PipelineBuilder::<u32, _>::new(PipelineConfig::default())
        .stage(
            StageConfig::new(6).with_max_in_flight(2),
            move |x: u32| {
                let probe = transform_probe.clone();
                async move {
                    let _guard = probe.enter();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(x)
                }
            },
        )
        .build()
        .unwrap();
    let results = pipeline.results();
    pipeline.start().unwrap();

    let started = Instant::now();
    let source = pipeline.source();
    tokio::spawn(async move { source.feed(futures::stream::iter(0..20)).await });

    let collected = collect_results(results).await;
    let elapsed = started.elapsed();
    pipeline.wait().await.unwrap();

    assert_eq!(collected.len(), 20);
    assert!(probe.peak() <= 2, "peak concurrency was {}", probe.peak());
    assert!(elapsed >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_stage_admits_burst_then_refill_rate() {
    init_test_tracing();

    let mut pipeline = PipelineBuilder::<u32, _>::new(PipelineConfig::default())
        .stage(
            StageConfig::new(4).with_rate_limit(RateLimitConfig::new(2, 10.0)),
            |x: u32| async move { Ok(x) },
        )
        .build()
        .unwrap();
    let results = pipeline.results();
    pipeline.start().unwrap();

    let started = Instant::now();
    let source = pipeline.source();
    tokio::spawn(async move { source.feed(futures::stream::iter(0..12)).await });

    let collected = collect_results(results).await;
    let elapsed = started.elapsed();
    let stats = pipeline.wait().await.unwrap();

    // Two tokens are available at once, the other ten arrive every 100ms.
    assert_eq!(collected.len(), 12);
    assert!(elapsed >= Duration::from_millis(950), "finished too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_000), "finished too late: {elapsed:?}");
    assert_eq!(stats.succeeded, 12);
}
