//! A single pipeline step.

use async_trait::async_trait;
use config::shared::StageConfig;
use tracing::warn;

use crate::concurrency::cancel::CancelRx;
use crate::concurrency::queue::BoundedQueue;
use crate::error::ConveyorResult;
use crate::stats::StageStats;
use crate::types::{StageInput, TaskResult};
use crate::workers::pool::{WorkerPool, WorkerPoolHandle, stage_name};
use crate::workers::transform::BoxedTransform;

/// Lifecycle of a stage as driven by its pipeline.
///
/// Erases the input and output types of a [`Stage`] so stages of different types can be held in
/// one list.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn index(&self) -> usize;

    fn name(&self) -> &str;

    /// Spawns the stage workers. Has no effect if already started.
    fn start(&mut self);

    /// Closes the stage input queue.
    fn close_input(&self);

    /// Removes every item left in the input queue.
    ///
    /// Returns how many of them were tasks still to be processed. Failures forwarded from
    /// upstream are not counted since they were accounted for at the stage where they failed.
    fn drain_input(&self) -> u64;

    /// Waits for the workers to exit.
    ///
    /// Returns zeroed statistics for a stage that was never started.
    async fn wait(&mut self) -> ConveyorResult<StageStats>;
}

/// A [`WorkerPool`] bound to its position in a pipeline.
pub struct Stage<I, O>
where
    I: StageInput,
{
    index: usize,
    name: String,
    input: BoundedQueue<I>,
    pool: Option<WorkerPool<I, O>>,
    handle: Option<WorkerPoolHandle>,
}

impl<I, O> Stage<I, O>
where
    I: StageInput,
    O: Send + 'static,
{
    /// Creates the stage at `index` reading `input` and publishing to `output`.
    ///
    /// Fails with [`crate::error::ErrorKind::ConfigError`] if `config` is invalid.
    pub fn new(
        index: usize,
        config: &StageConfig,
        input: BoundedQueue<I>,
        output: BoundedQueue<TaskResult<O>>,
        transform: BoxedTransform<I::Payload, O>,
        cancel_rx: CancelRx,
    ) -> ConveyorResult<Self> {
        let pool = WorkerPool::new(index, config, input.clone(), output, transform, cancel_rx)?;

        Ok(Self {
            index,
            name: stage_name(index, config),
            input,
            pool: Some(pool),
            handle: None,
        })
    }
}

#[async_trait]
impl<I, O> StageRunner for Stage<I, O>
where
    I: StageInput,
    O: Send + 'static,
{
    fn index(&self) -> usize {
        self.index
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) {
        if let Some(pool) = self.pool.take() {
            self.handle = Some(pool.start());
        }
    }

    fn close_input(&self) {
        self.input.close();
    }

    fn drain_input(&self) -> u64 {
        let drained = self.input.drain();
        if !drained.is_empty() {
            warn!(stage = %self.name, count = drained.len(), "abandoning buffered tasks");
        }

        drained.iter().filter(|item| !item.is_failure()).count() as u64
    }

    async fn wait(&mut self) -> ConveyorResult<StageStats> {
        match self.handle.take() {
            Some(handle) => handle.wait().await,
            None => Ok(StageStats {
                index: self.index,
                name: self.name.clone(),
                ..StageStats::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::cancel::create_cancel_channel;
    use crate::conveyor_error;
    use crate::error::ErrorKind;
    use crate::types::Task;
    use crate::workers::transform::boxed_transform;

    #[tokio::test]
    async fn unstarted_stage_reports_empty_stats() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let mut stage: Box<dyn StageRunner> = Box::new(
            Stage::new(
                3,
                &StageConfig::new(2).with_name("enrich"),
                BoundedQueue::<Task<u32>>::new(1, cancel_rx.clone()),
                BoundedQueue::new(1, cancel_rx.clone()),
                boxed_transform(|x: u32| async move { Ok(x) }),
                cancel_rx,
            )
            .unwrap(),
        );

        let stats = stage.wait().await.unwrap();

        assert_eq!(stage.index(), 3);
        assert_eq!(stats.name, "enrich");
        assert_eq!(stats.succeeded + stats.failed + stats.cancelled, 0);
    }

    #[tokio::test]
    async fn drain_counts_only_pending_tasks() {
        let (_cancel_tx, cancel_rx) = create_cancel_channel();
        let input = BoundedQueue::<TaskResult<u32>>::new(4, cancel_rx.clone());
        let stage = Stage::new(
            1,
            &StageConfig::new(1),
            input.clone(),
            BoundedQueue::new(1, cancel_rx.clone()),
            boxed_transform(|x: u32| async move { Ok(x) }),
            cancel_rx,
        )
        .unwrap();

        for seq in 0..2 {
            input
                .put(TaskResult {
                    seq,
                    stage: 0,
                    deadline: None,
                    outcome: Ok(1),
                })
                .await
                .unwrap();
        }
        input
            .put(TaskResult {
                seq: 2,
                stage: 0,
                deadline: None,
                outcome: Err(conveyor_error!(ErrorKind::TaskFailed, "Upstream failed")),
            })
            .await
            .unwrap();

        stage.close_input();

        assert_eq!(stage.drain_input(), 2);
        assert!(input.is_closed());
        assert!(input.is_empty());
        assert_eq!(stage.name(), "stage-1");
    }
}
