use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use config::shared::{PipelineConfig, StageConfig};
use futures::{Stream, StreamExt};
use metrics::counter;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::concurrency::cancel::{CancelRx, CancelTx, create_cancel_channel};
use crate::concurrency::queue::BoundedQueue;
use crate::error::{ConveyorError, ConveyorResult, ErrorKind};
use crate::metrics::CONVEYOR_TASKS_SUBMITTED_TOTAL;
use crate::stage::{Stage, StageRunner};
use crate::stats::{PipelineStats, StageStats};
use crate::types::{StageInput, Task, TaskResult, TaskSeq};
use crate::workers::transform::{BoxedTransform, boxed_transform};
use crate::{bail, conveyor_error};

/// Lifecycle states of a [`Pipeline`].
///
/// Transitions only move forward: `Created → Running → Draining → Completed` for a source that
/// runs dry, `Running | Draining → Cancelling → Cancelled` after [`Pipeline::cancel`], and
/// `Created → Cancelled` when cancelled before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Draining,
    Completed,
    Cancelling,
    Cancelled,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Created => "created",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Completed => "completed",
            PipelineState::Cancelling => "cancelling",
            PipelineState::Cancelled => "cancelled",
        };

        f.write_str(name)
    }
}

/// What the pipeline wires a freshly created queue into.
enum Wiring<I> {
    /// The queue is the pipeline source, i.e. the first stage input.
    Source(BoundedQueue<Task<I>>),
    /// The queue is the output of the previous stage, which is now complete.
    Stage(Box<dyn StageRunner>),
}

/// The last stage added to a builder, waiting for its output queue.
///
/// A stage output queue is the next stage input queue, sized by the next stage configuration,
/// so a stage can only be created once its successor (or the terminal output) is known.
type OpenStage<I, In> = Box<dyn FnOnce(BoundedQueue<In>) -> ConveyorResult<Wiring<I>> + Send>;

/// Builds a [`Pipeline`] from an ordered list of stages.
///
/// `I` is the payload type submitted to the pipeline and `In` the input item type of the next
/// stage to add. Each call to [`PipelineBuilder::stage`] changes `In` to the output of the added
/// stage, so transforms are type checked against their predecessor.
///
/// Configuration errors are collected while stages are added and reported by
/// [`PipelineBuilder::build`], before any worker exists.
pub struct PipelineBuilder<I, In> {
    config: PipelineConfig,
    cancel_tx: CancelTx,
    cancel_rx: CancelRx,
    source: Option<BoundedQueue<Task<I>>>,
    stages: Vec<Box<dyn StageRunner>>,
    open: OpenStage<I, In>,
    errors: Vec<ConveyorError>,
}

impl<I> PipelineBuilder<I, Task<I>>
where
    I: Send + 'static,
{
    pub fn new(config: PipelineConfig) -> Self {
        let (cancel_tx, cancel_rx) = create_cancel_channel();

        Self {
            config,
            cancel_tx,
            cancel_rx,
            source: None,
            stages: Vec::new(),
            open: Box::new(|queue| Ok(Wiring::Source(queue))),
            errors: Vec::new(),
        }
    }
}

impl<I, In> PipelineBuilder<I, In>
where
    I: Send + 'static,
    In: StageInput,
{
    /// Appends a stage running `transform` with `config`.
    pub fn stage<O, F, Fut>(self, config: StageConfig, transform: F) -> PipelineBuilder<I, TaskResult<O>>
    where
        O: Send + 'static,
        F: Fn(In::Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ConveyorResult<O>> + Send + 'static,
    {
        self.add_stage(config, boxed_transform(transform))
    }

    /// Appends a stage configured by the next unused entry of [`PipelineConfig::stages`].
    ///
    /// Entries are consumed in order, so the `n`-th stage added to the builder uses `stages[n]`.
    /// A missing entry is reported as a configuration error by [`PipelineBuilder::build`].
    pub fn configured_stage<O, F, Fut>(mut self, transform: F) -> PipelineBuilder<I, TaskResult<O>>
    where
        O: Send + 'static,
        F: Fn(In::Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ConveyorResult<O>> + Send + 'static,
    {
        let index = self.next_index();
        let config = match self.config.stages.get(index) {
            Some(config) => config.clone(),
            None => {
                self.errors.push(conveyor_error!(
                    ErrorKind::ConfigError,
                    "Missing stage configuration",
                    format!(
                        "stage {index} has no entry in the pipeline configuration, which lists {} stages",
                        self.config.stages.len()
                    )
                ));
                StageConfig::default()
            }
        };

        self.add_stage(config, boxed_transform(transform))
    }

    /// Returns a transmitter able to cancel the pipeline being built.
    pub fn cancel_tx(&self) -> CancelTx {
        self.cancel_tx.clone()
    }

    fn next_index(&self) -> usize {
        self.stages.len() + usize::from(self.source.is_some())
    }

    fn add_stage<O>(
        mut self,
        config: StageConfig,
        transform: BoxedTransform<In::Payload, O>,
    ) -> PipelineBuilder<I, TaskResult<O>>
    where
        O: Send + 'static,
    {
        let index = self.next_index();
        let input = BoundedQueue::<In>::new(config.queue_capacity, self.cancel_rx.clone());

        match (self.open)(input.clone()) {
            Ok(Wiring::Source(source)) => self.source = Some(source),
            Ok(Wiring::Stage(stage)) => self.stages.push(stage),
            Err(err) => self.errors.push(err),
        }

        let cancel_rx = self.cancel_rx.clone();
        let open: OpenStage<I, TaskResult<O>> = Box::new(move |output| {
            let stage = Stage::new(index, &config, input, output, transform, cancel_rx)?;
            Ok(Wiring::Stage(Box::new(stage)))
        });

        PipelineBuilder {
            config: self.config,
            cancel_tx: self.cancel_tx,
            cancel_rx: self.cancel_rx,
            source: self.source,
            stages: self.stages,
            open,
            errors: self.errors,
        }
    }
}

impl<I, O> PipelineBuilder<I, TaskResult<O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Finishes the pipeline.
    ///
    /// Fails with [`ErrorKind::ConfigError`] if the pipeline configuration or any stage
    /// configuration is invalid. Several errors are aggregated.
    pub fn build(mut self) -> ConveyorResult<Pipeline<I, O>> {
        self.config.validate()?;

        let output = BoundedQueue::new(self.config.output_capacity, self.cancel_rx.clone());
        match (self.open)(output.clone()) {
            Ok(Wiring::Stage(stage)) => self.stages.push(stage),
            Ok(Wiring::Source(_)) => self.errors.push(conveyor_error!(
                ErrorKind::ConfigError,
                "Pipeline has no stages"
            )),
            Err(err) => self.errors.push(err),
        }

        if !self.errors.is_empty() {
            return Err(self.errors.into());
        }

        let Some(source) = self.source else {
            bail!(ErrorKind::ConfigError, "Pipeline has no stages");
        };

        Ok(Pipeline {
            task_timeout: self.config.task_timeout(),
            state: PipelineState::Created,
            source,
            stages: self.stages,
            output,
            next_seq: Arc::new(AtomicU64::new(0)),
            cancel_tx: self.cancel_tx,
            started_at: None,
            stats: None,
        })
    }
}

/// An ordered sequence of stages connected by bounded queues.
///
/// Tasks enter through a [`TaskSource`] and their results leave through a [`ResultStream`]. The
/// result stream must be consumed while the pipeline runs, otherwise backpressure eventually
/// stalls every stage.
pub struct Pipeline<I, O> {
    task_timeout: Option<Duration>,
    state: PipelineState,
    source: BoundedQueue<Task<I>>,
    stages: Vec<Box<dyn StageRunner>>,
    output: BoundedQueue<TaskResult<O>>,
    next_seq: Arc<AtomicU64>,
    cancel_tx: CancelTx,
    started_at: Option<Instant>,
    stats: Option<PipelineStats>,
}

impl<I, O> Pipeline<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Returns the current lifecycle state.
    ///
    /// A running pipeline whose token was fired through [`Pipeline::cancel_tx`] reports
    /// [`PipelineState::Cancelling`].
    pub fn state(&self) -> PipelineState {
        match self.state {
            PipelineState::Running | PipelineState::Draining if self.cancel_tx.is_cancelled() => {
                PipelineState::Cancelling
            }
            state => state,
        }
    }

    /// Returns the transmitter of the pipeline cancellation token.
    ///
    /// Lets another task cancel the pipeline while this one is blocked in [`Pipeline::wait`].
    pub fn cancel_tx(&self) -> CancelTx {
        self.cancel_tx.clone()
    }

    /// Returns a handle for submitting tasks.
    pub fn source(&self) -> TaskSource<I> {
        TaskSource {
            queue: self.source.clone(),
            next_seq: self.next_seq.clone(),
            task_timeout: self.task_timeout,
        }
    }

    /// Returns a handle for reading the results of the terminal stage.
    pub fn results(&self) -> ResultStream<O> {
        ResultStream {
            queue: self.output.clone(),
        }
    }

    /// Spawns the workers of every stage.
    ///
    /// Fails with [`ErrorKind::InvalidState`] unless the pipeline is in
    /// [`PipelineState::Created`]. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> ConveyorResult<()> {
        if self.state != PipelineState::Created {
            bail!(
                ErrorKind::InvalidState,
                "Pipeline can only be started once",
                format!("pipeline is {}", self.state())
            );
        }

        if self.cancel_tx.is_cancelled() {
            self.cancel();
            bail!(
                ErrorKind::InvalidState,
                "Pipeline was cancelled before it started"
            );
        }

        info!(stages = self.stages.len(), "starting pipeline");

        for stage in &mut self.stages {
            stage.start();
        }

        self.state = PipelineState::Running;
        self.started_at = Some(Instant::now());

        Ok(())
    }

    /// Signals that no more tasks will be submitted.
    ///
    /// Stages finish the tasks already submitted and the pipeline completes once they drained.
    pub fn close_source(&mut self) {
        self.source.close();

        if self.state == PipelineState::Running {
            info!("pipeline source closed, draining");
            self.state = PipelineState::Draining;
        }
    }

    /// Cancels the pipeline without waiting.
    ///
    /// No new task starts once cancellation fired and every blocked operation wakes up. Call
    /// [`Pipeline::wait`] to join the workers and collect partial statistics. Cancelling twice,
    /// or cancelling a finished pipeline, has no effect.
    pub fn cancel(&mut self) {
        match self.state {
            PipelineState::Created => {
                info!("cancelling pipeline before start");
                self.cancel_tx.cancel();
                let (abandoned, abandoned_results) = self.teardown();
                self.state = PipelineState::Cancelled;
                self.stats = Some(PipelineStats {
                    cancelled: abandoned + abandoned_results,
                    ..PipelineStats::default()
                });
            }
            PipelineState::Running | PipelineState::Draining => {
                info!("cancelling pipeline");
                self.cancel_tx.cancel();
                self.state = PipelineState::Cancelling;
            }
            PipelineState::Cancelling | PipelineState::Completed | PipelineState::Cancelled => {}
        }
    }

    /// Waits for the pipeline to finish and returns its statistics.
    ///
    /// Without cancellation this returns once the source was closed, every worker exited and all
    /// results were read from the [`ResultStream`]. After cancellation it returns as soon as the
    /// workers stopped, accounting buffered and in-flight tasks as cancelled; cancellation is not
    /// an error. A pipeline that never started yields empty statistics.
    ///
    /// Errors are only returned when a worker crashed outside of its transform.
    pub async fn wait(&mut self) -> ConveyorResult<PipelineStats> {
        match self.state {
            PipelineState::Created => {
                info!("pipeline was not started, nothing to wait for");
                return Ok(PipelineStats::default());
            }
            PipelineState::Completed | PipelineState::Cancelled => {
                return Ok(self.stats.clone().unwrap_or_default());
            }
            PipelineState::Running | PipelineState::Draining | PipelineState::Cancelling => {}
        }

        let mut errors: Vec<ConveyorError> = Vec::new();
        let mut stage_stats = Vec::with_capacity(self.stages.len());

        info!("waiting for stages to complete");
        for stage in &mut self.stages {
            match stage.wait().await {
                Ok(stats) => stage_stats.push(stats),
                Err(err) => {
                    error!(stage = %stage.name(), error = %err, "stage completed with an error");
                    stage_stats.push(StageStats {
                        index: stage.index(),
                        name: stage.name().to_string(),
                        ..StageStats::default()
                    });
                    errors.push(err);
                }
            }
        }

        let mut cancelled = self.cancel_tx.is_cancelled();
        if !cancelled {
            // Completion also requires the caller to have read every result.
            if let Err(err) = self.output.wait_drained().await {
                if !err.is_cancelled() {
                    errors.push(err);
                }
            }
            cancelled = self.cancel_tx.is_cancelled();
        }

        let (abandoned, abandoned_results) = if cancelled {
            self.teardown()
        } else {
            (0, 0)
        };

        let stats = aggregate_stats(
            stage_stats,
            abandoned,
            abandoned_results,
            self.started_at.map(|started_at| started_at.elapsed()),
        );

        self.state = if cancelled {
            PipelineState::Cancelled
        } else {
            PipelineState::Completed
        };
        self.stats = Some(stats.clone());

        info!(
            state = %self.state,
            succeeded = stats.succeeded,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "pipeline finished"
        );

        if !errors.is_empty() {
            error!(errors = errors.len(), "pipeline finished with worker errors");
            return Err(errors.into());
        }

        Ok(stats)
    }

    /// Cancels the pipeline and waits for it to stop.
    pub async fn cancel_and_wait(&mut self) -> ConveyorResult<PipelineStats> {
        self.cancel();
        self.wait().await
    }

    /// Closes every queue, terminal output first and source last, and drops buffered items.
    ///
    /// Returns the number of abandoned tasks and, separately, of abandoned successful results of
    /// the terminal stage.
    fn teardown(&mut self) -> (u64, u64) {
        self.output.close();
        for stage in self.stages.iter().rev() {
            stage.close_input();
        }

        let abandoned_results = self
            .output
            .drain()
            .iter()
            .filter(|result| result.is_ok())
            .count() as u64;
        let abandoned: u64 = self.stages.iter().map(|stage| stage.drain_input()).sum();

        if abandoned + abandoned_results > 0 {
            warn!(abandoned, abandoned_results, "pipeline torn down with unfinished tasks");
        }

        (abandoned, abandoned_results)
    }
}

impl<I, O> Drop for Pipeline<I, O> {
    fn drop(&mut self) {
        // Workers of a pipeline dropped while running must not outlive it.
        if matches!(
            self.state,
            PipelineState::Running | PipelineState::Draining | PipelineState::Cancelling
        ) {
            self.cancel_tx.cancel();
        }
    }
}

/// Folds per-stage counters into pipeline counters.
///
/// A task succeeds once it leaves the terminal stage, fails at the stage where it failed and is
/// cancelled where it was abandoned.
fn aggregate_stats(
    stages: Vec<StageStats>,
    abandoned: u64,
    abandoned_results: u64,
    duration: Option<Duration>,
) -> PipelineStats {
    let terminal_succeeded = stages.last().map(|stage| stage.succeeded).unwrap_or(0);

    PipelineStats {
        succeeded: terminal_succeeded.saturating_sub(abandoned_results),
        failed: stages.iter().map(|stage| stage.failed).sum(),
        cancelled: stages.iter().map(|stage| stage.cancelled).sum::<u64>()
            + abandoned
            + abandoned_results,
        duration: duration.unwrap_or_default(),
        stages,
    }
}

/// Cloneable handle submitting tasks to a [`Pipeline`].
#[derive(Debug)]
pub struct TaskSource<I> {
    queue: BoundedQueue<Task<I>>,
    next_seq: Arc<AtomicU64>,
    task_timeout: Option<Duration>,
}

impl<I> Clone for TaskSource<I> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            next_seq: self.next_seq.clone(),
            task_timeout: self.task_timeout,
        }
    }
}

impl<I> TaskSource<I>
where
    I: Send + 'static,
{
    /// Submits `payload`, waiting while the first stage queue is full.
    ///
    /// Returns the sequence number assigned to the task. If the pipeline has a task timeout, the
    /// task deadline is set relative to now. Fails with [`ErrorKind::QueueClosed`] once the
    /// source was closed and with [`ErrorKind::Cancelled`] after cancellation.
    pub async fn submit(&self, payload: I) -> ConveyorResult<TaskSeq> {
        // A timeout too large to represent never expires.
        let deadline = self
            .task_timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        self.enqueue(payload, deadline).await
    }

    /// Submits `payload` with an explicit `deadline`, overriding the pipeline task timeout.
    pub async fn submit_with_deadline(&self, payload: I, deadline: Instant) -> ConveyorResult<TaskSeq> {
        self.enqueue(payload, Some(deadline)).await
    }

    /// Submits every item of `payloads`, then closes the source.
    ///
    /// Returns the number of submitted tasks. The source is left open if a submission fails.
    pub async fn feed<S>(&self, payloads: S) -> ConveyorResult<u64>
    where
        S: Stream<Item = I>,
    {
        let mut payloads = std::pin::pin!(payloads);
        let mut submitted = 0;

        while let Some(payload) = payloads.next().await {
            self.submit(payload).await?;
            submitted += 1;
        }

        self.close();

        Ok(submitted)
    }

    /// Closes the source. Tasks already submitted are still processed.
    pub fn close(&self) {
        self.queue.close();
    }

    async fn enqueue(&self, payload: I, deadline: Option<Instant>) -> ConveyorResult<TaskSeq> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            seq,
            deadline,
            payload,
        };

        self.queue.put(task).await?;
        counter!(CONVEYOR_TASKS_SUBMITTED_TOTAL).increment(1);

        Ok(seq)
    }
}

/// Reader of the results leaving the terminal stage.
///
/// Results arrive in completion order. Failed results carry the index of the stage where the
/// task failed.
#[derive(Debug)]
pub struct ResultStream<O> {
    queue: BoundedQueue<TaskResult<O>>,
}

impl<O> Clone for ResultStream<O> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<O> ResultStream<O>
where
    O: Send + 'static,
{
    /// Returns the next result, or `None` once the pipeline finished or was cancelled.
    pub async fn next(&mut self) -> Option<TaskResult<O>> {
        match self.queue.get().await {
            Ok(result) => result,
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(error = %err, "result stream ended unexpectedly");
                }
                None
            }
        }
    }

    /// Converts the reader into a [`Stream`] of results.
    pub fn into_stream(self) -> impl Stream<Item = TaskResult<O>> + Send {
        futures::stream::unfold(self, |mut results| async move {
            results.next().await.map(|result| (result, results))
        })
    }
}
