use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use config::shared::StageConfig;
use metrics::{counter, gauge, histogram};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::concurrency::cancel::CancelRx;
use crate::concurrency::deadline::DeadlineTimer;
use crate::concurrency::queue::BoundedQueue;
use crate::concurrency::rate_limit::RateLimiter;
use crate::concurrency::semaphore::BoundedSemaphore;
use crate::conveyor_error;
use crate::error::{ConveyorError, ConveyorResult, ErrorKind};
use crate::metrics::{
    CONVEYOR_ACTIVE_WORKERS, CONVEYOR_TASK_DURATION_SECONDS, CONVEYOR_TASKS_FORWARDED_TOTAL,
    CONVEYOR_TASKS_TOTAL, OUTCOME_CANCELLED, OUTCOME_FAILED, OUTCOME_LABEL, OUTCOME_SUCCEEDED,
    STAGE_LABEL,
};
use crate::stats::{StageCounters, StageStats};
use crate::types::{StageInput, Task, TaskResult};
use crate::workers::transform::{BoxedTransform, run_transform};

/// Returns the display name of the stage at `index`.
pub fn stage_name(index: usize, config: &StageConfig) -> String {
    config
        .name
        .clone()
        .unwrap_or_else(|| format!("stage-{index}"))
}

/// What happened to a task a worker took from its input queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    /// A failure of an upstream stage travelling through untouched.
    Forwarded,
    Cancelled,
}

/// Why a worker loop ended.
#[derive(Debug, Clone, Copy)]
enum WorkerExit {
    InputClosed,
    OutputClosed,
    Cancelled,
}

/// State shared by all workers of a pool.
struct PoolContext<I, O>
where
    I: StageInput,
{
    index: usize,
    name: String,
    input: BoundedQueue<I>,
    output: BoundedQueue<TaskResult<O>>,
    transform: BoxedTransform<I::Payload, O>,
    rate_limiter: Option<RateLimiter>,
    semaphore: Option<BoundedSemaphore>,
    task_timeout: Option<Duration>,
    cancel_rx: CancelRx,
    counters: Arc<StageCounters>,
}

impl<I, O> PoolContext<I, O>
where
    I: StageInput,
    O: Send + 'static,
{
    fn record(&self, outcome: Outcome) {
        let label = match outcome {
            Outcome::Succeeded => {
                self.counters.record_succeeded();
                OUTCOME_SUCCEEDED
            }
            Outcome::Failed => {
                self.counters.record_failed();
                OUTCOME_FAILED
            }
            Outcome::Cancelled => {
                self.counters.record_cancelled(1);
                OUTCOME_CANCELLED
            }
            Outcome::Forwarded => {
                counter!(CONVEYOR_TASKS_FORWARDED_TOTAL, STAGE_LABEL => self.name.clone())
                    .increment(1);
                return;
            }
        };

        counter!(
            CONVEYOR_TASKS_TOTAL,
            STAGE_LABEL => self.name.clone(),
            OUTCOME_LABEL => label
        )
        .increment(1);
    }

    /// Runs the transform on `task`.
    ///
    /// Returns `None` when cancellation interrupted the transform, in which case the task is
    /// abandoned.
    async fn process(&self, task: Task<I::Payload>) -> Option<TaskResult<O>> {
        let now = Instant::now();
        if task.is_expired(now) {
            debug!(stage = %self.name, seq = task.seq, "task deadline passed before processing");

            return Some(TaskResult {
                seq: task.seq,
                stage: self.index,
                deadline: task.deadline,
                outcome: Err(conveyor_error!(
                    ErrorKind::TaskTimeout,
                    "Task deadline passed before processing"
                )),
            });
        }

        let Task {
            seq,
            deadline,
            payload,
        } = task;

        let timer = DeadlineTimer::earliest([
            deadline,
            self.task_timeout.and_then(|timeout| now.checked_add(timeout)),
        ]);

        let outcome = tokio::select! {
            biased;

            _ = self.cancel_rx.wait_for_cancel() => {
                return None;
            }
            result = run_transform(&self.transform, payload) => result,
            _ = timer => {
                Err(conveyor_error!(
                    ErrorKind::TaskTimeout,
                    "Task timed out",
                    format!("transform still running after {:?}", now.elapsed())
                ))
            }
        };

        histogram!(CONVEYOR_TASK_DURATION_SECONDS, STAGE_LABEL => self.name.clone())
            .record(now.elapsed().as_secs_f64());

        if let Err(err) = &outcome {
            warn!(stage = %self.name, seq, error = %err, "task failed");
        }

        Some(TaskResult {
            seq,
            stage: self.index,
            deadline,
            outcome,
        })
    }
}

/// Tracks running workers, closing the pool output when the last one exits.
///
/// Dropped on every exit path of a worker, panics included.
struct LiveWorkers<O> {
    live: Arc<AtomicUsize>,
    output: BoundedQueue<TaskResult<O>>,
}

impl<O> Drop for LiveWorkers<O> {
    fn drop(&mut self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.output.close();
        }
    }
}

async fn run_worker<I, O>(worker_id: usize, context: Arc<PoolContext<I, O>>, live: LiveWorkers<O>)
where
    I: StageInput,
    O: Send + 'static,
{
    debug!(stage = %context.name, worker_id, "worker started");
    gauge!(CONVEYOR_ACTIVE_WORKERS, STAGE_LABEL => context.name.clone()).increment(1.0);

    let exit = loop {
        if let Some(rate_limiter) = &context.rate_limiter {
            if rate_limiter.acquire(&context.cancel_rx).await.is_err() {
                break WorkerExit::Cancelled;
            }
        }

        let permit = match &context.semaphore {
            Some(semaphore) => match semaphore.acquire(&context.cancel_rx).await {
                Ok(permit) => Some(permit),
                Err(_) => break WorkerExit::Cancelled,
            },
            None => None,
        };

        let item = match context.input.get().await {
            Ok(Some(item)) => item,
            Ok(None) => break WorkerExit::InputClosed,
            Err(_) => break WorkerExit::Cancelled,
        };

        let seq = item.seq();
        let (result, outcome) = match item.admit::<O>() {
            Err(forwarded) => (forwarded, Outcome::Forwarded),
            Ok(task) => match context.process(task).await {
                Some(result) => {
                    let outcome = if result.is_ok() {
                        Outcome::Succeeded
                    } else {
                        Outcome::Failed
                    };
                    (result, outcome)
                }
                None => {
                    debug!(stage = %context.name, worker_id, seq, "task abandoned on cancellation");
                    context.record(Outcome::Cancelled);
                    break WorkerExit::Cancelled;
                }
            },
        };

        // The slot bounds transforms only, publishing may block on a full output.
        drop(permit);

        if let Err(err) = context.output.put(result).await {
            debug!(stage = %context.name, worker_id, seq, error = %err, "result could not be published");
            if outcome != Outcome::Forwarded {
                context.record(Outcome::Cancelled);
            }

            break if err.is_cancelled() {
                WorkerExit::Cancelled
            } else {
                WorkerExit::OutputClosed
            };
        }

        context.record(outcome);
    };

    gauge!(CONVEYOR_ACTIVE_WORKERS, STAGE_LABEL => context.name.clone()).decrement(1.0);
    debug!(stage = %context.name, worker_id, ?exit, "worker exited");

    drop(live);
}

/// A pool of workers draining one input queue into one output queue.
///
/// Each worker loops: take a rate token (if configured), take an in-flight slot (if configured),
/// take the next item, transform it, release the slot and publish the result. Transform
/// failures, timeouts and panics are published as failed [`TaskResult`]s and never stop a worker.
/// Workers exit once the input is closed and drained or cancellation fires, and the last one to
/// exit closes the output queue.
pub struct WorkerPool<I, O>
where
    I: StageInput,
{
    index: usize,
    name: String,
    workers: usize,
    context: PoolContext<I, O>,
}

impl<I, O> WorkerPool<I, O>
where
    I: StageInput,
    O: Send + 'static,
{
    /// Creates a pool for the stage at `index`.
    ///
    /// Fails with [`ErrorKind::ConfigError`] if `config` is invalid. No worker is spawned until
    /// [`WorkerPool::start`] is called.
    pub fn new(
        index: usize,
        config: &StageConfig,
        input: BoundedQueue<I>,
        output: BoundedQueue<TaskResult<O>>,
        transform: BoxedTransform<I::Payload, O>,
        cancel_rx: CancelRx,
    ) -> ConveyorResult<Self> {
        config.validate()?;

        let name = stage_name(index, config);
        let context = PoolContext {
            index,
            name: name.clone(),
            input,
            output,
            transform,
            rate_limiter: config.rate_limit.as_ref().map(RateLimiter::new),
            semaphore: config.max_in_flight.map(BoundedSemaphore::new),
            task_timeout: config.task_timeout(),
            cancel_rx,
            counters: Arc::new(StageCounters::default()),
        };

        Ok(Self {
            index,
            name,
            workers: config.workers,
            context,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the workers and returns a handle to wait for them.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> WorkerPoolHandle {
        info!(stage = %self.name, workers = self.workers, "starting worker pool");

        let counters = self.context.counters.clone();
        let live = Arc::new(AtomicUsize::new(self.workers));
        let output = self.context.output.clone();
        let context = Arc::new(self.context);

        // Each worker gets its own handles, moved into the task at spawn time.
        let workers = (0..self.workers)
            .map(|worker_id| {
                let guard = LiveWorkers {
                    live: live.clone(),
                    output: output.clone(),
                };

                tokio::spawn(run_worker(worker_id, context.clone(), guard))
            })
            .collect();

        WorkerPoolHandle {
            index: self.index,
            name: self.name,
            workers,
            counters,
            started_at: Instant::now(),
        }
    }
}

/// Handle to the workers of a started [`WorkerPool`].
#[derive(Debug)]
pub struct WorkerPoolHandle {
    index: usize,
    name: String,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<StageCounters>,
    started_at: Instant,
}

impl WorkerPoolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> StageStats {
        self.counters
            .snapshot(self.index, &self.name, self.started_at.elapsed())
    }

    /// Waits for every worker to exit.
    ///
    /// Once this returns the output queue is closed. Workers that crashed outside of a transform
    /// are reported as [`ErrorKind::WorkerPanic`] errors, aggregated when several failed.
    pub async fn wait(self) -> ConveyorResult<StageStats> {
        let mut errors: Vec<ConveyorError> = Vec::new();

        for worker in self.workers {
            if let Err(join_err) = worker.await {
                if join_err.is_cancelled() {
                    debug!(stage = %self.name, "worker task was cancelled");
                } else {
                    error!(stage = %self.name, error = %join_err, "worker panicked");
                    errors.push(join_err.into());
                }
            }
        }

        let stats = self
            .counters
            .snapshot(self.index, &self.name, self.started_at.elapsed());

        info!(
            stage = %self.name,
            succeeded = stats.succeeded,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "worker pool finished"
        );

        if errors.is_empty() {
            Ok(stats)
        } else {
            Err(errors.into())
        }
    }
}
