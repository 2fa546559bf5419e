//! Values flowing through a pipeline.

use tokio::time::Instant;

use crate::error::ConveyorError;

/// Monotonically increasing sequence number assigned by the task source.
///
/// Used for diagnostics and to correlate results with submissions. It is not an ordering
/// guarantee: results leave a stage with several workers in completion order.
pub type TaskSeq = u64;

/// A unit of work submitted to a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Task<T> {
    pub seq: TaskSeq,
    /// Instant after which the task is failed with a timeout instead of being transformed.
    pub deadline: Option<Instant>,
    pub payload: T,
}

impl<T> Task<T> {
    pub fn new(seq: TaskSeq, payload: T) -> Self {
        Self {
            seq,
            deadline: None,
            payload,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns `true` if the deadline is set and lies at or before `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// Outcome of a task at a given stage.
///
/// A successful result of stage `i` is the task input of stage `i + 1`. A failed result is
/// passed through the remaining stages untouched, keeping the index of the stage where it
/// failed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult<T> {
    pub seq: TaskSeq,
    /// Index of the stage that produced the value or where the task failed.
    pub stage: usize,
    pub deadline: Option<Instant>,
    pub outcome: Result<T, ConveyorError>,
}

impl<T> TaskResult<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn is_err(&self) -> bool {
        self.outcome.is_err()
    }

    /// Returns the produced value or the failure, dropping the metadata.
    pub fn into_outcome(self) -> Result<T, ConveyorError> {
        self.outcome
    }

    /// Re-types a failed result so it can travel through a stage with a different output type.
    ///
    /// Returns the successful value instead when there is nothing to convert.
    pub(crate) fn into_failure<U>(self) -> Result<TaskResult<U>, Task<T>> {
        match self.outcome {
            Ok(payload) => Err(Task {
                seq: self.seq,
                deadline: self.deadline,
                payload,
            }),
            Err(err) => Ok(TaskResult {
                seq: self.seq,
                stage: self.stage,
                deadline: self.deadline,
                outcome: Err(err),
            }),
        }
    }
}

/// Item type accepted by a stage input queue.
///
/// The first stage consumes [`Task`]s from the source, later stages consume the
/// [`TaskResult`]s of their predecessor. Admitting an item either yields the task to transform
/// or, for a failure coming from upstream, the result to forward unchanged.
pub trait StageInput: Send + 'static {
    /// Payload handed to the stage transform.
    type Payload: Send + 'static;

    fn admit<O>(self) -> Result<Task<Self::Payload>, TaskResult<O>>;

    /// Sequence number of the underlying task.
    fn seq(&self) -> TaskSeq;

    /// Returns `true` for a failure forwarded from an upstream stage.
    fn is_failure(&self) -> bool;
}

impl<T> StageInput for Task<T>
where
    T: Send + 'static,
{
    type Payload = T;

    fn admit<O>(self) -> Result<Task<T>, TaskResult<O>> {
        Ok(self)
    }

    fn seq(&self) -> TaskSeq {
        self.seq
    }

    fn is_failure(&self) -> bool {
        false
    }
}

impl<T> StageInput for TaskResult<T>
where
    T: Send + 'static,
{
    type Payload = T;

    fn admit<O>(self) -> Result<Task<T>, TaskResult<O>> {
        match self.into_failure() {
            Ok(failure) => Err(failure),
            Err(task) => Ok(task),
        }
    }

    fn seq(&self) -> TaskSeq {
        self.seq
    }

    fn is_failure(&self) -> bool {
        self.is_err()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::conveyor_error;
    use crate::error::ErrorKind;

    #[test]
    fn successful_result_is_admitted_as_task() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let result = TaskResult {
            seq: 4,
            stage: 0,
            deadline: Some(deadline),
            outcome: Ok("payload"),
        };

        let task = StageInput::admit::<u32>(result).unwrap();

        assert_eq!(task, Task::new(4, "payload").with_deadline(deadline));
    }

    #[test]
    fn failed_result_is_forwarded_with_origin_stage() {
        let result: TaskResult<&str> = TaskResult {
            seq: 9,
            stage: 1,
            deadline: None,
            outcome: Err(conveyor_error!(ErrorKind::TaskFailed, "Transform failed")),
        };

        let forwarded = StageInput::admit::<u32>(result).unwrap_err();

        assert_eq!(forwarded.seq, 9);
        assert_eq!(forwarded.stage, 1);
        assert_eq!(
            forwarded.outcome.unwrap_err().kind(),
            ErrorKind::TaskFailed
        );
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = Instant::now();
        let task = Task::new(0, ()).with_deadline(now);

        assert!(task.is_expired(now));
        assert!(!Task::new(1, ()).is_expired(now));
    }
}
