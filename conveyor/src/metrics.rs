//! Metric names and labels emitted by the engine.
//!
//! The engine only records through the `metrics` facade. Installing a recorder, for example
//! `telemetry::metrics::init_metrics_handle`, is up to the application.

/// Label for the stage name in metrics.
pub const STAGE_LABEL: &str = "stage";

/// Label for the outcome of a task at a stage.
pub const OUTCOME_LABEL: &str = "outcome";

/// Outcome label value for successfully transformed tasks.
pub const OUTCOME_SUCCEEDED: &str = "succeeded";

/// Outcome label value for failed, timed out or panicked tasks.
pub const OUTCOME_FAILED: &str = "failed";

/// Outcome label value for tasks abandoned because of cancellation.
pub const OUTCOME_CANCELLED: &str = "cancelled";

// Task metrics

/// Counter of tasks that left a stage, labelled by stage and outcome.
pub const CONVEYOR_TASKS_TOTAL: &str = "conveyor_tasks_total";

/// Histogram of transform durations in seconds, labelled by stage.
pub const CONVEYOR_TASK_DURATION_SECONDS: &str = "conveyor_task_duration_seconds";

/// Counter of failed results forwarded untouched from an upstream stage.
pub const CONVEYOR_TASKS_FORWARDED_TOTAL: &str = "conveyor_tasks_forwarded_total";

// Worker metrics

/// Gauge of workers currently running, labelled by stage.
pub const CONVEYOR_ACTIVE_WORKERS: &str = "conveyor_active_workers";

// Pipeline metrics

/// Counter of tasks submitted through a task source.
pub const CONVEYOR_TASKS_SUBMITTED_TOTAL: &str = "conveyor_tasks_submitted_total";
