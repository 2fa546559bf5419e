//! Concurrency primitives the pipeline is assembled from.
//!
//! Every blocking operation in this module observes the pipeline [`cancel`] token, so firing it
//! wakes all waiting producers, consumers and admission gates at once:
//!
//! - [`queue`]: fixed-capacity blocking queue linking stages, the carrier of backpressure.
//! - [`rate_limit`]: lazily refilled token bucket.
//! - [`semaphore`]: bound on in-flight transforms.
//! - [`fan_in`]: merges several queues into one.
//! - [`deadline`]: timer for task deadlines and stage timeouts.

pub mod cancel;
pub mod deadline;
pub mod fan_in;
pub mod queue;
pub mod rate_limit;
pub mod semaphore;
