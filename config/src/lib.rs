//! Configuration types and loading for conveyor pipelines.
//!
//! The [`shared`] module holds the serde types describing stages and pipelines, each with a
//! `validate` method. The [`load`] module assembles them from configuration files and
//! `CONVEYOR_`-prefixed environment variables.

pub mod load;
pub mod profile;
pub mod shared;
