//! Embedded DuckDB engine for the samplescope viewer.
//!
//! [`lifecycle::Lifecycle`] starts the engine once and loads the sample data
//! as the `samples` view; [`query::QueryFacade`] runs SQL against it.

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod lifecycle;
pub mod metrics;
pub mod query;
pub mod rows;

#[cfg(test)]
pub(crate) mod testing;

pub use error::EngineError;
pub use lifecycle::{Lifecycle, LifecycleStatus};
pub use query::QueryFacade;
pub use rows::Row;
