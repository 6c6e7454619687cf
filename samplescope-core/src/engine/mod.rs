//! DuckDB engine module - bundle selection, the worker thread that hosts the
//! database, and the instance/connection handles.
//!
//! This module provides:
//! - `select_bundle`: picks the capability tier to run
//! - `EngineWorker`: background thread owning every DuckDB object
//! - `EngineInstance` / `EngineConnection`: the database and its single session
//! - `FileRegistry`: the virtual file namespace for registered buffers

pub mod bundle;
pub mod files;
pub mod instance;
pub mod worker;

pub use bundle::{select_bundle, BundleTier, EngineBundle, PlatformFeatures, SelectedBundle};
pub use instance::{EngineConnection, EngineInstance, QueryResult};
pub use worker::EngineWorker;

/// The instance and connection created by a successful startup.
pub struct EngineHandle {
    pub instance: EngineInstance,
    pub connection: EngineConnection,
}
