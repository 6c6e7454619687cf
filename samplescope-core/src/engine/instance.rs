//! The embedded DuckDB instance and its single connection.

use std::path::PathBuf;
use std::sync::Arc;

use arrow_array::RecordBatch;
use bytes::Bytes;
use duckdb::{Config, Connection};
use tracing::{debug, info, instrument};

use crate::engine::bundle::BundleTier;
use crate::engine::worker::EngineWorker;
use crate::error::EngineError;

/// Result of a query execution
pub struct QueryResult {
    pub batches: Vec<RecordBatch>,
    pub total_rows: usize,
}

/// Handle to the running database. Owns the worker that hosts it.
pub struct EngineInstance {
    worker: Arc<EngineWorker>,
    module_dir: PathBuf,
}

impl EngineInstance {
    /// Open an in-memory database on `worker`, using `main_module` as the
    /// extension directory. The directory is created when missing.
    #[instrument(skip(worker), fields(worker = %worker.name(), tier = %worker.tier()))]
    pub async fn instantiate(
        worker: Arc<EngineWorker>,
        main_module: &str,
    ) -> Result<Self, EngineError> {
        let module_dir = PathBuf::from(main_module);
        tokio::fs::create_dir_all(&module_dir).await?;

        let extension_dir = module_dir.to_string_lossy().into_owned();
        worker
            .call(move |state| {
                if state.is_instantiated() {
                    return Err(EngineError::Internal(
                        "engine instance already instantiated".to_string(),
                    ));
                }
                let search_path = state.files.root().to_string_lossy().into_owned();
                let config = Config::default()
                    .enable_autoload_extension(true)?
                    .with("extension_directory", &extension_dir)?
                    .with("file_search_path", &search_path)?;
                let database = Connection::open_in_memory_with_flags(config)?;
                state.database = Some(database);
                debug!(%extension_dir, %search_path, "opened in-memory database");
                Ok(())
            })
            .await?;

        info!(module = %module_dir.display(), "engine instantiated");
        Ok(Self { worker, module_dir })
    }

    pub fn tier(&self) -> BundleTier {
        self.worker.tier()
    }

    pub fn module_dir(&self) -> &std::path::Path {
        &self.module_dir
    }

    /// Open the instance's only connection.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<EngineConnection, EngineError> {
        self.worker
            .call(|state| {
                if state.connection.is_some() {
                    return Err(EngineError::Internal(
                        "engine connection already open".to_string(),
                    ));
                }
                let connection = state.database.take().ok_or_else(|| {
                    EngineError::Internal("engine instance not instantiated".to_string())
                })?;
                state.connection = Some(connection);
                Ok(())
            })
            .await?;
        info!("engine connection opened");
        Ok(EngineConnection {
            worker: Arc::clone(&self.worker),
        })
    }

    pub async fn is_connected(&self) -> Result<bool, EngineError> {
        self.worker.call(|state| Ok(state.connection.is_some())).await
    }

    /// Make `buffer` readable by SQL under the logical file `name`.
    #[instrument(skip(self, buffer), fields(bytes = buffer.len()))]
    pub async fn register_file_buffer(&self, name: &str, buffer: Bytes) -> Result<(), EngineError> {
        let name = name.to_string();
        self.worker
            .call(move |state| state.files.register(&name, buffer).map(|_| ()))
            .await
    }

    pub async fn has_file(&self, name: &str) -> Result<bool, EngineError> {
        let name = name.to_string();
        self.worker
            .call(move |state| Ok(state.files.contains(&name)))
            .await
    }
}

/// The single session bound to an [`EngineInstance`].
pub struct EngineConnection {
    worker: Arc<EngineWorker>,
}

impl EngineConnection {
    /// Execute a query and collect its Arrow batches.
    #[instrument(skip(self), fields(sql = %sql))]
    pub async fn query(&self, sql: &str) -> Result<QueryResult, EngineError> {
        check_sql(sql)?;
        let sql = sql.to_string();
        self.worker
            .call(move |state| {
                let conn = state.connection()?;
                let mut stmt = conn.prepare(&sql)?;
                let arrow = stmt.query_arrow([])?;

                let mut total_rows = 0usize;
                let mut total_bytes = 0usize;
                let batches: Vec<RecordBatch> = arrow
                    .inspect(|batch| {
                        total_rows += batch.num_rows();
                        total_bytes += batch.get_array_memory_size();
                    })
                    .collect();

                debug!(
                    batch_count = batches.len(),
                    total_rows, total_bytes, "executed query"
                );
                Ok(QueryResult {
                    batches,
                    total_rows,
                })
            })
            .await
    }

    /// Execute one or more statements without returning rows.
    #[instrument(skip(self), fields(sql = %sql))]
    pub async fn execute_batch(&self, sql: &str) -> Result<(), EngineError> {
        check_sql(sql)?;
        let sql = sql.to_string();
        self.worker
            .call(move |state| Ok(state.connection()?.execute_batch(&sql)?))
            .await?;
        debug!("executed batch");
        Ok(())
    }
}

fn check_sql(sql: &str) -> Result<(), EngineError> {
    if sql.contains('\0') {
        return Err(EngineError::Internal("SQL contains null bytes".to_string()));
    }
    Ok(())
}
