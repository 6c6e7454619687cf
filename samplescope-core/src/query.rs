//! Query entry point handed to the front end.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::{debug, error, instrument};

use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::rows::{batches_to_rows, Row};

/// Executes SQL on the engine's connection once it exists.
///
/// The façade never waits for ingestion to finish: callers that query before
/// the lifecycle is ready get whatever the engine reports (typically a missing
/// `samples` view).
#[derive(Clone)]
pub struct QueryFacade {
    handle: Arc<OnceLock<EngineHandle>>,
    metrics: Metrics,
}

impl QueryFacade {
    pub fn new(handle: Arc<OnceLock<EngineHandle>>, metrics: Metrics) -> Self {
        Self { handle, metrics }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.get().is_some()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run `sql` verbatim and return its rows in engine order.
    #[instrument(skip(self), fields(sql = %sql))]
    pub async fn execute_query(&self, sql: &str) -> Result<Vec<Row>, EngineError> {
        let handle = self.handle.get().ok_or_else(|| {
            error!("query rejected: database connection not initialized");
            EngineError::NotInitialized
        })?;

        let _in_flight = self.metrics.start_query();
        let started = Instant::now();
        let outcome = match handle.connection.query(sql).await {
            Ok(result) => batches_to_rows(&result.batches).map_err(EngineError::from),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(rows) => {
                self.metrics
                    .record_query_success(sql, started.elapsed(), rows.len());
                debug!(rows = rows.len(), "query completed");
                Ok(rows)
            }
            Err(err) => {
                let err = EngineError::query(err);
                error!(error = %err, "query error");
                self.metrics
                    .record_query_error(sql, started.elapsed(), err.to_string());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;

    #[tokio::test]
    async fn unset_handle_rejects_without_touching_metrics() -> Result<()> {
        let facade = QueryFacade::new(Arc::new(OnceLock::new()), Metrics::new(10, 4));
        assert!(!facade.is_connected());

        let err = facade
            .execute_query("SELECT 1")
            .await
            .err()
            .ok_or_else(|| anyhow!("expected not initialized"))?;
        assert!(matches!(err, EngineError::NotInitialized));

        let snapshot = facade.metrics().snapshot();
        assert_eq!(snapshot.totals.queries, 0);
        assert_eq!(snapshot.totals.errors, 0);
        Ok(())
    }
}
