//! One-shot engine startup and the status the front end observes.
//!
//! `initialize` runs the whole sequence exactly once: select a bundle, start
//! the worker, instantiate the database, open the connection, ingest the
//! sample data. Any failure ends in `Failed(reason)`; a second call is
//! rejected with [`EngineError::AlreadyInitialized`] and changes nothing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, info_span, instrument, warn};

use crate::config::AppConfig;
use crate::engine::{
    select_bundle, EngineBundle, EngineHandle, EngineInstance, EngineWorker, PlatformFeatures,
};
use crate::error::EngineError;
use crate::ingest::{ingest, DataSource, SourceLocation};
use crate::metrics::Metrics;
use crate::query::QueryFacade;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum LifecycleStatus {
    Loading,
    Ready,
    Failed(String),
}

pub struct Lifecycle {
    bundles: BTreeMap<String, EngineBundle>,
    source_location: String,
    init_sql: Option<String>,
    init_timeout: Option<Duration>,
    platform: PlatformFeatures,
    started: AtomicBool,
    status: watch::Sender<LifecycleStatus>,
    handle: Arc<OnceLock<EngineHandle>>,
    metrics: Metrics,
}

impl Lifecycle {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_platform(config, PlatformFeatures::probe())
    }

    pub fn with_platform(config: &AppConfig, platform: PlatformFeatures) -> Self {
        let (status, _) = watch::channel(LifecycleStatus::Loading);
        Self {
            bundles: config.bundles.clone(),
            source_location: config.source_location.clone(),
            init_sql: config.init_sql.clone(),
            init_timeout: config.init_timeout(),
            platform,
            started: AtomicBool::new(false),
            status,
            handle: Arc::new(OnceLock::new()),
            metrics: Metrics::new(config.slow_query_threshold_ms, config.metrics_history_size),
        }
    }

    pub fn status(&self) -> LifecycleStatus {
        self.status.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.status.borrow(), LifecycleStatus::Loading)
    }

    /// Failure reason, if initialization failed.
    pub fn error(&self) -> Option<String> {
        match &*self.status.borrow() {
            LifecycleStatus::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleStatus> {
        self.status.subscribe()
    }

    pub fn query_facade(&self) -> QueryFacade {
        QueryFacade::new(Arc::clone(&self.handle), self.metrics.clone())
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn engine(&self) -> Option<&EngineHandle> {
        self.handle.get()
    }

    /// Run the startup sequence. Only the first call does any work.
    #[instrument(skip(self), fields(source = %self.source_location))]
    pub async fn initialize(&self) -> Result<LifecycleStatus, EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("engine initialization requested again; rejecting");
            return Err(EngineError::AlreadyInitialized);
        }
        info!("initializing engine");

        let outcome = match self.init_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run()).await {
                Ok(result) => result.map_err(|err| err.to_string()),
                Err(_) => Err(format!(
                    "initialization timed out after {}s",
                    limit.as_secs()
                )),
            },
            None => self.run().await.map_err(|err| err.to_string()),
        };

        let status = match outcome {
            Ok(data) => {
                info!(
                    view = %data.view_name,
                    file = %data.file_name,
                    bytes = data.bytes,
                    "engine ready"
                );
                LifecycleStatus::Ready
            }
            Err(reason) => {
                error!(%reason, "failed to initialize engine");
                self.metrics
                    .record_error("initialization", None, reason.clone());
                LifecycleStatus::Failed(reason)
            }
        };
        self.status.send_replace(status.clone());
        Ok(status)
    }

    async fn run(&self) -> Result<DataSource, EngineError> {
        let selected = select_bundle(&self.bundles, &self.platform)?;
        let span = info_span!(
            "engine",
            tier = %selected.tier,
            worker = %selected.bundle.main_worker
        );
        let worker = Arc::new(EngineWorker::spawn(&selected, span)?);
        let instance = EngineInstance::instantiate(worker, &selected.bundle.main_module).await?;
        let connection = instance.connect().await?;

        self.handle
            .set(EngineHandle {
                instance,
                connection,
            })
            .map_err(|_| EngineError::Internal("engine handle already set".to_string()))?;
        let handle = self
            .handle
            .get()
            .ok_or_else(|| EngineError::Internal("engine handle missing".to_string()))?;

        if let Some(sql) = self.init_sql.as_deref().filter(|sql| !sql.trim().is_empty()) {
            info!("running startup sql");
            handle.connection.execute_batch(sql).await?;
        }

        let source = SourceLocation::parse(&self.source_location)?;
        ingest(&handle.instance, &handle.connection, &source).await
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::{anyhow, Result};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use serde_json::{json, Value};

    use super::*;
    use crate::engine::bundle::{EH_TIER, MVP_TIER};
    use crate::testing::write_sample_parquet;

    const FULL: PlatformFeatures = PlatformFeatures {
        exceptions: true,
        threads: true,
    };

    fn config(root: &Path, source: impl Into<String>) -> AppConfig {
        let mut bundles = BTreeMap::new();
        bundles.insert(
            MVP_TIER.to_string(),
            EngineBundle::new(root.join("ext-mvp").to_string_lossy(), "lifecycle-mvp"),
        );
        bundles.insert(
            EH_TIER.to_string(),
            EngineBundle::new(root.join("ext-eh").to_string_lossy(), "lifecycle-eh"),
        );
        AppConfig {
            source_location: source.into(),
            bundles,
            ..AppConfig::default()
        }
    }

    async fn ready_lifecycle(root: &Path) -> Result<Lifecycle> {
        let source = write_sample_parquet(root).await?;
        let lifecycle = Lifecycle::with_platform(&config(root, source.to_string_lossy()), FULL);
        let status = lifecycle.initialize().await?;
        assert_eq!(status, LifecycleStatus::Ready);
        Ok(lifecycle)
    }

    async fn serve(router: Router) -> Result<std::net::SocketAddr> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(addr)
    }

    fn as_json(rows: Vec<crate::rows::Row>) -> Vec<Value> {
        rows.into_iter().map(Value::Object).collect()
    }

    #[tokio::test]
    async fn successful_initialization_reaches_ready() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lifecycle = ready_lifecycle(dir.path()).await?;

        assert!(!lifecycle.is_loading());
        assert_eq!(lifecycle.error(), None);
        let engine = lifecycle
            .engine()
            .ok_or_else(|| anyhow!("expected engine handle"))?;
        assert!(engine.instance.is_connected().await?);
        assert_eq!(engine.instance.tier().as_str(), "eh");
        assert!(engine.instance.connect().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn status_starts_loading_and_subscribers_see_ready() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = write_sample_parquet(dir.path()).await?;
        let lifecycle =
            Lifecycle::with_platform(&config(dir.path(), source.to_string_lossy()), FULL);
        assert!(lifecycle.is_loading());
        assert!(lifecycle.is_loading());

        let mut updates = lifecycle.subscribe();
        lifecycle.initialize().await?;
        updates.changed().await?;
        assert_eq!(*updates.borrow(), LifecycleStatus::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn query_returns_rows_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lifecycle = ready_lifecycle(dir.path()).await?;
        let facade = lifecycle.query_facade();

        let rows = facade
            .execute_query("SELECT * FROM samples ORDER BY id")
            .await?;
        assert_eq!(
            as_json(rows),
            vec![json!({"id": 1, "val": "a"}), json!({"id": 2, "val": "b"})]
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_view_fails_query_without_touching_status() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lifecycle = ready_lifecycle(dir.path()).await?;
        let facade = lifecycle.query_facade();

        let err = facade
            .execute_query("SELECT * FROM nonexistent_view")
            .await
            .err()
            .ok_or_else(|| anyhow!("expected query failure"))?;
        assert!(matches!(err, EngineError::QueryExecutionFailed(_)));
        assert_eq!(lifecycle.status(), LifecycleStatus::Ready);

        let snapshot = lifecycle.metrics().snapshot();
        assert_eq!(snapshot.totals.errors, 1);
        assert_eq!(snapshot.recent_errors[0].context, "query");
        Ok(())
    }

    #[tokio::test]
    async fn sequential_queries_do_not_interleave() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lifecycle = ready_lifecycle(dir.path()).await?;
        let facade = lifecycle.query_facade();

        let first = facade
            .execute_query("SELECT id FROM samples WHERE id = 1")
            .await?;
        let second = facade
            .execute_query("SELECT val FROM samples WHERE id = 2")
            .await?;
        assert_eq!(as_json(first), vec![json!({"id": 1})]);
        assert_eq!(as_json(second), vec![json!({"val": "b"})]);
        Ok(())
    }

    #[tokio::test]
    async fn mutating_sql_is_passed_through() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lifecycle = ready_lifecycle(dir.path()).await?;
        let facade = lifecycle.query_facade();

        facade
            .execute_query("CREATE TABLE notes AS SELECT id, val || '!' AS note FROM samples")
            .await?;
        let rows = facade
            .execute_query("SELECT note FROM notes ORDER BY id")
            .await?;
        assert_eq!(
            as_json(rows),
            vec![json!({"note": "a!"}), json!({"note": "b!"})]
        );
        Ok(())
    }

    #[tokio::test]
    async fn query_before_initialization_is_not_initialized() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lifecycle = Lifecycle::with_platform(&config(dir.path(), "unused.parquet"), FULL);
        let facade = lifecycle.query_facade();

        let err = facade
            .execute_query("SELECT 1")
            .await
            .err()
            .ok_or_else(|| anyhow!("expected not initialized"))?;
        assert!(matches!(err, EngineError::NotInitialized));
        assert!(!facade.is_connected());
        assert_eq!(lifecycle.metrics().snapshot().totals.queries, 0);
        Ok(())
    }

    #[tokio::test]
    async fn no_usable_bundle_fails_without_a_connection() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = AppConfig {
            bundles: BTreeMap::new(),
            ..config(dir.path(), "unused.parquet")
        };
        let lifecycle = Lifecycle::with_platform(&config, FULL);

        let status = lifecycle.initialize().await?;
        let LifecycleStatus::Failed(reason) = status else {
            return Err(anyhow!("expected failed status, got {status:?}"));
        };
        assert!(reason.contains("unsupported environment"));
        assert!(lifecycle.engine().is_none());
        assert!(matches!(
            lifecycle.query_facade().execute_query("SELECT 1").await,
            Err(EngineError::NotInitialized)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn fetch_failure_leaves_connection_but_no_view() -> Result<()> {
        let addr = serve(Router::new().route(
            "/lv_export.parquet",
            get(|| async { StatusCode::NOT_FOUND }),
        ))
        .await?;
        let dir = tempfile::tempdir()?;
        let lifecycle = Lifecycle::with_platform(
            &config(dir.path(), format!("http://{addr}/lv_export.parquet")),
            FULL,
        );

        let status = lifecycle.initialize().await?;
        let reason = lifecycle
            .error()
            .ok_or_else(|| anyhow!("expected failure reason, got {status:?}"))?;
        assert!(reason.contains("failed to fetch"));
        assert!(reason.contains("404"));
        assert!(lifecycle.engine().is_some());

        let err = lifecycle
            .query_facade()
            .execute_query("SELECT * FROM samples")
            .await
            .err()
            .ok_or_else(|| anyhow!("expected samples to be undefined"))?;
        assert!(matches!(err, EngineError::QueryExecutionFailed(_)));
        assert_eq!(lifecycle.metrics().snapshot().recent_errors.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn view_definition_failure_is_reported_in_status() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = write_sample_parquet(dir.path()).await?;
        let config = AppConfig {
            init_sql: Some("CREATE TABLE samples (x INTEGER)".to_string()),
            ..config(dir.path(), source.to_string_lossy())
        };
        let lifecycle = Lifecycle::with_platform(&config, FULL);

        let status = lifecycle.initialize().await?;
        let LifecycleStatus::Failed(reason) = status else {
            return Err(anyhow!("expected failed status, got {status:?}"));
        };
        assert!(reason.contains("failed to define view"), "{reason}");
        assert_eq!(lifecycle.error().as_deref(), Some(reason.as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn startup_sql_runs_before_ingestion() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = write_sample_parquet(dir.path()).await?;
        let config = AppConfig {
            init_sql: Some("CREATE TABLE visits AS SELECT 7 AS n".to_string()),
            ..config(dir.path(), source.to_string_lossy())
        };
        let lifecycle = Lifecycle::with_platform(&config, FULL);
        assert_eq!(lifecycle.initialize().await?, LifecycleStatus::Ready);

        let rows = lifecycle
            .query_facade()
            .execute_query("SELECT n FROM visits")
            .await?;
        assert_eq!(as_json(rows), vec![json!({"n": 7})]);
        Ok(())
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lifecycle = ready_lifecycle(dir.path()).await?;

        let err = lifecycle
            .initialize()
            .await
            .err()
            .ok_or_else(|| anyhow!("expected re-entry to be rejected"))?;
        assert!(matches!(err, EngineError::AlreadyInitialized));
        assert_eq!(lifecycle.status(), LifecycleStatus::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_initialize_runs_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = write_sample_parquet(dir.path()).await?;
        let lifecycle =
            Lifecycle::with_platform(&config(dir.path(), source.to_string_lossy()), FULL);

        let (left, right) = tokio::join!(lifecycle.initialize(), lifecycle.initialize());
        let rejected = [&left, &right]
            .iter()
            .filter(|outcome| matches!(outcome, Err(EngineError::AlreadyInitialized)))
            .count();
        assert_eq!(rejected, 1);
        assert_eq!(lifecycle.status(), LifecycleStatus::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn configured_timeout_fails_a_stalled_fetch() -> Result<()> {
        let addr = serve(Router::new().route(
            "/lv_export.parquet",
            get(|| async {
                std::future::pending::<()>().await;
                StatusCode::OK
            }),
        ))
        .await?;
        let dir = tempfile::tempdir()?;
        let config = AppConfig {
            init_timeout_seconds: Some(1),
            ..config(dir.path(), format!("http://{addr}/lv_export.parquet"))
        };
        let lifecycle = Lifecycle::with_platform(&config, FULL);

        let status = lifecycle.initialize().await?;
        assert_eq!(
            status,
            LifecycleStatus::Failed("initialization timed out after 1s".to_string())
        );
        Ok(())
    }

    #[test]
    fn status_serializes_with_reason() -> Result<()> {
        assert_eq!(
            serde_json::to_value(LifecycleStatus::Failed("boom".to_string()))?,
            json!({"state": "failed", "reason": "boom"})
        );
        assert_eq!(
            serde_json::to_value(LifecycleStatus::Ready)?,
            json!({"state": "ready"})
        );
        Ok(())
    }
}
