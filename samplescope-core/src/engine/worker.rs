//! Background execution context for the engine.
//!
//! `duckdb::Connection` is not `Sync`, so every DuckDB object lives on a
//! single dedicated thread. Callers submit jobs over a channel and await the
//! reply, which keeps engine calls strictly ordered and never blocks the
//! async runtime.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use duckdb::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, Span};

use crate::engine::bundle::{BundleTier, SelectedBundle};
use crate::engine::files::FileRegistry;
use crate::error::EngineError;

/// Everything owned by the worker thread.
///
/// The database handle opened at instantiation is moved into `connection`
/// by `connect`, so at most one native connection ever exists.
pub struct WorkerState {
    pub(crate) database: Option<Connection>,
    pub(crate) connection: Option<Connection>,
    pub(crate) files: FileRegistry,
}

impl WorkerState {
    pub(crate) fn is_instantiated(&self) -> bool {
        self.database.is_some() || self.connection.is_some()
    }

    pub(crate) fn connection(&mut self) -> Result<&mut Connection, EngineError> {
        self.connection.as_mut().ok_or(EngineError::NotInitialized)
    }
}

type Job = Box<dyn FnOnce(&mut WorkerState) + Send + 'static>;

pub struct EngineWorker {
    name: String,
    tier: BundleTier,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl EngineWorker {
    /// Start the worker thread named after the bundle's worker entrypoint.
    ///
    /// `span` is entered for the lifetime of the thread so that everything the
    /// engine logs is attributed to it.
    pub fn spawn(selected: &SelectedBundle, span: Span) -> Result<Self, EngineError> {
        let files = FileRegistry::new()?;
        let (jobs, mut receiver) = mpsc::unbounded_channel::<Job>();
        let name = selected.bundle.main_worker.clone();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _entered = span.enter();
                let mut state = WorkerState {
                    database: None,
                    connection: None,
                    files,
                };
                debug!("engine worker started");
                while let Some(job) = receiver.blocking_recv() {
                    job(&mut state);
                }
                debug!("engine worker stopped");
            })?;

        Ok(Self {
            name,
            tier: selected.tier,
            jobs: Some(jobs),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(&self) -> BundleTier {
        self.tier
    }

    /// Run `f` on the worker thread and wait for its result.
    pub async fn call<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkerState) -> Result<T, EngineError> + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or(EngineError::WorkerStopped)?;
        let (reply, response) = oneshot::channel();
        let catch_panics = self.tier.catches_panics();

        let job: Job = Box::new(move |state| {
            let result = if catch_panics {
                catch_unwind(AssertUnwindSafe(|| f(state))).unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!(%message, "engine job panicked");
                    Err(EngineError::Internal(format!(
                        "engine job panicked: {message}"
                    )))
                })
            } else {
                f(state)
            };
            let _ = reply.send(result);
        });

        jobs.send(job).map_err(|_| EngineError::WorkerStopped)?;
        response.await.map_err(|_| EngineError::WorkerStopped)?
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!(worker = %self.name, "engine worker exited with a panic");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;
    use crate::engine::bundle::EngineBundle;

    fn selected(tier: BundleTier) -> SelectedBundle {
        SelectedBundle {
            tier,
            bundle: EngineBundle::new("ext", format!("test-worker-{tier}")),
        }
    }

    #[tokio::test]
    async fn jobs_run_on_the_named_worker_thread() -> Result<()> {
        let worker = EngineWorker::spawn(&selected(BundleTier::Mvp), Span::none())?;
        let thread_name = worker
            .call(|_| Ok(std::thread::current().name().map(str::to_string)))
            .await?;
        assert_eq!(thread_name.as_deref(), Some("test-worker-mvp"));
        assert_eq!(worker.name(), "test-worker-mvp");
        Ok(())
    }

    #[tokio::test]
    async fn jobs_execute_in_submission_order() -> Result<()> {
        let worker = EngineWorker::spawn(&selected(BundleTier::Mvp), Span::none())?;
        let mut seen = Vec::new();
        for i in 0..5 {
            seen.push(worker.call(move |_| Ok(i)).await?);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn connection_is_missing_before_connect() -> Result<()> {
        let worker = EngineWorker::spawn(&selected(BundleTier::Mvp), Span::none())?;
        let err = worker
            .call(|state| state.connection().map(|_| ()))
            .await
            .err()
            .ok_or_else(|| anyhow!("expected missing connection"))?;
        assert!(matches!(err, EngineError::NotInitialized));
        Ok(())
    }

    #[tokio::test]
    async fn eh_tier_reports_panics_and_keeps_serving() -> Result<()> {
        let worker = EngineWorker::spawn(&selected(BundleTier::Eh), Span::none())?;
        let err = worker
            .call::<(), _>(|_| panic!("bad job"))
            .await
            .err()
            .ok_or_else(|| anyhow!("expected panic to surface as an error"))?;
        assert!(err.to_string().contains("bad job"));

        let value = worker.call(|_| Ok(42)).await?;
        assert_eq!(value, 42);
        Ok(())
    }

    #[tokio::test]
    async fn mvp_tier_stops_after_a_panic() -> Result<()> {
        let worker = EngineWorker::spawn(&selected(BundleTier::Mvp), Span::none())?;
        let err = worker
            .call::<(), _>(|_| panic!("bad job"))
            .await
            .err()
            .ok_or_else(|| anyhow!("expected worker to stop"))?;
        assert!(matches!(err, EngineError::WorkerStopped));

        let err = worker
            .call(|_| Ok(()))
            .await
            .err()
            .ok_or_else(|| anyhow!("expected stopped worker to reject jobs"))?;
        assert!(matches!(err, EngineError::WorkerStopped));
        Ok(())
    }
}
