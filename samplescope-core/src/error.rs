use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(String),
    #[error("failed to fetch {location}: {reason}")]
    FetchFailed { location: String, reason: String },
    #[error("failed to register file buffer {name}: {reason}")]
    RegistrationFailed { name: String, reason: String },
    #[error("failed to define view {view}: {source}")]
    ViewDefinitionFailed {
        view: String,
        #[source]
        source: duckdb::Error,
    },
    #[error("database connection not initialized")]
    NotInitialized,
    #[error("query execution failed: {0}")]
    QueryExecutionFailed(#[source] Box<EngineError>),
    #[error("engine initialization already started")]
    AlreadyInitialized,
    #[error("engine worker stopped")]
    WorkerStopped,
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failures while preparing the Parquet data file.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("invalid model config: {0}")]
    Config(String),
    #[error("no common columns found between {left} and {right}")]
    NoCommonColumns { left: String, right: String },
    #[error("failed to parse model config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Wrap an engine-side failure raised while running a caller's query.
    pub fn query(err: EngineError) -> Self {
        match err {
            EngineError::NotInitialized | EngineError::QueryExecutionFailed(_) => err,
            other => EngineError::QueryExecutionFailed(Box::new(other)),
        }
    }
}
