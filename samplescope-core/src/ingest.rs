//! Loads the sample data file into the engine and exposes it as `samples`.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{info, instrument};

use crate::engine::{EngineConnection, EngineInstance};
use crate::error::EngineError;

/// Name the fetched bytes are registered under.
pub const LOGICAL_FILE_NAME: &str = "lv_export.parquet";
/// Relation downstream SQL queries.
pub const VIEW_NAME: &str = "samples";

/// Where the data file is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Remote(reqwest::Url),
    Local(PathBuf),
}

impl SourceLocation {
    pub fn parse(location: &str) -> Result<Self, EngineError> {
        let trimmed = location.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = reqwest::Url::parse(trimmed).map_err(|err| EngineError::FetchFailed {
                location: trimmed.to_string(),
                reason: format!("invalid url: {err}"),
            })?;
            return Ok(SourceLocation::Remote(url));
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        Ok(SourceLocation::Local(PathBuf::from(path)))
    }

    /// Read the whole source into memory.
    pub async fn fetch(&self) -> Result<Bytes, EngineError> {
        let failed = |reason: String| EngineError::FetchFailed {
            location: self.to_string(),
            reason,
        };
        match self {
            SourceLocation::Remote(url) => {
                let response = reqwest::get(url.clone())
                    .await
                    .map_err(|err| failed(format!("request failed: {err}")))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(failed(format!("HTTP {status}")));
                }
                response
                    .bytes()
                    .await
                    .map_err(|err| failed(format!("failed to read response body: {err}")))
            }
            SourceLocation::Local(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|err| failed(err.to_string())),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Remote(url) => write!(f, "{url}"),
            SourceLocation::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// What ingestion left behind in the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    pub file_name: String,
    pub view_name: String,
    pub bytes: usize,
}

pub fn view_definition_sql(view: &str, file_name: &str) -> String {
    format!(
        "CREATE OR REPLACE VIEW {} AS SELECT * FROM read_parquet({})",
        quote_ident(view),
        quote_literal(file_name)
    )
}

/// Fetch `source`, register it as [`LOGICAL_FILE_NAME`] and (re)define [`VIEW_NAME`].
#[instrument(skip(instance, connection), fields(source = %source))]
pub async fn ingest(
    instance: &EngineInstance,
    connection: &EngineConnection,
    source: &SourceLocation,
) -> Result<DataSource, EngineError> {
    let buffer = source.fetch().await?;
    let bytes = buffer.len();
    info!(bytes, "fetched source data");

    instance
        .register_file_buffer(LOGICAL_FILE_NAME, buffer)
        .await
        .map_err(|err| match err {
            EngineError::RegistrationFailed { .. } => err,
            other => EngineError::RegistrationFailed {
                name: LOGICAL_FILE_NAME.to_string(),
                reason: other.to_string(),
            },
        })?;

    connection
        .execute_batch(&view_definition_sql(VIEW_NAME, LOGICAL_FILE_NAME))
        .await
        .map_err(|err| match err {
            EngineError::DuckDb(source) => EngineError::ViewDefinitionFailed {
                view: VIEW_NAME.to_string(),
                source,
            },
            other => other,
        })?;

    info!(view = VIEW_NAME, file = LOGICAL_FILE_NAME, "defined data view");
    Ok(DataSource {
        file_name: LOGICAL_FILE_NAME.to_string(),
        view_name: VIEW_NAME.to_string(),
        bytes,
    })
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
