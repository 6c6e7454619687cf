use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::engine::bundle::{default_bundles, EngineBundle};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Location of the Parquet file loaded at startup: a local path or an http(s) URL.
    pub source_location: String,
    /// Optional SQL executed on the connection before the data file is ingested.
    pub init_sql: Option<String>,
    /// Engine module/worker pairs keyed by capability tier (`mvp`, `eh`).
    pub bundles: BTreeMap<String, EngineBundle>,
    /// Optional upper bound on the whole initialization sequence. Unset means no timeout.
    pub init_timeout_seconds: Option<u64>,
    /// Queries slower than this are kept in the slow query history.
    pub slow_query_threshold_ms: u64,
    /// Number of samples kept for latency, slow query and error histories.
    pub metrics_history_size: usize,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4215,
            source_location: "public/lv_export.parquet".to_string(),
            init_sql: None,
            bundles: default_bundles(),
            init_timeout_seconds: None,
            slow_query_threshold_ms: 1_000,
            metrics_history_size: 200,
            log_format: "compact".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("SAMPLESCOPE"))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: AppConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to resolve bind address for {addr}"))
    }

    pub fn init_timeout(&self) -> Option<Duration> {
        self.init_timeout_seconds.map(Duration::from_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source_location.trim().is_empty() {
            anyhow::bail!("source_location must not be empty");
        }
        if !matches!(self.log_format.as_str(), "compact" | "json") {
            anyhow::bail!(
                "unsupported log_format {:?}; expected \"compact\" or \"json\"",
                self.log_format
            );
        }
        Ok(())
    }
}
