use std::path::{Path, PathBuf};

use crate::ingest::quote_literal;

/// Write a two-row Parquet file (`id INTEGER`, `val VARCHAR`) into `dir`.
pub(crate) async fn write_sample_parquet(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("samples.parquet");
    let target = quote_literal(&path.to_string_lossy());
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let conn = duckdb::Connection::open_in_memory()?;
        conn.execute_batch(&format!(
            "COPY (SELECT * FROM (VALUES (1, 'a'), (2, 'b')) AS t(id, val)) TO {target} (FORMAT parquet)"
        ))?;
        Ok(())
    })
    .await??;
    Ok(path)
}
