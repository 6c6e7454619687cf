//! Builds the Parquet file the viewer loads, from CSV exports or a workbook.
//!
//! All reshaping (joins, renames, type coercion) runs as SQL on a scratch
//! in-memory DuckDB connection and the result is written with `COPY ... TO`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use duckdb::Connection;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::ConvertError;
use crate::ingest::{quote_ident, quote_literal};

/// JSON model describing how CSV exports become one table.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub file_names: Vec<String>,
    #[serde(default)]
    pub join: JoinConfig,
    /// Old column name to new column name, applied after joining.
    #[serde(default)]
    pub column_mapping: BTreeMap<String, String>,
    /// Per-column type coercions, keyed by the renamed column.
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSpec>,
    /// Type applied to text columns without an explicit entry.
    #[serde(default = "default_column_type")]
    pub default_type: String,
}

fn default_column_type() -> String {
    "string".to_string()
}

impl ModelConfig {
    pub fn load(path: &Path) -> Result<Self, ConvertError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinConfig {
    #[serde(rename = "type", default)]
    pub kind: JoinKind,
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Left,
    Right,
    Inner,
    Outer,
}

impl JoinKind {
    fn sql(&self) -> &'static str {
        match self {
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Outer => "FULL OUTER JOIN",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    #[serde(rename = "type")]
    pub kind: String,
    /// Separator for `array_of_strings`; defaults to a comma.
    #[serde(default)]
    pub delimiter: Option<String>,
}

/// Formats tried, in order, for date strings that are not ISO 8601.
/// Slash dates are read month first.
const DATETIME_FORMATS: &str = "['%m/%d/%Y', '%m/%d/%Y %H:%M:%S', '%m/%d/%Y %H:%M', '%m/%d/%y', \
     '%Y/%m/%d', '%d.%m.%Y', '%d-%b-%Y', '%B %d, %Y']";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Datetime,
    ArrayOfStrings,
    Category,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
}

impl ColumnType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "datetime" => Some(ColumnType::Datetime),
            "array_of_strings" => Some(ColumnType::ArrayOfStrings),
            "category" => Some(ColumnType::Category),
            "int32" => Some(ColumnType::Int32),
            "int64" => Some(ColumnType::Int64),
            "float32" => Some(ColumnType::Float32),
            "float64" => Some(ColumnType::Float64),
            "string" => Some(ColumnType::String),
            _ => None,
        }
    }

    /// SQL converting `column`; values that do not convert become NULL.
    fn cast_sql(&self, column: &str, delimiter: &str) -> String {
        match self {
            ColumnType::Datetime => format!(
                "COALESCE(TRY_CAST({column} AS TIMESTAMP), try_strptime(CAST({column} AS VARCHAR), {DATETIME_FORMATS}))"
            ),
            ColumnType::ArrayOfStrings => format!(
                "CASE WHEN {column} IS NULL THEN CAST([] AS VARCHAR[]) \
                 ELSE list_transform(string_split(CAST({column} AS VARCHAR), {}), lambda x: trim(x)) END",
                quote_literal(delimiter)
            ),
            ColumnType::Category | ColumnType::String => format!("CAST({column} AS VARCHAR)"),
            ColumnType::Int32 => format!("TRY_CAST({column} AS INTEGER)"),
            ColumnType::Int64 => format!("TRY_CAST({column} AS BIGINT)"),
            ColumnType::Float32 => format!("TRY_CAST({column} AS FLOAT)"),
            ColumnType::Float64 => format!("TRY_CAST({column} AS DOUBLE)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub output: PathBuf,
    pub rows: u64,
    pub columns: Vec<String>,
    pub list_columns: Vec<String>,
    pub file_size_bytes: u64,
}

#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    data_type: String,
}

/// Join the CSV files named by `config` (relative to `data_dir`), reshape them
/// and write the result to `output` as Snappy-compressed Parquet.
pub fn convert_csv_to_parquet(
    config: &ModelConfig,
    data_dir: &Path,
    output: &Path,
) -> Result<ConversionReport, ConvertError> {
    let Some((first, rest)) = config.file_names.split_first() else {
        return Err(ConvertError::Config(
            "no file_names specified in config".to_string(),
        ));
    };
    let conn = Connection::open_in_memory()?;

    let mut current = load_csv(&conn, &data_dir.join(first), "src_0")?;
    for (idx, file) in rest.iter().enumerate() {
        let right = load_csv(&conn, &data_dir.join(file), &format!("src_{}", idx + 1))?;
        current = join_tables(&conn, &config.join, &current, &right, &format!("joined_{}", idx + 1))?;
    }

    let columns = table_columns(&conn, &current)?;
    let columns = apply_column_mapping(columns, &config.column_mapping);
    let columns: Vec<(ColumnInfo, String)> = columns
        .into_iter()
        .filter(|(_, name)| !name.starts_with("Unnamed"))
        .collect();

    let default_type = ColumnType::parse(&config.default_type);
    if default_type.is_none() {
        warn!(default_type = %config.default_type, "unknown default_type; leaving text columns as-is");
    }

    let mut projection = Vec::with_capacity(columns.len());
    let mut list_columns = Vec::new();
    for (source, name) in &columns {
        let column = quote_ident(&source.name);
        let expr = match config.columns.get(name) {
            Some(spec) => match ColumnType::parse(&spec.kind) {
                Some(kind) => {
                    info!(column = %name, kind = %spec.kind, "converting column");
                    if kind == ColumnType::ArrayOfStrings {
                        list_columns.push(name.clone());
                    }
                    kind.cast_sql(&column, spec.delimiter.as_deref().unwrap_or(","))
                }
                None => {
                    warn!(column = %name, kind = %spec.kind, "unknown column type; keeping column unchanged");
                    column
                }
            },
            None if source.data_type == "VARCHAR" => match default_type {
                Some(kind) => kind.cast_sql(&column, ","),
                None => column,
            },
            None => column,
        };
        projection.push(format!("{expr} AS {}", quote_ident(name)));
    }

    let select = format!("SELECT {} FROM {}", projection.join(", "), quote_ident(&current));
    let mut report = write_parquet(&conn, &select, output)?;
    report.list_columns = list_columns;
    Ok(report)
}

/// Convert the first sheet of an `.xlsx` workbook, coercing `date_columns`
/// to timestamps.
pub fn convert_xlsx_to_parquet(
    input: &Path,
    output: &Path,
    date_columns: &[String],
) -> Result<ConversionReport, ConvertError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("INSTALL excel; LOAD excel;")?;
    conn.execute_batch(&format!(
        "CREATE TEMP TABLE sheet AS SELECT * FROM read_xlsx({})",
        quote_literal(&input.to_string_lossy())
    ))?;
    info!(input = %input.display(), "loaded workbook");

    let projection: Vec<String> = table_columns(&conn, "sheet")?
        .into_iter()
        .map(|column| {
            let ident = quote_ident(&column.name);
            if date_columns.iter().any(|date| date == &column.name) {
                info!(column = %column.name, "converting date column");
                format!("{} AS {ident}", ColumnType::Datetime.cast_sql(&ident, ","))
            } else {
                ident
            }
        })
        .collect();
    let select = format!("SELECT {} FROM sheet", projection.join(", "));
    write_parquet(&conn, &select, output)
}

fn load_csv(conn: &Connection, path: &Path, table: &str) -> Result<String, ConvertError> {
    if !path.is_file() {
        return Err(ConvertError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("csv file not found: {}", path.display()),
        )));
    }
    conn.execute_batch(&format!(
        "CREATE TEMP TABLE {} AS SELECT * FROM read_csv_auto({}, header = true)",
        quote_ident(table),
        quote_literal(&path.to_string_lossy())
    ))?;
    let rows = row_count(conn, table)?;
    info!(file = %path.display(), table, rows, "loaded csv");
    Ok(table.to_string())
}

fn join_tables(
    conn: &Connection,
    join: &JoinConfig,
    left: &str,
    right: &str,
    target: &str,
) -> Result<String, ConvertError> {
    let left_columns = table_columns(conn, left)?;
    let right_columns = table_columns(conn, right)?;
    let in_left = |name: &str| left_columns.iter().any(|c| c.name == name);
    let in_right = |name: &str| right_columns.iter().any(|c| c.name == name);

    let key = match join.column.as_deref() {
        Some(column) if in_left(column) && in_right(column) => column.to_string(),
        _ => left_columns
            .iter()
            .find(|c| in_right(&c.name))
            .map(|c| c.name.clone())
            .ok_or_else(|| ConvertError::NoCommonColumns {
                left: left.to_string(),
                right: right.to_string(),
            })?,
    };
    let key_ident = quote_ident(&key);

    let mut select = Vec::with_capacity(left_columns.len() + right_columns.len());
    for column in &left_columns {
        let ident = quote_ident(&column.name);
        if column.name == key {
            let expr = match join.kind {
                JoinKind::Right => format!("r.{ident}"),
                JoinKind::Outer => format!("COALESCE(l.{ident}, r.{ident})"),
                JoinKind::Left | JoinKind::Inner => format!("l.{ident}"),
            };
            select.push(format!("{expr} AS {ident}"));
        } else if in_right(&column.name) {
            select.push(format!(
                "l.{ident} AS {}",
                quote_ident(&format!("{}_x", column.name))
            ));
        } else {
            select.push(format!("l.{ident}"));
        }
    }
    for column in &right_columns {
        if column.name == key {
            continue;
        }
        let ident = quote_ident(&column.name);
        if in_left(&column.name) {
            select.push(format!(
                "r.{ident} AS {}",
                quote_ident(&format!("{}_y", column.name))
            ));
        } else {
            select.push(format!("r.{ident}"));
        }
    }

    conn.execute_batch(&format!(
        "CREATE TEMP TABLE {} AS SELECT {} FROM {} AS l {} {} AS r ON l.{key_ident} = r.{key_ident}",
        quote_ident(target),
        select.join(", "),
        quote_ident(left),
        join.kind.sql(),
        quote_ident(right),
    ))?;
    let rows = row_count(conn, target)?;
    info!(key = %key, kind = ?join.kind, rows, "joined tables");
    Ok(target.to_string())
}

fn apply_column_mapping(
    columns: Vec<ColumnInfo>,
    mapping: &BTreeMap<String, String>,
) -> Vec<(ColumnInfo, String)> {
    for old in mapping.keys() {
        if !columns.iter().any(|c| &c.name == old) {
            warn!(column = %old, "mapped column not found in data");
        }
    }
    columns
        .into_iter()
        .map(|column| {
            let name = match mapping.get(&column.name) {
                Some(new) => {
                    debug!(from = %column.name, to = %new, "renaming column");
                    new.clone()
                }
                None => column.name.clone(),
            };
            (column, name)
        })
        .collect()
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, ConvertError> {
    let mut stmt = conn.prepare(&format!("DESCRIBE {}", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get(0)?,
            data_type: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn row_count(conn: &Connection, table: &str) -> Result<u64, ConvertError> {
    let count: i64 = conn.query_row(
        &format!("SELECT count(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn write_parquet(
    conn: &Connection,
    select: &str,
    output: &Path,
) -> Result<ConversionReport, ConvertError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    conn.execute_batch(&format!("CREATE OR REPLACE TEMP TABLE export AS {select}"))?;
    conn.execute_batch(&format!(
        "COPY export TO {} (FORMAT parquet, COMPRESSION snappy)",
        quote_literal(&output.to_string_lossy())
    ))?;

    let rows = row_count(conn, "export")?;
    let columns = table_columns(conn, "export")?
        .into_iter()
        .map(|c| c.name)
        .collect();
    let file_size_bytes = fs::metadata(output)?.len();
    info!(
        output = %output.display(),
        rows,
        size_mb = format!("{:.2}", file_size_bytes as f64 / (1024.0 * 1024.0)),
        "conversion complete"
    );
    Ok(ConversionReport {
        output: output.to_path_buf(),
        rows,
        columns,
        list_columns: Vec::new(),
        file_size_bytes,
    })
}
