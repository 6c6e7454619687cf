use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use samplescope_core::convert::{
    convert_csv_to_parquet, convert_xlsx_to_parquet, ConversionReport, ModelConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Prepare the Parquet file served to the sample viewer.
#[derive(Debug, Parser)]
#[command(name = "samplescope-convert", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Join CSV exports described by a model config and write Parquet.
    Csv {
        /// JSON model config (file_names, join, column_mapping, columns, default_type).
        #[arg(long, default_value = "data/config/model.json")]
        config: PathBuf,
        /// Directory containing the CSV files named in the config.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "public/lv_export.parquet")]
        output: PathBuf,
    },
    /// Convert the first sheet of an .xlsx workbook to Parquet.
    Xlsx {
        input: PathBuf,
        #[arg(long, default_value = "public/lv_export.parquet")]
        output: PathBuf,
        /// Columns parsed as timestamps.
        #[arg(long = "date-column", default_value = "VISITDATE")]
        date_columns: Vec<String>,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let report = match cli.command {
        Command::Csv {
            config,
            data_dir,
            output,
        } => {
            let model = ModelConfig::load(&config)
                .with_context(|| format!("failed to read model config {}", config.display()))?;
            convert_csv_to_parquet(&model, &data_dir, &output).context("csv conversion failed")?
        }
        Command::Xlsx {
            input,
            output,
            date_columns,
        } => convert_xlsx_to_parquet(&input, &output, &date_columns)
            .context("xlsx conversion failed")?,
    };
    print_report(&report);
    Ok(())
}

fn print_report(report: &ConversionReport) {
    info!(
        output = %report.output.display(),
        rows = report.rows,
        columns = report.columns.len(),
        "wrote parquet file"
    );
    if !report.list_columns.is_empty() {
        info!(columns = ?report.list_columns, "list columns");
    }
    println!(
        "{}: {} rows, {} columns, {:.2} MB",
        report.output.display(),
        report.rows,
        report.columns.len(),
        report.file_size_bytes as f64 / (1024.0 * 1024.0)
    );
}
