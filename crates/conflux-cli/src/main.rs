//! Conflux CLI - stream JSON records into PostgreSQL tables
//!
//! Usage:
//!   conflux upsert --table foos --input foos.ndjson     Upsert NDJSON records
//!   conflux upsert --table foos --format json < a.json  Upsert one JSON array from stdin
//!   conflux upsert --table foos --id-field id --omit createdAt
//!   conflux upsert --table foos --strategy update-then-insert
//!   conflux upsert --table foos --dry-run               Print the COPY payload only
//!   conflux inspect --table foos                        Show the introspected model
//!
//! The database URL comes from --database-url, DATABASE_URL or the
//! [database] section of conflux.toml, in that order.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use conflux_postgres::{
    encode_copy_rows, BulkUpsertable, ConfluxError, Connection, MergeStrategy, RecordSource,
    Session, TableModel, UpsertOptions,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::info;

use config::ConfluxConfig;

#[derive(Parser)]
#[command(name = "conflux")]
#[command(about = "Bulk upsert JSON records into PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to conflux.toml (default: ./conflux.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL (overrides DATABASE_URL and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge records from a file or stdin into a table
    Upsert {
        /// Target table
        #[arg(short, long)]
        table: String,

        /// Schema of the target table
        #[arg(short, long)]
        schema: Option<String>,

        /// Identity column (repeatable; default: primary key)
        #[arg(long = "id-field")]
        id_fields: Vec<String>,

        /// Column to leave untouched (repeatable)
        #[arg(long)]
        omit: Vec<String>,

        /// Merge strategy
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Input file, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Input format
        #[arg(short, long, value_enum, default_value = "ndjson")]
        format: InputFormat,

        /// Print the CSV that would be sent to COPY instead of writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the model conflux derives from a table
    Inspect {
        /// Table to inspect
        #[arg(short, long)]
        table: String,

        /// Schema of the table
        #[arg(short, long)]
        schema: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    OnConflict,
    UpdateThenInsert,
}

impl From<StrategyArg> for MergeStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::OnConflict => MergeStrategy::OnConflict,
            StrategyArg::UpdateThenInsert => MergeStrategy::UpdateThenInsert,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum InputFormat {
    /// One JSON object per line
    Ndjson,
    /// A single top-level JSON array
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    let config = ConfluxConfig::load(cli.config.as_deref(), &cwd)?;
    let database_url =
        config.database_url(cli.database_url.as_deref(), std::env::var("DATABASE_URL").ok())?;

    match cli.command {
        Commands::Upsert {
            table,
            schema,
            id_fields,
            omit,
            strategy,
            input,
            format,
            dry_run,
        } => {
            let options = upsert_options(&config, id_fields, omit, strategy);
            run_upsert(&config, &database_url, &table, schema.as_deref(), &input, format, options, dry_run)
                .await?;
        }
        Commands::Inspect { table, schema } => {
            run_inspect(&config, &database_url, &table, schema.as_deref()).await?;
        }
    }

    Ok(())
}

/// Flags replace the `[upsert]` defaults they name.
fn upsert_options(
    config: &ConfluxConfig,
    id_fields: Vec<String>,
    omit: Vec<String>,
    strategy: Option<StrategyArg>,
) -> UpsertOptions {
    let mut options = config.upsert.clone();
    if !id_fields.is_empty() {
        options = options.id_fields(id_fields);
    }
    if !omit.is_empty() {
        options = options.omit(omit);
    }
    if let Some(strategy) = strategy {
        options = options.strategy(strategy.into());
    }
    options
}

async fn connect(config: &ConfluxConfig, database_url: &str) -> Result<Connection> {
    Connection::new(database_url, config.database.pool.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect: {}", e))
}

#[allow(clippy::too_many_arguments)]
async fn run_upsert(
    config: &ConfluxConfig,
    database_url: &str,
    table: &str,
    schema: Option<&str>,
    input: &str,
    format: InputFormat,
    options: UpsertOptions,
    dry_run: bool,
) -> Result<()> {
    let conn = connect(config, database_url).await?;
    let model = TableModel::introspect(&conn, table, schema)
        .await
        .with_context(|| format!("Failed to introspect '{}'", table))?;
    options
        .validate(&model)
        .map_err(|e| anyhow::anyhow!("Invalid options: {}", e))?;

    let reader = open_input(input).await?;
    let source = match format {
        InputFormat::Ndjson => RecordSource::from_stream(ndjson_records(reader)),
        InputFormat::Json => RecordSource::from_json(read_json(reader).await?)?,
    };

    if dry_run {
        let records: Vec<JsonValue> = match source {
            RecordSource::Records(records) => records,
            RecordSource::Stream(stream) => stream
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .collect::<std::result::Result<_, _>>()?,
        };
        let (columns, csv) = encode_copy_rows(&model, &records, &options)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", columns.join(","))?;
        stdout.write_all(&csv)?;
        return Ok(());
    }

    info!(table = %table, input = %input, "Upserting records");
    let summary = model
        .bulk_upsert_stream(Session::Pool(&conn), source, &options)
        .await
        .map_err(|e| anyhow::anyhow!("Upsert into '{}' failed: {}", table, e))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    conn.close().await?;
    Ok(())
}

async fn run_inspect(
    config: &ConfluxConfig,
    database_url: &str,
    table: &str,
    schema: Option<&str>,
) -> Result<()> {
    let conn = connect(config, database_url).await?;
    let model = TableModel::introspect(&conn, table, schema)
        .await
        .with_context(|| format!("Failed to introspect '{}'", table))?;

    println!("Table: {}", model.table_name());
    println!();
    println!("{:<32} {:<14} {:<5} {:<8} {}", "COLUMN", "TYPE", "PK", "NULL", "DEFAULT");
    for column in model.columns() {
        println!(
            "{:<32} {:<14} {:<5} {:<8} {}",
            column.field,
            column.column_type.sql_name(),
            if column.primary_key { "yes" } else { "" },
            if column.not_null { "no" } else { "yes" },
            if column.db_default { "database" } else { "" },
        );
    }

    let timestamps = [
        ("created at", model.created_at_column()),
        ("updated at", model.updated_at_column()),
    ];
    for (label, column) in timestamps {
        if let Some(column) = column {
            println!("{}: {}", label, column.field);
        }
    }
    for key in model.unique_keys() {
        println!("unique: ({})", key.join(", "));
    }

    conn.close().await?;
    Ok(())
}

async fn open_input(input: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    if input == "-" {
        return Ok(Box::new(tokio::io::stdin()));
    }
    let path = Path::new(input);
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(file))
}

async fn read_json(mut reader: Box<dyn AsyncRead + Send + Unpin>) -> Result<JsonValue> {
    let mut content = Vec::new();
    reader.read_to_end(&mut content).await?;
    serde_json::from_slice(&content).context("Input is not valid JSON")
}

/// Yields one record per non-blank line. A read or parse failure ends the
/// stream with a source error.
fn ndjson_records<R>(reader: R) -> BoxStream<'static, conflux_postgres::Result<JsonValue>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    async_stream::stream! {
        let mut lines = BufReader::new(reader).lines();
        let mut line_no = 0usize;
        loop {
            line_no += 1;
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<JsonValue>(&line) {
                    Ok(record) => yield Ok(record),
                    Err(e) => {
                        yield Err(ConfluxError::source(format!("line {}: {}", line_no, e)));
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    yield Err(ConfluxError::source(e));
                    break;
                }
            }
        }
    }
    .boxed()
}

/// Initialize logging based on log level
fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &'static [u8]) -> Vec<conflux_postgres::Result<JsonValue>> {
        ndjson_records(input).collect().await
    }

    #[tokio::test]
    async fn test_ndjson_skips_blank_lines() {
        let records = collect(b"{\"id\":\"a\"}\n\n  \n{\"id\":\"b\"}").await;
        let ids: Vec<_> = records
            .into_iter()
            .map(|r| r.unwrap()["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_ndjson_stops_at_first_bad_line() {
        let records = collect(b"{\"id\":\"a\"}\nnot json\n{\"id\":\"c\"}\n").await;
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());
        match &records[1] {
            Err(ConfluxError::Source(msg)) => assert!(msg.starts_with("line 2:"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = ConfluxConfig::default();
        config.upsert = UpsertOptions::default().omit(["a"]).batch_size(10);

        let options = upsert_options(&config, vec![], vec![], None);
        assert_eq!(options, config.upsert);

        let options = upsert_options(
            &config,
            vec!["key".into()],
            vec!["b".into()],
            Some(StrategyArg::UpdateThenInsert),
        );
        assert_eq!(options.id_fields, Some(vec!["key".to_string()]));
        assert_eq!(options.omit, vec!["b".to_string()]);
        assert_eq!(options.strategy, MergeStrategy::UpdateThenInsert);
        assert_eq!(options.batch_size, 10);
    }

    #[test]
    fn test_cli_parses_upsert() {
        let cli = Cli::try_parse_from([
            "conflux",
            "upsert",
            "--table",
            "foos",
            "--id-field",
            "id",
            "--strategy",
            "update-then-insert",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Upsert { table, id_fields, strategy, format, input, .. } => {
                assert_eq!(table, "foos");
                assert_eq!(id_fields, vec!["id"]);
                assert_eq!(strategy, Some(StrategyArg::UpdateThenInsert));
                assert_eq!(format, InputFormat::Json);
                assert_eq!(input, "-");
            }
            _ => panic!("expected upsert"),
        }
    }
}
