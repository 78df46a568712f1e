use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stmtmap_core::{args, Value};
use stmtmap_settings::Settings;
use stmtmap_sqlite::{SqliteConfig, SqliteConnection, SqliteRegistry};
use stmtmap_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS Testing1 (
    TestID INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    TestName VARCHAR(64) NOT NULL UNIQUE
)";

#[derive(Parser, Debug)]
#[command(name = "stmtmap", version, about = "Named prepared statements over SQLite")]
struct Cli {
    /// Database path; overrides the settings file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Settings file [default: ~/.stmtmap/settings.json]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a table, register statements, insert a row and read it back.
    Demo,
    /// Execute each file's SQL script, in the order given. A file may hold
    /// several `;`-separated statements.
    Migrate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run SQL with positional arguments and print result rows as JSON lines.
    Query { sql: String, args: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => stmtmap_settings::load_settings_from_path(path),
        None => stmtmap_settings::load_settings(),
    }
    .context("loading settings")?;
    init_telemetry(&telemetry_config(&settings));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    // Registry calls block on SQLite; keep them off the async workers.
    tokio::task::spawn_blocking(move || run(cli, &settings, &cancel))
        .await
        .context("worker thread panicked")?
}

fn telemetry_config(settings: &Settings) -> TelemetryConfig {
    let config = TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(Level::INFO),
        json: settings.logging.json,
        ..TelemetryConfig::default()
    };
    settings
        .logging
        .modules
        .iter()
        .fold(config, |config, (module, level)| match parse_level(level) {
            Some(level) => config.with_module_level(module, level),
            None => config,
        })
}

fn run(cli: Cli, settings: &Settings, cancel: &CancellationToken) -> Result<()> {
    let path = cli
        .db
        .unwrap_or_else(|| PathBuf::from(&settings.database.path));
    let registry = open_registry(&path, settings)?;

    let result = match cli.command {
        Command::Demo => demo(&registry, cancel),
        Command::Migrate { files } => migrate(&registry, &files, cancel),
        Command::Query { sql, args } => query(&registry, &sql, &args, cancel),
    };
    let closed = registry.close().context("closing registry");
    result.and(closed)
}

fn open_registry(path: &Path, settings: &Settings) -> Result<SqliteRegistry> {
    let config = SqliteConfig {
        statement_cache_capacity: settings.database.statement_cache_capacity,
        busy_timeout: Duration::from_millis(settings.database.busy_timeout_ms),
    };
    let conn = SqliteConnection::open_with(path, &config)
        .with_context(|| format!("opening database {}", path.display()))?;
    Ok(SqliteRegistry::new(conn))
}

fn demo(registry: &SqliteRegistry, cancel: &CancellationToken) -> Result<()> {
    registry.add_with_cancel("create_table", CREATE_TABLE, cancel)?;
    registry.exec_with_cancel("create_table", &[], cancel)?;

    registry.extend_with_cancel(
        [
            ("insert", "INSERT INTO Testing1(TestName) VALUES(?)"),
            ("select", "SELECT TestName FROM Testing1 WHERE TestID = ?"),
        ],
        cancel,
    )?;

    let outcome = registry.exec_with_cancel("insert", &args!["Hello World :D!"], cancel)?;
    println!("Rows Affected: {}", outcome.rows_affected);

    let id = outcome.last_insert_id.unwrap_or(1);
    let name: String = registry
        .query_row_with_cancel("select", &args![id], cancel)
        .context("select statement is not registered")?
        .scan(0)?;
    println!("got {name:?}");
    Ok(())
}

fn migrate(registry: &SqliteRegistry, files: &[PathBuf], cancel: &CancellationToken) -> Result<()> {
    let statements = files
        .iter()
        .map(|f| std::fs::read_to_string(f).with_context(|| format!("reading {}", f.display())))
        .collect::<Result<Vec<_>>>()?;

    registry.batch_with_cancel(
        statements.iter().map(|s| s.trim()),
        cancel,
    )?;
    info!(count = statements.len(), "migrations applied");
    println!("applied {} file(s)", statements.len());
    Ok(())
}

fn query(registry: &SqliteRegistry, sql: &str, raw_args: &[String], cancel: &CancellationToken) -> Result<()> {
    registry.add_with_cancel("query", sql, cancel)?;
    let values: Vec<Value> = raw_args.iter().map(|a| parse_arg(a)).collect();
    for row in registry.query_with_cancel("query", &values, cancel)? {
        println!("{}", row_to_json(&row?)?);
    }
    Ok(())
}

fn row_to_json(row: &stmtmap_core::Row) -> Result<serde_json::Value> {
    let mut object = serde_json::Map::new();
    for (column, value) in row.iter() {
        object.insert(column.to_string(), serde_json::to_value(value)?);
    }
    Ok(serde_json::Value::Object(object))
}

/// Integer, then real, then text.
fn parse_arg(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Real(f)
    } else {
        Value::Text(raw.to_string())
    }
}
