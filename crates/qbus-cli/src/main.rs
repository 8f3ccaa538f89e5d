use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qbus_bus::{EventBus, Publish};
use qbus_core::EventRow;
use qbus_db::{DbBackedQueue, PgQueueDao};
use qbus_dispatch::DispatchDelegate;
use qbus_runtime::RuntimeConfig;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "qbus")]
#[command(about = "Operator CLI for the durable event bus", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database schema commands, scoped to one queue table.
    Db {
        /// Queue table name (the history table is `<table>_history`).
        #[arg(long)]
        table: String,

        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Publish one event as raw JSON, outside of any caller transaction.
    Post {
        #[arg(long)]
        table: String,

        #[arg(long = "class")]
        class_name: String,

        #[arg(long, default_value_t = 0)]
        search_key2: i64,

        #[arg(long)]
        search_key1: Option<i64>,

        /// Event payload, as a JSON object.
        payload: String,
    },

    /// Read-only inspection queries (spec §4.F), permitted at any time.
    Inspect {
        #[arg(long)]
        table: String,

        #[command(subcommand)]
        cmd: InspectCmd,
    },

    /// Start the worker pool and poll loop and block until Ctrl-C.
    Run {
        #[arg(long)]
        table: String,

        #[arg(long, default_value_t = 4)]
        nb_threads: usize,

        #[arg(long, default_value_t = 1_000)]
        poll_interval_ms: u64,

        #[arg(long, default_value_t = 50)]
        claim_batch_size: i64,

        #[arg(long, default_value_t = 30_000)]
        claim_lease_ms: u64,

        #[arg(long, default_value_t = 5)]
        max_failure_retries: i32,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Connectivity check plus whether the live table already exists.
    Status,
    /// Create the live and history tables if they are absent.
    Migrate,
}

#[derive(Subcommand)]
enum InspectCmd {
    /// Rows currently AVAILABLE for `search_key2` (optionally + `search_key1`).
    Ready {
        #[arg(long)]
        search_key2: i64,
        #[arg(long)]
        search_key1: Option<i64>,
    },
    /// Rows AVAILABLE or IN_PROCESSING for `search_key2` (optionally + `search_key1`).
    ReadyOrInProcessing {
        #[arg(long)]
        search_key2: i64,
        #[arg(long)]
        search_key1: Option<i64>,
    },
    /// Every row currently IN_PROCESSING, across all search keys.
    InProcessing,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { table, cmd } => {
            let pool = qbus_db::connect_from_env().await?;
            let dao = PgQueueDao::new(pool.clone(), &table)?;
            match cmd {
                DbCmd::Status => {
                    let status = qbus_db::status(&pool, &table).await?;
                    println!("db_ok={} has_table={}", status.ok, status.has_table);
                }
                DbCmd::Migrate => {
                    dao.ensure_schema().await?;
                    println!("migrations_applied=true table={table}");
                }
            }
        }

        Commands::Post {
            table,
            class_name,
            search_key2,
            search_key1,
            payload,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let bus = connect_bus(&table, RuntimeConfig::default()).await?;
            bus.start().await?;
            bus.post(
                Publish {
                    class_name,
                    search_key1,
                    search_key2,
                    user_token: Uuid::new_v4(),
                },
                &payload,
            )
            .await?;
            bus.stop().await?;
            println!("posted=true table={table}");
        }

        Commands::Inspect { table, cmd } => {
            let bus = connect_bus(&table, RuntimeConfig::default()).await?;
            let rows = match cmd {
                InspectCmd::Ready { search_key2, search_key1 } => match search_key1 {
                    Some(k1) => bus.get_ready_with_both_keys(k1, search_key2).await?,
                    None => bus.get_ready(search_key2).await?,
                },
                InspectCmd::ReadyOrInProcessing { search_key2, search_key1 } => match search_key1 {
                    Some(k1) => bus.get_ready_or_in_processing_with_both_keys(k1, search_key2).await?,
                    None => bus.get_ready_or_in_processing(search_key2).await?,
                },
                InspectCmd::InProcessing => bus.get_in_processing().await?,
            };
            print_rows(&rows);
        }

        Commands::Run {
            table,
            nb_threads,
            poll_interval_ms,
            claim_batch_size,
            claim_lease_ms,
            max_failure_retries,
        } => {
            let config = RuntimeConfig {
                nb_threads,
                poll_interval: Duration::from_millis(poll_interval_ms),
                claim_batch_size,
                claim_lease: Duration::from_millis(claim_lease_ms),
                max_failure_retries,
                ..RuntimeConfig::default()
            };
            let bus = connect_bus(&table, config).await?;
            bus.start().await?;
            tracing::info!(table, nb_threads, "worker pool started, waiting for Ctrl-C");

            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

            tracing::info!("shutdown requested, draining in-flight work");
            bus.stop().await?;
        }
    }

    Ok(())
}

/// Build a bus with no handlers registered. `qbus run` is a generic
/// operator process: it has no compile-time knowledge of event types, so
/// dispatch for every class falls through to the zero-handler success
/// path (spec §4.D) and rows are simply drained into history. Embedding
/// applications register real handlers through the library crates
/// directly, not through this binary.
async fn connect_bus(table: &str, config: RuntimeConfig) -> Result<EventBus<PgQueueDao>> {
    let pool = qbus_db::connect_from_env().await?;
    let dao = PgQueueDao::new(pool, table)?;
    dao.ensure_schema().await?;
    let queue = Arc::new(DbBackedQueue::new(dao, default_owner_tag()));
    let dispatch = Arc::new(DispatchDelegate::new());
    Ok(EventBus::new(queue, dispatch, config, default_owner_tag()))
}

fn default_owner_tag() -> String {
    format!("qbus-cli-{}", std::process::id())
}

fn print_rows(rows: &[EventRow]) {
    if rows.is_empty() {
        println!("(no rows)");
        return;
    }
    for row in rows {
        println!(
            "record_id={} class_name={} state={} search_key1={:?} search_key2={} error_count={} created_date={}",
            row.record_id,
            row.class_name,
            row.processing_state.as_str(),
            row.search_key1,
            row.search_key2,
            row.error_count,
            row.created_date,
        );
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
