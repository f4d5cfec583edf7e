use clap::{Parser, Subcommand};
use schedule_forge::config::{EngineConfig, CONFIG_ENV};
use schedule_forge::port::XlsxPort;
use schedule_forge::{cli, scheduler, ScheduleEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schedule-forge")]
#[command(about = "Write purchase-order lines into production-schedule workbooks.")]
#[command(long_about = "Schedule Forge - batch writer for production-schedule workbooks

Each order record (SKU, spec, business fields) is written as a new row directly
below the best-matching reference row, inheriting its formatting and formulas.
Records marked 'modify' overwrite their own row in place; records marked 'cancel'
copy their row to the cancellation sheet and delete it. Row numbers stay
consistent while rows shift within a call.

MATCHING (strongest first):
  1. exact SKU-SPEC      92105-S001 == 92105-S001
  2. base SKU            92105-S002 -> row holding 92105
  3. bounded prefix      9210 <-> 92105 (length difference <= prefix_max_len_diff)

COMMANDS:
  find           - Show the reference row a record would use
  batch          - Apply an orders file (new, modify, cancel) to a workbook
  delete         - Delete rows (undoable)
  undo           - Restore a deleted or cancelled row, or revert a modification
  revert         - Remove a committed order row
  evict          - Drop a ledger entry
  ledger         - List undoable entries for a workbook
  retries        - List the retry queue
  retry          - Re-run queued records now
  schedule       - Give queued records a due time
  cancel         - Remove a queued record
  tick           - Run every due retry once
  run-scheduler  - Run due retries until interrupted

EXAMPLES:
  schedule-forge batch plan.xlsx orders.yaml
  schedule-forge delete plan.xlsx Dinosaurs!12 Dinosaurs!13
  schedule-forge schedule 3f2c... --at +30m
  SCHEDULE_FORGE_CONFIG=forge.yaml schedule-forge run-scheduler")]
#[command(version)]
struct Cli {
    /// Engine config file (YAML)
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the reference row a record would use, without writing
    Find {
        /// Workbook (.xlsx)
        workbook: PathBuf,

        /// Base SKU
        #[arg(short, long)]
        sku: String,

        /// Spec suffix (e.g. S001)
        #[arg(short = 'p', long)]
        spec: Option<String>,

        /// Restrict the search to this sheet
        #[arg(long)]
        sheet: Option<String>,
    },

    #[command(long_about = "Write every record of an orders file into a workbook.

Records are processed in file order. A record that fails (no reference row,
ambiguous match, partial write) does not stop the others; it is queued for
retry and listed at the end. A locked workbook or an offset desync aborts the
whole call without saving, and every record is queued.

ORDERS FILE (YAML or JSON):
  orders:
    - id: PO-4471-1
      sku: 92105
      spec: S001
      target_sheet: Dinosaurs
      fields:
        qty: 240            # mapped through config 'columns'
        M: 2025-05-01       # or a column letter
        total: \"=I2*2\"      # formulas start with '='")]
    /// Write an orders file into a workbook
    Batch {
        /// Workbook (.xlsx)
        workbook: PathBuf,

        /// Orders file (YAML or JSON)
        orders: PathBuf,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete rows, addressed as SHEET!ROW in the numbering before the call
    Delete {
        /// Workbook (.xlsx)
        workbook: PathBuf,

        /// Rows to delete (e.g. Dinosaurs!12)
        #[arg(required = true)]
        rows: Vec<String>,
    },

    /// Restore a deleted row
    Undo {
        /// Undo token printed by 'delete' or 'batch'
        token: String,
    },

    /// Remove a committed order row (only while it is unchanged)
    Revert {
        /// Write token from the batch results
        token: String,
    },

    /// Drop a ledger entry without touching the workbook
    Evict {
        token: String,
    },

    /// List undoable deletions, writes and modifications for a workbook
    Ledger {
        /// Workbook (.xlsx)
        workbook: PathBuf,
    },

    /// List the retry queue
    Retries {
        /// Only items for this workbook
        #[arg(long)]
        workbook: Option<PathBuf>,
    },

    /// Re-run queued records now
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Give queued records a due time
    Schedule {
        #[arg(required = true)]
        ids: Vec<String>,

        /// RFC 3339 time or offset from now (+30m, +2h, +1d)
        #[arg(long)]
        at: String,
    },

    /// Remove a queued record
    Cancel {
        id: String,
    },

    /// Run every due retry once
    Tick,

    #[command(long_about = "Run due retries on a fixed interval until SIGINT/SIGTERM.

The interval defaults to retry.tick_interval_secs from the config file.
A tick in progress finishes before shutdown.")]
    /// Run due retries until interrupted
    RunScheduler {
        /// Seconds between ticks
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "schedule_forge=debug"
    } else {
        "schedule_forge=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::load_or_default(cli.config.as_deref())?;
    let tick_interval = config.retry.tick_interval_secs;
    let engine = ScheduleEngine::new(config, Arc::new(XlsxPort::new()))?;

    match cli.command {
        Commands::Find {
            workbook,
            sku,
            spec,
            sheet,
        } => cli::find(&engine, workbook, sku, spec, sheet).await?,

        Commands::Batch {
            workbook,
            orders,
            json,
        } => cli::batch(&engine, workbook, orders, json).await?,

        Commands::Delete { workbook, rows } => cli::delete(&engine, workbook, rows).await?,

        Commands::Undo { token } => cli::undo(&engine, token).await?,

        Commands::Revert { token } => cli::revert(&engine, token).await?,

        Commands::Evict { token } => cli::evict(&engine, token).await?,

        Commands::Ledger { workbook } => cli::ledger(&engine, workbook)?,

        Commands::Retries { workbook } => cli::retries(&engine, workbook)?,

        Commands::Retry { ids } => cli::retry(&engine, ids).await?,

        Commands::Schedule { ids, at } => cli::schedule(&engine, ids, at)?,

        Commands::Cancel { id } => cli::cancel(&engine, id)?,

        Commands::Tick => cli::tick(&engine).await?,

        Commands::RunScheduler { interval } => {
            let every = Duration::from_secs(interval.unwrap_or(tick_interval).max(1));
            scheduler::run_scheduler(Arc::new(engine), every).await?
        }
    }
    Ok(())
}
