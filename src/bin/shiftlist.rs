//! shiftlist CLI: operator interface to the shift work list.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use shiftlist::config::Config;
use shiftlist::db::Db;
use shiftlist::model::*;
use shiftlist::telemetry::{TelemetryConfig, init_telemetry};
use shiftlist::workflow::{cancel_last_compensated, pick_and_record};

#[derive(Parser)]
#[command(name = "shiftlist", about = "Shift-scoped work list")]
struct Cli {
    /// Shift to operate on (defaults to the open shift, created if needed)
    #[arg(long, global = true)]
    shift: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations
    Migrate,
    /// Shift lifecycle
    Shift {
        #[command(subcommand)]
        action: ShiftAction,
    },
    /// Task list operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Collection and inspection history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Bulk imports (rows as JSON arrays)
    Import {
        #[command(subcommand)]
        action: ImportAction,
    },
}

#[derive(Subcommand)]
enum ShiftAction {
    /// Print the open shift, if any
    Current,
    /// Print the open shift, starting one if none is open
    Open,
    /// Start a new shift
    New {
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        computer: Option<String>,
        /// Close every other open shift first
        #[arg(long)]
        close_previous: bool,
    },
    /// Close the selected shift
    Close,
    /// Show the selected shift
    Show,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Print the task list
    Show,
    /// Add copies of an article
    Add {
        article: String,
        #[arg(default_value_t = 1)]
        copies: u32,
    },
    /// Claim one unit at random
    Claim {
        /// Also record the claim as collected by this collector
        #[arg(long)]
        collector: Option<String>,
    },
    /// Decrement remaining (clamped at zero)
    Dec {
        article: String,
        #[arg(default_value_t = 1)]
        by: u32,
    },
    /// Increment remaining
    Inc {
        article: String,
        #[arg(default_value_t = 1)]
        by: u32,
    },
    /// Print the sum of remaining copies
    Remaining,
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Append an entry
    Record {
        /// collection | inspection
        kind: HistoryKind,
        article: String,
        actor: String,
        #[arg(long, default_value_t = 1)]
        copies: u32,
    },
    /// Remove the newest entry of a stream
    Cancel {
        kind: HistoryKind,
        /// Give cancelled collections back to the task list
        #[arg(long)]
        compensate: bool,
    },
    /// List entries of a stream
    List {
        kind: HistoryKind,
        /// Inclusive lower bound (RFC 3339)
        #[arg(long)]
        from: Option<chrono::DateTime<chrono::Utc>>,
        /// Exclusive upper bound (RFC 3339)
        #[arg(long)]
        to: Option<chrono::DateTime<chrono::Utc>>,
    },
}

#[derive(Subcommand)]
enum ImportAction {
    /// Load a task list
    Task {
        /// JSON array of {"article", "total", "remaining"?}
        #[arg(long)]
        rows: String,
        /// merge | replace
        #[arg(long, default_value = "merge")]
        mode: ImportMode,
    },
    /// Load collection history
    Collector {
        /// JSON array of {"article", "collector", "occurred_at"?, "copies"?}
        #[arg(long)]
        rows: String,
        /// Draw the task list down by the collected copies
        #[arg(long)]
        apply_to_remaining: bool,
    },
    /// Load inspection history
    Check {
        /// JSON array of {"article", "inspector", "occurred_at"?}
        #[arg(long)]
        rows: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "shiftlist".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect_with(
        config.database_url.expose_secret(),
        config.max_connections,
        config.retry,
    )
    .await?;
    db.migrate().await?;

    match cli.command {
        Command::Migrate => {
            println!("Migrations applied.");
            Ok(())
        }
        Command::Shift { action } => cmd_shift(&db, cli.shift.map(ShiftId), action).await,
        Command::Task { action } => {
            let shift = resolve_shift(&db, cli.shift).await?;
            cmd_task(&db, shift, action).await
        }
        Command::History { action } => {
            let shift = resolve_shift(&db, cli.shift).await?;
            cmd_history(&db, shift, action).await
        }
        Command::Import { action } => {
            let shift = resolve_shift(&db, cli.shift).await?;
            cmd_import(&db, shift, action).await
        }
    }
}

async fn resolve_shift(db: &Db, shift: Option<i64>) -> anyhow::Result<ShiftId> {
    match shift {
        Some(id) => Ok(ShiftId(id)),
        None => Ok(db.open_or_create_shift().await?),
    }
}

async fn cmd_shift(db: &Db, shift: Option<ShiftId>, action: ShiftAction) -> anyhow::Result<()> {
    match action {
        ShiftAction::Current => match db.current_open_shift().await? {
            Some(id) => print_shift(&db.get_shift(id).await?),
            None => println!("No open shift."),
        },
        ShiftAction::Open => {
            let id = db.open_or_create_shift().await?;
            print_shift(&db.get_shift(id).await?);
        }
        ShiftAction::New {
            role,
            computer,
            close_previous,
        } => {
            let mut new = NewShift::new().close_previous(close_previous);
            if let Some(role) = role {
                new = new.role(role);
            }
            if let Some(computer) = computer {
                new = new.computer(computer);
            }
            let id = db.start_new_shift(new).await?;
            print_shift(&db.get_shift(id).await?);
        }
        ShiftAction::Close => {
            let id = shift
                .ok_or_else(|| anyhow::anyhow!("--shift is required to close a shift"))?;
            print_shift(&db.close_shift(id).await?);
        }
        ShiftAction::Show => {
            let id = resolve_shift(db, shift.map(|s| s.0)).await?;
            print_shift(&db.get_shift(id).await?);
        }
    }
    Ok(())
}

fn print_shift(shift: &Shift) {
    println!("Shift:      {}", shift.id);
    println!("Status:     {}", shift.status);
    println!("Started:    {}", shift.started_at.format("%Y-%m-%d %H:%M"));
    if let Some(ended) = shift.ended_at {
        println!("Ended:      {}", ended.format("%Y-%m-%d %H:%M"));
    }
    println!("Role:       {}", shift.started_by_role.as_deref().unwrap_or("-"));
    println!("Computer:   {}", shift.started_by_computer.as_deref().unwrap_or("-"));
}

async fn cmd_task(db: &Db, shift: ShiftId, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Show => print_tasks(&db.task_snapshot(shift).await?),
        TaskAction::Add { article, copies } => {
            let outcome = db
                .merge_articles(shift, &[ArticleCopies::new(article, copies)])
                .await?;
            println!("Added {}, updated {}.", outcome.added, outcome.updated);
            print_tasks(&outcome.snapshot);
        }
        TaskAction::Claim { collector } => {
            let claim = match collector {
                Some(collector) => pick_and_record(db, shift, &collector)
                    .await?
                    .map(|(claim, _)| claim),
                None => db.claim_one_available(shift).await?,
            };
            match claim {
                Some(claim) => println!("{} ({} left)", claim.article, claim.remaining),
                None => println!("Nothing left to claim."),
            }
        }
        TaskAction::Dec { article, by } => {
            let left = db.dec_remaining(shift, &article, by).await?;
            println!("{article}: {left} left");
        }
        TaskAction::Inc { article, by } => {
            let left = db.inc_remaining(shift, &article, by).await?;
            println!("{article}: {left} left");
        }
        TaskAction::Remaining => println!("{}", db.remaining_total(shift).await?),
    }
    Ok(())
}

fn print_tasks(items: &[TaskItem]) {
    if items.is_empty() {
        println!("Task list is empty.");
        return;
    }
    println!("{:<30}  {:>8}  {:>9}", "ARTICLE", "TOTAL", "REMAINING");
    println!("{}", "-".repeat(51));
    for item in items {
        println!("{:<30}  {:>8}  {:>9}", item.article, item.total, item.remaining);
    }
    println!("\n{} item(s)", items.len());
}

async fn cmd_history(db: &Db, shift: ShiftId, action: HistoryAction) -> anyhow::Result<()> {
    match action {
        HistoryAction::Record {
            kind,
            article,
            actor,
            copies,
        } => {
            let entry = match kind {
                HistoryKind::Collection => NewHistoryEntry::collection(article, actor, copies),
                HistoryKind::Inspection => NewHistoryEntry::inspection(article, actor),
            };
            print_entries(&[db.record(shift, entry).await?]);
        }
        HistoryAction::Cancel { kind, compensate } => {
            let cancelled = if compensate {
                cancel_last_compensated(db, shift, kind).await?
            } else {
                db.cancel_last(shift, kind).await?
            };
            match cancelled {
                Some(entry) => print_entries(&[entry]),
                None => println!("No {kind} entries to cancel."),
            }
        }
        HistoryAction::List { kind, from, to } => {
            let entries = db.history(shift, kind, HistoryRange { from, to }).await?;
            if entries.is_empty() {
                println!("No {kind} entries found.");
            } else {
                print_entries(&entries);
                println!("\n{} entry(s)", entries.len());
            }
        }
    }
    Ok(())
}

fn print_entries(entries: &[HistoryEntry]) {
    println!(
        "{:<8}  {:<30}  {:<20}  {:>6}  OCCURRED",
        "ID", "ARTICLE", "ACTOR", "COPIES"
    );
    println!("{}", "-".repeat(90));
    for entry in entries {
        println!(
            "{:<8}  {:<30}  {:<20}  {:>6}  {}",
            entry.id,
            entry.article.as_deref().unwrap_or("-"),
            entry.actor,
            entry
                .copies
                .map(|n| n.to_string())
                .unwrap_or("-".to_string()),
            entry.occurred_at.format("%Y-%m-%d %H:%M")
        );
    }
}

async fn cmd_import(db: &Db, shift: ShiftId, action: ImportAction) -> anyhow::Result<()> {
    let summary = match action {
        ImportAction::Task { rows, mode } => {
            let rows: Vec<TaskRow> = serde_json::from_str(&rows)?;
            db.import_task(shift, &rows, mode).await?
        }
        ImportAction::Collector {
            rows,
            apply_to_remaining,
        } => {
            let rows: Vec<CollectorRow> = serde_json::from_str(&rows)?;
            db.import_collector_rows(shift, &rows, apply_to_remaining)
                .await?
        }
        ImportAction::Check { rows } => {
            let rows: Vec<CheckRow> = serde_json::from_str(&rows)?;
            db.import_check_rows(shift, &rows).await?
        }
    };

    println!("Batch:      {}", summary.batch_id);
    println!("Applied:    {}", summary.applied);
    println!("Skipped:    {}", summary.skipped);
    println!("Removed:    {}", summary.removed);
    println!("Adjusted:   {}", summary.adjusted);
    println!("Attempts:   {}", summary.attempts);
    Ok(())
}
