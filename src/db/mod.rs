//! Postgres store: connection pool, migrations, and the shift gate.
//!
//! Every mutation runs in its own transaction. Ledger and history mutations
//! hold the shift's advisory lock in shared mode; bulk imports and shift
//! closing hold it exclusively, so they never interleave with claims.

pub mod articles;
pub mod bulk;
pub mod history;
pub mod shifts;
pub mod tasks;

use std::future::Future;

use crate::error::{Error, Result};
use crate::ledger::WorkList;
use crate::model::*;
use crate::retry::RetryPolicy;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

/// Database handle. Owns the connection pool and the import retry policy.
pub struct Db {
    pool: PgPool,
    retry: RetryPolicy,
}

impl Db {
    /// Connect to Postgres with default pool size and retry policy.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, 10, RetryPolicy::default()).await
    }

    /// Connect to Postgres with an explicit pool size and retry policy.
    pub async fn connect_with(url: &str, max_connections: u32, retry: RetryPolicy) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool, retry })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// How a transaction holds the shift gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftAccess {
    /// Row-level mutations; many may run at once.
    Shared,
    /// Bulk rewrites and closing; excludes every other mutation of the shift.
    Exclusive,
}

/// Take the shift's advisory lock for the rest of the transaction, then
/// check the shift exists and is still open.
pub(crate) async fn enter_shift(
    conn: &mut PgConnection,
    shift: ShiftId,
    access: ShiftAccess,
) -> Result<()> {
    let lock = match access {
        ShiftAccess::Shared => "SELECT pg_advisory_xact_lock_shared($1)",
        ShiftAccess::Exclusive => "SELECT pg_advisory_xact_lock($1)",
    };
    sqlx::query(lock).bind(shift.0).execute(&mut *conn).await?;

    let status: Option<(String,)> = sqlx::query_as("SELECT status FROM shifts WHERE id = $1")
        .bind(shift.0)
        .fetch_optional(&mut *conn)
        .await?;
    match status {
        None => Err(Error::NotFound(format!("shift {shift}"))),
        Some((status,)) => match status.parse::<ShiftStatus>()? {
            ShiftStatus::Open => Ok(()),
            ShiftStatus::Closed => Err(Error::ShiftClosed(shift)),
        },
    }
}

/// Convert a unit count to the INTEGER column type.
pub(crate) fn db_count(n: u32) -> Result<i32> {
    i32::try_from(n).map_err(|_| Error::InvalidInput(format!("count {n} is too large")))
}

/// Convert an INTEGER column back to a unit count. CHECK constraints keep
/// stored counts non-negative.
pub(crate) fn count(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

impl WorkList for Db {
    fn get_or_create_article(&self, code: &str) -> impl Future<Output = Result<ArticleId>> + Send {
        Db::get_or_create_article(self, code)
    }

    fn open_or_create_shift(&self) -> impl Future<Output = Result<ShiftId>> + Send {
        Db::open_or_create_shift(self)
    }

    fn current_open_shift(&self) -> impl Future<Output = Result<Option<ShiftId>>> + Send {
        Db::current_open_shift(self)
    }

    fn start_new_shift(&self, new: NewShift) -> impl Future<Output = Result<ShiftId>> + Send {
        Db::start_new_shift(self, new)
    }

    fn close_shift(&self, shift: ShiftId) -> impl Future<Output = Result<Shift>> + Send {
        Db::close_shift(self, shift)
    }

    fn get_shift(&self, shift: ShiftId) -> impl Future<Output = Result<Shift>> + Send {
        Db::get_shift(self, shift)
    }

    fn merge_articles(
        &self,
        shift: ShiftId,
        items: &[ArticleCopies],
    ) -> impl Future<Output = Result<MergeOutcome>> + Send {
        Db::merge_articles(self, shift, items)
    }

    fn claim_one_available(
        &self,
        shift: ShiftId,
    ) -> impl Future<Output = Result<Option<Claim>>> + Send {
        Db::claim_one_available(self, shift)
    }

    fn dec_remaining(
        &self,
        shift: ShiftId,
        code: &str,
        by: u32,
    ) -> impl Future<Output = Result<u32>> + Send {
        Db::dec_remaining(self, shift, code, by)
    }

    fn inc_remaining(
        &self,
        shift: ShiftId,
        code: &str,
        by: u32,
    ) -> impl Future<Output = Result<u32>> + Send {
        Db::inc_remaining(self, shift, code, by)
    }

    fn remaining_total(&self, shift: ShiftId) -> impl Future<Output = Result<u64>> + Send {
        Db::remaining_total(self, shift)
    }

    fn task_snapshot(&self, shift: ShiftId) -> impl Future<Output = Result<Vec<TaskItem>>> + Send {
        Db::task_snapshot(self, shift)
    }

    fn record(
        &self,
        shift: ShiftId,
        entry: NewHistoryEntry,
    ) -> impl Future<Output = Result<HistoryEntry>> + Send {
        Db::record(self, shift, entry)
    }

    fn cancel_last(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
    ) -> impl Future<Output = Result<Option<HistoryEntry>>> + Send {
        Db::cancel_last(self, shift, kind)
    }

    fn history(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
        range: HistoryRange,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>>> + Send {
        Db::history(self, shift, kind, range)
    }

    fn import_task(
        &self,
        shift: ShiftId,
        rows: &[TaskRow],
        mode: ImportMode,
    ) -> impl Future<Output = Result<ImportSummary>> + Send {
        Db::import_task(self, shift, rows, mode)
    }

    fn import_collector_rows(
        &self,
        shift: ShiftId,
        rows: &[CollectorRow],
        apply_to_remaining: bool,
    ) -> impl Future<Output = Result<ImportSummary>> + Send {
        Db::import_collector_rows(self, shift, rows, apply_to_remaining)
    }

    fn import_check_rows(
        &self,
        shift: ShiftId,
        rows: &[CheckRow],
    ) -> impl Future<Output = Result<ImportSummary>> + Send {
        Db::import_check_rows(self, shift, rows)
    }
}
