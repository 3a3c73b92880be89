//! Task ledger: per (shift, article) total/remaining counters.

use opentelemetry::KeyValue;
use sqlx::PgConnection;
use tracing::debug;

use super::articles::article_id;
use super::{ShiftAccess, count, db_count, enter_shift};
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;

/// Additive upsert shared by merges and merge-mode imports. Reports whether
/// the row was freshly inserted (`xmax = 0` only holds for new tuples).
pub(crate) const UPSERT_ADDITIVE: &str =
    "INSERT INTO task_items (shift_id, article_id, total_copies, remaining_copies)
     VALUES ($1, $2, $3, $4)
     ON CONFLICT (shift_id, article_id) DO UPDATE
     SET total_copies = task_items.total_copies + EXCLUDED.total_copies,
         remaining_copies = task_items.remaining_copies + EXCLUDED.remaining_copies
     RETURNING (xmax = 0)";

impl super::Db {
    /// Merge articles into the shift's task list in one transaction.
    ///
    /// Existing items get `copies` added to both counters, so merging the
    /// same list twice doubles it rather than overwriting. Rows are applied
    /// in code order, so concurrent merges lock shared rows in one order.
    pub async fn merge_articles(
        &self,
        shift: ShiftId,
        items: &[ArticleCopies],
    ) -> Result<MergeOutcome> {
        let rows = prepare_merge(items)?
            .into_iter()
            .map(|(code, copies)| Ok((code, db_count(copies)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        enter_shift(&mut tx, shift, ShiftAccess::Shared).await?;

        let (mut added, mut updated) = (0, 0);
        for (code, copies) in &rows {
            let article = article_id(&mut tx, code).await?;
            let (inserted,): (bool,) = sqlx::query_as(UPSERT_ADDITIVE)
                .bind(shift.0)
                .bind(article.0)
                .bind(copies)
                .bind(copies)
                .fetch_one(&mut *tx)
                .await?;
            if inserted {
                added += 1;
            } else {
                updated += 1;
            }
        }

        let snapshot = snapshot_on(&mut tx, shift).await?;
        tx.commit().await?;

        metrics::merged_rows().add(added as u64, &[KeyValue::new("result", "added")]);
        metrics::merged_rows().add(updated as u64, &[KeyValue::new("result", "updated")]);
        debug!(shift = shift.0, added, updated, "merged articles");

        Ok(MergeOutcome {
            snapshot,
            added,
            updated,
        })
    }

    /// Take one unit from a random task item with stock.
    ///
    /// Rows locked by concurrent claims are skipped rather than waited on,
    /// so parallel claimants land on different rows. `None` means no
    /// unlocked row has stock.
    pub async fn claim_one_available(&self, shift: ShiftId) -> Result<Option<Claim>> {
        let started = std::time::Instant::now();
        let mut tx = self.pool.begin().await?;
        enter_shift(&mut tx, shift, ShiftAccess::Shared).await?;

        let claimed: Option<(String, i32)> = sqlx::query_as(
            "WITH picked AS (
                 SELECT id FROM task_items
                 WHERE shift_id = $1 AND remaining_copies > 0
                 ORDER BY random()
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE task_items t
             SET remaining_copies = t.remaining_copies - 1
             FROM picked, articles a
             WHERE t.id = picked.id AND a.id = t.article_id
             RETURNING a.code, t.remaining_copies",
        )
        .bind(shift.0)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        metrics::claims().add(
            1,
            &[KeyValue::new(
                "result",
                if claimed.is_some() { "ok" } else { "empty" },
            )],
        );
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "task.claim")],
        );

        Ok(claimed.map(|(article, remaining)| {
            debug!(shift = shift.0, %article, remaining, "claimed one unit");
            Claim {
                article,
                remaining: count(remaining),
            }
        }))
    }

    /// Decrement remaining by `by`, clamped so it never drops below zero.
    pub async fn dec_remaining(&self, shift: ShiftId, code: &str, by: u32) -> Result<u32> {
        let code = normalize_code(code)?;
        let by = db_count(by)?;

        let mut tx = self.pool.begin().await?;
        enter_shift(&mut tx, shift, ShiftAccess::Shared).await?;

        let row: Option<(i64, i32)> = sqlx::query_as(
            "SELECT t.id, t.remaining_copies
             FROM task_items t
             JOIN articles a ON a.id = t.article_id
             WHERE t.shift_id = $1 AND a.code = $2
             FOR UPDATE OF t",
        )
        .bind(shift.0)
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let (id, remaining) =
            row.ok_or_else(|| Error::NotFound(format!("task item {code} in shift {shift}")))?;

        let (left,): (i32,) = sqlx::query_as(
            "UPDATE task_items SET remaining_copies = remaining_copies - $2
             WHERE id = $1
             RETURNING remaining_copies",
        )
        .bind(id)
        .bind(by.min(remaining))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::adjustments().add(1, &[KeyValue::new("operation", "dec")]);
        debug!(shift = shift.0, code, by, left, "decremented remaining");
        Ok(count(left))
    }

    /// Increment remaining by `by`. Total is raised to match when remaining
    /// would exceed it; a missing item is created with total = remaining = by.
    pub async fn inc_remaining(&self, shift: ShiftId, code: &str, by: u32) -> Result<u32> {
        let code = normalize_code(code)?;
        let by = db_count(by)?;

        let mut tx = self.pool.begin().await?;
        enter_shift(&mut tx, shift, ShiftAccess::Shared).await?;

        let article = article_id(&mut tx, code).await?;
        let (left,): (i32,) = sqlx::query_as(
            "INSERT INTO task_items (shift_id, article_id, total_copies, remaining_copies)
             VALUES ($1, $2, $3, $3)
             ON CONFLICT (shift_id, article_id) DO UPDATE
             SET remaining_copies = task_items.remaining_copies + EXCLUDED.remaining_copies,
                 total_copies = GREATEST(
                     task_items.total_copies,
                     task_items.remaining_copies + EXCLUDED.remaining_copies
                 )
             RETURNING remaining_copies",
        )
        .bind(shift.0)
        .bind(article.0)
        .bind(by)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::adjustments().add(1, &[KeyValue::new("operation", "inc")]);
        debug!(shift = shift.0, code, by, left, "incremented remaining");
        Ok(count(left))
    }

    /// Sum of remaining copies across the shift. Not synchronized with
    /// concurrent claims.
    pub async fn remaining_total(&self, shift: ShiftId) -> Result<u64> {
        let (total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(remaining_copies), 0)::BIGINT
             FROM task_items WHERE shift_id = $1",
        )
        .bind(shift.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    /// The shift's task list ordered by article code.
    pub async fn task_snapshot(&self, shift: ShiftId) -> Result<Vec<TaskItem>> {
        let mut conn = self.pool.acquire().await?;
        snapshot_on(&mut conn, shift).await
    }
}

pub(crate) async fn snapshot_on(
    conn: &mut PgConnection,
    shift: ShiftId,
) -> Result<Vec<TaskItem>> {
    let rows: Vec<TaskItemRow> = sqlx::query_as(
        "SELECT a.code, t.total_copies, t.remaining_copies
         FROM task_items t
         JOIN articles a ON a.id = t.article_id
         WHERE t.shift_id = $1
         ORDER BY a.code",
    )
    .bind(shift.0)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(TaskItem::from).collect())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskItemRow {
    code: String,
    total_copies: i32,
    remaining_copies: i32,
}

impl From<TaskItemRow> for TaskItem {
    fn from(row: TaskItemRow) -> Self {
        TaskItem {
            article: row.code,
            total: count(row.total_copies),
            remaining: count(row.remaining_copies),
        }
    }
}
