//! Bulk reconciler: multi-row imports as single serializable units.
//!
//! Each import runs in one SERIALIZABLE transaction that holds the shift gate
//! exclusively, so claims and adjustments never observe a half-applied batch.
//! Serialization conflicts re-run the whole transaction via
//! [`retry_on_conflict`].

use std::collections::BTreeSet;

use sqlx::{PgConnection, Postgres, Transaction};
use tracing::Instrument;
use uuid::Uuid;

use super::articles::article_id;
use super::history::insert_entry;
use super::tasks::UPSERT_ADDITIVE;
use super::{ShiftAccess, db_count, enter_shift};
use crate::error::Result;
use crate::ledger::{Applied, settle_import};
use crate::model::import::*;
use crate::model::{HistoryKind, ShiftId};
use crate::retry::retry_on_conflict;
use crate::telemetry::ledger::{record_import_attempts, start_import_span};

impl super::Db {
    /// Load task rows into the shift, replacing or merging with what is there.
    pub async fn import_task(
        &self,
        shift: ShiftId,
        rows: &[TaskRow],
        mode: ImportMode,
    ) -> Result<ImportSummary> {
        let prepared = prepare_task_rows(rows);
        let mut attempts = 0;
        let batch_id = Uuid::new_v4();
        let span = start_import_span("task", shift, &batch_id, prepared.rows.len());

        let outcome = retry_on_conflict(&self.retry, || {
            attempts += 1;
            self.import_task_once(shift, &prepared.rows, mode)
        })
        .instrument(span.clone())
        .await;

        record_import_attempts(&span, attempts);
        settle_import(
            "task",
            &mode.to_string(),
            batch_id,
            prepared.skipped,
            attempts,
            outcome,
        )
    }

    /// Append collection rows; with `apply_to_remaining`, also draw down the
    /// matching task items (clamped at zero).
    pub async fn import_collector_rows(
        &self,
        shift: ShiftId,
        rows: &[CollectorRow],
        apply_to_remaining: bool,
    ) -> Result<ImportSummary> {
        let prepared = prepare_collector_rows(rows);
        let mut attempts = 0;
        let batch_id = Uuid::new_v4();
        let span = start_import_span("collector", shift, &batch_id, prepared.rows.len());

        let outcome = retry_on_conflict(&self.retry, || {
            attempts += 1;
            self.import_collector_once(shift, &prepared.rows, apply_to_remaining)
        })
        .instrument(span.clone())
        .await;

        record_import_attempts(&span, attempts);
        let mode = if apply_to_remaining { "apply" } else { "append" };
        settle_import("collector", mode, batch_id, prepared.skipped, attempts, outcome)
    }

    /// Append inspection rows.
    pub async fn import_check_rows(
        &self,
        shift: ShiftId,
        rows: &[CheckRow],
    ) -> Result<ImportSummary> {
        let prepared = prepare_check_rows(rows);
        let mut attempts = 0;
        let batch_id = Uuid::new_v4();
        let span = start_import_span("check", shift, &batch_id, prepared.rows.len());

        let outcome = retry_on_conflict(&self.retry, || {
            attempts += 1;
            self.import_check_once(shift, &prepared.rows)
        })
        .instrument(span.clone())
        .await;

        record_import_attempts(&span, attempts);
        settle_import("check", "append", batch_id, prepared.skipped, attempts, outcome)
    }

    /// Begin a serializable transaction holding the shift gate exclusively.
    async fn begin_exclusive(&self, shift: ShiftId) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        enter_shift(&mut tx, shift, ShiftAccess::Exclusive).await?;
        Ok(tx)
    }

    /// `rows` arrive ordered by code, so imports lock articles and task items
    /// in the same order as merges.
    async fn import_task_once(
        &self,
        shift: ShiftId,
        rows: &[PreparedTask],
        mode: ImportMode,
    ) -> Result<Applied> {
        let mut tx = self.begin_exclusive(shift).await?;

        let removed = match mode {
            ImportMode::Replace => sqlx::query("DELETE FROM task_items WHERE shift_id = $1")
                .bind(shift.0)
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize,
            ImportMode::Merge => 0,
        };

        for row in rows {
            let article = article_id(&mut tx, &row.code).await?;
            sqlx::query(UPSERT_ADDITIVE)
                .bind(shift.0)
                .bind(article.0)
                .bind(db_count(row.total)?)
                .bind(db_count(row.remaining)?)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(Applied {
            applied: rows.len(),
            removed,
            adjusted: 0,
        })
    }

    async fn import_collector_once(
        &self,
        shift: ShiftId,
        rows: &[PreparedCollect],
        apply_to_remaining: bool,
    ) -> Result<Applied> {
        let mut tx = self.begin_exclusive(shift).await?;
        register_articles(&mut tx, rows.iter().map(|r| r.code.as_str())).await?;

        let mut adjusted = 0;
        for row in rows {
            insert_entry(
                &mut tx,
                shift,
                HistoryKind::Collection,
                &row.code,
                &row.actor,
                row.occurred_at,
                Some(row.copies),
            )
            .await?;

            if apply_to_remaining {
                let touched = sqlx::query(
                    "UPDATE task_items t
                     SET remaining_copies = GREATEST(t.remaining_copies - $3, 0)
                     FROM articles a
                     WHERE t.shift_id = $1 AND a.id = t.article_id AND a.code = $2",
                )
                .bind(shift.0)
                .bind(&row.code)
                .bind(db_count(row.copies)?)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                adjusted += touched as usize;
            }
        }

        tx.commit().await?;
        Ok(Applied {
            applied: rows.len(),
            removed: 0,
            adjusted,
        })
    }

    async fn import_check_once(&self, shift: ShiftId, rows: &[PreparedCheck]) -> Result<Applied> {
        let mut tx = self.begin_exclusive(shift).await?;
        register_articles(&mut tx, rows.iter().map(|r| r.code.as_str())).await?;
        for row in rows {
            insert_entry(
                &mut tx,
                shift,
                HistoryKind::Inspection,
                &row.code,
                &row.actor,
                row.occurred_at,
                None,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(Applied {
            applied: rows.len(),
            ..Applied::default()
        })
    }
}

/// Get-or-create every article of a history batch in code order. Entries are
/// then appended in input order against rows that already exist.
async fn register_articles<'a>(
    conn: &mut PgConnection,
    codes: impl Iterator<Item = &'a str>,
) -> Result<()> {
    for code in codes.collect::<BTreeSet<_>>() {
        article_id(conn, code).await?;
    }
    Ok(())
}
