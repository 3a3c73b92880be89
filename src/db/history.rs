//! History log: append, cancel-last, and range listing for both streams.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgConnection;

use super::articles::article_id;
use super::{ShiftAccess, count, db_count, enter_shift};
use crate::error::Result;
use crate::model::*;
use crate::telemetry::metrics;

/// Table layout of one history stream.
struct Stream {
    table: &'static str,
    actor: &'static str,
    /// Column expression selected as `copies`.
    copies: &'static str,
}

fn stream(kind: HistoryKind) -> Stream {
    match kind {
        HistoryKind::Collection => Stream {
            table: "collector_history",
            actor: "collector",
            copies: "copies",
        },
        HistoryKind::Inspection => Stream {
            table: "check_history",
            actor: "inspector",
            copies: "NULL::INTEGER",
        },
    }
}

/// Append one entry on an open transaction. The shift gate must already be held.
pub(crate) async fn insert_entry(
    conn: &mut PgConnection,
    shift: ShiftId,
    kind: HistoryKind,
    code: &str,
    actor: &str,
    occurred_at: Option<DateTime<Utc>>,
    copies: Option<u32>,
) -> Result<HistoryEntry> {
    let article = article_id(&mut *conn, code).await?;
    let (id, occurred_at): (i64, DateTime<Utc>) = match kind {
        HistoryKind::Collection => {
            sqlx::query_as(
                "INSERT INTO collector_history
                     (shift_id, article_id, collector, occurred_at, copies)
                 VALUES ($1, $2, $3, COALESCE($4, now()), $5)
                 RETURNING id, occurred_at",
            )
            .bind(shift.0)
            .bind(article.0)
            .bind(actor)
            .bind(occurred_at)
            .bind(db_count(copies.unwrap_or(1))?)
            .fetch_one(&mut *conn)
            .await?
        }
        HistoryKind::Inspection => {
            sqlx::query_as(
                "INSERT INTO check_history (shift_id, article_id, inspector, occurred_at)
                 VALUES ($1, $2, $3, COALESCE($4, now()))
                 RETURNING id, occurred_at",
            )
            .bind(shift.0)
            .bind(article.0)
            .bind(actor)
            .bind(occurred_at)
            .fetch_one(&mut *conn)
            .await?
        }
    };

    Ok(HistoryEntry {
        id: EntryId(id),
        kind,
        shift,
        article: Some(code.to_string()),
        actor: actor.to_string(),
        occurred_at,
        copies: match kind {
            HistoryKind::Collection => Some(copies.unwrap_or(1)),
            HistoryKind::Inspection => None,
        },
    })
}

impl super::Db {
    /// Append an entry to a history stream. Counters are not touched.
    pub async fn record(&self, shift: ShiftId, entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let (code, copies) = entry.validate()?;

        let mut tx = self.pool.begin().await?;
        enter_shift(&mut tx, shift, ShiftAccess::Shared).await?;
        let recorded = insert_entry(
            &mut tx,
            shift,
            entry.kind,
            code,
            &entry.actor,
            entry.occurred_at,
            copies,
        )
        .await?;
        tx.commit().await?;

        metrics::history_operations().add(
            1,
            &[
                KeyValue::new("stream", entry.kind.to_string()),
                KeyValue::new("operation", "record"),
            ],
        );
        Ok(recorded)
    }

    /// Delete and return the newest entry of the stream for this shift.
    ///
    /// Compensating the task ledger is left to the caller.
    pub async fn cancel_last(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
    ) -> Result<Option<HistoryEntry>> {
        let Stream {
            table,
            actor,
            copies,
        } = stream(kind);

        let mut tx = self.pool.begin().await?;
        enter_shift(&mut tx, shift, ShiftAccess::Shared).await?;

        let row: Option<HistoryRow> = sqlx::query_as(&format!(
            "WITH gone AS (
                 DELETE FROM {table}
                 WHERE id = (
                     SELECT id FROM {table}
                     WHERE shift_id = $1
                     ORDER BY id DESC
                     LIMIT 1
                     FOR UPDATE
                 )
                 RETURNING id, shift_id, article_id, {actor} AS actor, occurred_at,
                           {copies} AS copies
             )
             SELECT gone.id, gone.shift_id, a.code, gone.actor, gone.occurred_at, gone.copies
             FROM gone
             LEFT JOIN articles a ON a.id = gone.article_id"
        ))
        .bind(shift.0)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        metrics::history_operations().add(
            1,
            &[
                KeyValue::new("stream", kind.to_string()),
                KeyValue::new(
                    "operation",
                    if row.is_some() { "cancel" } else { "cancel_empty" },
                ),
            ],
        );
        Ok(row.map(|r| r.into_entry(kind)))
    }

    /// Entries of a stream in sequence order within `[range.from, range.to)`.
    pub async fn history(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
        range: HistoryRange,
    ) -> Result<Vec<HistoryEntry>> {
        let Stream {
            table,
            actor,
            copies,
        } = stream(kind);

        let rows: Vec<HistoryRow> = sqlx::query_as(&format!(
            "SELECT h.id, h.shift_id, a.code, h.{actor} AS actor, h.occurred_at, {copies} AS copies
             FROM {table} h
             LEFT JOIN articles a ON a.id = h.article_id
             WHERE h.shift_id = $1
             AND ($2::timestamptz IS NULL OR h.occurred_at >= $2)
             AND ($3::timestamptz IS NULL OR h.occurred_at < $3)
             ORDER BY h.id ASC"
        ))
        .bind(shift.0)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_entry(kind)).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    shift_id: i64,
    code: Option<String>,
    actor: String,
    occurred_at: DateTime<Utc>,
    copies: Option<i32>,
}

impl HistoryRow {
    fn into_entry(self, kind: HistoryKind) -> HistoryEntry {
        HistoryEntry {
            id: EntryId(self.id),
            kind,
            shift: ShiftId(self.shift_id),
            article: self.code,
            actor: self.actor,
            occurred_at: self.occurred_at,
            copies: self.copies.map(count),
        }
    }
}
