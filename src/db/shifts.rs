//! Shift lifecycle: open, start, close, lookup.

use chrono::{DateTime, Utc};
use tracing::info;

use super::{ShiftAccess, enter_shift};
use crate::error::{Error, Result};
use crate::model::{NewShift, Shift, ShiftId};

/// Two-key advisory lock guarding creation of open shifts. The two-key
/// space does not overlap the single-key space used for per-shift locks.
const OPEN_SHIFT_LOCK: (i32, i32) = (0x5348, 1);

const SHIFT_COLUMNS: &str =
    "id, status, started_at, ended_at, started_by_role, started_by_computer";

impl super::Db {
    /// The most recently started open shift, creating one if none is open.
    pub async fn open_or_create_shift(&self) -> Result<ShiftId> {
        let mut tx = self.pool.begin().await?;
        lock_shift_creation(&mut tx).await?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM shifts WHERE status = 'open'
             ORDER BY started_at DESC, id DESC
             LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some((id,)) => id,
            None => {
                let (id,): (i64,) =
                    sqlx::query_as("INSERT INTO shifts (status) VALUES ('open') RETURNING id")
                        .fetch_one(&mut *tx)
                        .await?;
                info!(shift = id, "no open shift, started a new one");
                id
            }
        };

        tx.commit().await?;
        Ok(ShiftId(id))
    }

    /// The most recently started open shift, if any.
    pub async fn current_open_shift(&self) -> Result<Option<ShiftId>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM shifts WHERE status = 'open'
             ORDER BY started_at DESC, id DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| ShiftId(id)))
    }

    /// Start a new open shift. Other open shifts stay open unless
    /// `new.close_previous` is set.
    pub async fn start_new_shift(&self, new: NewShift) -> Result<ShiftId> {
        let mut tx = self.pool.begin().await?;
        lock_shift_creation(&mut tx).await?;

        if new.close_previous {
            let closed: Vec<(i64,)> = sqlx::query_as(
                "UPDATE shifts SET status = 'closed', ended_at = now()
                 WHERE status = 'open'
                 RETURNING id",
            )
            .fetch_all(&mut *tx)
            .await?;
            for (id,) in closed {
                info!(shift = id, "closed previous shift");
            }
        }

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO shifts (status, started_at, started_by_role, started_by_computer)
             VALUES ('open', now(), $1, $2)
             RETURNING id",
        )
        .bind(&new.started_by_role)
        .bind(&new.started_by_computer)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            shift = id,
            role = new.started_by_role.as_deref(),
            computer = new.started_by_computer.as_deref(),
            "shift started"
        );
        Ok(ShiftId(id))
    }

    /// Close a shift. Waits for in-flight mutations of the shift to finish;
    /// closing an already closed shift returns it unchanged.
    pub async fn close_shift(&self, shift: ShiftId) -> Result<Shift> {
        let mut tx = self.pool.begin().await?;
        match enter_shift(&mut tx, shift, ShiftAccess::Exclusive).await {
            Ok(()) | Err(Error::ShiftClosed(_)) => {}
            Err(e) => return Err(e),
        }

        let row: ShiftRow = sqlx::query_as(&format!(
            "UPDATE shifts SET status = 'closed', ended_at = COALESCE(ended_at, now())
             WHERE id = $1
             RETURNING {SHIFT_COLUMNS}"
        ))
        .bind(shift.0)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(shift = shift.0, "shift closed");
        row.try_into_shift()
    }

    pub async fn get_shift(&self, shift: ShiftId) -> Result<Shift> {
        let row: Option<ShiftRow> =
            sqlx::query_as(&format!("SELECT {SHIFT_COLUMNS} FROM shifts WHERE id = $1"))
                .bind(shift.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("shift {shift}")))?
            .try_into_shift()
    }
}

async fn lock_shift_creation(conn: &mut sqlx::PgConnection) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(OPEN_SHIFT_LOCK.0)
        .bind(OPEN_SHIFT_LOCK.1)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ShiftRow {
    id: i64,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    started_by_role: Option<String>,
    started_by_computer: Option<String>,
}

impl ShiftRow {
    fn try_into_shift(self) -> Result<Shift> {
        Ok(Shift {
            id: ShiftId(self.id),
            status: self.status.parse()?,
            started_at: self.started_at,
            ended_at: self.ended_at,
            started_by_role: self.started_by_role,
            started_by_computer: self.started_by_computer,
        })
    }
}
