//! In-process store with the same concurrency contract as the Postgres one.
//!
//! Table state lives behind one `std::sync::Mutex` that is never held across
//! an `.await`. Concurrency control mirrors the database backend: a per-shift
//! reader/writer gate in place of the advisory lock, and a lease table in
//! place of row locks. Every read that decides a write happens inside the
//! same critical section as the write.

mod lease;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use opentelemetry::KeyValue;
use rand::seq::SliceRandom;
use tracing::{Instrument, debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ledger::{Applied, WorkList, settle_import};
use crate::model::import::*;
use crate::model::*;
use crate::telemetry::ledger::{record_import_attempts, start_import_span};
use crate::telemetry::metrics;
use lease::{LeaseTable, ShiftGate};

type TaskKey = (ShiftId, String);

/// Work list held in memory. Useful for tests and single-process embedding.
pub struct LocalStore {
    state: Mutex<State>,
    leases: LeaseTable<TaskKey>,
    gate: ShiftGate,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    total: u32,
    remaining: u32,
}

#[derive(Default)]
struct State {
    articles: HashMap<String, ArticleId>,
    next_article: i64,
    shifts: BTreeMap<ShiftId, Shift>,
    next_shift: i64,
    /// Task items per shift, keyed (and so ordered) by article code.
    tasks: HashMap<ShiftId, BTreeMap<String, Counters>>,
    collection: Stream,
    inspection: Stream,
}

#[derive(Default)]
struct Stream {
    entries: Vec<HistoryEntry>,
    next_id: i64,
}

impl State {
    fn article(&mut self, code: &str) -> ArticleId {
        if let Some(id) = self.articles.get(code) {
            return *id;
        }
        self.next_article += 1;
        let id = ArticleId(self.next_article);
        self.articles.insert(code.to_string(), id);
        id
    }

    fn ensure_open(&self, shift: ShiftId) -> Result<()> {
        match self.shifts.get(&shift).map(|s| s.status) {
            None => Err(Error::NotFound(format!("shift {shift}"))),
            Some(ShiftStatus::Closed) => Err(Error::ShiftClosed(shift)),
            Some(ShiftStatus::Open) => Ok(()),
        }
    }

    fn latest_open(&self) -> Option<ShiftId> {
        self.shifts
            .values()
            .filter(|s| s.status == ShiftStatus::Open)
            .max_by_key(|s| (s.started_at, s.id))
            .map(|s| s.id)
    }

    fn insert_shift(&mut self, new: NewShift) -> ShiftId {
        self.next_shift += 1;
        let id = ShiftId(self.next_shift);
        self.shifts.insert(
            id,
            Shift {
                id,
                status: ShiftStatus::Open,
                started_at: Utc::now(),
                ended_at: None,
                started_by_role: new.started_by_role,
                started_by_computer: new.started_by_computer,
            },
        );
        id
    }

    fn stream(&mut self, kind: HistoryKind) -> &mut Stream {
        match kind {
            HistoryKind::Collection => &mut self.collection,
            HistoryKind::Inspection => &mut self.inspection,
        }
    }

    fn append(&mut self, shift: ShiftId, kind: HistoryKind, entry: Appended) -> HistoryEntry {
        self.article(&entry.code);
        let stream = self.stream(kind);
        stream.next_id += 1;
        let recorded = HistoryEntry {
            id: EntryId(stream.next_id),
            kind,
            shift,
            article: Some(entry.code),
            actor: entry.actor,
            occurred_at: entry.occurred_at.unwrap_or_else(Utc::now),
            copies: entry.copies,
        };
        stream.entries.push(recorded.clone());
        recorded
    }

    fn snapshot(&self, shift: ShiftId) -> Vec<TaskItem> {
        self.tasks
            .get(&shift)
            .map(|items| {
                items
                    .iter()
                    .map(|(code, c)| TaskItem {
                        article: code.clone(),
                        total: c.total,
                        remaining: c.remaining,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A validated history entry about to be stored.
struct Appended {
    code: String,
    actor: String,
    occurred_at: Option<chrono::DateTime<Utc>>,
    copies: Option<u32>,
}

fn add_counts(item: &mut Counters, total: u32, remaining: u32, code: &str) -> Result<()> {
    let overflow = || Error::InvalidInput(format!("counts for {code} are too large"));
    item.total = item.total.checked_add(total).ok_or_else(overflow)?;
    item.remaining = item.remaining.checked_add(remaining).ok_or_else(overflow)?;
    Ok(())
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            leases: LeaseTable::new(),
            gate: ShiftGate::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Article registry ---------------------------------------------------

    pub async fn get_or_create_article(&self, code: &str) -> Result<ArticleId> {
        let code = normalize_code(code)?;
        Ok(self.state().article(code))
    }

    // -- Shift lifecycle ----------------------------------------------------

    pub async fn open_or_create_shift(&self) -> Result<ShiftId> {
        let mut state = self.state();
        if let Some(id) = state.latest_open() {
            return Ok(id);
        }
        let id = state.insert_shift(NewShift::new());
        self.gate.register(id);
        info!(shift = id.0, "no open shift, started a new one");
        Ok(id)
    }

    pub async fn current_open_shift(&self) -> Result<Option<ShiftId>> {
        Ok(self.state().latest_open())
    }

    pub async fn start_new_shift(&self, new: NewShift) -> Result<ShiftId> {
        let mut state = self.state();
        if new.close_previous {
            let now = Utc::now();
            for shift in state.shifts.values_mut() {
                if shift.status == ShiftStatus::Open {
                    shift.status = ShiftStatus::Closed;
                    shift.ended_at = Some(now);
                    info!(shift = shift.id.0, "closed previous shift");
                }
            }
        }
        let role = new.started_by_role.clone();
        let computer = new.started_by_computer.clone();
        let id = state.insert_shift(new);
        self.gate.register(id);
        info!(
            shift = id.0,
            role = role.as_deref(),
            computer = computer.as_deref(),
            "shift started"
        );
        Ok(id)
    }

    pub async fn close_shift(&self, shift: ShiftId) -> Result<Shift> {
        let _entry = self.gate.exclusive(shift).await?;
        let mut state = self.state();
        let record = state
            .shifts
            .get_mut(&shift)
            .ok_or_else(|| Error::NotFound(format!("shift {shift}")))?;
        record.status = ShiftStatus::Closed;
        record.ended_at.get_or_insert_with(Utc::now);
        info!(shift = shift.0, "shift closed");
        Ok(record.clone())
    }

    pub async fn get_shift(&self, shift: ShiftId) -> Result<Shift> {
        self.state()
            .shifts
            .get(&shift)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("shift {shift}")))
    }

    // -- Task ledger --------------------------------------------------------

    pub async fn merge_articles(
        &self,
        shift: ShiftId,
        items: &[ArticleCopies],
    ) -> Result<MergeOutcome> {
        let rows = prepare_merge(items)?;
        let _entry = self.gate.shared(shift).await?;

        // Leases in key order so overlapping merges cannot deadlock.
        let codes: BTreeSet<&str> = rows.iter().map(|(code, _)| code.as_str()).collect();
        let mut leases = Vec::with_capacity(codes.len());
        for code in codes {
            leases.push(self.leases.acquire(&(shift, code.to_string())).await);
        }

        let mut state = self.state();
        state.ensure_open(shift)?;

        let mut items = state.tasks.get(&shift).cloned().unwrap_or_default();
        let (mut added, mut updated) = (0, 0);
        for (code, copies) in &rows {
            match items.get_mut(code) {
                Some(item) => {
                    add_counts(item, *copies, *copies, code)?;
                    updated += 1;
                }
                None => {
                    items.insert(
                        code.clone(),
                        Counters {
                            total: *copies,
                            remaining: *copies,
                        },
                    );
                    added += 1;
                }
            }
        }
        for (code, _) in &rows {
            state.article(code);
        }
        state.tasks.insert(shift, items);
        let snapshot = state.snapshot(shift);
        drop(state);

        metrics::merged_rows().add(added as u64, &[KeyValue::new("result", "added")]);
        metrics::merged_rows().add(updated as u64, &[KeyValue::new("result", "updated")]);
        debug!(shift = shift.0, added, updated, "merged articles");

        Ok(MergeOutcome {
            snapshot,
            added,
            updated,
        })
    }

    pub async fn claim_one_available(&self, shift: ShiftId) -> Result<Option<Claim>> {
        let started = std::time::Instant::now();
        let _entry = self.gate.shared(shift).await?;

        let mut candidates: Vec<String> = {
            let state = self.state();
            state.ensure_open(shift)?;
            state
                .tasks
                .get(&shift)
                .map(|items| {
                    items
                        .iter()
                        .filter(|(_, c)| c.remaining > 0)
                        .map(|(code, _)| code.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        candidates.shuffle(&mut rand::rng());

        let mut claimed = None;
        for code in candidates {
            let key = (shift, code);
            let Some(_lease) = self.leases.try_acquire(&key) else {
                continue;
            };
            let mut state = self.state();
            let item = state
                .tasks
                .get_mut(&shift)
                .and_then(|items| items.get_mut(&key.1));
            if let Some(item) = item.filter(|item| item.remaining > 0) {
                item.remaining -= 1;
                claimed = Some(Claim {
                    article: key.1.clone(),
                    remaining: item.remaining,
                });
                break;
            }
        }

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
        if let Some(claim) = &claimed {
            debug!(
                shift = shift.0,
                article = %claim.article,
                remaining = claim.remaining,
                "claimed one unit"
            );
        }
        Ok(claimed)
    }

    pub async fn dec_remaining(&self, shift: ShiftId, code: &str, by: u32) -> Result<u32> {
        let code = normalize_code(code)?;
        let _entry = self.gate.shared(shift).await?;
        let _lease = self.leases.acquire(&(shift, code.to_string())).await;

        let mut state = self.state();
        state.ensure_open(shift)?;
        let item = state
            .tasks
            .get_mut(&shift)
            .and_then(|items| items.get_mut(code))
            .ok_or_else(|| Error::NotFound(format!("task item {code} in shift {shift}")))?;
        item.remaining -= by.min(item.remaining);
        let left = item.remaining;
        drop(state);

        metrics::adjustments().add(1, &[KeyValue::new("operation", "dec")]);
        debug!(shift = shift.0, code, by, left, "decremented remaining");
        Ok(left)
    }

    pub async fn inc_remaining(&self, shift: ShiftId, code: &str, by: u32) -> Result<u32> {
        let code = normalize_code(code)?;
        let _entry = self.gate.shared(shift).await?;
        let _lease = self.leases.acquire(&(shift, code.to_string())).await;

        let mut state = self.state();
        state.ensure_open(shift)?;
        state.article(code);
        let items = state.tasks.entry(shift).or_default();
        let left = match items.get_mut(code) {
            Some(item) => {
                item.remaining = item.remaining.checked_add(by).ok_or_else(|| {
                    Error::InvalidInput(format!("counts for {code} are too large"))
                })?;
                item.total = item.total.max(item.remaining);
                item.remaining
            }
            None => {
                items.insert(
                    code.to_string(),
                    Counters {
                        total: by,
                        remaining: by,
                    },
                );
                by
            }
        };
        drop(state);

        metrics::adjustments().add(1, &[KeyValue::new("operation", "inc")]);
        debug!(shift = shift.0, code, by, left, "incremented remaining");
        Ok(left)
    }

    pub async fn remaining_total(&self, shift: ShiftId) -> Result<u64> {
        Ok(self
            .state()
            .tasks
            .get(&shift)
            .map(|items| items.values().map(|c| u64::from(c.remaining)).sum())
            .unwrap_or(0))
    }

    pub async fn task_snapshot(&self, shift: ShiftId) -> Result<Vec<TaskItem>> {
        Ok(self.state().snapshot(shift))
    }

    // -- History log --------------------------------------------------------

    pub async fn record(&self, shift: ShiftId, entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let (code, copies) = entry.validate()?;
        let appended = Appended {
            code: code.to_string(),
            actor: entry.actor.clone(),
            occurred_at: entry.occurred_at,
            copies,
        };
        let _gate = self.gate.shared(shift).await?;

        let recorded = {
            let mut state = self.state();
            state.ensure_open(shift)?;
            state.append(shift, entry.kind, appended)
        };

        metrics::history_operations().add(
            1,
            &[
                KeyValue::new("stream", entry.kind.to_string()),
                KeyValue::new("operation", "record"),
            ],
        );
        Ok(recorded)
    }

    pub async fn cancel_last(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
    ) -> Result<Option<HistoryEntry>> {
        let _entry = self.gate.shared(shift).await?;

        let removed = {
            let mut state = self.state();
            state.ensure_open(shift)?;
            let stream = state.stream(kind);
            stream
                .entries
                .iter()
                .rposition(|e| e.shift == shift)
                .map(|at| stream.entries.remove(at))
        };

        metrics::history_operations().add(
            1,
            &[
                KeyValue::new("stream", kind.to_string()),
                KeyValue::new(
                    "operation",
                    if removed.is_some() { "cancel" } else { "cancel_empty" },
                ),
            ],
        );
        Ok(removed)
    }

    pub async fn history(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
        range: HistoryRange,
    ) -> Result<Vec<HistoryEntry>> {
        let mut state = self.state();
        Ok(state
            .stream(kind)
            .entries
            .iter()
            .filter(|e| e.shift == shift && range.contains(e.occurred_at))
            .cloned()
            .collect())
    }

    // -- Bulk reconciler ----------------------------------------------------
    //
    // The exclusive gate excludes every other mutation of the shift, so one
    // critical section is a complete, conflict-free attempt.

    pub async fn import_task(
        &self,
        shift: ShiftId,
        rows: &[TaskRow],
        mode: ImportMode,
    ) -> Result<ImportSummary> {
        let prepared = prepare_task_rows(rows);
        let batch_id = Uuid::new_v4();
        let span = start_import_span("task", shift, &batch_id, prepared.rows.len());

        let outcome = async {
            let _entry = self.gate.exclusive(shift).await?;
            let mut state = self.state();
            state.ensure_open(shift)?;

            let current = state.tasks.get(&shift).cloned().unwrap_or_default();
            let (mut items, removed) = match mode {
                ImportMode::Replace => (BTreeMap::new(), current.len()),
                ImportMode::Merge => (current, 0),
            };
            for row in &prepared.rows {
                let item = items.entry(row.code.clone()).or_insert(Counters {
                    total: 0,
                    remaining: 0,
                });
                add_counts(item, row.total, row.remaining, &row.code)?;
            }
            for row in &prepared.rows {
                state.article(&row.code);
            }
            state.tasks.insert(shift, items);
            Ok::<_, Error>(Applied {
                applied: prepared.rows.len(),
                removed,
                adjusted: 0,
            })
        }
        .instrument(span.clone())
        .await;

        record_import_attempts(&span, 1);
        settle_import(
            "task",
            &mode.to_string(),
            batch_id,
            prepared.skipped,
            1,
            outcome,
        )
    }

    pub async fn import_collector_rows(
        &self,
        shift: ShiftId,
        rows: &[CollectorRow],
        apply_to_remaining: bool,
    ) -> Result<ImportSummary> {
        let prepared = prepare_collector_rows(rows);
        let batch_id = Uuid::new_v4();
        let span = start_import_span("collector", shift, &batch_id, prepared.rows.len());

        let outcome = async {
            let _entry = self.gate.exclusive(shift).await?;
            let mut state = self.state();
            state.ensure_open(shift)?;

            let mut adjusted = 0;
            for row in &prepared.rows {
                state.append(
                    shift,
                    HistoryKind::Collection,
                    Appended {
                        code: row.code.clone(),
                        actor: row.actor.clone(),
                        occurred_at: row.occurred_at,
                        copies: Some(row.copies),
                    },
                );
                if !apply_to_remaining {
                    continue;
                }
                let item = state
                    .tasks
                    .get_mut(&shift)
                    .and_then(|items| items.get_mut(&row.code));
                if let Some(item) = item {
                    item.remaining = item.remaining.saturating_sub(row.copies);
                    adjusted += 1;
                }
            }
            Ok::<_, Error>(Applied {
                applied: prepared.rows.len(),
                removed: 0,
                adjusted,
            })
        }
        .instrument(span.clone())
        .await;

        record_import_attempts(&span, 1);
        let mode = if apply_to_remaining { "apply" } else { "append" };
        settle_import("collector", mode, batch_id, prepared.skipped, 1, outcome)
    }

    pub async fn import_check_rows(
        &self,
        shift: ShiftId,
        rows: &[CheckRow],
    ) -> Result<ImportSummary> {
        let prepared = prepare_check_rows(rows);
        let batch_id = Uuid::new_v4();
        let span = start_import_span("check", shift, &batch_id, prepared.rows.len());

        let outcome = async {
            let _entry = self.gate.exclusive(shift).await?;
            let mut state = self.state();
            state.ensure_open(shift)?;
            for row in &prepared.rows {
                state.append(
                    shift,
                    HistoryKind::Inspection,
                    Appended {
                        code: row.code.clone(),
                        actor: row.actor.clone(),
                        occurred_at: row.occurred_at,
                        copies: None,
                    },
                );
            }
            Ok::<_, Error>(Applied {
                applied: prepared.rows.len(),
                ..Applied::default()
            })
        }
        .instrument(span.clone())
        .await;

        record_import_attempts(&span, 1);
        settle_import("check", "append", batch_id, prepared.skipped, 1, outcome)
    }
}

impl WorkList for LocalStore {
    fn get_or_create_article(&self, code: &str) -> impl Future<Output = Result<ArticleId>> + Send {
        LocalStore::get_or_create_article(self, code)
    }

    fn open_or_create_shift(&self) -> impl Future<Output = Result<ShiftId>> + Send {
        LocalStore::open_or_create_shift(self)
    }

    fn current_open_shift(&self) -> impl Future<Output = Result<Option<ShiftId>>> + Send {
        LocalStore::current_open_shift(self)
    }

    fn start_new_shift(&self, new: NewShift) -> impl Future<Output = Result<ShiftId>> + Send {
        LocalStore::start_new_shift(self, new)
    }

    fn close_shift(&self, shift: ShiftId) -> impl Future<Output = Result<Shift>> + Send {
        LocalStore::close_shift(self, shift)
    }

    fn get_shift(&self, shift: ShiftId) -> impl Future<Output = Result<Shift>> + Send {
        LocalStore::get_shift(self, shift)
    }

    fn merge_articles(
        &self,
        shift: ShiftId,
        items: &[ArticleCopies],
    ) -> impl Future<Output = Result<MergeOutcome>> + Send {
        LocalStore::merge_articles(self, shift, items)
    }

    fn claim_one_available(
        &self,
        shift: ShiftId,
    ) -> impl Future<Output = Result<Option<Claim>>> + Send {
        LocalStore::claim_one_available(self, shift)
    }

    fn dec_remaining(
        &self,
        shift: ShiftId,
        code: &str,
        by: u32,
    ) -> impl Future<Output = Result<u32>> + Send {
        LocalStore::dec_remaining(self, shift, code, by)
    }

    fn inc_remaining(
        &self,
        shift: ShiftId,
        code: &str,
        by: u32,
    ) -> impl Future<Output = Result<u32>> + Send {
        LocalStore::inc_remaining(self, shift, code, by)
    }

    fn remaining_total(&self, shift: ShiftId) -> impl Future<Output = Result<u64>> + Send {
        LocalStore::remaining_total(self, shift)
    }

    fn task_snapshot(&self, shift: ShiftId) -> impl Future<Output = Result<Vec<TaskItem>>> + Send {
        LocalStore::task_snapshot(self, shift)
    }

    fn record(
        &self,
        shift: ShiftId,
        entry: NewHistoryEntry,
    ) -> impl Future<Output = Result<HistoryEntry>> + Send {
        LocalStore::record(self, shift, entry)
    }

    fn cancel_last(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
    ) -> impl Future<Output = Result<Option<HistoryEntry>>> + Send {
        LocalStore::cancel_last(self, shift, kind)
    }

    fn history(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
        range: HistoryRange,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>>> + Send {
        LocalStore::history(self, shift, kind, range)
    }

    fn import_task(
        &self,
        shift: ShiftId,
        rows: &[TaskRow],
        mode: ImportMode,
    ) -> impl Future<Output = Result<ImportSummary>> + Send {
        LocalStore::import_task(self, shift, rows, mode)
    }

    fn import_collector_rows(
        &self,
        shift: ShiftId,
        rows: &[CollectorRow],
        apply_to_remaining: bool,
    ) -> impl Future<Output = Result<ImportSummary>> + Send {
        LocalStore::import_collector_rows(self, shift, rows, apply_to_remaining)
    }

    fn import_check_rows(
        &self,
        shift: ShiftId,
        rows: &[CheckRow],
    ) -> impl Future<Output = Result<ImportSummary>> + Send {
        LocalStore::import_check_rows(self, shift, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_skips_leased_items() {
        let store = LocalStore::new();
        let shift = store.open_or_create_shift().await.unwrap();
        store
            .merge_articles(shift, &[ArticleCopies::new("A", 1), ArticleCopies::new("B", 1)])
            .await
            .unwrap();

        let held = store.leases.acquire(&(shift, "A".to_string())).await;
        for _ in 0..5 {
            // Only B is free; once taken, nothing is claimable while A is held.
            let claim = store.claim_one_available(shift).await.unwrap();
            if let Some(claim) = claim {
                assert_eq!(claim.article, "B");
            }
        }
        assert!(store.claim_one_available(shift).await.unwrap().is_none());

        drop(held);
        let claim = store.claim_one_available(shift).await.unwrap().unwrap();
        assert_eq!(claim.article, "A");
    }

    #[tokio::test]
    async fn failed_import_leaves_task_list_untouched() {
        let store = LocalStore::new();
        let shift = store.open_or_create_shift().await.unwrap();
        store
            .merge_articles(shift, &[ArticleCopies::new("A", 2)])
            .await
            .unwrap();

        let rows = [TaskRow::new("B", 1), TaskRow::new("A", u32::MAX)];
        let err = store.import_task(shift, &rows, ImportMode::Merge).await;
        assert!(matches!(err, Err(Error::InvalidInput(_))));

        let snapshot = store.task_snapshot(shift).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].remaining, 2);
    }
}
