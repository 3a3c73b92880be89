//! The work-list interface shared by every store backend.
//!
//! Every operation names its shift explicitly; no backend keeps a hidden
//! "current shift". Futures are `Send` so callers can spawn them on a
//! multi-threaded runtime.

use std::future::Future;

use opentelemetry::KeyValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::*;
use crate::telemetry::metrics;

pub trait WorkList: Send + Sync {
    // -- Article registry ---------------------------------------------------

    /// Identity for `code`, registering it on first use.
    fn get_or_create_article(&self, code: &str) -> impl Future<Output = Result<ArticleId>> + Send;

    // -- Shift lifecycle ----------------------------------------------------

    /// The most recently started open shift, creating one if none is open.
    fn open_or_create_shift(&self) -> impl Future<Output = Result<ShiftId>> + Send;

    /// The most recently started open shift, if any.
    fn current_open_shift(&self) -> impl Future<Output = Result<Option<ShiftId>>> + Send;

    /// Start a new open shift unconditionally.
    fn start_new_shift(&self, new: NewShift) -> impl Future<Output = Result<ShiftId>> + Send;

    /// Close a shift once in-flight mutations of it have finished.
    fn close_shift(&self, shift: ShiftId) -> impl Future<Output = Result<Shift>> + Send;

    fn get_shift(&self, shift: ShiftId) -> impl Future<Output = Result<Shift>> + Send;

    // -- Task ledger --------------------------------------------------------

    /// Add copies onto the shift's task list, creating items as needed.
    fn merge_articles(
        &self,
        shift: ShiftId,
        items: &[ArticleCopies],
    ) -> impl Future<Output = Result<MergeOutcome>> + Send;

    /// Take one unit from a random task item that no other claim holds.
    fn claim_one_available(
        &self,
        shift: ShiftId,
    ) -> impl Future<Output = Result<Option<Claim>>> + Send;

    /// Decrement remaining by `by`, clamped at zero. Errors if the item is missing.
    fn dec_remaining(
        &self,
        shift: ShiftId,
        code: &str,
        by: u32,
    ) -> impl Future<Output = Result<u32>> + Send;

    /// Increment remaining by `by`, raising total to match. Creates the item if missing.
    fn inc_remaining(
        &self,
        shift: ShiftId,
        code: &str,
        by: u32,
    ) -> impl Future<Output = Result<u32>> + Send;

    fn remaining_total(&self, shift: ShiftId) -> impl Future<Output = Result<u64>> + Send;

    /// The shift's task list ordered by article code.
    fn task_snapshot(&self, shift: ShiftId) -> impl Future<Output = Result<Vec<TaskItem>>> + Send;

    // -- History log --------------------------------------------------------

    fn record(
        &self,
        shift: ShiftId,
        entry: NewHistoryEntry,
    ) -> impl Future<Output = Result<HistoryEntry>> + Send;

    /// Delete and return the newest entry of a stream, if any.
    fn cancel_last(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
    ) -> impl Future<Output = Result<Option<HistoryEntry>>> + Send;

    /// Entries of a stream in sequence order, filtered by occurrence time.
    fn history(
        &self,
        shift: ShiftId,
        kind: HistoryKind,
        range: HistoryRange,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>>> + Send;

    // -- Bulk reconciler ----------------------------------------------------

    fn import_task(
        &self,
        shift: ShiftId,
        rows: &[TaskRow],
        mode: ImportMode,
    ) -> impl Future<Output = Result<ImportSummary>> + Send;

    fn import_collector_rows(
        &self,
        shift: ShiftId,
        rows: &[CollectorRow],
        apply_to_remaining: bool,
    ) -> impl Future<Output = Result<ImportSummary>> + Send;

    fn import_check_rows(
        &self,
        shift: ShiftId,
        rows: &[CheckRow],
    ) -> impl Future<Output = Result<ImportSummary>> + Send;
}

/// Counts produced by one successful import attempt.
#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub applied: usize,
    pub removed: usize,
    pub adjusted: usize,
}

/// Log, count and summarize a finished import.
pub(crate) fn settle_import(
    stream: &'static str,
    mode: &str,
    batch_id: Uuid,
    skipped: usize,
    attempts: u32,
    outcome: Result<Applied>,
) -> Result<ImportSummary> {
    let result = if outcome.is_ok() { "ok" } else { "error" };
    metrics::imports().add(
        1,
        &[
            KeyValue::new("stream", stream),
            KeyValue::new("mode", mode.to_string()),
            KeyValue::new("result", result),
        ],
    );

    match outcome {
        Ok(applied) => {
            info!(
                %batch_id,
                stream,
                mode,
                applied = applied.applied,
                skipped,
                removed = applied.removed,
                adjusted = applied.adjusted,
                attempts,
                "import committed"
            );
            Ok(ImportSummary {
                batch_id,
                applied: applied.applied,
                skipped,
                removed: applied.removed,
                adjusted: applied.adjusted,
                attempts,
            })
        }
        Err(e) => {
            warn!(%batch_id, stream, mode, attempts, error = %e, "import rolled back");
            Err(e)
        }
    }
}
