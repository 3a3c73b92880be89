//! Multi-step operations that restore the task ledger when a later step fails.
//!
//! Each workflow is a composition over [`WorkList`], so it behaves the same on
//! every backend. A unit taken by a claim is handed back with
//! `inc_remaining(code, 1)` if the downstream step does not succeed; a
//! cancelled collection entry feeds its copies back the same way.

use std::future::Future;

use opentelemetry::KeyValue;
use tracing::{Instrument, debug};

use crate::error::{Error, Result};
use crate::ledger::WorkList;
use crate::model::*;
use crate::telemetry::ledger::{record_compensation, start_workflow_span};
use crate::telemetry::metrics;

/// Claim one unit and run `step` on it.
///
/// Returns `Ok(None)` when nothing is claimable. If `step` fails the unit is
/// restored and the step's error returned; if the restore fails too, both
/// errors come back as [`Error::Compensation`].
pub async fn claim_then<L, F, Fut, T>(
    list: &L,
    shift: ShiftId,
    step: F,
) -> Result<Option<(Claim, T)>>
where
    L: WorkList,
    F: FnOnce(Claim) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let span = start_workflow_span("claim_then", shift);
    async {
        let Some(claim) = list.claim_one_available(shift).await? else {
            return Ok(None);
        };

        match step(claim.clone()).await {
            Ok(value) => Ok(Some((claim, value))),
            Err(step_err) => {
                record_compensation(&tracing::Span::current(), &claim.article, 1, "step_failed");
                metrics::compensations().add(1, &[KeyValue::new("reason", "step_failed")]);
                match list.inc_remaining(shift, &claim.article, 1).await {
                    Ok(_) => Err(step_err),
                    Err(restore_err) => Err(Error::Compensation {
                        article: claim.article,
                        step: Box::new(step_err),
                        compensation: Box::new(restore_err),
                    }),
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Claim one unit and log it as collected by `actor`.
pub async fn pick_and_record<L: WorkList>(
    list: &L,
    shift: ShiftId,
    actor: &str,
) -> Result<Option<(Claim, HistoryEntry)>> {
    claim_then(list, shift, |claim| {
        list.record(shift, NewHistoryEntry::collection(claim.article, actor, 1))
    })
    .await
}

/// Cancel the newest entry of a stream. A cancelled collection gives its
/// copies back to the task item; inspections leave the ledger alone.
pub async fn cancel_last_compensated<L: WorkList>(
    list: &L,
    shift: ShiftId,
    kind: HistoryKind,
) -> Result<Option<HistoryEntry>> {
    let span = start_workflow_span("cancel_last", shift);
    async {
        let Some(entry) = list.cancel_last(shift, kind).await? else {
            return Ok(None);
        };

        match (&entry.article, entry.copies) {
            (Some(article), Some(copies)) if kind == HistoryKind::Collection => {
                record_compensation(&tracing::Span::current(), article, copies, "cancelled");
                metrics::compensations()
                    .add(u64::from(copies), &[KeyValue::new("reason", "cancelled")]);
                list.inc_remaining(shift, article, copies).await?;
            }
            _ => debug!(entry = entry.id.0, %kind, "cancelled without compensation"),
        }
        Ok::<_, Error>(Some(entry))
    }
    .instrument(span)
    .await
}
