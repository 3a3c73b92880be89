//! Behavior every `WorkList` backend must share.
//!
//! Each scenario starts its own shift, so scenarios can run concurrently
//! against one database.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Barrier;
use shiftlist::error::Error;
use shiftlist::ledger::WorkList;
use shiftlist::model::*;

pub async fn fresh_shift<L: WorkList>(list: &L) -> ShiftId {
    list.start_new_shift(NewShift::new().role("test"))
        .await
        .unwrap()
}

fn item<'a>(snapshot: &'a [TaskItem], code: &str) -> &'a TaskItem {
    snapshot
        .iter()
        .find(|i| i.article == code)
        .unwrap_or_else(|| panic!("no task item {code}"))
}

pub async fn articles_are_get_or_create<L: WorkList>(list: &L) {
    let code = format!("ART-{}", uuid::Uuid::new_v4());
    let first = list.get_or_create_article(&code).await.unwrap();
    let again = list
        .get_or_create_article(&format!("  {code} "))
        .await
        .unwrap();
    assert_eq!(first, again);

    assert!(matches!(
        list.get_or_create_article("   ").await,
        Err(Error::InvalidInput(_))
    ));
}

pub async fn merge_twice_doubles<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    let rows = [ArticleCopies::new("A", 3)];

    let first = list.merge_articles(shift, &rows).await.unwrap();
    assert_eq!((first.added, first.updated), (1, 0));

    let second = list.merge_articles(shift, &rows).await.unwrap();
    assert_eq!((second.added, second.updated), (0, 1));
    assert_eq!(
        second.snapshot,
        vec![TaskItem {
            article: "A".to_string(),
            total: 6,
            remaining: 6,
        }]
    );
}

pub async fn merge_rejects_bad_rows_atomically<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    let rows = [ArticleCopies::new("A", 2), ArticleCopies::new("  ", 1)];

    assert!(matches!(
        list.merge_articles(shift, &rows).await,
        Err(Error::InvalidInput(_))
    ));
    assert!(list.task_snapshot(shift).await.unwrap().is_empty());
}

pub async fn zero_counts_mean_one_unit<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    list.merge_articles(shift, &[ArticleCopies::new("A", 0)])
        .await
        .unwrap();
    list.import_task(shift, &[TaskRow::new("B", 0)], ImportMode::Merge)
        .await
        .unwrap();
    let recorded = list
        .record(shift, NewHistoryEntry::collection("A", "ivan", 0))
        .await
        .unwrap();
    assert_eq!(recorded.copies, Some(1));

    let snapshot = list.task_snapshot(shift).await.unwrap();
    for code in ["A", "B"] {
        let counted = item(&snapshot, code);
        assert_eq!((counted.total, counted.remaining), (1, 1));
    }
}

pub async fn snapshot_is_ordered_by_code<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    let rows = [
        ArticleCopies::new("C", 1),
        ArticleCopies::new("A", 1),
        ArticleCopies::new("B", 1),
    ];
    let outcome = list.merge_articles(shift, &rows).await.unwrap();
    let codes: Vec<_> = outcome.snapshot.iter().map(|i| i.article.as_str()).collect();
    assert_eq!(codes, ["A", "B", "C"]);
    assert_eq!(list.remaining_total(shift).await.unwrap(), 3);
}

pub async fn dec_clamps_at_zero<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    list.merge_articles(shift, &[ArticleCopies::new("A", 4)])
        .await
        .unwrap();

    assert_eq!(list.dec_remaining(shift, "A", 10).await.unwrap(), 0);
    let snapshot = list.task_snapshot(shift).await.unwrap();
    assert_eq!(item(&snapshot, "A").total, 4);

    assert!(matches!(
        list.dec_remaining(shift, "missing", 1).await,
        Err(Error::NotFound(_))
    ));
}

pub async fn inc_raises_total<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    list.merge_articles(shift, &[ArticleCopies::new("A", 3)])
        .await
        .unwrap();
    list.dec_remaining(shift, "A", 3).await.unwrap();

    assert_eq!(list.inc_remaining(shift, "A", 5).await.unwrap(), 5);
    let snapshot = list.task_snapshot(shift).await.unwrap();
    let a = item(&snapshot, "A");
    assert_eq!((a.total, a.remaining), (5, 5));
}

pub async fn inc_creates_missing_item<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    assert_eq!(list.inc_remaining(shift, "NEW", 2).await.unwrap(), 2);

    let snapshot = list.task_snapshot(shift).await.unwrap();
    let new = item(&snapshot, "NEW");
    assert_eq!((new.total, new.remaining), (2, 2));
}

pub async fn claim_takes_one_unit<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    assert!(list.claim_one_available(shift).await.unwrap().is_none());

    list.merge_articles(shift, &[ArticleCopies::new("A", 2)])
        .await
        .unwrap();
    let claim = list.claim_one_available(shift).await.unwrap().unwrap();
    assert_eq!(claim.article, "A");
    assert_eq!(claim.remaining, 1);
    assert_eq!(list.remaining_total(shift).await.unwrap(), 1);
}

pub async fn record_then_cancel_restores_stream<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    list.record(shift, NewHistoryEntry::collection("A", "ivan", 1))
        .await
        .unwrap();
    let before = list
        .history(shift, HistoryKind::Collection, HistoryRange::all())
        .await
        .unwrap();

    let recorded = list
        .record(shift, NewHistoryEntry::collection("B", "ivan", 2))
        .await
        .unwrap();
    assert_eq!(recorded.copies, Some(2));

    let cancelled = list
        .cancel_last(shift, HistoryKind::Collection)
        .await
        .unwrap();
    assert_eq!(cancelled, Some(recorded));

    let after = list
        .history(shift, HistoryKind::Collection, HistoryRange::all())
        .await
        .unwrap();
    assert_eq!(after, before);

    // The inspection stream is untouched and empty.
    assert_eq!(
        list.cancel_last(shift, HistoryKind::Inspection)
            .await
            .unwrap(),
        None
    );
}

pub async fn history_range_filters_by_time<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    let base = Utc::now() - Duration::hours(3);
    for (code, hours) in [("EARLY", 0), ("MIDDLE", 1), ("LATE", 2)] {
        list.record(
            shift,
            NewHistoryEntry::inspection(code, "olga").at(base + Duration::hours(hours)),
        )
        .await
        .unwrap();
    }

    let range = HistoryRange {
        from: Some(base + Duration::minutes(30)),
        to: Some(base + Duration::hours(2)),
    };
    let entries = list
        .history(shift, HistoryKind::Inspection, range)
        .await
        .unwrap();
    let codes: Vec<_> = entries.iter().filter_map(|e| e.article.as_deref()).collect();
    assert_eq!(codes, ["MIDDLE"]);
    assert!(entries.iter().all(|e| e.copies.is_none()));
}

pub async fn replace_import_removes_absent_items<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    list.merge_articles(shift, &[ArticleCopies::new("X", 2), ArticleCopies::new("Y", 3)])
        .await
        .unwrap();

    let summary = list
        .import_task(shift, &[TaskRow::new("X", 5)], ImportMode::Replace)
        .await
        .unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.removed, 2);

    assert_eq!(
        list.task_snapshot(shift).await.unwrap(),
        vec![TaskItem {
            article: "X".to_string(),
            total: 5,
            remaining: 5,
        }]
    );
}

pub async fn merge_import_adds_and_skips_blank_codes<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    list.merge_articles(shift, &[ArticleCopies::new("X", 2)])
        .await
        .unwrap();

    let rows = [
        TaskRow::new("X", 4).remaining(1),
        TaskRow::new("  ", 9),
        TaskRow::new("Z", 3),
    ];
    let summary = list
        .import_task(shift, &rows, ImportMode::Merge)
        .await
        .unwrap();
    assert_eq!((summary.applied, summary.skipped, summary.removed), (2, 1, 0));
    assert!(summary.attempts >= 1);

    let snapshot = list.task_snapshot(shift).await.unwrap();
    let x = item(&snapshot, "X");
    assert_eq!((x.total, x.remaining), (6, 3));
    let z = item(&snapshot, "Z");
    assert_eq!((z.total, z.remaining), (3, 3));
}

pub async fn collector_import_clamps_remaining<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    list.merge_articles(shift, &[ArticleCopies::new("A", 2)])
        .await
        .unwrap();

    let rows = [
        CollectorRow::new("A", "ivan", 3),
        CollectorRow::new("UNLISTED", "ivan", 0),
    ];
    let summary = list
        .import_collector_rows(shift, &rows, true)
        .await
        .unwrap();
    assert_eq!((summary.applied, summary.adjusted), (2, 1));

    let snapshot = list.task_snapshot(shift).await.unwrap();
    assert_eq!(item(&snapshot, "A").remaining, 0);
    assert_eq!(snapshot.len(), 1);

    let entries = list
        .history(shift, HistoryKind::Collection, HistoryRange::all())
        .await
        .unwrap();
    let copies: Vec<_> = entries.iter().map(|e| e.copies).collect();
    assert_eq!(copies, [Some(3), Some(1)]);
}

pub async fn collector_import_without_apply_keeps_counts<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    list.merge_articles(shift, &[ArticleCopies::new("A", 2)])
        .await
        .unwrap();

    let summary = list
        .import_collector_rows(shift, &[CollectorRow::new("A", "ivan", 1)], false)
        .await
        .unwrap();
    assert_eq!(summary.adjusted, 0);
    assert_eq!(list.remaining_total(shift).await.unwrap(), 2);
}

pub async fn check_import_appends_inspections<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    let rows = [CheckRow::new("A", "olga"), CheckRow::new("", "olga")];
    let summary = list.import_check_rows(shift, &rows).await.unwrap();
    assert_eq!((summary.applied, summary.skipped), (1, 1));

    let entries = list
        .history(shift, HistoryKind::Inspection, HistoryRange::all())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].actor, "olga");
}

pub async fn closed_shift_rejects_mutations<L: WorkList>(list: &L) {
    let shift = fresh_shift(list).await;
    list.merge_articles(shift, &[ArticleCopies::new("A", 1)])
        .await
        .unwrap();

    let closed = list.close_shift(shift).await.unwrap();
    assert_eq!(closed.status, ShiftStatus::Closed);
    assert!(closed.ended_at.is_some());

    // Closing again is a no-op.
    let again = list.close_shift(shift).await.unwrap();
    assert_eq!(again.ended_at, closed.ended_at);

    assert!(matches!(
        list.claim_one_available(shift).await,
        Err(Error::ShiftClosed(_))
    ));
    assert!(matches!(
        list.inc_remaining(shift, "A", 1).await,
        Err(Error::ShiftClosed(_))
    ));
    assert!(matches!(
        list.record(shift, NewHistoryEntry::inspection("A", "olga")).await,
        Err(Error::ShiftClosed(_))
    ));
    assert!(matches!(
        list.import_task(shift, &[TaskRow::new("A", 1)], ImportMode::Merge)
            .await,
        Err(Error::ShiftClosed(_))
    ));

    // Reads still work.
    assert_eq!(list.remaining_total(shift).await.unwrap(), 1);
}

pub async fn unknown_shift_is_not_found<L: WorkList>(list: &L) {
    let missing = ShiftId(i64::MAX);
    assert!(matches!(
        list.get_shift(missing).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        list.merge_articles(missing, &[ArticleCopies::new("A", 1)])
            .await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(list.remaining_total(missing).await.unwrap(), 0);
    assert!(list.task_snapshot(missing).await.unwrap().is_empty());
}

pub async fn concurrent_claims_take_each_last_unit_once<L: WorkList + 'static>(list: Arc<L>) {
    for _ in 0..20 {
        let shift = fresh_shift(list.as_ref()).await;
        list.merge_articles(shift, &[ArticleCopies::new("P", 1), ArticleCopies::new("Q", 1)])
            .await
            .unwrap();

        let start = Arc::new(Barrier::new(2));
        let claimants: Vec<_> = (0..2)
            .map(|_| {
                let list = list.clone();
                let start = start.clone();
                tokio::spawn(async move {
                    start.wait().await;
                    list.claim_one_available(shift).await
                })
            })
            .collect();

        let mut codes = Vec::new();
        for claimant in claimants {
            let claim = claimant
                .await
                .unwrap()
                .unwrap()
                .expect("both claimants get a unit");
            assert_eq!(claim.remaining, 0);
            codes.push(claim.article);
        }
        codes.sort();
        assert_eq!(codes, ["P", "Q"]);
        assert_eq!(list.remaining_total(shift).await.unwrap(), 0);
    }
}

/// Two merges over the same articles, one listing them in reverse, must both
/// commit; a lock-order inversion between them would abort one.
pub async fn opposed_merges_both_commit<L: WorkList + 'static>(list: Arc<L>) {
    const ROUNDS: u32 = 30;
    let shift = fresh_shift(list.as_ref()).await;
    let tag = uuid::Uuid::new_v4().simple().to_string();
    let forward: Vec<_> = (0..20)
        .map(|i| ArticleCopies::new(format!("{tag}-M{i:02}"), 1))
        .collect();
    let reversed: Vec<_> = forward.iter().rev().cloned().collect();

    for _ in 0..ROUNDS {
        let start = Arc::new(Barrier::new(2));
        let merges: Vec<_> = [forward.clone(), reversed.clone()]
            .into_iter()
            .map(|rows| {
                let list = list.clone();
                let start = start.clone();
                tokio::spawn(async move {
                    start.wait().await;
                    list.merge_articles(shift, &rows).await
                })
            })
            .collect();
        for merge in merges {
            let outcome = merge.await.unwrap().unwrap();
            assert_eq!(outcome.added + outcome.updated, 20);
        }
    }

    let snapshot = list.task_snapshot(shift).await.unwrap();
    assert_eq!(snapshot.len(), 20);
    for counted in &snapshot {
        assert_eq!((counted.total, counted.remaining), (2 * ROUNDS, 2 * ROUNDS));
    }
}

pub async fn concurrent_claims_conserve_units<L: WorkList + 'static>(list: Arc<L>) {
    let shift = fresh_shift(list.as_ref()).await;
    let initial = [
        ArticleCopies::new("A", 20),
        ArticleCopies::new("B", 15),
        ArticleCopies::new("C", 5),
    ];
    list.merge_articles(shift, &initial).await.unwrap();

    let claimants: Vec<_> = (0..8)
        .map(|_| {
            let list = list.clone();
            tokio::spawn(async move {
                let mut taken = Vec::new();
                let mut idle = 0;
                // An empty result can mean every stocked row was leased at
                // that instant, so stop only after repeated empties.
                while idle < 3 {
                    match list.claim_one_available(shift).await.unwrap() {
                        Some(claim) => {
                            idle = 0;
                            taken.push(claim.article);
                        }
                        None => {
                            idle += 1;
                            tokio::task::yield_now().await;
                        }
                    }
                }
                taken
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for claimant in claimants {
        claimed.extend(claimant.await.unwrap());
    }

    let remaining = list.remaining_total(shift).await.unwrap();
    assert_eq!(claimed.len() as u64 + remaining, 40);

    let snapshot = list.task_snapshot(shift).await.unwrap();
    for counted in &snapshot {
        let taken = claimed.iter().filter(|c| **c == counted.article).count() as u32;
        assert!(taken <= counted.total);
        assert_eq!(taken + counted.remaining, counted.total);
    }
    let seen: HashSet<_> = claimed.iter().collect();
    assert!(seen.len() <= 3);
}
