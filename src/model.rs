//! Core data model.
//!
//! An article is a uniquely coded item type. A shift is a bounded work period
//! that owns a task list: one counter pair (total, remaining) per article.
//! History streams record who collected or inspected what during the shift.

pub mod history;
pub mod import;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use history::{HistoryEntry, HistoryKind, HistoryRange, NewHistoryEntry};
pub use import::{CheckRow, CollectorRow, ImportMode, ImportSummary, TaskRow};

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Surrogate identity of a registered article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArticleId(pub i64);

/// Surrogate identity of a shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShiftId(pub i64);

/// Per-stream sequence id of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub i64);

impl std::fmt::Display for ArticleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for ShiftId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trim an article code, rejecting codes that are empty after trimming.
pub fn normalize_code(code: &str) -> Result<&str> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        Err(Error::InvalidInput("article code must not be empty".to_string()))
    } else {
        Ok(trimmed)
    }
}

// ---------------------------------------------------------------------------
// Shift
// ---------------------------------------------------------------------------

/// One work period. Task items and history entries belong to exactly one shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: ShiftId,
    pub status: ShiftStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Role of the operator who started the shift, if recorded.
    pub started_by_role: Option<String>,
    /// Workstation the shift was started from, if recorded.
    pub started_by_computer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    Open,
    Closed,
}

impl std::fmt::Display for ShiftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShiftStatus::Open => "open",
            ShiftStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ShiftStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(ShiftStatus::Open),
            "closed" => Ok(ShiftStatus::Closed),
            other => Err(Error::InvalidInput(format!("unknown shift status: {other}"))),
        }
    }
}

/// Parameters for starting a shift explicitly.
#[derive(Debug, Clone, Default)]
pub struct NewShift {
    pub(crate) started_by_role: Option<String>,
    pub(crate) started_by_computer: Option<String>,
    pub(crate) close_previous: bool,
}

impl NewShift {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.started_by_role = Some(role.into());
        self
    }

    pub fn computer(mut self, computer: impl Into<String>) -> Self {
        self.started_by_computer = Some(computer.into());
        self
    }

    /// Close every other open shift in the same transaction.
    pub fn close_previous(mut self, close: bool) -> Self {
        self.close_previous = close;
        self
    }
}

// ---------------------------------------------------------------------------
// Task list
// ---------------------------------------------------------------------------

/// The counter pair of one article within a shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    pub article: String,
    pub total: u32,
    pub remaining: u32,
}

/// One row of an additive task-list load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleCopies {
    pub article: String,
    pub copies: u32,
}

impl ArticleCopies {
    pub fn new(article: impl Into<String>, copies: u32) -> Self {
        Self {
            article: article.into(),
            copies,
        }
    }
}

/// Result of merging articles into a shift's task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Full task list of the shift after the merge, ordered by article code.
    pub snapshot: Vec<TaskItem>,
    /// Rows that created a new task item.
    pub added: usize,
    /// Rows that incremented an existing task item.
    pub updated: usize,
}

/// A single unit taken from the task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub article: String,
    /// Remaining copies of the article after this claim.
    pub remaining: u32,
}

/// Validate merge input up front so a bad row rejects the whole call.
///
/// Rows come back ordered by code (stable for duplicates) so every merge
/// touches task items in the same order. A count of 0 means one unit.
pub(crate) fn prepare_merge(items: &[ArticleCopies]) -> Result<Vec<(String, u32)>> {
    let mut rows = items
        .iter()
        .map(|item| Ok((normalize_code(&item.article)?.to_string(), item.copies.max(1))))
        .collect::<Result<Vec<_>>>()?;
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(rows)
}
