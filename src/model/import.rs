//! Bulk import rows and their validation.
//!
//! Rows arrive from file adapters already parsed. Blank article codes are
//! skipped rather than rejected, so one stray line does not sink a whole file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// How an imported task list combines with the existing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Add totals and remaining counts onto existing task items.
    #[default]
    Merge,
    /// Delete the shift's task items, then load the rows.
    Replace,
}

impl std::fmt::Display for ImportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImportMode::Merge => "merge",
            ImportMode::Replace => "replace",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ImportMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(ImportMode::Merge),
            "replace" => Ok(ImportMode::Replace),
            other => Err(Error::InvalidInput(format!(
                "import mode must be 'merge' or 'replace', got '{other}'"
            ))),
        }
    }
}

/// A task-list row: `remaining` defaults to `total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    #[serde(alias = "code")]
    pub article: String,
    pub total: u32,
    #[serde(default)]
    pub remaining: Option<u32>,
}

impl TaskRow {
    pub fn new(article: impl Into<String>, total: u32) -> Self {
        Self {
            article: article.into(),
            total,
            remaining: None,
        }
    }

    pub fn remaining(mut self, remaining: u32) -> Self {
        self.remaining = Some(remaining);
        self
    }
}

/// A collection history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorRow {
    #[serde(alias = "code")]
    pub article: String,
    #[serde(default)]
    pub collector: String,
    #[serde(default, alias = "datetime")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default = "one")]
    pub copies: u32,
}

impl CollectorRow {
    pub fn new(article: impl Into<String>, collector: impl Into<String>, copies: u32) -> Self {
        Self {
            article: article.into(),
            collector: collector.into(),
            occurred_at: None,
            copies,
        }
    }
}

/// An inspection history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRow {
    #[serde(alias = "code")]
    pub article: String,
    #[serde(default)]
    pub inspector: String,
    #[serde(default, alias = "datetime")]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl CheckRow {
    pub fn new(article: impl Into<String>, inspector: impl Into<String>) -> Self {
        Self {
            article: article.into(),
            inspector: inspector.into(),
            occurred_at: None,
        }
    }
}

fn one() -> u32 {
    1
}

/// What a bulk import did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// Correlates the import with its trace span and log lines.
    pub batch_id: Uuid,
    /// Rows written.
    pub applied: usize,
    /// Rows ignored because their article code was blank.
    pub skipped: usize,
    /// Task items deleted by a replace.
    pub removed: usize,
    /// Task items whose remaining count was drawn down by collection rows.
    pub adjusted: usize,
    /// Transaction attempts, including retries after serialization conflicts.
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Prepared rows
// ---------------------------------------------------------------------------

/// Rows that survived validation plus the number skipped.
#[derive(Debug, Clone)]
pub(crate) struct Prepared<T> {
    pub rows: Vec<T>,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct PreparedTask {
    pub code: String,
    pub total: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct PreparedCollect {
    pub code: String,
    pub actor: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub copies: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct PreparedCheck {
    pub code: String,
    pub actor: String,
    pub occurred_at: Option<DateTime<Utc>>,
}

fn prepare<R, T>(
    rows: &[R],
    code: impl Fn(&R) -> &str,
    build: impl Fn(String, &R) -> T,
) -> Prepared<T> {
    let mut prepared = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        let trimmed = code(row).trim();
        if trimmed.is_empty() {
            skipped += 1;
            continue;
        }
        prepared.push(build(trimmed.to_string(), row));
    }
    Prepared {
        rows: prepared,
        skipped,
    }
}

/// Task rows come back ordered by code (stable for duplicates), the same
/// order merges use.
pub(crate) fn prepare_task_rows(rows: &[TaskRow]) -> Prepared<PreparedTask> {
    let mut prepared = prepare(
        rows,
        |r| &r.article,
        |code, r| {
            // A zero total in an export means "one unit".
            let total = r.total.max(1);
            PreparedTask {
                code,
                total,
                remaining: r.remaining.unwrap_or(total),
            }
        },
    );
    prepared.rows.sort_by(|a, b| a.code.cmp(&b.code));
    prepared
}

pub(crate) fn prepare_collector_rows(rows: &[CollectorRow]) -> Prepared<PreparedCollect> {
    prepare(
        rows,
        |r| &r.article,
        |code, r| PreparedCollect {
            code,
            actor: r.collector.trim().to_string(),
            occurred_at: r.occurred_at,
            // A zero count in an export means "one unit".
            copies: r.copies.max(1),
        },
    )
}

pub(crate) fn prepare_check_rows(rows: &[CheckRow]) -> Prepared<PreparedCheck> {
    prepare(
        rows,
        |r| &r.article,
        |code, r| PreparedCheck {
            code,
            actor: r.inspector.trim().to_string(),
            occurred_at: r.occurred_at,
        },
    )
}
