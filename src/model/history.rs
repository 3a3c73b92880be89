//! History stream types: collection and inspection events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntryId, ShiftId, normalize_code};
use crate::error::{Error, Result};

/// Which append-only stream an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// Units collected by a collector. Entries carry a copies count.
    Collection,
    /// Units checked by an inspector.
    Inspection,
}

impl std::fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HistoryKind::Collection => "collection",
            HistoryKind::Inspection => "inspection",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for HistoryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collection" | "collector" | "collect" => Ok(HistoryKind::Collection),
            "inspection" | "inspector" | "check" => Ok(HistoryKind::Inspection),
            other => Err(Error::InvalidInput(format!("unknown history kind: {other}"))),
        }
    }
}

/// A stored history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: EntryId,
    pub kind: HistoryKind,
    pub shift: ShiftId,
    /// Article code. `None` once the referenced article no longer exists.
    pub article: Option<String>,
    /// Collector or inspector name.
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    /// Copies collected. Always `None` for inspections.
    pub copies: Option<u32>,
}

/// Builder for appending to a history stream.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub(crate) kind: HistoryKind,
    pub(crate) article: String,
    pub(crate) actor: String,
    pub(crate) copies: Option<u32>,
    pub(crate) occurred_at: Option<DateTime<Utc>>,
}

impl NewHistoryEntry {
    /// A collection event of `copies` units.
    pub fn collection(article: impl Into<String>, actor: impl Into<String>, copies: u32) -> Self {
        Self {
            kind: HistoryKind::Collection,
            article: article.into(),
            actor: actor.into(),
            copies: Some(copies),
            occurred_at: None,
        }
    }

    /// An inspection event.
    pub fn inspection(article: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            kind: HistoryKind::Inspection,
            article: article.into(),
            actor: actor.into(),
            copies: None,
            occurred_at: None,
        }
    }

    /// Override the occurrence time (defaults to now).
    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Normalized code plus the copies count to store for this stream.
    pub(crate) fn validate(&self) -> Result<(&str, Option<u32>)> {
        let code = normalize_code(&self.article)?;
        match self.kind {
            HistoryKind::Collection => Ok((code, Some(self.copies.unwrap_or(1).max(1)))),
            HistoryKind::Inspection => Ok((code, None)),
        }
    }
}

/// Half-open occurrence window `[from, to)`; unset bounds are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl HistoryRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at < to)
    }
}
