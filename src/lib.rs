//! # shiftlist
//!
//! Shift-scoped work list: concurrent allocation and reconciliation of
//! article units.
//!
//! Provides an article registry, shift lifecycle, a per-shift task ledger with
//! random single-unit claims, collection/inspection history, and serializable
//! bulk imports. [`db::Db`] stores everything in Postgres; [`local::LocalStore`]
//! keeps it in process. Both implement [`ledger::WorkList`].

pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod local;
pub mod model;
pub mod retry;
pub mod telemetry;
pub mod workflow;
