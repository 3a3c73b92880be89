//! Span helpers for bulk imports and compensating workflows.

use tracing::Span;
use uuid::Uuid;

use crate::model::ShiftId;

/// Start a span covering one bulk import, across all of its attempts.
///
/// `import.attempts` is declared empty and filled in by
/// [`record_import_attempts`] once the import settles.
pub fn start_import_span(stream: &str, shift: ShiftId, batch_id: &Uuid, rows: usize) -> Span {
    tracing::info_span!(
        "worklist.import",
        "import.stream" = stream,
        "import.shift" = shift.0,
        "import.batch" = %batch_id,
        "import.rows" = rows,
        "import.attempts" = tracing::field::Empty,
    )
}

/// Record how many transaction attempts an import needed.
pub fn record_import_attempts(span: &Span, attempts: u32) {
    span.record("import.attempts", attempts);
}

/// Start a span for a workflow composed of several ledger operations.
pub fn start_workflow_span(workflow: &str, shift: ShiftId) -> Span {
    tracing::info_span!(
        "worklist.workflow",
        "workflow.name" = workflow,
        "workflow.shift" = shift.0,
    )
}

/// Emit a compensation event scoped to the given span.
pub fn record_compensation(span: &Span, article: &str, copies: u32, reason: &str) {
    span.in_scope(|| {
        tracing::warn!(article, copies, reason, "compensation");
    });
}
