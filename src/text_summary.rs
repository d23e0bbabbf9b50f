//! Text summary builder for CLI output.
//!
//! Formats a finished run's report into human-readable lines for text mode.

use crate::model::{RunReport, RunStatus, ERROR_STAGE};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a final run report.
pub(crate) fn build_text_summary(report: &RunReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!(
        "Run {} finished: {}",
        report.run_id,
        report.status.label()
    ));
    if !report.timestamp_utc.is_empty() {
        lines.push(format!("Completed at: {}", report.timestamp_utc));
    }
    lines.push(format!("Log entries: {}", report.logs.len()));

    if let Some(result) = report.result.as_ref() {
        lines.push(format!("Result: {}", result.final_message));
        for (i, action) in result.actions.iter().enumerate() {
            lines.push(format!("  {}. {}: {}", i + 1, action.action, action.message));
        }
    } else if report.status == RunStatus::Error {
        if let Some(entry) = report.logs.iter().rev().find(|e| e.stage == ERROR_STAGE) {
            lines.push(format!("Error: {}", entry.message));
        }
    }

    TextSummary { lines }
}
