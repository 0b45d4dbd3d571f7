//! Markdown run report.
//!
//! Rendered from a [`RunSummary`]; the report is a view over the summary and
//! the recorded outcomes and can be regenerated at any time.

use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::path::Path;

use crate::outcome::{Outcome, OutcomeStatus};
use crate::scheduler::{RunSummary, WorkerReport};

/// Offending outcomes listed per violation before the list is truncated
const MAX_REFS_SHOWN: usize = 10;

/// Counts of outcomes by status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeStats {
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub timeout: usize,
    pub abandoned: usize,
}

impl OutcomeStats {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a Outcome>) -> Self {
        let mut stats = Self::default();
        for outcome in outcomes {
            stats.total += 1;
            match outcome.status {
                OutcomeStatus::Success => stats.success += 1,
                OutcomeStatus::Error => stats.error += 1,
                OutcomeStatus::Timeout => stats.timeout += 1,
                OutcomeStatus::Abandoned => stats.abandoned += 1,
            }
        }
        stats
    }
}

/// Render the report as markdown.
pub fn generate_report(summary: &RunSummary) -> String {
    let mut report = String::new();
    // Writing into a String cannot fail.
    let _ = render(&mut report, summary);
    report
}

/// Render the report and write it to `path`.
pub fn write_report(path: impl AsRef<Path>, summary: &RunSummary) -> std::io::Result<()> {
    std::fs::write(path, generate_report(summary))
}

fn render(report: &mut String, summary: &RunSummary) -> fmt::Result {
    writeln!(report, "# Stormweaver run report: {}", summary.name)?;
    writeln!(report)?;
    writeln!(report, "**Run:** `{}`  ", summary.run_id)?;
    writeln!(report, "**Seed:** `{}`  ", summary.seed)?;
    writeln!(report, "**Started:** {}  ", summary.started_at)?;
    writeln!(report, "**Elapsed:** {} ms  ", summary.elapsed_ms)?;
    writeln!(
        report,
        "**Result:** {}",
        if summary.is_success() { "PASSED" } else { "FAILED" }
    )?;
    if summary.cancelled {
        writeln!(report)?;
        writeln!(report, "> The run was cancelled before it completed.")?;
    }
    if let Some(e) = &summary.recorder_error {
        writeln!(report)?;
        writeln!(report, "> Outcomes could not be persisted: {}", e)?;
    }
    writeln!(report)?;

    writeln!(report, "## Workers")?;
    writeln!(report)?;
    writeln!(report, "| Worker | Script | State | Cause | Actions | Errors | Elapsed (ms) |")?;
    writeln!(report, "|--------|--------|-------|-------|---------|--------|--------------|")?;
    if let Some(setup) = &summary.setup {
        worker_row(report, "setup", setup)?;
    }
    for worker in &summary.workers {
        worker_row(report, &worker.worker.to_string(), worker)?;
    }
    writeln!(report)?;

    let stats = OutcomeStats::from_outcomes(&summary.outcomes);
    writeln!(report, "## Outcomes")?;
    writeln!(report)?;
    writeln!(report, "| Status | Count |")?;
    writeln!(report, "|--------|-------|")?;
    writeln!(report, "| Total | {} |", stats.total)?;
    writeln!(report, "| success | {} |", stats.success)?;
    writeln!(report, "| error | {} |", stats.error)?;
    writeln!(report, "| timeout | {} |", stats.timeout)?;
    writeln!(report, "| abandoned | {} |", stats.abandoned)?;
    writeln!(report)?;

    let mut by_tag: BTreeMap<&str, Vec<&Outcome>> = BTreeMap::new();
    for outcome in &summary.outcomes {
        by_tag
            .entry(outcome.tag.as_deref().unwrap_or("(untagged)"))
            .or_default()
            .push(outcome);
    }
    if !by_tag.is_empty() {
        writeln!(report, "| Tag | Total | Success | Error | Max duration (us) |")?;
        writeln!(report, "|-----|-------|---------|-------|-------------------|")?;
        for (tag, outcomes) in &by_tag {
            let tag_stats = OutcomeStats::from_outcomes(outcomes.iter().copied());
            let slowest = outcomes.iter().map(|o| o.duration_us).max().unwrap_or(0);
            writeln!(
                report,
                "| {} | {} | {} | {} | {} |",
                tag, tag_stats.total, tag_stats.success, tag_stats.error, slowest
            )?;
        }
        writeln!(report)?;
    }

    writeln!(report, "## Invariants")?;
    writeln!(report)?;
    for name in &summary.invariants {
        let failed = summary.violations.iter().any(|v| &v.invariant == name);
        writeln!(report, "- [{}] `{}`", if failed { " " } else { "x" }, name)?;
    }
    writeln!(report)?;

    if !summary.violations.is_empty() {
        writeln!(report, "## Violations")?;
        writeln!(report)?;
        for violation in &summary.violations {
            writeln!(report, "- **{}**: {}", violation.invariant, violation.explanation)?;
            if !violation.outcomes.is_empty() {
                let shown: Vec<String> = violation
                    .outcomes
                    .iter()
                    .take(MAX_REFS_SHOWN)
                    .map(|r| r.to_string())
                    .collect();
                let more = violation.outcomes.len().saturating_sub(MAX_REFS_SHOWN);
                if more > 0 {
                    writeln!(report, "  - Outcomes: {} (+{} more)", shown.join(", "), more)?;
                } else {
                    writeln!(report, "  - Outcomes: {}", shown.join(", "))?;
                }
            }
        }
        writeln!(report)?;
    }

    let failures: Vec<&WorkerReport> = summary.failed_workers().collect();
    if !failures.is_empty() {
        writeln!(report, "## Failures")?;
        writeln!(report)?;
        for worker in failures {
            if let Some(e) = worker.error() {
                writeln!(report, "- **worker {}** `{}`: {}", worker.worker, e.kind(), e)?;
            }
        }
        writeln!(report)?;
    }

    Ok(())
}

fn worker_row(report: &mut String, label: &str, worker: &WorkerReport) -> fmt::Result {
    writeln!(
        report,
        "| {} | {} | {} | {} | {} | {} | {} |",
        label,
        worker.variant,
        worker.terminal,
        worker.cause.as_deref().unwrap_or("-"),
        worker.actions,
        worker.errors,
        worker.elapsed_ms
    )
}
