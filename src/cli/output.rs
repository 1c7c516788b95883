//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{StackyardConfig, ValidationResult};
use crate::planner::{ChangeKind, DiffResult, RunOutcome, RunReport, StackStatus};
use crate::state::{DeploymentRecord, LockInfo, RecordStatus};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Diff row for table display.
#[derive(Tabled)]
struct DiffRow {
    #[tabled(rename = "Batch")]
    batch: usize,
    #[tabled(rename = "Stack")]
    stack: String,
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
}

/// Run report row for table display.
#[derive(Tabled)]
struct StackRow {
    #[tabled(rename = "Batch")]
    batch: usize,
    #[tabled(rename = "Stack")]
    stack: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Error")]
    error: String,
}

/// Record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Stack")]
    stack: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Exports")]
    exports: usize,
    #[tabled(rename = "Removal")]
    removal: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Writes formatted output to stdout.
    #[allow(clippy::print_stdout)]
    pub fn print(&self, rendered: &str) {
        println!("{}", rendered.trim_end());
    }

    /// Formats a diff for display.
    #[must_use]
    pub fn format_diff(&self, diff: &DiffResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(diff).unwrap_or_default(),
            OutputFormat::Text => Self::format_diff_text(diff),
        }
    }

    /// Formats a diff as text.
    fn format_diff_text(diff: &DiffResult) -> String {
        if diff.plan.is_empty() {
            return format!("{} No stacks declared.\n", "✓".green());
        }

        let mut output = String::new();
        let _ = write!(
            output,
            "\nDeployment Plan ({} stacks in {} batches)\n\n",
            diff.plan.stack_count(),
            diff.plan.batches.len()
        );

        let rows: Vec<DiffRow> = diff
            .stacks
            .iter()
            .map(|s| DiffRow {
                batch: s.batch + 1,
                stack: s.stack_id.clone(),
                change: s.change.map_or_else(|| "?".dimmed().to_string(), Self::format_change),
                fingerprint: s
                    .new_fingerprint
                    .as_deref()
                    .or(s.old_fingerprint.as_deref())
                    .map(|h| h.chars().take(8).collect())
                    .unwrap_or_default(),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if !diff.annotated {
            let _ = write!(
                output,
                "\n{} State unavailable; changes not computed.\n",
                "⚠".yellow()
            );
            return output;
        }

        if !diff.orphans.is_empty() {
            let _ = write!(
                output,
                "\n{} Recorded but no longer declared: {}\n",
                "⚠".yellow(),
                diff.orphans.join(", ")
            );
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to recover, {} deferred, {} unchanged\n",
            diff.count(ChangeKind::Create).to_string().green(),
            diff.count(ChangeKind::Update).to_string().yellow(),
            diff.count(ChangeKind::Recover).to_string().yellow(),
            diff.count(ChangeKind::Deferred),
            diff.count(ChangeKind::Unchanged)
        );

        output
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &RunReport) -> String {
        let headline = match &report.outcome {
            RunOutcome::Succeeded => {
                format!("{} {} succeeded", "✓".green(), report.operation)
            }
            RunOutcome::Cancelled { .. } => {
                format!("{} {} {}", "⚠".yellow(), report.operation, report.outcome)
            }
            outcome => format!("{} {} {}", "✗".red(), report.operation, outcome),
        };

        let mut output = format!("{headline}\n");
        let _ = writeln!(output, "   Run: {}", report.run_id);
        let elapsed = report.finished_at - report.started_at;
        let _ = writeln!(output, "   Duration: {}ms\n", elapsed.num_milliseconds());

        if report.stacks.is_empty() {
            output.push_str("   No stacks in plan.\n");
            return output;
        }

        let rows: Vec<StackRow> = report
            .stacks
            .iter()
            .map(|s| StackRow {
                batch: s.batch + 1,
                stack: s.stack_id.clone(),
                status: Self::format_status(s.status),
                attempts: s.attempts,
                error: s.error.as_deref().map(|e| Self::truncate(e, 60)).unwrap_or_default(),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if let RunOutcome::PartialRollbackFailure { stacks } = &report.outcome {
            let _ = write!(
                output,
                "\n{} Operator intervention required for: {}\n",
                "⚠".yellow(),
                stacks.join(", ")
            );
        }

        output
    }

    /// Formats deployment records and the current lock.
    #[must_use]
    pub fn format_records(&self, records: &[DeploymentRecord], lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "records": records,
                "lock": lock,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                match lock {
                    Some(lock) if !lock.is_expired() => {
                        let _ = write!(
                            output,
                            "\n{} Locked by {} since {} (lock id {})\n",
                            "⚠".yellow(),
                            lock.holder,
                            lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                            lock.lock_id
                        );
                    }
                    _ => output.push_str("\nState is unlocked.\n"),
                }

                if records.is_empty() {
                    output.push_str("\nNo records found.\n");
                    return output;
                }

                let rows: Vec<RecordRow> = records
                    .iter()
                    .map(|r| RecordRow {
                        stack: r.stack_id.clone(),
                        status: Self::format_record_status(r.status),
                        fingerprint: r.fingerprint.chars().take(8).collect(),
                        exports: r.exports.len(),
                        removal: r.removal.to_string(),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                output.push('\n');
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                for record in records.iter().filter(|r| r.last_error.is_some()) {
                    let _ = writeln!(
                        output,
                        "   {}: {}",
                        record.stack_id,
                        record.last_error.as_deref().unwrap_or_default()
                    );
                }

                output
            }
        }
    }

    /// Formats a validation result and configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &StackyardConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
                "project": config.project.name,
                "environment": config.project.environment,
                "stacks": config.stacks.len(),
                "resources": config.total_resources(),
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid.\n", "✓".green())
                } else {
                    let mut out = format!("{} Configuration is invalid:\n", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(out, "   - {error}");
                    }
                    out
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = write!(
                    output,
                    "\n   Project: {}\n   Environment: {}\n   Stacks: {}\n   Resources: {}\n",
                    config.project.name,
                    config.project.environment,
                    config.stacks.len(),
                    config.total_resources()
                );
                output
            }
        }
    }

    fn format_change(change: ChangeKind) -> String {
        match change {
            ChangeKind::Create => "+create".green().to_string(),
            ChangeKind::Update => "~update".yellow().to_string(),
            ChangeKind::Recover => "!recover".yellow().to_string(),
            ChangeKind::Deferred => "?deferred".cyan().to_string(),
            ChangeKind::Unchanged => "unchanged".dimmed().to_string(),
        }
    }

    fn format_status(status: StackStatus) -> String {
        let text = status.to_string();
        match status {
            StackStatus::Deployed | StackStatus::Destroyed => text.green().to_string(),
            StackStatus::Failed | StackStatus::RollbackFailed => text.red().to_string(),
            StackStatus::RolledBack | StackStatus::Cancelled => text.yellow().to_string(),
            StackStatus::Unchanged | StackStatus::NotStarted | StackStatus::AlreadyAbsent => {
                text.dimmed().to_string()
            }
        }
    }

    fn format_record_status(status: RecordStatus) -> String {
        let text = status.to_string();
        match status {
            RecordStatus::Deployed => text.green().to_string(),
            RecordStatus::Failed => text.red().to_string(),
            RecordStatus::Pending | RecordStatus::RolledBack => text.yellow().to_string(),
            RecordStatus::Destroyed => text.dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}
