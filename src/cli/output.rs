//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::planner::{Action, Plan};
use crate::reconciler::{ApplyReport, LiveStatus, StatusReport};
use crate::state::{AppliedStateSet, ApplyOperation, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    rank: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
}

/// Operation result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
}

/// Applied resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Pending")]
    pending: String,
    #[tabled(rename = "Live")]
    live: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan {}\n\n", Self::short(&plan.fingerprint));

        let rows: Vec<PlanRow> = plan
            .operations
            .iter()
            .filter(|op| op.action != Action::NoOp)
            .map(|op| PlanRow {
                rank: op.rank,
                action: Self::format_action(op.action),
                kind: op.kind.to_string(),
                resource: op.name.clone(),
                dependencies: op.dependencies.join(", "),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for op in plan.operations.iter().filter(|op| !op.changes.is_empty()) {
                let _ = writeln!(output, "\n  ~ {}", op.name);
                for change in &op.changes {
                    let _ = writeln!(output, "      {change}");
                }
            }
        }

        let counts = plan.counts();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to destroy, {} unchanged\n",
            counts.create.to_string().green(),
            counts.update.to_string().yellow(),
            counts.delete.to_string().red(),
            counts.noop
        );

        output
    }

    /// Formats the report of an apply or destroy cycle.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ApplyReport) -> String {
        let verb = match report.operation {
            ApplyOperation::Apply => "Apply",
            ApplyOperation::Destroy => "Destroy",
        };
        let mut output = if report.is_success() {
            format!("{} {verb} complete\n\n", "✓".green())
        } else {
            format!("{} {verb} incomplete\n\n", "✗".red())
        };

        let rows: Vec<ResultRow> = report
            .results
            .iter()
            .filter(|r| r.action != Action::NoOp)
            .map(|r| ResultRow {
                resource: r.name.clone(),
                action: Self::format_action(r.action),
                outcome: match r.outcome {
                    crate::planner::Outcome::Success => "success".green().to_string(),
                    crate::planner::Outcome::Failed => "failed".red().to_string(),
                    crate::planner::Outcome::Skipped => "skipped".dimmed().to_string(),
                },
                attempts: r.attempts,
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push_str("\n\n");
        }

        let _ = writeln!(output, "   Created: {}", report.summary.created);
        let _ = writeln!(output, "   Updated: {}", report.summary.updated);
        let _ = writeln!(output, "   Deleted: {}", report.summary.deleted);
        let _ = writeln!(output, "   Unchanged: {}", report.summary.unchanged);

        if !report.summary.failed.is_empty() {
            let _ = write!(output, "\n{} Failed:\n", "⚠".yellow());
            for failed in &report.summary.failed {
                let _ = writeln!(output, "   - {}: {}", failed.name, failed.error);
            }
        }

        if !report.summary.skipped.is_empty() {
            let _ = writeln!(output, "\n   Skipped: {}", report.summary.skipped.join(", "));
        }

        if let Some(reason) = &report.interrupted {
            let _ = writeln!(output, "\n{} Interrupted: {reason}", "⚠".yellow());
        }

        if !report.outputs.public_ips.is_empty() {
            output.push_str("\nOutputs:\n");
            for (name, address) in &report.outputs.public_ips {
                let _ = writeln!(
                    output,
                    "   {name} = {}",
                    address.as_deref().unwrap_or("(not allocated)")
                );
            }
        }

        output
    }

    /// Formats a status report.
    #[must_use]
    pub fn format_status(&self, status: &StatusReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(status).unwrap_or_default(),
            OutputFormat::Text => Self::format_status_text(status),
        }
    }

    fn format_status_text(status: &StatusReport) -> String {
        let mut output = String::new();

        if status.resources.is_empty() {
            output.push_str("   No resources applied.\n");
        } else {
            let rows: Vec<ResourceRow> = status
                .resources
                .iter()
                .map(|r| ResourceRow {
                    name: r.name.clone(),
                    kind: r.kind.to_string(),
                    pending: Self::format_action(r.pending),
                    live: match &r.live {
                        None => "-".dimmed().to_string(),
                        Some(LiveStatus::Present) => "present".green().to_string(),
                        Some(LiveStatus::Missing) => "missing".red().to_string(),
                        Some(LiveStatus::Unknown(reason)) => {
                            format!("unknown ({})", Self::truncate(reason, 30)).yellow().to_string()
                        }
                    },
                    id: Self::truncate(&r.provider_id, 40),
                })
                .collect();

            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if !status.missing.is_empty() {
            let _ = write!(output, "\nNot yet applied: {}\n", status.missing.join(", "));
        }

        let converged = if status.is_converged() {
            "converged".green().to_string()
        } else {
            "pending changes".yellow().to_string()
        };
        let _ = write!(output, "\nStatus: {converged} (serial {})\n", status.serial);

        if let Some(cycle) = &status.last_cycle {
            let _ = writeln!(
                output,
                "Last cycle: {:?} at {} ({} failed, {} skipped)",
                cycle.operation,
                cycle.timestamp.format("%Y-%m-%d %H:%M"),
                cycle.failed,
                cycle.skipped
            );
        }

        if let Some(lock) = &status.lock {
            let _ = writeln!(output, "{}", Self::describe_lock(lock));
        }

        output
    }

    /// Formats the raw state document.
    #[must_use]
    pub fn format_state(&self, state: &AppliedStateSet) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = writeln!(output, "\nState (version {})\n", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.len());

                for resource in state.resources.values() {
                    let _ = writeln!(
                        output,
                        "     {} {} [{}]",
                        resource.kind,
                        resource.name,
                        Self::short(&resource.fingerprint)
                    );
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let mark = if entry.failed == 0 && entry.skipped == 0 { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {mark} {} - {:?} (+{} ~{} -{})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.created,
                            entry.updated,
                            entry.deleted
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a configuration validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, descriptors: usize, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "descriptors": descriptors,
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} Configuration is valid ({descriptors} resources)\n",
                    "✓".green()
                );
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "  - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a one-line message.
    #[must_use]
    pub fn message(&self, level: MessageLevel, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": level.as_str(), "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mark = match level {
                    MessageLevel::Success => "✓".green(),
                    MessageLevel::Warning => "⚠".yellow(),
                    MessageLevel::Error => "✗".red(),
                };
                format!("{mark} {message}")
            }
        }
    }

    /// Describes a lock for humans.
    #[must_use]
    pub fn describe_lock(lock: &LockInfo) -> String {
        let expiry = if lock.is_expired() {
            String::from("expired")
        } else {
            format!("expires in {}s", lock.remaining_secs())
        };
        format!(
            "Locked by {} since {}, {expiry} (id {})",
            lock.holder,
            lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
            lock.lock_id
        )
    }

    fn format_action(action: Action) -> String {
        match action {
            Action::Create => "+create".green().to_string(),
            Action::Update => "~update".yellow().to_string(),
            Action::Delete => "-delete".red().to_string(),
            Action::NoOp => "noop".dimmed().to_string(),
        }
    }

    fn short(hash: &str) -> &str {
        &hash[..8.min(hash.len())]
    }

    /// Truncates a string to at most `max_len` characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

/// Severity of a one-line message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// Something finished.
    Success,
    /// Needs attention.
    Warning,
    /// Failed.
    Error,
}

impl MessageLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlanEngine;
    use crate::resource::{ResourceDescriptor, ResourceKind};

    fn plan() -> Plan {
        let desired = vec![
            ResourceDescriptor::new(ResourceKind::ResourceGroup, "rg1").with_attr("location", "East US"),
            ResourceDescriptor::new(ResourceKind::VNet, "vnet1")
                .with_attr("location", "East US")
                .with_ref(ResourceKind::ResourceGroup, "rg1"),
        ];
        PlanEngine::new().plan(&desired, &AppliedStateSet::new()).unwrap()
    }

    #[test]
    fn test_plan_json_is_parseable() {
        let out = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), false);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["operations"].as_array().unwrap().len(), 2);
        assert_eq!(value["operations"][0]["action"], "create");
    }

    #[test]
    fn test_plan_text_lists_resources() {
        let out = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), false);
        assert!(out.contains("rg1"));
        assert!(out.contains("vnet1"));
        assert!(out.contains("to create"));
    }

    #[test]
    fn test_empty_plan_text() {
        let empty = PlanEngine::new().plan(&[], &AppliedStateSet::new()).unwrap();
        let out = OutputFormatter::new(OutputFormat::Text).format_plan(&empty, false);
        assert!(out.contains("No changes required"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééé", 6), "ééé...");
    }
}
