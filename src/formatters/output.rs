use crate::engine::apply::{ApplyReport, PartialApplyError};
use crate::engine::plan::{Action, Plan, PlannedChange};
use crate::stack::value::Value;
use crate::state::model::ResourceRecord;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Renders plans, apply results and state for the terminal or as JSON
pub struct OutputFormatter;

impl OutputFormatter {
    fn symbol(action: Action) -> &'static str {
        match action {
            Action::NoOp => " ",
            Action::Create => "+",
            Action::Update => "~",
            Action::Replace => "-/+",
            Action::Delete => "-",
        }
    }

    /// Human-readable plan, Terraform style
    pub fn format_plan(plan: &Plan) -> String {
        let mut out = String::new();
        if !plan.has_changes() {
            let _ = writeln!(
                out,
                "No changes. Workspace '{}' matches the configuration.",
                plan.workspace
            );
            return out;
        }

        let _ = writeln!(out, "Workspace: {}\n", plan.workspace);
        for change in plan.changes.iter().filter(|c| c.action != Action::NoOp) {
            Self::write_change(&mut out, change);
        }

        let summary = plan.summary();
        let _ = writeln!(
            out,
            "Plan: {} to add, {} to change, {} to destroy.",
            summary.add, summary.change, summary.destroy
        );
        out
    }

    fn write_change(out: &mut String, change: &PlannedChange) {
        let _ = writeln!(
            out,
            "  {} {} ({}, kind {}) will be {}",
            Self::symbol(change.action),
            change.address,
            change.module,
            change.kind,
            match change.action {
                Action::Create => "created",
                Action::Update => "updated in-place",
                Action::Replace => "replaced",
                Action::Delete => "destroyed",
                Action::NoOp => "left unchanged",
            }
        );

        if !change.pending_upstream.is_empty() {
            let pending: Vec<&str> = change.pending_upstream.iter().map(String::as_str).collect();
            let _ = writeln!(
                out,
                "      (inputs known after apply of: {})",
                pending.join(", ")
            );
        }

        for attr in &change.changes {
            let line = match (&attr.before, &attr.after) {
                (None, Some(after)) => format!("+ {} = {}", attr.name, after),
                (Some(before), Some(after)) => format!("~ {} = {} -> {}", attr.name, before, after),
                (Some(before), None) => format!("- {} = {}", attr.name, before),
                (None, None) => continue,
            };
            let _ = writeln!(out, "      {}", line);
        }
        out.push('\n');
    }

    /// Machine-readable plan
    pub fn format_plan_json(plan: &Plan) -> serde_json::Value {
        let summary = plan.summary();
        json!({
            "workspace": plan.workspace,
            "state_serial": plan.state_serial,
            "destroy": plan.destroy,
            "summary": {
                "add": summary.add,
                "change": summary.change,
                "destroy": summary.destroy,
            },
            "changes": plan.changes.iter().map(|change| {
                json!({
                    "address": change.address,
                    "module": change.module,
                    "kind": change.kind,
                    "action": change.action,
                    "desired": change.desired,
                    "pending_upstream": change.pending_upstream,
                    "attributes": change.changes,
                })
            }).collect::<Vec<_>>(),
        })
    }

    pub fn format_apply_report(report: &ApplyReport) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Apply complete! Resources: {} applied, {} destroyed, {} unchanged.",
            report.applied.len(),
            report.deleted.len(),
            report.unchanged.len()
        );
        if !report.outputs.is_empty() {
            out.push_str("\nOutputs:\n\n");
            out.push_str(&Self::format_outputs(&report.outputs));
        }
        out
    }

    pub fn format_partial_failure(err: &PartialApplyError) -> String {
        let mut out = String::from("Apply stopped after a failure.\n");
        if !err.completed.is_empty() {
            let _ = writeln!(out, "  committed to state: {}", err.completed.join(", "));
        }
        for failure in &err.failed {
            let _ = writeln!(out, "  failed: module.{}: {:#}", failure.instance, failure.error);
        }
        if !err.not_attempted.is_empty() {
            let _ = writeln!(out, "  not attempted: {}", err.not_attempted.join(", "));
        }
        out.push_str("Run apply again to converge the remaining instances.\n");
        out
    }

    pub fn format_outputs(outputs: &BTreeMap<String, Value>) -> String {
        let width = outputs.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::new();
        for (name, value) in outputs {
            let _ = writeln!(out, "{:width$} = {}", name, value, width = width);
        }
        out
    }

    pub fn format_workspaces(workspaces: &[String], current: &str) -> String {
        let mut out = String::new();
        for name in workspaces {
            let marker = if name == current { "*" } else { " " };
            let _ = writeln!(out, "{} {}", marker, name);
        }
        out
    }

    pub fn format_record(address: &str, record: &ResourceRecord) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {} ({}, kind {}):", address, record.module, record.kind);
        for (name, value) in &record.attributes {
            let _ = writeln!(out, "    {} = {}", name, value);
        }
        if !record.dependencies.is_empty() {
            let _ = writeln!(out, "    # depends on: {}", record.dependencies.join(", "));
        }
        let _ = writeln!(
            out,
            "    # updated: {}",
            record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::plan::AttributeChange;
    use std::collections::BTreeSet;

    fn plan() -> Plan {
        Plan {
            workspace: "dev".to_string(),
            state_serial: 3,
            destroy: false,
            changes: vec![
                PlannedChange {
                    instance: "vpc".to_string(),
                    address: "module.vpc".to_string(),
                    module: "network".to_string(),
                    kind: "null".to_string(),
                    action: Action::Update,
                    desired: None,
                    pending_upstream: BTreeSet::new(),
                    changes: vec![AttributeChange {
                        name: "cidr".to_string(),
                        before: Some(Value::from("10.0.0.0/16")),
                        after: Some(Value::from("10.1.0.0/16")),
                    }],
                },
                PlannedChange {
                    instance: "eks".to_string(),
                    address: "module.eks".to_string(),
                    module: "cluster".to_string(),
                    kind: "null".to_string(),
                    action: Action::Update,
                    desired: None,
                    pending_upstream: BTreeSet::from(["vpc".to_string()]),
                    changes: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_format_plan() {
        let text = OutputFormatter::format_plan(&plan());
        assert!(text.contains("~ module.vpc"));
        assert!(text.contains(r#"~ cidr = "10.0.0.0/16" -> "10.1.0.0/16""#));
        assert!(text.contains("known after apply of: vpc"));
        assert!(text.contains("Plan: 0 to add, 2 to change, 0 to destroy."));
    }

    #[test]
    fn test_format_plan_json() {
        let value = OutputFormatter::format_plan_json(&plan());
        assert_eq!(value["summary"]["change"], 2);
        assert_eq!(value["changes"][0]["action"], "update");
        assert_eq!(value["changes"][1]["pending_upstream"][0], "vpc");
    }

    #[test]
    fn test_format_workspaces() {
        let text = OutputFormatter::format_workspaces(
            &["default".to_string(), "dev".to_string()],
            "dev",
        );
        assert_eq!(text, "  default\n* dev\n");
    }
}
