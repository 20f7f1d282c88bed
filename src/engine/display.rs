//! Plan, report and state rendering

use chrono::Utc;
use colored::{ColoredString, Colorize};
use declarative::{
    ApplyReport, Attributes, ChangeAction, ChangePlanEntry, EntryOutcome, EntryReport, Plan,
    ResourceState, StateFile, Value,
};

use crate::ui;

/// Longest identity shown in tables before it is shortened
const IDENTITY_WIDTH: usize = 60;

pub fn action_symbol(action: ChangeAction) -> ColoredString {
    let symbol = action.symbol();
    match action {
        ChangeAction::Create => symbol.green(),
        ChangeAction::Update => symbol.yellow(),
        ChangeAction::Delete => symbol.red(),
        ChangeAction::Drifted => symbol.magenta().bold(),
        ChangeAction::Forget => symbol.dimmed(),
        ChangeAction::NoOp => symbol.normal(),
    }
}

pub fn outcome_symbol(outcome: &EntryOutcome) -> ColoredString {
    match outcome {
        EntryOutcome::Applied(_) => "✓".green(),
        EntryOutcome::NoOp => "·".dimmed(),
        EntryOutcome::Failed { .. } => "✗".red(),
        EntryOutcome::Blocked { .. } => "⊘".yellow(),
        EntryOutcome::Cancelled => "○".dimmed(),
    }
}

/// Past-tense description of what happened to an entry
pub fn outcome_text(action: ChangeAction, outcome: &EntryOutcome) -> String {
    match outcome {
        EntryOutcome::Applied(applied) => match applied {
            ChangeAction::Create => "created".green().to_string(),
            ChangeAction::Update => "updated".yellow().to_string(),
            ChangeAction::Delete => "deleted".red().to_string(),
            ChangeAction::Forget => "forgotten".dimmed().to_string(),
            other => other.label().to_string(),
        },
        EntryOutcome::NoOp => "unchanged".dimmed().to_string(),
        EntryOutcome::Failed { reason } => {
            format!("{} {}", format!("{action} failed:").red(), reason)
        }
        EntryOutcome::Blocked { by } => format!("{} {by}", "blocked by".yellow()),
        EntryOutcome::Cancelled => "cancelled".dimmed().to_string(),
    }
}

/// One-line detail shown after an entry's address
fn entry_detail(entry: &ChangePlanEntry) -> String {
    match entry.action {
        ChangeAction::Create => {
            let pending = entry
                .after
                .as_ref()
                .is_some_and(|after| after.values().any(Value::has_reference));
            if pending {
                "(some values known after apply)".to_string()
            } else {
                String::new()
            }
        }
        ChangeAction::Update => format!("({})", entry.changed.join(", ")),
        ChangeAction::Delete => match &entry.identity {
            Some(identity) => ui::truncate_start(identity, IDENTITY_WIDTH),
            None => String::new(),
        },
        ChangeAction::Drifted => "(deleted outside forma; recreate or forget)".to_string(),
        ChangeAction::Forget => "(remove from state only)".to_string(),
        ChangeAction::NoOp => String::new(),
    }
}

fn value_text(value: Option<&Value>) -> String {
    value.map_or_else(|| "(unset)".to_string(), ToString::to_string)
}

/// Attribute-level lines for an entry, shown with `-v`
fn attribute_lines(entry: &ChangePlanEntry) -> Vec<String> {
    let empty = Attributes::new();
    let before = entry.before.as_ref().unwrap_or(&empty);
    let after = entry.after.as_ref().unwrap_or(&empty);

    match entry.action {
        ChangeAction::Create => after
            .iter()
            .map(|(key, value)| format!("{} {key} = {}", "+".green(), value_text(Some(value))))
            .collect(),
        ChangeAction::Update => entry
            .changed
            .iter()
            .map(|key| {
                format!(
                    "{} {key}: {} → {}",
                    "~".yellow(),
                    value_text(before.get(key)).dimmed(),
                    value_text(after.get(key))
                )
            })
            .collect(),
        ChangeAction::Delete | ChangeAction::Forget => before
            .iter()
            .map(|(key, value)| format!("{} {key} = {}", "-".red(), value_text(Some(value))))
            .collect(),
        _ => Vec::new(),
    }
}

/// Print a plan
pub fn plan(plan: &Plan, verbose: bool) {
    if !plan.has_changes() {
        println!();
        println!(
            "  {} No changes. Infrastructure matches the declarations.",
            "✓".green()
        );
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        "Execution Plan".bold()
    );
    println!("│");

    for entry in plan.entries() {
        if entry.action == ChangeAction::NoOp && !verbose {
            continue;
        }
        println!(
            "│   {} {:<40} {}",
            action_symbol(entry.action),
            entry.address.to_string(),
            entry_detail(entry).dimmed()
        );
        if verbose {
            for line in attribute_lines(entry) {
                println!("│       {line}");
            }
        }
    }
    println!("│");

    let summary = plan.summary();
    println!("├─────────────────────────────────────────────────────┤");
    println!("│ Plan: {summary}");
    if summary.no_op > 0 {
        println!("│ {}", format!("{} unchanged", summary.no_op).dimmed());
    }
    println!("└─────────────────────────────────────────────────────┘");
}

/// Print the per-resource outcome table and summary of an apply run
/// Entries worth a row in the report
///
/// With `full` every entry that did or should have done something is listed;
/// otherwise only problems, since progress already showed the rest.
fn report_rows(report: &ApplyReport, full: bool) -> Vec<&EntryReport> {
    report
        .entries
        .iter()
        .filter(|e| {
            if full {
                e.outcome != EntryOutcome::NoOp
            } else {
                e.outcome.is_problem()
            }
        })
        .collect()
}

/// Print the apply report
///
/// `full` lists every outcome; pass it when nothing was shown during apply.
pub fn report(report: &ApplyReport, full: bool) {
    let rows = report_rows(report, full);
    if !rows.is_empty() {
        ui::section(if full { "Results" } else { "Problems" });
        for entry in rows {
            println!(
                "  {} {:<40} {}",
                outcome_symbol(&entry.outcome),
                entry.address.to_string(),
                outcome_text(entry.action, &entry.outcome)
            );
        }
    }

    let summary = report.summary();
    println!();
    if report.is_success() {
        println!("  {} Apply complete!", "✓".green().bold());
    } else {
        println!("  {} Apply finished with errors", "⚠".yellow().bold());
    }

    if summary.created > 0 {
        println!("    • {} created", ui::plural(summary.created, "resource"));
    }
    if summary.updated > 0 {
        println!("    • {} updated", ui::plural(summary.updated, "resource"));
    }
    if summary.deleted > 0 {
        println!("    • {} deleted", ui::plural(summary.deleted, "resource"));
    }
    if summary.forgotten > 0 {
        println!("    • {} forgotten", ui::plural(summary.forgotten, "resource"));
    }
    if summary.no_op > 0 {
        println!("    • {} unchanged", ui::plural(summary.no_op, "resource"));
    }
    if summary.failed > 0 {
        println!("    • {} {}", summary.failed, "failed".red());
    }
    if summary.blocked > 0 {
        println!("    • {} {}", summary.blocked, "blocked".yellow());
    }
    if summary.cancelled > 0 {
        println!("    • {} {}", summary.cancelled, "cancelled".dimmed());
    }
}

/// Print every resource in state, in creation order
pub fn state_list(state: &StateFile) {
    if state.is_empty() {
        ui::info("State is empty");
        return;
    }

    let now = Utc::now();
    println!();
    for resource in state.by_serial() {
        println!(
            "  {:>3}  {:<40} {}",
            resource.serial.to_string().dimmed(),
            resource.address().to_string().bold(),
            ui::age(&resource.updated_at, &now).dimmed()
        );
    }
    println!();
    ui::dim(&format!(
        "{} · serial {} · lineage {}",
        ui::plural(state.len(), "resource"),
        state.serial,
        state.lineage
    ));
}

/// Print one recorded resource in full
pub fn resource(resource: &ResourceState) {
    ui::header(&resource.address().to_string());
    ui::kv("identity", &resource.identity);
    ui::kv("serial", &resource.serial.to_string());
    ui::kv("created", &ui::timestamp(&resource.created_at));
    ui::kv("updated", &ui::timestamp(&resource.updated_at));
    if !resource.dependencies.is_empty() {
        ui::kv("depends on", &resource.dependencies.join(", "));
    }

    if !resource.attributes.is_empty() {
        ui::section("Attributes");
        for (key, value) in &resource.attributes {
            ui::kv(key, &value.to_string());
        }
    }

    let computed: Vec<_> = resource
        .outputs
        .iter()
        .filter(|(key, value)| resource.attributes.get(*key) != Some(*value))
        .collect();
    if !computed.is_empty() {
        ui::section("Computed");
        for (key, value) in computed {
            ui::kv(key, &value.to_string());
        }
    }
}
