//! `forma validate`

use anyhow::Result;
use colored::Colorize;
use std::collections::BTreeMap;
use std::process::ExitCode;

use crate::Context;
use crate::cli::SourceArgs;
use crate::declarations::VariableSource;
use crate::engine::Project;
use crate::ui;

pub fn run(ctx: &Context, args: SourceArgs) -> Result<ExitCode> {
    let project = Project::open(&args.dir, args.state_dir.as_deref())?;
    let validated = project.validate(&args.vars)?;
    let loaded = &validated.loaded;

    if ctx.quiet {
        return Ok(ExitCode::SUCCESS);
    }

    ui::success(&format!(
        "{} in {} are valid",
        ui::plural(loaded.set.len(), "declaration"),
        ui::plural(loaded.files.len(), "file")
    ));

    let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
    for decl in loaded.set.iter() {
        *by_kind.entry(decl.kind()).or_default() += 1;
    }
    ui::section("Kinds");
    for (kind, count) in by_kind {
        ui::kv(kind, &count.to_string());
    }

    if !loaded.variables.is_empty() {
        ui::section("Variables");
        for variable in loaded.variables.values() {
            let value = variable
                .value
                .as_ref()
                .map_or_else(|| "(unset)".to_string(), ToString::to_string);
            let source = match variable.source {
                Some(VariableSource::Override) => "--var",
                Some(VariableSource::Environment) => "environment",
                Some(VariableSource::Default) => "default",
                None => "unset",
            };
            ui::kv(&variable.name, &format!("{value} {}", format!("({source})").dimmed()));
            if ctx.verbose > 0
                && let Some(description) = &variable.description
            {
                ui::dim(&format!("  {description}"));
            }
        }
    }

    if ctx.verbose > 0 {
        ui::section("Apply order");
        for (i, name) in validated.graph.order().iter().enumerate() {
            let deps = validated.graph.dependencies(name);
            if deps.is_empty() {
                println!("  {:>3}. {name}", i + 1);
            } else {
                println!(
                    "  {:>3}. {name} {}",
                    i + 1,
                    format!("← {}", deps.join(", ")).dimmed()
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
