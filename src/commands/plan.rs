//! `forma plan`

use anyhow::Result;
use declarative::{DriftReport, Provider, StateFile};
use std::process::ExitCode;

use crate::Context;
use crate::cli::PlanArgs;
use crate::config::Settings;
use crate::engine::{Project, display};
use crate::ui;

pub fn run(ctx: &Context, args: PlanArgs) -> Result<ExitCode> {
    let project = Project::open(&args.source.dir, args.source.state_dir.as_deref())?;
    let settings = project
        .settings
        .clone()
        .with_overrides(args.jobs, args.lock_timeout);
    let validated = project.validate(&args.source.vars)?;

    let store = project.store();
    let lock = store.lock("plan", settings.lock_timeout())?;
    let state = lock.load()?;

    let drift = if args.refresh {
        refresh(ctx, &state, &project.provider(), &settings)?
    } else {
        DriftReport::none()
    };

    let plan = declarative::plan(
        &validated.loaded.set,
        &validated.graph,
        &project.registry,
        &state,
        &drift,
    );
    drop(lock);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        display::plan(&plan, ctx.verbose > 0);
        if !plan.unresolved_drift().is_empty() && !ctx.quiet {
            println!();
            ui::warn("Some resources were deleted outside forma.");
            ui::dim(
                "Run `forma apply --refresh` to choose, or pass --recreate-drifted / --forget-drifted.",
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Read every recorded resource and report what the provider no longer has
pub(crate) fn refresh(
    ctx: &Context,
    state: &StateFile,
    provider: &dyn Provider,
    settings: &Settings,
) -> Result<DriftReport> {
    if !ctx.quiet && !state.is_empty() {
        ui::info(&format!(
            "Refreshing {}...",
            ui::plural(state.len(), "resource")
        ));
    }

    let drift = declarative::refresh(state, provider, settings.jobs)?;
    for (name, error) in &drift.errors {
        ui::warn(&format!("Could not refresh {name}: {error}"));
    }
    if !drift.drifted.is_empty() {
        log::info!(
            "Drifted: {}",
            drift.drifted.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(drift)
}
