//! `forma apply`

use anyhow::Result;
use declarative::{
    ApplyStatus, CancelToken, ChangePlanEntry, DriftReport, DriftResolution, DriftResolver,
    FixedResolution,
};
use std::io;
use std::process::ExitCode;

use super::confirm;
use crate::Context;
use crate::cli::ApplyArgs;
use crate::engine::{Project, display};
use crate::progress::ApplyProgress;
use crate::ui;

/// Asks on the terminal what to do with each drifted resource
struct PromptResolver;

impl DriftResolver for PromptResolver {
    fn resolve(&mut self, entry: &ChangePlanEntry) -> io::Result<Option<DriftResolution>> {
        use dialoguer::Select;

        let choice = Select::new()
            .with_prompt(format!("{} was deleted outside forma", entry.address))
            .items(&[
                "Recreate it",
                "Forget it (remove from state only)",
                "Leave it unresolved",
            ])
            .default(0)
            .interact()
            .map_err(io::Error::other)?;

        Ok(match choice {
            0 => Some(DriftResolution::Recreate),
            1 => Some(DriftResolution::Forget),
            _ => None,
        })
    }
}

pub fn run(ctx: &Context, args: ApplyArgs, cancel: &CancelToken) -> Result<ExitCode> {
    let project = Project::open(&args.source.dir, args.source.state_dir.as_deref())?;
    let settings = project
        .settings
        .clone()
        .with_overrides(args.jobs, args.lock_timeout);
    let validated = project.validate(&args.source.vars)?;

    let store = project.store();
    let provider = project.provider();
    let lock = store.lock("apply", settings.lock_timeout())?;
    let mut state = lock.load()?;

    let drift = if args.refresh {
        super::plan::refresh(ctx, &state, &provider, &settings)?
    } else {
        DriftReport::none()
    };

    let mut plan = declarative::plan(
        &validated.loaded.set,
        &validated.graph,
        &project.registry,
        &state,
        &drift,
    );

    if !plan.unresolved_drift().is_empty() {
        // With --yes and no resolution flag nobody can be asked; apply refuses
        let resolved = if args.recreate_drifted {
            declarative::resolve_drift(&mut plan, &mut FixedResolution(DriftResolution::Recreate))?
        } else if args.forget_drifted {
            declarative::resolve_drift(&mut plan, &mut FixedResolution(DriftResolution::Forget))?
        } else if !args.yes {
            declarative::resolve_drift(&mut plan, &mut PromptResolver)?
        } else {
            0
        };
        log::info!("Resolved drift for {}", ui::plural(resolved, "resource"));
    }

    if !ctx.quiet {
        display::plan(&plan, ctx.verbose > 0);
    }
    if !plan.has_changes() {
        return Ok(ExitCode::SUCCESS);
    }

    if !args.yes {
        println!();
        if !confirm("Apply these changes?", true)? {
            ui::info("Apply cancelled");
            return Ok(ExitCode::SUCCESS);
        }
    }
    println!();

    let mut progress = ApplyProgress::new(ctx.quiet);
    let report = declarative::apply(
        &plan,
        &provider,
        &lock,
        &mut state,
        &settings.apply_options(),
        cancel,
        &mut progress,
    )?;
    drop(lock);

    display::report(&report, !progress.showed_outcomes());

    Ok(match report.status() {
        ApplyStatus::Success => ExitCode::SUCCESS,
        ApplyStatus::Failed => ExitCode::FAILURE,
        ApplyStatus::Cancelled => {
            ui::warn("Apply was interrupted; finished operations are saved in state");
            ExitCode::FAILURE
        }
    })
}
