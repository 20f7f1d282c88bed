//! `forma state` subcommands

use anyhow::{Result, bail};
use std::process::ExitCode;

use super::confirm;
use crate::Context;
use crate::cli::{LocationArgs, StateCommand};
use crate::engine::{Project, display};
use crate::ui;

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<ExitCode> {
    match cmd {
        StateCommand::Show {
            name,
            json,
            location,
        } => show(ctx, &location, name.as_deref(), json),
        StateCommand::List { location } => list(ctx, &location),
        StateCommand::Rm {
            name,
            yes,
            lock_timeout,
            location,
        } => rm(ctx, &location, &name, yes, lock_timeout),
        StateCommand::ForceUnlock { yes, location } => force_unlock(ctx, &location, yes),
    }
}

fn open(location: &LocationArgs) -> Result<Project> {
    Project::open(&location.dir, location.state_dir.as_deref())
}

fn show(
    ctx: &Context,
    location: &LocationArgs,
    name: Option<&str>,
    json: bool,
) -> Result<ExitCode> {
    let project = open(location)?;
    let store = project.store();
    let state = store.load()?;

    match name {
        Some(name) => {
            let Some(resource) = state.get(name) else {
                bail!("No resource named '{name}' in state");
            };
            if json {
                println!("{}", serde_json::to_string_pretty(resource)?);
            } else {
                display::resource(resource);
            }
        }
        None if json => println!("{}", serde_json::to_string_pretty(&state)?),
        None => {
            if !ctx.quiet {
                ui::header("State");
                ui::kv("file", &store.path().display().to_string());
                ui::kv("version", &state.version.to_string());
                if let Some(at) = &state.last_updated {
                    ui::kv("updated", &ui::timestamp(at));
                }
            }
            for resource in state.by_serial() {
                display::resource(resource);
            }
            if state.is_empty() {
                println!();
                ui::info("State is empty");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn list(ctx: &Context, location: &LocationArgs) -> Result<ExitCode> {
    let project = open(location)?;
    let state = project.store().load()?;

    if ctx.quiet {
        for resource in state.by_serial() {
            println!("{}", resource.address());
        }
    } else {
        display::state_list(&state);
    }
    Ok(ExitCode::SUCCESS)
}

fn rm(
    ctx: &Context,
    location: &LocationArgs,
    name: &str,
    yes: bool,
    lock_timeout: Option<u64>,
) -> Result<ExitCode> {
    let project = open(location)?;
    let settings = project.settings.clone().with_overrides(None, lock_timeout);
    let store = project.store();
    let lock = store.lock("state rm", settings.lock_timeout())?;
    let mut state = lock.load()?;

    let Some(resource) = state.get(name) else {
        bail!("No resource named '{name}' in state");
    };
    let address = resource.address();

    let dependents: Vec<&str> = state
        .iter()
        .filter(|r| r.dependencies.iter().any(|d| d == name))
        .map(|r| r.name.as_str())
        .collect();
    if !dependents.is_empty() {
        ui::warn(&format!(
            "{} still depended on {name} when last applied: {}",
            ui::plural(dependents.len(), "resource"),
            dependents.join(", ")
        ));
    }

    if !ctx.quiet {
        ui::dim(&format!(
            "{address} will be forgotten; the resource itself is left alone"
        ));
    }
    if !yes && !confirm(&format!("Remove {address} from state?"), false)? {
        ui::info("Nothing removed");
        return Ok(ExitCode::SUCCESS);
    }

    state.remove(name);
    lock.save(&mut state)?;
    ui::success(&format!("Removed {address} from state"));
    Ok(ExitCode::SUCCESS)
}

fn force_unlock(ctx: &Context, location: &LocationArgs, yes: bool) -> Result<ExitCode> {
    let project = open(location)?;
    let store = project.store();

    if !store.is_locked() {
        ui::info("State is not locked");
        return Ok(ExitCode::SUCCESS);
    }

    match store.lock_holder()? {
        Some(holder) => ui::kv("held by", &holder.to_string()),
        None => ui::kv("held by", "unknown (lock file unreadable)"),
    }
    if !ctx.quiet {
        ui::dim("Only remove the lock if that run is no longer active.");
    }
    if !yes && !confirm("Remove the state lock?", false)? {
        ui::info("Lock left in place");
        return Ok(ExitCode::SUCCESS);
    }

    if store.force_unlock()? {
        ui::success("State lock removed");
    } else {
        ui::info("The lock was released in the meantime");
    }
    Ok(ExitCode::SUCCESS)
}
