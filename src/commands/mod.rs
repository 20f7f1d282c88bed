// Reconcile commands
pub mod apply;
pub mod plan;

// Inspection and repair
pub mod state;
pub mod validate;

use anyhow::{Context, Result};

/// Ask for confirmation on the terminal
fn confirm(prompt: &str, default: bool) -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .context("Confirmation needs an interactive terminal (pass --yes to skip it)")?;

    Ok(confirmed)
}
