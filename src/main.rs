mod cli;
mod commands;
mod config;
mod declarations;
mod engine;
mod kinds;
mod paths;
mod progress;
mod provider;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use declarative::CancelToken;
use declarations::DeclarationError;
use std::io;
use std::process::ExitCode;

/// Exit status for declarations that fail validation
const EXIT_INVALID: u8 = 2;

/// Exit status when a second Ctrl-C stops the process outright
const EXIT_INTERRUPTED: i32 = 130;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel);

    match run(&ctx, cli.command, &cancel) {
        Ok(code) => code,
        Err(err) => {
            ui::error(&format!("{err:#}"));
            exit_code_for(&err)
        }
    }
}

fn run(ctx: &Context, command: Command, cancel: &CancelToken) -> Result<ExitCode> {
    match command {
        Command::Plan(args) => commands::plan::run(ctx, args),
        Command::Apply(args) => commands::apply::run(ctx, args, cancel),
        Command::Validate(args) => commands::validate::run(ctx, args),
        Command::State(cmd) => commands::state::run(ctx, cmd),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "forma", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// First Ctrl-C stops new work from starting; the second exits at once
fn install_interrupt_handler(cancel: &CancelToken) {
    let cancel = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(EXIT_INTERRUPTED);
        }
        cancel.cancel();
        eprintln!();
        ui::warn("Interrupted: waiting for running operations (Ctrl-C again to abort)");
    });
    if let Err(e) = installed {
        log::warn!("Could not install Ctrl-C handler: {e}");
    }
}

/// Validation failures exit with 2, everything else with 1
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    let invalid = err.chain().any(|cause| {
        cause
            .downcast_ref::<declarative::Error>()
            .is_some_and(declarative::Error::is_validation)
            || cause
                .downcast_ref::<DeclarationError>()
                .is_some_and(DeclarationError::is_validation)
    });
    if invalid {
        ExitCode::from(EXIT_INVALID)
    } else {
        ExitCode::FAILURE
    }
}
