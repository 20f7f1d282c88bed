use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "forma")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply declared infrastructure", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan(PlanArgs),

    /// Make the infrastructure match the declarations
    Apply(ApplyArgs),

    /// Check declarations without reading state
    Validate(SourceArgs),

    /// Inspect or repair recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Shared Arguments
// ============================================================================

#[derive(Args)]
pub struct SourceArgs {
    /// Directory containing declaration files
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Set a variable (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// State directory (overrides FORMA_STATE_DIR and forma.toml)
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct LocationArgs {
    /// Directory containing declaration files
    #[arg(short = 'C', long = "dir", default_value = ".")]
    pub dir: PathBuf,

    /// State directory (overrides FORMA_STATE_DIR and forma.toml)
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,
}

// ============================================================================
// Plan / Apply
// ============================================================================

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Check recorded resources still exist before planning
    #[arg(long)]
    pub refresh: bool,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    /// Parallel provider reads during refresh
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Seconds to wait for the state lock
    #[arg(long, value_name = "SECS")]
    pub lock_timeout: Option<u64>,
}

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Maximum provider calls in flight
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Seconds to wait for the state lock
    #[arg(long, value_name = "SECS")]
    pub lock_timeout: Option<u64>,

    /// Check recorded resources still exist before planning
    #[arg(long)]
    pub refresh: bool,

    /// Recreate resources that were deleted outside forma
    #[arg(long, requires = "refresh", conflicts_with = "forget_drifted")]
    pub recreate_drifted: bool,

    /// Drop resources that were deleted outside forma from state
    #[arg(long, requires = "refresh")]
    pub forget_drifted: bool,
}

// ============================================================================
// State Commands
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// Show recorded state (all resources, or one in detail)
    Show {
        /// Logical name of a resource
        name: Option<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        location: LocationArgs,
    },

    /// List recorded resources in creation order
    List {
        #[command(flatten)]
        location: LocationArgs,
    },

    /// Remove a resource from state without deleting it
    Rm {
        /// Logical name of the resource
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        /// Seconds to wait for the state lock
        #[arg(long, value_name = "SECS")]
        lock_timeout: Option<u64>,

        #[command(flatten)]
        location: LocationArgs,
    },

    /// Remove a stale state lock
    ForceUnlock {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,

        #[command(flatten)]
        location: LocationArgs,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from([
            "forma", "-vv", "apply", "infra", "--var", "location=westus", "-j", "2", "--yes",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.source.dir, PathBuf::from("infra"));
        assert_eq!(args.source.vars, ["location=westus"]);
        assert_eq!(args.jobs, Some(2));
        assert!(args.yes);
    }

    #[test]
    fn test_drift_flags_need_refresh() {
        assert!(Cli::try_parse_from(["forma", "apply", "--recreate-drifted"]).is_err());
        assert!(
            Cli::try_parse_from([
                "forma",
                "apply",
                "--refresh",
                "--recreate-drifted",
                "--forget-drifted"
            ])
            .is_err()
        );
        assert!(Cli::try_parse_from(["forma", "apply", "--refresh", "--forget-drifted"]).is_ok());
    }

    #[test]
    fn test_state_show_defaults() {
        let cli = Cli::try_parse_from(["forma", "state", "show", "s1", "--json"]).unwrap();
        let Command::State(StateCommand::Show {
            name,
            json,
            location,
        }) = cli.command
        else {
            panic!("expected state show");
        };
        assert_eq!(name.as_deref(), Some("s1"));
        assert!(json);
        assert_eq!(location.dir, PathBuf::from("."));
        assert!(location.state_dir.is_none());
    }
}
