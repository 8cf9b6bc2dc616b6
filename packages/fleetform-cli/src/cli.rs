//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "fleetform",
    about = "Deploy infrastructure modules across every account and region of a fleet",
    version
)]
pub struct Cli {
    /// Path to the package manifest
    #[arg(long, global = true, default_value = "package.yaml")]
    pub manifest: PathBuf,

    /// Root directory containing the modules, one folder per engine
    #[arg(long, global = true, default_value = "modules")]
    pub modules_dir: PathBuf,

    /// Where to write the output JSON document
    #[arg(long, global = true, default_value = "output.json")]
    pub output_file: PathBuf,

    /// Directory for caches and logs
    #[arg(long, global = true, default_value = ".fleetform")]
    pub temp_dir: PathBuf,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Export the fleet inventory
    Fleet,
    /// List the deployments and the changes to be made
    List(ListArgs),
    /// Determine the resource changes each pending deployment would make
    Preview(RunArgs),
    /// Apply the pending deployments
    Apply(RunArgs),
    /// Overwrite the stored module hash for deployments to update
    UpdateHash(RunArgs),
    /// Remove deployments whose account or region left the fleet
    RemoveOrphans(RemoveOrphansArgs),
}

/// Include/exclude filters restricting the deployments in scope.
#[derive(Debug, Default, Args)]
pub struct ScopeArgs {
    #[arg(long, value_delimiter = ',')]
    pub include_modules: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub exclude_modules: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub include_account_ids: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub exclude_account_ids: Option<Vec<String>>,
    /// Account names; `*` matches any suffix
    #[arg(long, value_delimiter = ',')]
    pub include_account_names: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub exclude_account_names: Option<Vec<String>>,
    /// Account tags as `Key=Value`
    #[arg(long, value_delimiter = ',')]
    pub include_account_tags: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub exclude_account_tags: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub include_ou_ids: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub exclude_ou_ids: Option<Vec<String>>,
    /// Organizational unit tags as `Key=Value`
    #[arg(long, value_delimiter = ',')]
    pub include_ou_tags: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub exclude_ou_tags: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub include_regions: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    pub exclude_regions: Option<Vec<String>>,
}

#[derive(Debug, Default, Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Mark unchanged deployments for update anyway
    #[arg(long)]
    pub force_update: bool,

    /// Exit with code 2 when changes are pending
    #[arg(long)]
    pub detailed_exitcode: bool,
}

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Mark unchanged deployments for update anyway
    #[arg(long)]
    pub force_update: bool,

    /// Exit with code 2 when changes are pending or were made
    #[arg(long)]
    pub detailed_exitcode: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub non_interactive: bool,

    /// Keep the per-deployment cache directories after the run
    #[arg(long)]
    pub keep_deployment_cache: bool,

    /// Save the state periodically during the run; 0 disables the autosave
    #[arg(long, default_value_t = 0)]
    pub save_state_every_seconds: u64,
}

#[derive(Debug, Default, Args)]
pub struct RemoveOrphansArgs {
    /// Report the orphans without removing them
    #[arg(long)]
    pub dry_run: bool,

    /// Exit with code 2 when orphans are found
    #[arg(long)]
    pub detailed_exitcode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_with_filters() {
        let cli = Cli::parse_from([
            "fleetform",
            "apply",
            "--non-interactive",
            "--include-modules",
            "vpc,app",
            "--exclude-regions",
            "us-east-1",
            "--save-state-every-seconds",
            "30",
        ]);
        match cli.command {
            Commands::Apply(args) => {
                assert!(args.non_interactive);
                assert_eq!(
                    args.scope.include_modules,
                    Some(vec!["vpc".to_string(), "app".to_string()])
                );
                assert_eq!(
                    args.scope.exclude_regions,
                    Some(vec!["us-east-1".to_string()])
                );
                assert_eq!(args.save_state_every_seconds, 30);
            }
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_remove_orphans_dry_run() {
        let cli = Cli::parse_from(["fleetform", "remove-orphans", "--dry-run"]);
        match cli.command {
            Commands::RemoveOrphans(args) => assert!(args.dry_run),
            other => panic!("expected remove-orphans, got {other:?}"),
        }
    }
}
