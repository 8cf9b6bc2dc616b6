//! Command flows: wire the manifest, the module registry, the fleet and the
//! state store into a plan, then list, preview or apply it.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde_json::json;
use tracing::info;

use fleetform_orchestration::credentials::{CredentialCache, StsCredentialSource};
use fleetform_orchestration::engines::{Engine, ModuleRegistry, ScriptEngine};
use fleetform_orchestration::executor::{Executor, ExecutorConfig, DEFAULT_CONCURRENT_WORKERS};
use fleetform_orchestration::fleet::FleetInventory;
use fleetform_orchestration::manifest::Manifest;
use fleetform_orchestration::planner::{CliFilters, DeploymentPlan, PlanOptions};
use fleetform_orchestration::{OrchestrationError, PackageCommand};
use fleetform_storage::{CurrentStateStore, ObjectStore, S3ObjectStore};

use crate::cli::{Cli, Commands, ListArgs, RunArgs, ScopeArgs};

/// Exit code used when `--detailed-exitcode` is set and changes are pending,
/// were made, or orphans were found.
const EXIT_CHANGES: i32 = 2;

pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let manifest = Manifest::from_yaml_file(&cli.manifest)
        .with_context(|| format!("cannot load {}", cli.manifest.display()))?;

    let object_store: Arc<dyn ObjectStore> = Arc::new(
        S3ObjectStore::connect(
            &manifest.configuration.s3_region,
            &manifest.configuration.s3_bucket,
            &manifest.configuration.s3_prefix,
        )
        .await,
    );

    let engines: Vec<Arc<dyn Engine>> = vec![Arc::new(ScriptEngine)];
    let registry = Arc::new(ModuleRegistry::discover(&cli.modules_dir, &engines)?);

    let fleet = FleetInventory::load_cached(&object_store)
        .await?
        .ok_or_else(|| {
            anyhow!("no fleet inventory cache found; refresh it with the discovery tooling")
        })?;

    match &cli.command {
        Commands::Fleet => {
            write_output(&cli.output_file, &fleet.export(), "the fleet inventory")?;
            Ok(0)
        }
        Commands::List(args) => {
            list(&cli, manifest, registry, fleet, object_store, args).await
        }
        Commands::Preview(args) => {
            execute(
                &cli,
                PackageCommand::Preview,
                manifest,
                registry,
                fleet,
                object_store,
                args,
            )
            .await
        }
        Commands::Apply(args) => {
            execute(
                &cli,
                PackageCommand::Apply,
                manifest,
                registry,
                fleet,
                object_store,
                args,
            )
            .await
        }
        Commands::UpdateHash(args) => {
            execute(
                &cli,
                PackageCommand::UpdateHash,
                manifest,
                registry,
                fleet,
                object_store,
                args,
            )
            .await
        }
        Commands::RemoveOrphans(args) => {
            let plan = build_plan(
                manifest,
                registry,
                fleet,
                object_store,
                PlanOptions::default(),
                0,
            )
            .await?;
            let orphans = plan.remove_orphans(args.dry_run).await?;
            write_output(
                &cli.output_file,
                &json!({ "OrphanedDeployments": orphans }),
                "the list of orphaned module deployments",
            )?;
            if !orphans.is_empty() && args.detailed_exitcode {
                return Ok(EXIT_CHANGES);
            }
            Ok(0)
        }
    }
}

async fn list(
    cli: &Cli,
    manifest: Manifest,
    registry: Arc<ModuleRegistry>,
    fleet: FleetInventory,
    object_store: Arc<dyn ObjectStore>,
    args: &ListArgs,
) -> anyhow::Result<i32> {
    let options = PlanOptions {
        filters: filters_from(&args.scope),
        force_update: args.force_update,
    };
    let plan = build_plan(manifest, registry, fleet, object_store, options, 0).await?;
    let has_pending_changes = plan.analyze_changes();
    write_output(
        &cli.output_file,
        &plan.export_changes()?,
        "the list of deployed modules and changes to be made",
    )?;
    if has_pending_changes && args.detailed_exitcode {
        return Ok(EXIT_CHANGES);
    }
    Ok(0)
}

async fn execute(
    cli: &Cli,
    command: PackageCommand,
    manifest: Manifest,
    registry: Arc<ModuleRegistry>,
    fleet: FleetInventory,
    object_store: Arc<dyn ObjectStore>,
    args: &RunArgs,
) -> anyhow::Result<i32> {
    let options = PlanOptions {
        filters: filters_from(&args.scope),
        force_update: args.force_update,
    };
    let plan = Arc::new(
        build_plan(
            manifest,
            registry,
            fleet,
            object_store,
            options,
            args.save_state_every_seconds,
        )
        .await?,
    );

    let has_pending_changes = plan.analyze_changes();
    if !has_pending_changes {
        return Ok(0);
    }

    match command {
        PackageCommand::Preview => info!(
            "\"preview\" will determine which resources to add, update or delete if the \
             pending deployments are applied"
        ),
        PackageCommand::Apply => info!(
            "\"apply\" will apply pending deployments, resulting in the creation, update or \
             deletion of resources"
        ),
        PackageCommand::UpdateHash => info!(
            "\"update-hash\" will update the value of the module hash for deployments to update"
        ),
        PackageCommand::List => {}
    }

    if !args.non_interactive && !confirm_scope()? {
        return Ok(0);
    }

    let credentials = Arc::new(CredentialCache::new(Arc::new(
        StsCredentialSource::connect("fleetform").await,
    )));
    let workers = plan
        .manifest()
        .configuration
        .concurrent_workers
        .unwrap_or(DEFAULT_CONCURRENT_WORKERS);
    let executor = Executor::new(
        Arc::clone(&plan),
        credentials,
        &cli.temp_dir,
        ExecutorConfig::new(command)
            .with_workers(workers)
            .with_keep_deployment_cache(args.keep_deployment_cache),
    )?;
    let run_result = executor.run().await;

    let (made_changes, has_failed) = plan.analyze_results();
    write_output(
        &cli.output_file,
        &plan.export_results(command)?,
        "the result of the execution",
    )?;
    plan.save(true).await?;

    match run_result {
        Err(OrchestrationError::Interrupted) => return Ok(1),
        Err(err) => return Err(err.into()),
        Ok(()) => {}
    }
    if has_failed {
        return Ok(1);
    }
    if made_changes && args.detailed_exitcode {
        return Ok(EXIT_CHANGES);
    }
    Ok(0)
}

async fn build_plan(
    manifest: Manifest,
    registry: Arc<ModuleRegistry>,
    fleet: FleetInventory,
    object_store: Arc<dyn ObjectStore>,
    options: PlanOptions,
    save_state_every_seconds: u64,
) -> anyhow::Result<DeploymentPlan> {
    let current = CurrentStateStore::load(object_store, save_state_every_seconds).await?;
    Ok(DeploymentPlan::new(
        manifest,
        registry,
        Arc::new(fleet),
        current,
        options,
    )?)
}

fn filters_from(scope: &ScopeArgs) -> CliFilters {
    CliFilters {
        include_modules: scope.include_modules.clone(),
        exclude_modules: scope.exclude_modules.clone(),
        include_account_ids: scope.include_account_ids.clone(),
        exclude_account_ids: scope.exclude_account_ids.clone(),
        include_account_names: scope.include_account_names.clone(),
        exclude_account_names: scope.exclude_account_names.clone(),
        include_account_tags: scope.include_account_tags.clone(),
        exclude_account_tags: scope.exclude_account_tags.clone(),
        include_ou_ids: scope.include_ou_ids.clone(),
        exclude_ou_ids: scope.exclude_ou_ids.clone(),
        include_ou_tags: scope.include_ou_tags.clone(),
        exclude_ou_tags: scope.exclude_ou_tags.clone(),
        include_regions: scope.include_regions.clone(),
        exclude_regions: scope.exclude_regions.clone(),
    }
}

/// Ask for an explicit confirmation of the deployment scope.
fn confirm_scope() -> anyhow::Result<bool> {
    print!("Enter \"yes\" to confirm the deployment scope (use the command \"list\" for details): ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

fn write_output(path: &Path, document: &serde_json::Value, description: &str) -> anyhow::Result<()> {
    info!("Exporting {description} to {}", path.display());
    std::fs::write(path, serde_json::to_string_pretty(document)?)?;
    Ok(())
}
