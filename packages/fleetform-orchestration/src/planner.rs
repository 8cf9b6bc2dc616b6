//! Deployment planner: derives the target set from the manifest and the
//! fleet, diffs it against the persisted state, and drives the deployment
//! graph on behalf of the executor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{error, info};

use fleetform_storage::{
    CurrentState, CurrentStateStore, DependencyRef, DeploymentKey, OutputRef, TargetState,
    VariableMap,
};

use crate::engines::{ModuleRegistry, PackageCommand};
use crate::error::OrchestrationError;
use crate::fleet::{FleetInventory, ALL_ENABLED_REGIONS};
use crate::graph::{Action, DeploymentGraph, Status, StepDetails};
use crate::manifest::{ConfigMap, DeploymentBlock, Manifest, ScopeFilter};
use crate::Result;

/// Placeholder replaced by the account id of each expanded deployment.
pub const CURRENT_ACCOUNT_ID: &str = "${CURRENT_ACCOUNT_ID}";
/// Placeholder replaced by the region of each expanded deployment.
pub const CURRENT_REGION: &str = "${CURRENT_REGION}";

/// Include/exclude filters taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliFilters {
    pub include_modules: Option<Vec<String>>,
    pub exclude_modules: Option<Vec<String>>,
    pub include_account_ids: Option<Vec<String>>,
    pub exclude_account_ids: Option<Vec<String>>,
    pub include_account_names: Option<Vec<String>>,
    pub exclude_account_names: Option<Vec<String>>,
    pub include_account_tags: Option<Vec<String>>,
    pub exclude_account_tags: Option<Vec<String>>,
    pub include_ou_ids: Option<Vec<String>>,
    pub exclude_ou_ids: Option<Vec<String>>,
    pub include_ou_tags: Option<Vec<String>>,
    pub exclude_ou_tags: Option<Vec<String>>,
    pub include_regions: Option<Vec<String>>,
    pub exclude_regions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    pub filters: CliFilters,
    pub force_update: bool,
}

/// The effective scope once CLI filters are resolved against the fleet.
struct EffectiveFilters {
    modules: BTreeSet<String>,
    account_ids: BTreeSet<String>,
    regions: BTreeSet<String>,
}

/// The step handed to a worker.
#[derive(Debug, Clone)]
pub struct NextStep {
    pub key: DeploymentKey,
    pub action: Action,
    pub nb_attempts: u32,
    pub max_attempts: u32,
}

/// A fully planned run over one package.
pub struct DeploymentPlan {
    manifest: Manifest,
    registry: Arc<ModuleRegistry>,
    fleet: Arc<FleetInventory>,
    current: CurrentStateStore,
    target: Mutex<BTreeMap<DeploymentKey, TargetState>>,
    graph: Mutex<DeploymentGraph>,
    modules_config: BTreeMap<String, ConfigMap>,
    filters: EffectiveFilters,
    force_update: bool,
}

impl DeploymentPlan {
    /// Build the target set, diff it against the current state, and populate
    /// and validate the deployment graph.
    pub fn new(
        manifest: Manifest,
        registry: Arc<ModuleRegistry>,
        fleet: Arc<FleetInventory>,
        current: CurrentStateStore,
        options: PlanOptions,
    ) -> Result<Self> {
        let mut modules_config = BTreeMap::new();
        for module in manifest.modules.keys() {
            let info = registry.get(module).ok_or_else(|| {
                OrchestrationError::manifest(format!(
                    "the module \"{module}\" does not exist in the modules directory"
                ))
            })?;
            let config = manifest.module_config(module, info.engine.name());
            info.engine.validate_module_config(&config).map_err(|err| {
                OrchestrationError::manifest(format!("Configuration of {module}: {err}"))
            })?;
            modules_config.insert(module.clone(), config);
        }

        let filters = Self::resolve_cli_filters(&registry, &fleet, &options.filters);
        let plan = Self {
            manifest,
            registry,
            fleet,
            current,
            target: Mutex::new(BTreeMap::new()),
            graph: Mutex::new(DeploymentGraph::new()),
            modules_config,
            filters,
            force_update: options.force_update,
        };
        plan.init_target_deployments()?;
        plan.init_graph()?;
        Ok(plan)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn fleet(&self) -> &Arc<FleetInventory> {
        &self.fleet
    }

    /// Scheduling details of one step, for inspection and tests.
    pub fn step_details(&self, key: &DeploymentKey) -> Result<StepDetails> {
        Ok(self.graph.lock().details(key)?.clone())
    }

    pub fn target_state(&self, key: &DeploymentKey) -> Option<TargetState> {
        self.target.lock().get(key).cloned()
    }

    pub fn current_store(&self) -> &CurrentStateStore {
        &self.current
    }

    // ------------------------------------------------------------------
    // Target set derivation
    // ------------------------------------------------------------------

    fn init_target_deployments(&self) -> Result<()> {
        for (module, module_block) in &self.manifest.modules {
            for deployment_block in &module_block.deployments {
                self.process_deployment_block(module, deployment_block)?;
            }
        }
        Ok(())
    }

    /// Expand one deployment block into concrete (account, region) targets.
    fn process_deployment_block(&self, module: &str, block: &DeploymentBlock) -> Result<()> {
        let info = self
            .registry
            .get(module)
            .expect("module presence checked at construction");
        let module_block = &self.manifest.modules[module];

        // Layer the variables: package defaults, then the module block, then
        // the deployment block.
        let mut variables_block = self
            .manifest
            .base_variables(module, info.engine.name());
        variables_block.extend(block.variables.clone());

        let mut var_from_outputs_block = module_block.variables_from_outputs.clone();
        var_from_outputs_block.extend(block.variables_from_outputs.clone());

        let account_ids = self.accounts_in_scope(&block.include, &block.exclude);
        for account_id in account_ids {
            let mut regions: BTreeSet<String> = self
                .fleet
                .account_regions(&account_id, &[ALL_ENABLED_REGIONS.to_string()])
                .into_iter()
                .collect();
            if let Some(include) = &block.include.regions {
                let included: BTreeSet<String> = self
                    .fleet
                    .account_regions(&account_id, include)
                    .into_iter()
                    .collect();
                regions = regions.intersection(&included).cloned().collect();
            }
            if let Some(exclude) = &block.exclude.regions {
                for region in self.fleet.account_regions(&account_id, exclude) {
                    regions.remove(&region);
                }
            }
            for region in regions {
                // Each (account, region) needs its own resolved copy because
                // the placeholders expand differently per target.
                let variables = substitute_map(&variables_block, &account_id, &region);
                let variables_from_outputs = var_from_outputs_block
                    .iter()
                    .map(|(name, output_ref)| {
                        (
                            name.clone(),
                            substitute_output_ref(output_ref, &account_id, &region),
                        )
                    })
                    .collect();
                let dependencies = block
                    .dependencies
                    .iter()
                    .map(|dependency| substitute_dependency_ref(dependency, &account_id, &region))
                    .collect();

                let key = DeploymentKey::new(module, &account_id, &region);
                self.target.lock().insert(
                    key.clone(),
                    TargetState {
                        variables,
                        variables_from_outputs,
                        dependencies,
                        module_hash: info.hash.clone(),
                    },
                );
                self.resolve_variables_from_outputs(&key);
            }
        }
        Ok(())
    }

    /// Accounts selected by a deployment block's include and exclude filters.
    fn accounts_in_scope(
        &self,
        include: &ScopeFilter,
        exclude: &ScopeFilter,
    ) -> BTreeSet<String> {
        let mut account_ids: BTreeSet<String> = self.fleet.all_accounts().into_iter().collect();
        let fleet = &self.fleet;
        let mut intersect = |selected: Vec<String>| {
            let selected: BTreeSet<String> = selected.into_iter().collect();
            account_ids = account_ids.intersection(&selected).cloned().collect();
        };
        if let Some(ids) = &include.account_ids {
            intersect(fleet.accounts_by_id(ids));
        }
        if let Some(names) = &include.account_names {
            intersect(fleet.accounts_by_name(names));
        }
        if let Some(tags) = &include.account_tags {
            intersect(fleet.accounts_by_tag(tags));
        }
        if let Some(ou_ids) = &include.ou_ids {
            intersect(fleet.accounts_by_ou(ou_ids));
        }
        if let Some(ou_tags) = &include.ou_tags {
            intersect(fleet.accounts_by_ou_tag(ou_tags));
        }
        let mut subtract = |selected: Vec<String>| {
            for id in selected {
                account_ids.remove(&id);
            }
        };
        if let Some(ids) = &exclude.account_ids {
            subtract(fleet.accounts_by_id(ids));
        }
        if let Some(names) = &exclude.account_names {
            subtract(fleet.accounts_by_name(names));
        }
        if let Some(tags) = &exclude.account_tags {
            subtract(fleet.accounts_by_tag(tags));
        }
        if let Some(ou_ids) = &exclude.ou_ids {
            subtract(fleet.accounts_by_ou(ou_ids));
        }
        if let Some(ou_tags) = &exclude.ou_tags {
            subtract(fleet.accounts_by_ou_tag(ou_tags));
        }
        account_ids
    }

    /// Rewrite the variables of a step from the outputs of its sources, where
    /// those outputs exist in the current state.
    fn resolve_variables_from_outputs(&self, key: &DeploymentKey) {
        let mut target = self.target.lock();
        let Some(state) = target.get_mut(key) else {
            return;
        };
        let references: Vec<(String, OutputRef)> = state
            .variables_from_outputs
            .iter()
            .map(|(name, output_ref)| (name.clone(), output_ref.clone()))
            .collect();
        for (name, output_ref) in references {
            if let Some(source) = self.current.get(&output_ref.source_key()) {
                if let Some(value) = source.outputs.get(&output_ref.output_name) {
                    state.variables.insert(name, value.clone());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // CLI filters
    // ------------------------------------------------------------------

    fn resolve_cli_filters(
        registry: &ModuleRegistry,
        fleet: &FleetInventory,
        filters: &CliFilters,
    ) -> EffectiveFilters {
        let mut modules: BTreeSet<String> = registry.names().into_iter().collect();
        if let Some(include) = &filters.include_modules {
            let include: BTreeSet<String> = include.iter().cloned().collect();
            modules = modules.intersection(&include).cloned().collect();
        }
        if let Some(exclude) = &filters.exclude_modules {
            for module in exclude {
                modules.remove(module);
            }
        }

        let mut account_ids: BTreeSet<String> = fleet.all_accounts().into_iter().collect();
        let mut intersect = |selected: Vec<String>| {
            let selected: BTreeSet<String> = selected.into_iter().collect();
            account_ids = account_ids.intersection(&selected).cloned().collect();
        };
        if let Some(ids) = &filters.include_account_ids {
            intersect(fleet.accounts_by_id(ids));
        }
        if let Some(names) = &filters.include_account_names {
            intersect(fleet.accounts_by_name(names));
        }
        if let Some(tags) = &filters.include_account_tags {
            intersect(fleet.accounts_by_tag(tags));
        }
        if let Some(ou_ids) = &filters.include_ou_ids {
            intersect(fleet.accounts_by_ou(ou_ids));
        }
        if let Some(ou_tags) = &filters.include_ou_tags {
            intersect(fleet.accounts_by_ou_tag(ou_tags));
        }
        let mut subtract = |selected: Vec<String>| {
            for id in selected {
                account_ids.remove(&id);
            }
        };
        if let Some(ids) = &filters.exclude_account_ids {
            subtract(fleet.accounts_by_id(ids));
        }
        if let Some(names) = &filters.exclude_account_names {
            subtract(fleet.accounts_by_name(names));
        }
        if let Some(tags) = &filters.exclude_account_tags {
            subtract(fleet.accounts_by_tag(tags));
        }
        if let Some(ou_ids) = &filters.exclude_ou_ids {
            subtract(fleet.accounts_by_ou(ou_ids));
        }
        if let Some(ou_tags) = &filters.exclude_ou_tags {
            subtract(fleet.accounts_by_ou_tag(ou_tags));
        }

        let mut regions: BTreeSet<String> = fleet.all_enabled_regions().into_iter().collect();
        if let Some(include) = &filters.include_regions {
            let include: BTreeSet<String> = include.iter().cloned().collect();
            regions = regions.intersection(&include).cloned().collect();
        }
        if let Some(exclude) = &filters.exclude_regions {
            for region in exclude {
                regions.remove(region);
            }
        }

        EffectiveFilters {
            modules,
            account_ids,
            regions,
        }
    }

    fn is_skipped_by_cli_filters(&self, key: &DeploymentKey) -> bool {
        !(self.filters.modules.contains(&key.module)
            && self.filters.account_ids.contains(&key.account_id)
            && self.filters.regions.contains(&key.region))
    }

    // ------------------------------------------------------------------
    // Graph population
    // ------------------------------------------------------------------

    fn init_graph(&self) -> Result<()> {
        let mut graph = self.graph.lock();
        let target = self.target.lock();

        // Steps to create or update.
        for (key, target_state) in target.iter() {
            let action = match self.current.get(key) {
                Some(current_state) => {
                    if self.update_needed(&current_state, target_state) {
                        Action::Update
                    } else {
                        Action::None
                    }
                }
                None => Action::Create,
            };
            let skip = self.is_skipped_by_cli_filters(key);
            let (max_attempts, delay) = self.retry_parameters(&key.module);
            graph.add_step(key.clone(), action, skip, max_attempts, delay);
        }

        // Steps to destroy: present in the current state, absent from the
        // target. The manifest must keep a block for those modules.
        for key in self.current.keys() {
            if !self.modules_config.contains_key(&key.module) {
                return Err(OrchestrationError::ModuleBlockMissing(key.module.clone()));
            }
            if !target.contains_key(&key) {
                let skip = self.is_skipped_by_cli_filters(&key);
                let (max_attempts, delay) = self.retry_parameters(&key.module);
                graph.add_step(key.clone(), Action::Destroy, skip, max_attempts, delay);
            }
        }

        // Dependencies, from the target state when the step has one, from the
        // current record otherwise. An output-valued dependency prevails over
        // a structural one for the same pair.
        let keys: Vec<DeploymentKey> = graph.steps().map(|(key, _)| key.clone()).collect();
        for key in keys {
            let (dependencies, variables_from_outputs) = match target.get(&key) {
                Some(state) => (
                    state.dependencies.clone(),
                    state.variables_from_outputs.clone(),
                ),
                None => {
                    let state = self
                        .current
                        .get(&key)
                        .ok_or_else(|| OrchestrationError::UnknownStep(key.clone()))?;
                    (state.dependencies, state.variables_from_outputs)
                }
            };
            for dependency in &dependencies {
                graph.add_dependency(
                    &dependency.source_key(),
                    &key,
                    false,
                    dependency.ignore_if_not_exists,
                )?;
            }
            for output_ref in variables_from_outputs.values() {
                graph.add_dependency(
                    &output_ref.source_key(),
                    &key,
                    true,
                    output_ref.ignore_if_not_exists,
                )?;
            }
        }

        graph.validate()
    }

    /// Retry parameters for a module, from its configuration.
    fn retry_parameters(&self, module: &str) -> (u32, u64) {
        let Some(retry) = self
            .modules_config
            .get(module)
            .and_then(|config| config.get("Retry"))
        else {
            return (1, 0);
        };
        let max_attempts = retry
            .get("MaxAttempts")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;
        let delay = retry
            .get("DelayBeforeRetrying")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        (max_attempts, delay)
    }

    /// True if the step must be updated because the current and target states
    /// differ, or because `--force-update` is set.
    fn update_needed(&self, current: &CurrentState, target: &TargetState) -> bool {
        self.force_update
            || !(current.module_hash == target.module_hash
                && current.variables == target.variables)
    }

    // ------------------------------------------------------------------
    // Scheduling facade used by the executor
    // ------------------------------------------------------------------

    /// Return the next step to process and the action to make.
    ///
    /// Refreshes the step's variables from the latest outputs first. A
    /// conditional-update step is either elided (outputs unchanged) or
    /// upgraded to a plain update. In preview mode a step downstream of
    /// pending changes cannot be previewed and is failed instead.
    pub fn next(&self, command: PackageCommand) -> Result<NextStep> {
        let mut graph = self.graph.lock();
        loop {
            let key = graph.next()?;
            let details = graph.details(&key)?.clone();
            if command == PackageCommand::Preview
                && details.action != Action::Destroy
                && graph.has_ascendants_with_changes(&key)?
            {
                let message = "Unable to preview changes as this deployment is dependent on \
                               other deployments with pending changes";
                error!("{key} {message}");
                graph.fail(&key, message, None)?;
                continue;
            }
            self.resolve_variables_from_outputs(&key);
            if details.action != Action::ConditionalUpdate {
                return Ok(NextStep {
                    key,
                    action: details.action,
                    nb_attempts: details.nb_attempts,
                    max_attempts: details.max_attempts,
                });
            }
            // The step depends on output values; re-diff now that they are
            // final.
            let current = self
                .current
                .get(&key)
                .ok_or_else(|| OrchestrationError::UnknownStep(key.clone()))?;
            let update_needed = {
                let target = self.target.lock();
                let target_state = target
                    .get(&key)
                    .ok_or_else(|| OrchestrationError::UnknownStep(key.clone()))?;
                self.update_needed(&current, target_state)
            };
            if update_needed {
                return Ok(NextStep {
                    key,
                    action: Action::Update,
                    nb_attempts: details.nb_attempts,
                    max_attempts: details.max_attempts,
                });
            }
            graph.complete(
                &key,
                false,
                "No changes required because the dependent output values have not changed",
                None,
            )?;
        }
    }

    /// The variables to pass to the engine for a step: the target state for
    /// creations and updates, the last applied state for destroys.
    pub fn variables_for(&self, key: &DeploymentKey, action: Action) -> Result<VariableMap> {
        match action {
            Action::Destroy => Ok(self
                .current
                .get(key)
                .ok_or_else(|| OrchestrationError::UnknownStep(key.clone()))?
                .variables),
            _ => Ok(self
                .target
                .lock()
                .get(key)
                .ok_or_else(|| OrchestrationError::UnknownStep(key.clone()))?
                .variables
                .clone()),
        }
    }

    /// Module configuration for a step, with placeholders resolved.
    pub fn module_config(&self, key: &DeploymentKey) -> Result<ConfigMap> {
        let config = self
            .modules_config
            .get(&key.module)
            .ok_or_else(|| OrchestrationError::ModuleBlockMissing(key.module.clone()))?;
        Ok(substitute_map(config, &key.account_id, &key.region))
    }

    /// Mark a step completed. On apply, fold the result into the current
    /// state: destroys remove the record, everything else overwrites it from
    /// the target state plus the step outputs.
    pub fn complete(
        &self,
        command: PackageCommand,
        key: &DeploymentKey,
        made_changes: bool,
        result: impl Into<String>,
        detailed_results: Option<Value>,
        outputs: Option<VariableMap>,
    ) -> Result<()> {
        let mut graph = self.graph.lock();
        graph.complete(key, made_changes, result, detailed_results)?;
        if command == PackageCommand::Apply {
            if graph.details(key)?.action == Action::Destroy {
                self.current.remove(key);
            } else {
                let target = self.target.lock();
                let target_state = target
                    .get(key)
                    .ok_or_else(|| OrchestrationError::UnknownStep(key.clone()))?;
                self.current.insert(
                    key.clone(),
                    CurrentState::from_target(
                        target_state,
                        outputs.unwrap_or_default(),
                        utc_timestamp(),
                    ),
                );
            }
        }
        Ok(())
    }

    /// Mark a failed attempt; the graph re-arms the step while attempts
    /// remain.
    pub fn fail(
        &self,
        key: &DeploymentKey,
        result: impl Into<String>,
        detailed_results: Option<Value>,
    ) -> Result<()> {
        self.graph.lock().fail(key, result, detailed_results)
    }

    /// Overwrite the stored module hash when only the hash diverged. Returns
    /// whether the hash was updated.
    pub fn update_hash(&self, key: &DeploymentKey) -> Result<bool> {
        let mut graph = self.graph.lock();
        if graph.details(key)?.action == Action::Update {
            let target_hash = self
                .target
                .lock()
                .get(key)
                .ok_or_else(|| OrchestrationError::UnknownStep(key.clone()))?
                .module_hash
                .clone();
            let current_hash = self
                .current
                .get(key)
                .ok_or_else(|| OrchestrationError::UnknownStep(key.clone()))?
                .module_hash;
            if current_hash != target_hash {
                self.current.update(key, |state| {
                    state.module_hash = target_hash;
                    state.last_changed_time = utc_timestamp();
                });
                graph.complete(key, true, "Updated the module hash", None)?;
                return Ok(true);
            }
        }
        graph.complete(key, false, "No action needed", None)?;
        Ok(false)
    }

    /// Save the current state, optionally stopping the autosave task.
    pub async fn save(&self, stop_autosave: bool) -> Result<()> {
        self.current.save().await?;
        if stop_autosave {
            self.current.stop();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Analysis and exports
    // ------------------------------------------------------------------

    /// Log a summary of the changes to make and return whether any unskipped
    /// change is pending.
    pub fn analyze_changes(&self) -> bool {
        let graph = self.graph.lock();
        let mut pending: BTreeMap<&'static str, (usize, usize)> = BTreeMap::new();
        let mut pending_changes = 0;
        for (_, details) in graph.steps() {
            if details.action == Action::None {
                continue;
            }
            let entry = pending.entry(details.action.as_str()).or_default();
            if details.skip {
                entry.1 += 1;
            } else {
                pending_changes += 1;
                entry.0 += 1;
            }
        }
        for (action, label) in [
            ("create", "Deployments to create"),
            ("update", "Deployments to update"),
            (
                "conditional-update",
                "Deployments that may need updates if the outputs on which they depend change",
            ),
            ("destroy", "Deployments to destroy"),
        ] {
            if let Some((count, skipped)) = pending.get(action) {
                if count + skipped > 0 {
                    info!("{label}: {count} ({skipped} skipped due to CLI filters)");
                }
            }
        }
        if pending_changes == 0 {
            info!("No changes to be made during this run");
        }
        pending_changes > 0
    }

    /// Export the deployments and the changes to be made.
    pub fn export_changes(&self) -> Result<Value> {
        let graph = self.graph.lock();
        let mut result = json!({});
        for (key, details) in graph.steps() {
            let mut item = json!({});
            let mut deployment = serde_json::to_value(key)?;
            deployment["AccountName"] =
                json!(self.fleet.account_name(&key.account_id).unwrap_or_default());
            item["Deployment"] = deployment;
            item["ModuleConfig"] = serde_json::to_value(self.module_config(key)?)?;
            let show_current = details.action != Action::Create;
            let show_target = !matches!(details.action, Action::Destroy | Action::None);
            if show_current {
                if let Some(current) = self.current.get(key) {
                    item["CurrentState"] = serde_json::to_value(current)?;
                }
            }
            if show_target {
                if let Some(target) = self.target.lock().get(key) {
                    item["TargetState"] = serde_json::to_value(target)?;
                }
            }
            if details.action == Action::None {
                push_into(&mut result, &["NoChanges"], item);
                continue;
            }
            let category = if details.skip {
                "PendingButSkippedChanges"
            } else {
                "PendingChanges"
            };
            push_into(&mut result, &[category, details.action.export_name()], item);
        }
        Ok(result)
    }

    /// Log a summary of the results. Returns whether changes were made or are
    /// to be made, and whether any step failed.
    pub fn analyze_results(&self) -> (bool, bool) {
        let graph = self.graph.lock();
        let mut completed = 0usize;
        let mut completed_with_changes = 0usize;
        let mut failed = 0usize;
        let mut pending = 0usize;
        for (_, details) in graph.steps() {
            match details.status {
                Status::Completed => {
                    completed += 1;
                    if details.made_changes {
                        completed_with_changes += 1;
                    }
                }
                Status::Failed => failed += 1,
                Status::Skipped => {}
                // Steps still pending or in flight when the run stops early.
                Status::Pending | Status::Ongoing => pending += 1,
            }
        }
        info!("{completed} deployments completed, {failed} failed, {pending} still pending");
        (completed_with_changes > 0, failed > 0)
    }

    /// Export the results of the execution, grouped by status then action.
    pub fn export_results(&self, command: PackageCommand) -> Result<Value> {
        let graph = self.graph.lock();
        let mut result = json!({});
        for (key, details) in graph.steps() {
            if details.status == Status::Skipped {
                continue;
            }
            let mut item = json!({});
            let mut deployment = serde_json::to_value(key)?;
            deployment["AccountName"] =
                json!(self.fleet.account_name(&key.account_id).unwrap_or_default());
            item["Deployment"] = deployment;
            item["NbAttempts"] = json!(details.nb_attempts);
            if !details.result.is_empty() {
                item["Result"] = json!(details.result);
            }
            if let Some(detailed_results) = &details.detailed_results {
                item["DetailedResults"] = detailed_results.clone();
            }
            if details.status == Status::Completed {
                item["ResultedInChanges"] = json!(details.made_changes);
                if command == PackageCommand::Apply {
                    if let Some(current) = self.current.get(key) {
                        item["Outputs"] = serde_json::to_value(current.outputs)?;
                    }
                }
            }
            push_into(
                &mut result,
                &[details.status.export_name(), details.action.export_name()],
                item,
            );
        }
        Ok(result)
    }

    /// Remove deployments whose account or region is no longer part of the
    /// fleet. Returns the removed keys.
    pub async fn remove_orphans(&self, dry_run: bool) -> Result<Vec<DeploymentKey>> {
        let mut orphans = Vec::new();
        for key in self.current.keys() {
            if !self.fleet.account_region_exists(&key.account_id, &key.region) {
                if !dry_run {
                    self.current.remove(&key);
                }
                orphans.push(key);
            }
        }
        if dry_run {
            info!("Found {} orphaned module deployments to remove", orphans.len());
        } else {
            self.current.save().await?;
            info!("Removed {} orphaned module deployments", orphans.len());
        }
        Ok(orphans)
    }
}

fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Append `item` to the array at the given path, creating the intermediate
/// objects as needed.
fn push_into(document: &mut Value, path: &[&str], item: Value) {
    let mut node = document;
    for (position, segment) in path.iter().enumerate() {
        let is_last = position == path.len() - 1;
        let object = node.as_object_mut().expect("export nodes are objects");
        node = object
            .entry(segment.to_string())
            .or_insert_with(|| if is_last { json!([]) } else { json!({}) });
    }
    node.as_array_mut().expect("leaf is an array").push(item);
}

/// Replace the expansion placeholders recursively across a JSON value. Only
/// string leaves are rewritten.
fn substitute_value(value: &Value, account_id: &str, region: &str) -> Value {
    match value {
        Value::String(text) => Value::String(
            text.replace(CURRENT_ACCOUNT_ID, account_id)
                .replace(CURRENT_REGION, region),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, account_id, region))
                .collect(),
        ),
        Value::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(name, item)| (name.clone(), substitute_value(item, account_id, region)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_map(
    map: &BTreeMap<String, Value>,
    account_id: &str,
    region: &str,
) -> BTreeMap<String, Value> {
    map.iter()
        .map(|(name, value)| (name.clone(), substitute_value(value, account_id, region)))
        .collect()
}

fn substitute_text(text: &str, account_id: &str, region: &str) -> String {
    text.replace(CURRENT_ACCOUNT_ID, account_id)
        .replace(CURRENT_REGION, region)
}

fn substitute_output_ref(output_ref: &OutputRef, account_id: &str, region: &str) -> OutputRef {
    OutputRef {
        module: substitute_text(&output_ref.module, account_id, region),
        account_id: substitute_text(&output_ref.account_id, account_id, region),
        region: substitute_text(&output_ref.region, account_id, region),
        output_name: substitute_text(&output_ref.output_name, account_id, region),
        ignore_if_not_exists: output_ref.ignore_if_not_exists,
    }
}

fn substitute_dependency_ref(
    dependency: &DependencyRef,
    account_id: &str,
    region: &str,
) -> DependencyRef {
    DependencyRef {
        module: substitute_text(&dependency.module, account_id, region),
        account_id: substitute_text(&dependency.account_id, account_id, region),
        region: substitute_text(&dependency.region, account_id, region),
        ignore_if_not_exists: dependency.ignore_if_not_exists,
    }
}
