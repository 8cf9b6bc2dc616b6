//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use fleetform_orchestration::engines::{
    Engine, ModuleRegistry, PostprocessRequest, PrepareRequest, StepCommand, StepOutcome,
};
use fleetform_orchestration::fleet::{AccountInfo, FleetInventory};
use fleetform_orchestration::manifest::Manifest;
use fleetform_orchestration::planner::{DeploymentPlan, PlanOptions};
use fleetform_orchestration::Result;
use fleetform_storage::{
    CurrentState, CurrentStateStore, DeploymentKey, LocalObjectStore, ObjectStore, VariableMap,
};

/// Engine that runs no subprocess and fabricates its outcome, optionally from
/// the `StubOutputs` module configuration key.
pub struct StubEngine;

#[async_trait]
impl Engine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn prepare(&self, _request: PrepareRequest<'_>) -> Result<Vec<StepCommand>> {
        Ok(Vec::new())
    }

    async fn postprocess(&self, request: PostprocessRequest<'_>) -> Result<StepOutcome> {
        let outputs = request
            .module_config
            .get("StubOutputs")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect::<VariableMap>()
            });
        Ok(StepOutcome {
            made_changes: true,
            result: format!("stubbed {}", request.action),
            detailed_results: None,
            outputs,
        })
    }
}

/// A fleet with one account `a1` (name `account-one`) and one region `r1`.
pub fn single_account_fleet() -> FleetInventory {
    let mut fleet = FleetInventory::new();
    fleet.add_account(AccountInfo {
        id: "a1".to_string(),
        name: "account-one".to_string(),
        tags: BTreeMap::new(),
        enabled_regions: vec!["r1".to_string()],
        parent_ous: vec![],
    });
    fleet
}

/// Build a registry of stub modules, each with one hashable file.
pub fn stub_registry(root: &Path, modules: &[&str]) -> Arc<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    for module in modules {
        let module_dir = root.join("stub").join(module);
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(module_dir.join("module.txt"), module.as_bytes()).unwrap();
        registry
            .register(*module, Arc::new(StubEngine), module_dir)
            .unwrap();
    }
    Arc::new(registry)
}

pub fn object_store(root: &Path) -> Arc<dyn ObjectStore> {
    Arc::new(LocalObjectStore::new(root.join("state")))
}

pub async fn load_store(object_store: &Arc<dyn ObjectStore>) -> CurrentStateStore {
    CurrentStateStore::load(Arc::clone(object_store), 0)
        .await
        .unwrap()
}

pub async fn build_plan(
    manifest_yaml: &str,
    registry: Arc<ModuleRegistry>,
    object_store: &Arc<dyn ObjectStore>,
    options: PlanOptions,
) -> fleetform_orchestration::Result<DeploymentPlan> {
    let manifest = Manifest::from_yaml_str(manifest_yaml)?;
    let current = load_store(object_store).await;
    DeploymentPlan::new(
        manifest,
        registry,
        Arc::new(single_account_fleet()),
        current,
        options,
    )
}

pub fn key(module: &str) -> DeploymentKey {
    DeploymentKey::new(module, "a1", "r1")
}

pub fn record(hash: &str, variables: VariableMap, outputs: VariableMap) -> CurrentState {
    CurrentState {
        variables,
        variables_from_outputs: BTreeMap::new(),
        dependencies: vec![],
        module_hash: hash.to_string(),
        outputs,
        last_changed_time: "2024-01-01 00:00:00.000000".to_string(),
    }
}

/// The registry hash of a module, for records that must read as unchanged.
pub fn module_hash(registry: &ModuleRegistry, module: &str) -> String {
    registry.get(module).unwrap().hash.clone()
}

pub fn vars(pairs: &[(&str, &str)]) -> VariableMap {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
        .collect()
}
