//! Domain layer for the deployment state.
//!
//! # Domain Models
//!
//! - `DeploymentKey`: identity of one module deployment in one (account, region)
//! - `TargetState`: what a deployment should look like, derived from the manifest
//! - `CurrentState`: what a deployment looked like after its last successful apply
//! - `StateDocument`: wire form of the whole fleet state (`state.json`)
//!
//! # Port Trait
//!
//! - `ObjectStore`: durable byte storage under a flat path namespace

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Variable and output mappings are JSON-shaped and ordered for stable
/// serialization.
pub type VariableMap = BTreeMap<String, Value>;

/// Identity of a module deployment: (module, account, region).
///
/// Equality and hashing are structural on the triple. This is the universal
/// key of the planner, the graph and the state store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentKey {
    #[serde(rename = "Module")]
    pub module: String,
    #[serde(rename = "AccountId")]
    pub account_id: String,
    #[serde(rename = "Region")]
    pub region: String,
}

impl DeploymentKey {
    pub fn new(
        module: impl Into<String>,
        account_id: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            account_id: account_id.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{}]", self.module, self.account_id, self.region)
    }
}

/// Reference to an output of another deployment, used to value a local
/// variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    #[serde(rename = "Module")]
    pub module: String,
    #[serde(rename = "AccountId")]
    pub account_id: String,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "OutputName")]
    pub output_name: String,
    #[serde(rename = "IgnoreIfNotExists", default)]
    pub ignore_if_not_exists: bool,
}

impl OutputRef {
    pub fn source_key(&self) -> DeploymentKey {
        DeploymentKey::new(&self.module, &self.account_id, &self.region)
    }
}

/// Structural ordering dependency on another deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    #[serde(rename = "Module")]
    pub module: String,
    #[serde(rename = "AccountId")]
    pub account_id: String,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "IgnoreIfNotExists", default)]
    pub ignore_if_not_exists: bool,
}

impl DependencyRef {
    pub fn source_key(&self) -> DeploymentKey {
        DeploymentKey::new(&self.module, &self.account_id, &self.region)
    }
}

/// Intended state of a deployment, rebuilt from scratch on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    #[serde(rename = "Variables", default)]
    pub variables: VariableMap,
    #[serde(rename = "VariablesFromOutputs", default)]
    pub variables_from_outputs: BTreeMap<String, OutputRef>,
    #[serde(rename = "Dependencies", default)]
    pub dependencies: Vec<DependencyRef>,
    #[serde(rename = "ModuleHash")]
    pub module_hash: String,
}

/// Observed state of a deployment, mutated only on successful apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    #[serde(rename = "Variables", default)]
    pub variables: VariableMap,
    #[serde(rename = "VariablesFromOutputs", default)]
    pub variables_from_outputs: BTreeMap<String, OutputRef>,
    #[serde(rename = "Dependencies", default)]
    pub dependencies: Vec<DependencyRef>,
    #[serde(rename = "ModuleHash")]
    pub module_hash: String,
    #[serde(rename = "Outputs", default)]
    pub outputs: VariableMap,
    #[serde(rename = "LastChangedTime")]
    pub last_changed_time: String,
}

impl CurrentState {
    /// Build the record persisted after a successful create or update.
    pub fn from_target(
        target: &TargetState,
        outputs: VariableMap,
        last_changed_time: String,
    ) -> Self {
        Self {
            variables: target.variables.clone(),
            variables_from_outputs: target.variables_from_outputs.clone(),
            dependencies: target.dependencies.clone(),
            module_hash: target.module_hash.clone(),
            outputs,
            last_changed_time,
        }
    }
}

/// One entry of the persisted state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    #[serde(rename = "Deployment")]
    pub deployment: DeploymentKey,
    #[serde(rename = "CurrentState")]
    pub current_state: CurrentState,
}

/// Wire form of `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(rename = "Deployments", default)]
    pub deployments: Vec<StateEntry>,
}

/// Durable byte storage under a flat path namespace.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object. Returns `None` if the object does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite an object.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()>;
}
