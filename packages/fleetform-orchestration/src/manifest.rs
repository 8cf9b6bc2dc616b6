//! Package manifest model: the fields the planner consumes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use fleetform_storage::{DependencyRef, OutputRef, VariableMap};

use crate::error::OrchestrationError;
use crate::Result;

/// Free-form module configuration parameters, keyed by wire name.
pub type ConfigMap = BTreeMap<String, Value>;

/// Scope key used by the configuration and variable defaults that apply to
/// every engine.
pub const ALL_ENGINES: &str = "All";

/// Package-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageConfiguration {
    #[serde(rename = "S3Bucket")]
    pub s3_bucket: String,
    #[serde(rename = "S3Region")]
    pub s3_region: String,
    #[serde(rename = "S3Prefix", default)]
    pub s3_prefix: String,
    #[serde(rename = "ConcurrentWorkers", default)]
    pub concurrent_workers: Option<usize>,
}

/// Account and region scoping of a deployment block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopeFilter {
    #[serde(rename = "AccountIds")]
    pub account_ids: Option<Vec<String>>,
    #[serde(rename = "AccountNames")]
    pub account_names: Option<Vec<String>>,
    #[serde(rename = "AccountTags")]
    pub account_tags: Option<Vec<String>>,
    #[serde(rename = "OUIds")]
    pub ou_ids: Option<Vec<String>>,
    #[serde(rename = "OUTags")]
    pub ou_tags: Option<Vec<String>>,
    #[serde(rename = "Regions")]
    pub regions: Option<Vec<String>>,
}

/// One item of a module's `Deployments` list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentBlock {
    #[serde(rename = "Include", default)]
    pub include: ScopeFilter,
    #[serde(rename = "Exclude", default)]
    pub exclude: ScopeFilter,
    #[serde(rename = "Variables", default)]
    pub variables: VariableMap,
    #[serde(rename = "VariablesFromOutputs", default)]
    pub variables_from_outputs: BTreeMap<String, OutputRef>,
    #[serde(rename = "Dependencies", default)]
    pub dependencies: Vec<DependencyRef>,
}

/// Per-module block of the manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleBlock {
    #[serde(rename = "Configuration", default)]
    pub configuration: ConfigMap,
    #[serde(rename = "Variables", default)]
    pub variables: VariableMap,
    #[serde(rename = "VariablesFromOutputs", default)]
    pub variables_from_outputs: BTreeMap<String, OutputRef>,
    #[serde(rename = "Deployments", default)]
    pub deployments: Vec<DeploymentBlock>,
}

/// The package manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(rename = "PackageConfiguration")]
    pub configuration: PackageConfiguration,
    #[serde(rename = "DefaultModuleConfiguration", default)]
    pub default_module_configuration: BTreeMap<String, ConfigMap>,
    #[serde(rename = "DefaultVariables", default)]
    pub default_variables: BTreeMap<String, VariableMap>,
    #[serde(rename = "Modules", default)]
    pub modules: BTreeMap<String, ModuleBlock>,
}

impl Manifest {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let manifest: Manifest =
            serde_yaml::from_str(content).map_err(OrchestrationError::manifest)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if let Some(workers) = self.configuration.concurrent_workers {
            if workers == 0 {
                return Err(OrchestrationError::manifest(
                    "ConcurrentWorkers must be larger than 0",
                ));
            }
        }
        Ok(())
    }

    /// Effective module configuration: defaults for all engines, then the
    /// engine defaults, then the module block.
    pub fn module_config(&self, module: &str, engine: &str) -> ConfigMap {
        let mut config = ConfigMap::new();
        if let Some(defaults) = self.default_module_configuration.get(ALL_ENGINES) {
            config.extend(defaults.clone());
        }
        if let Some(defaults) = self.default_module_configuration.get(engine) {
            config.extend(defaults.clone());
        }
        if let Some(block) = self.modules.get(module) {
            config.extend(block.configuration.clone());
        }
        config
    }

    /// Variables shared by every deployment block of a module: defaults for
    /// all engines, then the engine defaults, then the module block.
    pub fn base_variables(&self, module: &str, engine: &str) -> VariableMap {
        let mut variables = VariableMap::new();
        if let Some(defaults) = self.default_variables.get(ALL_ENGINES) {
            variables.extend(defaults.clone());
        }
        if let Some(defaults) = self.default_variables.get(engine) {
            variables.extend(defaults.clone());
        }
        if let Some(block) = self.modules.get(module) {
            variables.extend(block.variables.clone());
        }
        variables
    }
}
