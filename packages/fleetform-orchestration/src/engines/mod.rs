//! Engine contract consumed by the executor, module hashing, and the module
//! registry.
//!
//! An engine turns one step into a sequence of subprocess commands
//! (`prepare`) and parses what the subprocesses left behind into an outcome
//! (`postprocess`). How templates are materialized is entirely the engine's
//! business.

pub mod script;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use fleetform_storage::{DeploymentKey, VariableMap};

use crate::error::OrchestrationError;
use crate::graph::Action;
use crate::manifest::ConfigMap;
use crate::patterns::matches_any;
use crate::Result;

pub use script::ScriptEngine;

/// Optional per-module file that overrides the hash file patterns. The file
/// itself never contributes to the hash.
pub const HASH_CONFIG_FILENAME: &str = "hash-config.json";

/// The CLI command driving a run, as seen by the planner and the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageCommand {
    List,
    Preview,
    Apply,
    UpdateHash,
}

impl PackageCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageCommand::List => "list",
            PackageCommand::Preview => "preview",
            PackageCommand::Apply => "apply",
            PackageCommand::UpdateHash => "update-hash",
        }
    }
}

impl fmt::Display for PackageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One subprocess to execute for a step.
#[derive(Debug, Clone)]
pub struct StepCommand {
    /// Friendly name used in logs and failure records.
    pub name: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// True if temporary credentials must be injected into the environment.
    pub assume_role: bool,
    pub env: HashMap<String, String>,
    /// Where to also write the captured standard output, if anywhere.
    pub stdout_file: Option<PathBuf>,
}

/// The result of a step execution.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub made_changes: bool,
    pub result: String,
    pub detailed_results: Option<Value>,
    /// Only valued when the command is apply and the action is not destroy.
    pub outputs: Option<VariableMap>,
}

/// Inputs to `Engine::prepare`.
pub struct PrepareRequest<'a> {
    pub key: &'a DeploymentKey,
    pub command: PackageCommand,
    pub action: Action,
    pub variables: &'a VariableMap,
    pub module_config: &'a ConfigMap,
    pub module_dir: &'a Path,
    pub deployment_cache_dir: &'a Path,
    pub engine_cache_dir: &'a Path,
}

/// Inputs to `Engine::postprocess`.
pub struct PostprocessRequest<'a> {
    pub key: &'a DeploymentKey,
    pub command: PackageCommand,
    pub action: Action,
    pub module_config: &'a ConfigMap,
    pub deployment_cache_dir: &'a Path,
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Default file patterns retained for the module hash.
    fn default_included_patterns(&self) -> Vec<String> {
        vec!["*".to_string()]
    }

    fn default_excluded_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Fail-fast sanity checks on the module configuration.
    fn validate_module_config(&self, module_config: &ConfigMap) -> Result<()> {
        validate_common_module_config(module_config)
    }

    /// Prepare input files and return the subprocess commands to execute.
    async fn prepare(&self, request: PrepareRequest<'_>) -> Result<Vec<StepCommand>>;

    /// Parse the files generated by the subprocesses into an outcome.
    async fn postprocess(&self, request: PostprocessRequest<'_>) -> Result<StepOutcome>;
}

/// Checks shared by every engine: optional role, retry block, endpoint
/// overrides.
pub fn validate_common_module_config(module_config: &ConfigMap) -> Result<()> {
    if let Some(role) = module_config.get("AssumeRole") {
        if !(role.is_null() || role.is_string()) {
            return Err(OrchestrationError::config(
                "AssumeRole must be \"null\" or a string",
            ));
        }
    }
    if let Some(retry) = module_config.get("Retry") {
        if let Some(max_attempts) = retry.get("MaxAttempts") {
            match max_attempts.as_i64() {
                Some(n) if n > 0 => {}
                Some(_) => {
                    return Err(OrchestrationError::config(
                        "MaxAttempts must be larger than 0",
                    ))
                }
                None => {
                    return Err(OrchestrationError::config("MaxAttempts must be an integer"))
                }
            }
        }
        if let Some(delay) = retry.get("DelayBeforeRetrying") {
            match delay.as_i64() {
                Some(n) if n >= 0 => {}
                Some(_) => {
                    return Err(OrchestrationError::config(
                        "DelayBeforeRetrying must be larger than or equal to 0",
                    ))
                }
                None => {
                    return Err(OrchestrationError::config(
                        "DelayBeforeRetrying must be an integer",
                    ))
                }
            }
        }
    }
    if let Some(endpoints) = module_config.get("EndpointUrls") {
        if !endpoints.is_object() {
            return Err(OrchestrationError::config("EndpointUrls must be a mapping"));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct HashConfig {
    #[serde(rename = "Include")]
    include: Option<Vec<String>>,
    #[serde(rename = "Exclude")]
    exclude: Option<Vec<String>>,
}

/// Resolve the include/exclude patterns for a module, honoring the optional
/// override file. An unreadable or invalid override falls back to the engine
/// defaults.
fn hash_patterns(module_dir: &Path, engine: &dyn Engine) -> (Vec<String>, Vec<String>) {
    let mut included = engine.default_included_patterns();
    let mut excluded = engine.default_excluded_patterns();
    let override_file = module_dir.join(HASH_CONFIG_FILENAME);
    match std::fs::read(&override_file) {
        Ok(bytes) => match serde_json::from_slice::<HashConfig>(&bytes) {
            Ok(config) => {
                if let Some(include) = config.include {
                    included = include;
                }
                if let Some(exclude) = config.exclude {
                    excluded = exclude;
                }
                debug!(
                    "Found {HASH_CONFIG_FILENAME}: Include={} Exclude={}",
                    included.join(","),
                    excluded.join(",")
                );
            }
            Err(_) => {
                debug!("{HASH_CONFIG_FILENAME} is invalid, using the engine defaults");
            }
        },
        Err(_) => {
            debug!("No {HASH_CONFIG_FILENAME} file found, using the engine defaults");
        }
    }
    (included, excluded)
}

/// Content fingerprint of a module directory: MD5 over the name and contents
/// of every retained file, in sorted path order.
pub fn compute_module_hash(
    module_dir: &Path,
    included: &[String],
    excluded: &[String],
) -> Result<String> {
    let mut hasher = Md5::new();
    hash_directory(module_dir, included, excluded, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_directory(
    directory: &Path,
    included: &[String],
    excluded: &[String],
    hasher: &mut Md5,
) -> Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(directory)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            hash_directory(&path, included, excluded, hasher)?;
        } else if path.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let retained = matches_any(&name, included)
                && !matches_any(&name, excluded)
                && !name.ends_with(HASH_CONFIG_FILENAME);
            if !retained {
                continue;
            }
            hasher.update(name.as_bytes());
            hasher.update(std::fs::read(&path)?);
        }
    }
    Ok(())
}

/// One registered module: its engine, source directory and content hash.
pub struct ModuleInfo {
    pub name: String,
    pub engine: Arc<dyn Engine>,
    pub dir: PathBuf,
    pub hash: String,
}

/// Modules available to the package, keyed by name.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleInfo>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, computing its hash from the directory contents.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        engine: Arc<dyn Engine>,
        dir: impl Into<PathBuf>,
    ) -> Result<()> {
        let name = name.into();
        let dir = dir.into();
        let (included, excluded) = hash_patterns(&dir, engine.as_ref());
        let hash = compute_module_hash(&dir, &included, &excluded)?;
        debug!("[{name}] Module hash is {hash}");
        self.modules.insert(
            name.clone(),
            ModuleInfo {
                name,
                engine,
                dir,
                hash,
            },
        );
        Ok(())
    }

    /// Scan a modules root laid out as `<root>/<engine>/<module>/`.
    pub fn discover(root: &Path, engines: &[Arc<dyn Engine>]) -> Result<Self> {
        let mut registry = Self::new();
        for engine in engines {
            let engine_dir = root.join(engine.name());
            if !engine_dir.is_dir() {
                continue;
            }
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&engine_dir)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<_>>()?;
            entries.sort();
            for path in entries {
                if path.is_dir() {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    registry.register(name, Arc::clone(engine), path)?;
                }
            }
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    /// Engine names in use, for the per-engine cache directories.
    pub fn engine_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> =
            self.modules.values().map(|m| m.engine.name()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        // Same logical contents written in a different order.
        write(a.path(), "main.tf", "resource {}");
        write(a.path(), "vars.tf", "variable {}");
        write(b.path(), "vars.tf", "variable {}");
        write(b.path(), "main.tf", "resource {}");

        let star = vec!["*".to_string()];
        let hash_a = compute_module_hash(a.path(), &star, &[]).unwrap();
        let hash_b = compute_module_hash(b.path(), &star, &[]).unwrap();
        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 32);
    }

    #[test]
    fn test_hash_changes_with_content_and_name() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.tf", "resource {}");
        let star = vec!["*".to_string()];
        let before = compute_module_hash(dir.path(), &star, &[]).unwrap();

        write(dir.path(), "main.tf", "resource { changed }");
        let changed = compute_module_hash(dir.path(), &star, &[]).unwrap();
        assert_ne!(before, changed);

        std::fs::rename(dir.path().join("main.tf"), dir.path().join("other.tf")).unwrap();
        let renamed = compute_module_hash(dir.path(), &star, &[]).unwrap();
        assert_ne!(changed, renamed);
    }

    #[test]
    fn test_hash_override_file_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.tf", "resource {}");
        let star = vec!["*".to_string()];
        let before = compute_module_hash(dir.path(), &star, &[]).unwrap();

        write(dir.path(), HASH_CONFIG_FILENAME, r#"{"Include": ["*"]}"#);
        let after = compute_module_hash(dir.path(), &star, &[]).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_hash_respects_patterns() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.tf", "resource {}");
        let only_tf = vec!["*.tf".to_string()];
        let before = compute_module_hash(dir.path(), &only_tf, &[]).unwrap();

        write(dir.path(), "notes.md", "scratch");
        let after = compute_module_hash(dir.path(), &only_tf, &[]).unwrap();
        assert_eq!(before, after);

        let excluded = vec!["main*".to_string()];
        let nothing_left = compute_module_hash(dir.path(), &only_tf, &excluded).unwrap();
        assert_ne!(before, nothing_left);
    }

    #[test]
    fn test_registry_uses_hash_override() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.py", "print('hi')");
        write(dir.path(), "scratch.log", "noise");
        write(
            dir.path(),
            HASH_CONFIG_FILENAME,
            r#"{"Include": ["*.py"]}"#,
        );

        let mut registry = ModuleRegistry::new();
        registry
            .register("demo", Arc::new(ScriptEngine), dir.path())
            .unwrap();
        let with_noise = registry.get("demo").unwrap().hash.clone();

        std::fs::remove_file(dir.path().join("scratch.log")).unwrap();
        let mut registry = ModuleRegistry::new();
        registry
            .register("demo", Arc::new(ScriptEngine), dir.path())
            .unwrap();
        assert_eq!(registry.get("demo").unwrap().hash, with_noise);
    }

    #[test]
    fn test_discover_layout() {
        let root = tempfile::tempdir().unwrap();
        let module_dir = root.path().join("script").join("demo");
        std::fs::create_dir_all(&module_dir).unwrap();
        write(&module_dir, "main.py", "print('hi')");

        let engines: Vec<Arc<dyn Engine>> = vec![Arc::new(ScriptEngine)];
        let registry = ModuleRegistry::discover(root.path(), &engines).unwrap();
        assert_eq!(registry.names(), vec!["demo".to_string()]);
        assert_eq!(registry.engine_names(), vec!["script"]);
    }

    #[test]
    fn test_validate_common_module_config() {
        let mut config = ConfigMap::new();
        config.insert("AssumeRole".to_string(), json!("arn:aws:iam::1:role/x"));
        config.insert(
            "Retry".to_string(),
            json!({"MaxAttempts": 2, "DelayBeforeRetrying": 5}),
        );
        config.insert("EndpointUrls".to_string(), json!({"s3": "http://localhost"}));
        assert!(validate_common_module_config(&config).is_ok());

        config.insert("Retry".to_string(), json!({"MaxAttempts": 0}));
        assert!(validate_common_module_config(&config).is_err());

        config.insert("Retry".to_string(), json!({"DelayBeforeRetrying": -1}));
        assert!(validate_common_module_config(&config).is_err());

        config.insert("Retry".to_string(), json!({}));
        config.insert("AssumeRole".to_string(), json!(42));
        assert!(validate_common_module_config(&config).is_err());

        config.insert("AssumeRole".to_string(), json!(null));
        config.insert("EndpointUrls".to_string(), json!(["not", "a", "map"]));
        assert!(validate_common_module_config(&config).is_err());
    }
}
