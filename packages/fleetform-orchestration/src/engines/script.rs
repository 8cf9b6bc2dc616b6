//! Scripted engine: the module ships an executable script that talks to the
//! executor through `input.json` and `output.json` in the deployment cache
//! directory.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use fleetform_storage::VariableMap;

use crate::error::OrchestrationError;
use crate::manifest::ConfigMap;
use crate::Result;

use super::{
    validate_common_module_config, Engine, PostprocessRequest, PrepareRequest, StepCommand,
    StepOutcome,
};

const INPUT_FILENAME: &str = "input.json";
const OUTPUT_FILENAME: &str = "output.json";
const DEFAULT_INTERPRETER: &str = "python3";
const DEFAULT_SCRIPT_FILE: &str = "main.py";

pub struct ScriptEngine;

impl ScriptEngine {
    fn interpreter(module_config: &ConfigMap) -> String {
        module_config
            .get("Interpreter")
            .and_then(|value| value.as_str())
            .unwrap_or(DEFAULT_INTERPRETER)
            .to_string()
    }

    fn script_file(module_config: &ConfigMap) -> String {
        module_config
            .get("ScriptFile")
            .and_then(|value| value.as_str())
            .unwrap_or(DEFAULT_SCRIPT_FILE)
            .to_string()
    }
}

/// Wire form of `output.json`.
#[derive(Debug, Deserialize)]
struct ScriptOutput {
    #[serde(rename = "MadeChanges")]
    made_changes: bool,
    #[serde(rename = "Result")]
    result: String,
    #[serde(rename = "DetailedResults", default)]
    detailed_results: Option<serde_json::Value>,
    #[serde(rename = "Outputs", default)]
    outputs: Option<VariableMap>,
}

#[async_trait]
impl Engine for ScriptEngine {
    fn name(&self) -> &'static str {
        "script"
    }

    fn validate_module_config(&self, module_config: &ConfigMap) -> Result<()> {
        validate_common_module_config(module_config)?;
        for field in ["Interpreter", "ScriptFile"] {
            if let Some(value) = module_config.get(field) {
                if !value.is_string() {
                    return Err(OrchestrationError::config(format!(
                        "{field} must be a string"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn prepare(&self, request: PrepareRequest<'_>) -> Result<Vec<StepCommand>> {
        let input = json!({
            "Deployment": request.key,
            "Command": request.command.as_str(),
            "Action": request.action.as_str(),
            "Variables": request.variables,
            "ModuleConfig": request.module_config,
            "ModulePath": request.module_dir,
            "DeploymentCacheDir": request.deployment_cache_dir,
            "EngineCacheDir": request.engine_cache_dir,
        });
        let input_file = request.deployment_cache_dir.join(INPUT_FILENAME);
        tokio::fs::write(&input_file, serde_json::to_vec(&input)?)
            .await
            .map_err(|err| {
                OrchestrationError::Prepare(format!(
                    "cannot write {}: {err}",
                    input_file.display()
                ))
            })?;
        debug!("{} Wrote the script inputs to {}", request.key, input_file.display());

        let script = request.module_dir.join(Self::script_file(request.module_config));
        Ok(vec![StepCommand {
            name: "script".to_string(),
            args: vec![
                Self::interpreter(request.module_config),
                script.to_string_lossy().to_string(),
            ],
            cwd: request.deployment_cache_dir.to_path_buf(),
            assume_role: true,
            env: Default::default(),
            stdout_file: None,
        }])
    }

    async fn postprocess(&self, request: PostprocessRequest<'_>) -> Result<StepOutcome> {
        let output_file = request.deployment_cache_dir.join(OUTPUT_FILENAME);
        let bytes = tokio::fs::read(&output_file).await.map_err(|err| {
            OrchestrationError::Postprocess(format!(
                "cannot read {}: {err}",
                output_file.display()
            ))
        })?;
        let output: ScriptOutput = serde_json::from_slice(&bytes)
            .map_err(|err| OrchestrationError::Postprocess(err.to_string()))?;
        Ok(StepOutcome {
            made_changes: output.made_changes,
            result: output.result,
            detailed_results: output.detailed_results,
            outputs: output.outputs,
        })
    }
}
