//! Executor scenarios: worker pool scheduling, real subprocess execution
//! through the scripted engine, and retry accounting.

mod common;

use std::sync::Arc;

use common::*;

use fleetform_orchestration::credentials::{
    CredentialCache, Credentials, StaticCredentialSource,
};
use fleetform_orchestration::engines::{ModuleRegistry, ScriptEngine};
use fleetform_orchestration::executor::{Executor, ExecutorConfig};
use fleetform_orchestration::graph::Status;
use fleetform_orchestration::planner::PlanOptions;
use fleetform_orchestration::PackageCommand;

fn credentials() -> Arc<CredentialCache> {
    Arc::new(CredentialCache::new(Arc::new(StaticCredentialSource::new(
        Credentials {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "token".to_string(),
        },
    ))))
}

/// Register one scripted module whose shell script writes `output.json`.
fn script_registry(root: &std::path::Path, module: &str, script: &str) -> Arc<ModuleRegistry> {
    let module_dir = root.join("script").join(module);
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(module_dir.join("run.sh"), script).unwrap();
    let mut registry = ModuleRegistry::new();
    registry
        .register(module, Arc::new(ScriptEngine), module_dir)
        .unwrap();
    Arc::new(registry)
}

#[tokio::test]
async fn test_apply_runs_script_and_persists_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let store_backend = object_store(dir.path());
    let registry = script_registry(
        dir.path(),
        "job",
        r#"cat input.json > /dev/null
echo '{"MadeChanges": true, "Result": "applied", "Outputs": {"Arn": "arn:demo"}}' > output.json
"#,
    );

    let manifest = r#"
PackageConfiguration:
  S3Bucket: test-bucket
  S3Region: r1
Modules:
  job:
    Configuration:
      Interpreter: sh
      ScriptFile: run.sh
    Deployments:
      - {}
"#;
    let plan = Arc::new(
        build_plan(manifest, registry, &store_backend, PlanOptions::default())
            .await
            .unwrap(),
    );

    let executor = Executor::new(
        Arc::clone(&plan),
        credentials(),
        dir.path(),
        ExecutorConfig::new(PackageCommand::Apply).with_workers(2),
    )
    .unwrap();
    executor.run().await.unwrap();

    let details = plan.step_details(&key("job")).unwrap();
    assert_eq!(details.status, Status::Completed);
    assert!(details.made_changes);
    assert_eq!(details.result, "applied");

    // The current state was overwritten from the target plus the outputs.
    let stored = plan.current_store().get(&key("job")).unwrap();
    assert_eq!(stored.outputs, vars(&[("Arn", "arn:demo")]));

    // The captured subprocess output landed in the logs directory.
    let stdout_log = executor.root_logs_dir().join("job/a1/r1/stdout.log");
    let content = std::fs::read_to_string(stdout_log).unwrap();
    assert!(content.contains("# Subprocess 'script' - Attempt #1"));

    // The state survived the save at the end of the run.
    let reloaded = load_store(&store_backend).await;
    assert!(reloaded.contains(&key("job")));
}

#[tokio::test]
async fn test_failing_script_retries_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store_backend = object_store(dir.path());
    let registry = script_registry(dir.path(), "job", "exit 1\n");

    let manifest = r#"
PackageConfiguration:
  S3Bucket: test-bucket
  S3Region: r1
Modules:
  job:
    Configuration:
      Interpreter: sh
      ScriptFile: run.sh
      Retry:
        MaxAttempts: 2
        DelayBeforeRetrying: 0
    Deployments:
      - {}
"#;
    let plan = Arc::new(
        build_plan(manifest, registry, &store_backend, PlanOptions::default())
            .await
            .unwrap(),
    );

    let executor = Executor::new(
        Arc::clone(&plan),
        credentials(),
        dir.path(),
        ExecutorConfig::new(PackageCommand::Apply).with_workers(1),
    )
    .unwrap();
    executor.run().await.unwrap();

    let details = plan.step_details(&key("job")).unwrap();
    assert_eq!(details.status, Status::Failed);
    assert_eq!(details.nb_attempts, 2);
    assert_eq!(details.result, "Failed");
    let detailed = details.detailed_results.unwrap();
    assert_eq!(detailed["FailedSection"], "subprocess 'script'");
    assert_eq!(detailed["ErrorMessage"], "Exit code is not 0");

    // Nothing was recorded for the failed step.
    assert!(!plan.current_store().contains(&key("job")));

    let (made_changes, has_failed) = plan.analyze_results();
    assert!(!made_changes);
    assert!(has_failed);
}

#[tokio::test]
async fn test_worker_pool_respects_dependency_chain() {
    let dir = tempfile::tempdir().unwrap();
    let store_backend = object_store(dir.path());
    let registry = stub_registry(dir.path(), &["m1", "m2", "m3"]);

    let manifest = r#"
PackageConfiguration:
  S3Bucket: test-bucket
  S3Region: r1
Modules:
  m1:
    Deployments:
      - {}
  m2:
    Deployments:
      - Dependencies:
          - Module: m1
            AccountId: a1
            Region: r1
  m3:
    Deployments:
      - Dependencies:
          - Module: m2
            AccountId: a1
            Region: r1
"#;
    let plan = Arc::new(
        build_plan(manifest, registry, &store_backend, PlanOptions::default())
            .await
            .unwrap(),
    );

    let executor = Executor::new(
        Arc::clone(&plan),
        credentials(),
        dir.path(),
        ExecutorConfig::new(PackageCommand::Apply).with_workers(4),
    )
    .unwrap();
    executor.run().await.unwrap();

    for module in ["m1", "m2", "m3"] {
        let details = plan.step_details(&key(module)).unwrap();
        assert_eq!(details.status, Status::Completed, "step {module}");
        assert!(plan.current_store().contains(&key(module)));
        // The chained record carries a later change time than its ancestor.
    }
    let t1 = plan.current_store().get(&key("m1")).unwrap().last_changed_time;
    let t3 = plan.current_store().get(&key("m3")).unwrap().last_changed_time;
    assert!(t1 <= t3);
}

#[tokio::test]
async fn test_script_engine_receives_credentials_for_assumed_role() {
    let dir = tempfile::tempdir().unwrap();
    let store_backend = object_store(dir.path());
    let registry = script_registry(
        dir.path(),
        "job",
        r#"printf '{"MadeChanges": false, "Result": "%s"}' "$ACCESS_KEY_ID" > output.json
"#,
    );

    let manifest = r#"
PackageConfiguration:
  S3Bucket: test-bucket
  S3Region: r1
Modules:
  job:
    Configuration:
      Interpreter: sh
      ScriptFile: run.sh
      AssumeRole: arn:aws:iam::111111111111:role/deployer
    Deployments:
      - {}
"#;
    let plan = Arc::new(
        build_plan(manifest, registry, &store_backend, PlanOptions::default())
            .await
            .unwrap(),
    );

    let executor = Executor::new(
        Arc::clone(&plan),
        credentials(),
        dir.path(),
        ExecutorConfig::new(PackageCommand::Apply).with_workers(1),
    )
    .unwrap();
    executor.run().await.unwrap();

    // The script saw the injected temporary credentials.
    let details = plan.step_details(&key("job")).unwrap();
    assert_eq!(details.status, Status::Completed);
    assert_eq!(details.result, "AKIATEST");
}
