//! Property tests over the scheduling, hashing and persistence invariants.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use fleetform_orchestration::engines::compute_module_hash;
use fleetform_orchestration::graph::{Action, DeploymentGraph, Status};
use fleetform_orchestration::OrchestrationError;
use fleetform_storage::{
    CurrentState, CurrentStateStore, DeploymentKey, LocalObjectStore, ObjectStore, VariableMap,
};

fn key(index: usize) -> DeploymentKey {
    DeploymentKey::new(format!("m{index}"), "a1", "r1")
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::None),
        Just(Action::Create),
        Just(Action::Update),
    ]
}

proptest! {
    /// Validation accepts forward-edge graphs and the conditional-update
    /// fixed point matches an independent computation of it.
    #[test]
    fn prop_conditional_update_propagation(
        actions in prop::collection::vec(action_strategy(), 2..8),
        edge_bits in prop::collection::vec((any::<bool>(), any::<bool>()), 1..28),
    ) {
        let n = actions.len();
        let mut graph = DeploymentGraph::new();
        for (index, action) in actions.iter().enumerate() {
            graph.add_step(key(index), *action, false, 1, 0);
        }
        // Edges only point forward, so the graph is a DAG by construction.
        let mut pairs = Vec::new();
        for from in 0..n {
            for to in (from + 1)..n {
                pairs.push((from, to));
            }
        }
        let mut edges = Vec::new();
        for (pair_index, (present, is_var)) in edge_bits.iter().enumerate() {
            if let Some(&(from, to)) = pairs.get(pair_index) {
                if *present {
                    graph
                        .add_dependency(&key(from), &key(to), *is_var, false)
                        .unwrap();
                    edges.push((from, to, *is_var));
                }
            }
        }
        graph.validate().unwrap();

        // Reference fixed point over the output-valued edges.
        let mut expected = actions.clone();
        loop {
            let mut changed = false;
            for &(from, to, is_var) in &edges {
                if is_var
                    && matches!(expected[from], Action::Update | Action::ConditionalUpdate)
                    && expected[to] == Action::None
                {
                    expected[to] = Action::ConditionalUpdate;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for index in 0..n {
            let details = graph.details(&key(index)).unwrap();
            prop_assert_eq!(details.action, expected[index]);
            if expected[index] == Action::None {
                prop_assert_eq!(details.status, Status::Skipped);
            }
        }
    }

    /// Validation accepts a graph exactly when no edge violates the
    /// creatable-after-ancestors and destroyable-before-descendants rules.
    #[test]
    fn prop_ordering_checks(
        steps in prop::collection::vec(
            (
                prop_oneof![
                    Just(Action::None),
                    Just(Action::Create),
                    Just(Action::Update),
                    Just(Action::Destroy),
                ],
                any::<bool>(),
            ),
            2..7,
        ),
        edge_bits in prop::collection::vec(any::<bool>(), 1..21),
    ) {
        let n = steps.len();
        let mut graph = DeploymentGraph::new();
        for (index, (action, skip)) in steps.iter().enumerate() {
            graph.add_step(key(index), *action, *skip, 1, 0);
        }
        let mut pairs = Vec::new();
        for from in 0..n {
            for to in (from + 1)..n {
                pairs.push((from, to));
            }
        }
        let mut edges = Vec::new();
        for (pair_index, present) in edge_bits.iter().enumerate() {
            if let Some(&(from, to)) = pairs.get(pair_index) {
                if *present {
                    graph.add_dependency(&key(from), &key(to), false, false).unwrap();
                    edges.push((from, to));
                }
            }
        }

        // Reference model of the two ordering rules.
        let violates = edges.iter().any(|&(from, to)| {
            let (from_action, from_skip) = steps[from];
            let (to_action, to_skip) = steps[to];
            let uncreatable = to_action == Action::Create
                && !to_skip
                && ((from_action == Action::Destroy && !from_skip)
                    || (from_action == Action::Create && from_skip));
            let undeletable = from_action == Action::Destroy
                && !from_skip
                && !((to_action == Action::Create && to_skip)
                    || (to_action == Action::Destroy && !to_skip));
            uncreatable || undeletable
        });

        match graph.validate() {
            Ok(()) => prop_assert!(!violates),
            Err(OrchestrationError::ForbiddenOrdering(_)) => prop_assert!(violates),
            Err(err) => prop_assert!(false, "unexpected error: {}", err),
        }
    }

    /// A step moves to ongoing at most `max_attempts` times and fails only
    /// once the attempts are exhausted.
    #[test]
    fn prop_retry_accounting(max_attempts in 1u32..5) {
        let mut graph = DeploymentGraph::new();
        graph.add_step(key(0), Action::Create, false, max_attempts, 0);
        graph.validate().unwrap();

        let mut attempts_observed = 0;
        let mut guard = 0;
        loop {
            guard += 1;
            prop_assert!(guard < 1000, "scheduler did not converge");
            match graph.next() {
                Ok(step_key) => {
                    attempts_observed += 1;
                    let details = graph.details(&step_key).unwrap();
                    prop_assert!(details.nb_attempts <= details.max_attempts);
                    prop_assert_eq!(details.nb_attempts, attempts_observed);
                    graph.fail(&step_key, "boom", None).unwrap();
                    let details = graph.details(&step_key).unwrap();
                    if details.nb_attempts < details.max_attempts {
                        prop_assert_eq!(details.status, Status::Pending);
                    } else {
                        prop_assert_eq!(details.status, Status::Failed);
                    }
                }
                Err(OrchestrationError::NoProcessableStep) => {
                    // The retry delay is zero; give the clock a tick.
                    std::thread::sleep(std::time::Duration::from_millis(2));
                }
                Err(OrchestrationError::NoMorePendingStep) => break,
                Err(err) => prop_assert!(false, "unexpected error: {}", err),
            }
        }
        prop_assert_eq!(attempts_observed, max_attempts);
        prop_assert_eq!(graph.details(&key(0)).unwrap().status, Status::Failed);
    }

    /// The module hash depends only on the retained file names and contents.
    #[test]
    fn prop_module_hash_determinism(
        files in prop::collection::btree_map("[a-z]{1,8}", prop::collection::vec(any::<u8>(), 0..64), 1..5),
    ) {
        let star = vec!["*".to_string()];

        let first = tempfile::tempdir().unwrap();
        for (name, content) in &files {
            std::fs::write(first.path().join(name), content).unwrap();
        }
        let second = tempfile::tempdir().unwrap();
        for (name, content) in files.iter().rev() {
            std::fs::write(second.path().join(name), content).unwrap();
        }
        let hash_first = compute_module_hash(first.path(), &star, &[]).unwrap();
        let hash_second = compute_module_hash(second.path(), &star, &[]).unwrap();
        prop_assert_eq!(&hash_first, &hash_second);

        // Changing any file's content changes the hash.
        let (name, content) = files.iter().next().unwrap();
        let mut changed = content.clone();
        changed.push(0x42);
        std::fs::write(second.path().join(name), &changed).unwrap();
        let hash_changed = compute_module_hash(second.path(), &star, &[]).unwrap();
        prop_assert_ne!(&hash_first, &hash_changed);

        // Renaming a file changes the hash even with identical contents.
        std::fs::write(second.path().join(name), content).unwrap();
        let renamed = format!("{name}renamed");
        std::fs::rename(second.path().join(name), second.path().join(&renamed)).unwrap();
        let hash_renamed = compute_module_hash(second.path(), &star, &[]).unwrap();
        prop_assert_ne!(&hash_first, &hash_renamed);
    }

    /// Saving and reloading the state store preserves every record.
    #[test]
    fn prop_state_roundtrip(
        records in prop::collection::btree_map(
            "[a-z]{1,6}",
            ("[0-9a-f]{32}", prop::collection::btree_map("[A-Za-z]{1,6}", "[ -~]{0,12}", 0..4)),
            0..6,
        ),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let backend: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));

            let store = CurrentStateStore::load(Arc::clone(&backend), 0).await.unwrap();
            for (module, (hash, outputs)) in &records {
                let outputs: VariableMap = outputs
                    .iter()
                    .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
                    .collect();
                store.insert(
                    DeploymentKey::new(module.clone(), "a1", "r1"),
                    CurrentState {
                        variables: VariableMap::new(),
                        variables_from_outputs: BTreeMap::new(),
                        dependencies: vec![],
                        module_hash: hash.clone(),
                        outputs,
                        last_changed_time: "2024-01-01 00:00:00.000000".to_string(),
                    },
                );
            }
            let saved = store.save().await.unwrap();
            assert_eq!(saved, !records.is_empty());

            let reloaded = CurrentStateStore::load(backend, 0).await.unwrap();
            assert_eq!(reloaded.snapshot(), store.snapshot());
        });
    }
}
