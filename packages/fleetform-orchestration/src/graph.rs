//! Deployment graph: one node per step (a module deployment in one account
//! and region), edges for dependencies between steps, with validation and
//! ready-step selection.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::{debug, error};

use fleetform_storage::DeploymentKey;

use crate::error::OrchestrationError;
use crate::Result;

/// What the planner decided must happen to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    None,
    Create,
    Update,
    /// Update only if the output values the step depends on change.
    ConditionalUpdate,
    Destroy,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Create => "create",
            Action::Update => "update",
            Action::ConditionalUpdate => "conditional-update",
            Action::Destroy => "destroy",
        }
    }

    /// Wire name used by change and result exports.
    pub fn export_name(&self) -> &'static str {
        match self {
            Action::None => "None",
            Action::Create => "Create",
            Action::Update => "Update",
            Action::ConditionalUpdate => "ConditionalUpdate",
            Action::Destroy => "Destroy",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Skipped,
    Ongoing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Skipped => "skipped",
            Status::Ongoing => "ongoing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn export_name(&self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Skipped => "Skipped",
            Status::Ongoing => "Ongoing",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
        }
    }
}

/// Scheduling state of one step.
#[derive(Debug, Clone)]
pub struct StepDetails {
    pub action: Action,
    /// True if a CLI filter excludes this step, or no work is required.
    pub skip: bool,
    pub status: Status,
    pub nb_attempts: u32,
    pub max_attempts: u32,
    /// Seconds to wait before retrying after a failed attempt.
    pub delay: u64,
    /// Earliest time at which the step may be attempted.
    pub wait_until: DateTime<Utc>,
    /// One-line summary of the result.
    pub result: String,
    pub detailed_results: Option<serde_json::Value>,
    /// True if the step resulted in changes made or to be made.
    pub made_changes: bool,
}

impl StepDetails {
    fn new(action: Action, skip: bool, max_attempts: u32, delay: u64) -> Self {
        Self {
            action,
            skip,
            status: Status::Pending,
            nb_attempts: 0,
            max_attempts,
            delay,
            wait_until: Utc::now(),
            result: String::new(),
            detailed_results: None,
            made_changes: false,
        }
    }
}

struct StepNode {
    key: DeploymentKey,
    details: StepDetails,
}

#[derive(Debug, Clone, Copy)]
struct EdgeTag {
    /// True if the edge carries output values into variables downstream.
    is_var: bool,
}

/// The deployment steps, their dependencies and status.
pub struct DeploymentGraph {
    graph: DiGraph<StepNode, EdgeTag>,
    indices: HashMap<DeploymentKey, NodeIndex>,
}

impl Default for DeploymentGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            indices: HashMap::new(),
        }
    }

    /// Add a step. Re-adding a key resets its details.
    pub fn add_step(
        &mut self,
        key: DeploymentKey,
        action: Action,
        skip: bool,
        max_attempts: u32,
        delay: u64,
    ) {
        let details = StepDetails::new(action, skip, max_attempts, delay);
        match self.indices.get(&key) {
            Some(&index) => self.graph[index].details = details,
            None => {
                let index = self.graph.add_node(StepNode {
                    key: key.clone(),
                    details,
                });
                self.indices.insert(key, index);
            }
        }
    }

    /// Add a dependency edge from `from` to `to`.
    ///
    /// A missing `from` step is tolerated when the destination will be
    /// destroyed (there is nothing to wait for) or when the edge is marked
    /// `ignore_if_not_exists`; otherwise the call fails.
    pub fn add_dependency(
        &mut self,
        from: &DeploymentKey,
        to: &DeploymentKey,
        is_var: bool,
        ignore_if_not_exists: bool,
    ) -> Result<()> {
        let to_index = *self
            .indices
            .get(to)
            .ok_or_else(|| OrchestrationError::UnknownStep(to.clone()))?;
        let Some(&from_index) = self.indices.get(from) else {
            if self.graph[to_index].details.action == Action::Destroy || ignore_if_not_exists {
                return Ok(());
            }
            return Err(OrchestrationError::MissingDependency {
                from: from.clone(),
                to: to.clone(),
            });
        };
        self.graph.add_edge(from_index, to_index, EdgeTag { is_var });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn steps(&self) -> impl Iterator<Item = (&DeploymentKey, &StepDetails)> {
        self.graph
            .node_weights()
            .map(|node| (&node.key, &node.details))
    }

    pub fn details(&self, key: &DeploymentKey) -> Result<&StepDetails> {
        let index = self.index_of(key)?;
        Ok(&self.graph[index].details)
    }

    fn index_of(&self, key: &DeploymentKey) -> Result<NodeIndex> {
        self.indices
            .get(key)
            .copied()
            .ok_or_else(|| OrchestrationError::UnknownStep(key.clone()))
    }

    /// True if at least one predecessor that is not skipped has pending
    /// changes: a create or destroy, or an update that made changes.
    pub fn has_ascendants_with_changes(&self, key: &DeploymentKey) -> Result<bool> {
        let index = self.index_of(key)?;
        for ancestor in self.graph.neighbors_directed(index, Direction::Incoming) {
            let details = &self.graph[ancestor].details;
            if !details.skip
                && (matches!(details.action, Action::Create | Action::Destroy)
                    || (matches!(details.action, Action::Update | Action::ConditionalUpdate)
                        && details.made_changes))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validate the graph and make initial changes.
    pub fn validate(&mut self) -> Result<()> {
        self.check_for_cycles()?;
        self.check_for_uncreatable_deployments()?;
        self.check_for_undeletable_deployments()?;
        self.propagate_conditional_update();
        self.set_status_skipped();
        debug!(
            "The deployment graph is valid and contains {} steps and {} dependencies",
            self.graph.node_count(),
            self.graph.edge_count()
        );
        Ok(())
    }

    fn check_for_cycles(&self) -> Result<()> {
        if toposort(&self.graph, None).is_ok() {
            return Ok(());
        }
        // Enumerate the cycles for the error message: every strongly
        // connected component with more than one node, plus self-loops.
        let mut cycles = Vec::new();
        for component in tarjan_scc(&self.graph) {
            if component.len() > 1 {
                cycles.push(
                    component
                        .iter()
                        .map(|&index| self.graph[index].key.to_string())
                        .collect::<Vec<_>>()
                        .join(">"),
                );
            }
        }
        for edge in self.graph.edge_indices() {
            if let Some((a, b)) = self.graph.edge_endpoints(edge) {
                if a == b {
                    cycles.push(self.graph[a].key.to_string());
                }
            }
        }
        Err(OrchestrationError::CycleDetected(cycles.join(" and ")))
    }

    /// Steps that depend on other deployments can only be created if their
    /// ancestors have been created.
    fn check_for_uncreatable_deployments(&self) -> Result<()> {
        for to_index in self.graph.node_indices() {
            let to = &self.graph[to_index];
            if !(to.details.action == Action::Create && !to.details.skip) {
                continue;
            }
            for from_index in self.graph.neighbors_directed(to_index, Direction::Incoming) {
                let from = &self.graph[from_index];
                if from.details.action == Action::Destroy && !from.details.skip {
                    return Err(OrchestrationError::ForbiddenOrdering(format!(
                        "{} must be created after {} which will be deleted during this run",
                        to.key, from.key
                    )));
                }
                if from.details.action == Action::Create && from.details.skip {
                    return Err(OrchestrationError::ForbiddenOrdering(format!(
                        "{} must be created after {} which has not yet been created and will \
                         not be created during this run",
                        to.key, from.key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Deployments on which other deployments depend can only be deleted if
    /// every descendant is deleted too (or was never created).
    fn check_for_undeletable_deployments(&self) -> Result<()> {
        for from_index in self.graph.node_indices() {
            let from = &self.graph[from_index];
            if !(from.details.action == Action::Destroy && !from.details.skip) {
                continue;
            }
            for to_index in self.graph.neighbors_directed(from_index, Direction::Outgoing) {
                let to = &self.graph[to_index];
                let descendant_goes_away = (to.details.action == Action::Create
                    && to.details.skip)
                    || (to.details.action == Action::Destroy && !to.details.skip);
                if !descendant_goes_away {
                    return Err(OrchestrationError::ForbiddenOrdering(format!(
                        "{} must be deleted after {} which has not yet been deleted and will \
                         not be deleted during this run",
                        from.key, to.key
                    )));
                }
            }
        }
        Ok(())
    }

    /// When a step A takes variables from the outputs of a step B, updating B
    /// may require updating A if the output values change. Repeat until the
    /// propagation reaches a fixed point.
    fn propagate_conditional_update(&mut self) {
        let var_edges: Vec<(NodeIndex, NodeIndex)> = self
            .graph
            .edge_indices()
            .filter(|&edge| self.graph[edge].is_var)
            .filter_map(|edge| self.graph.edge_endpoints(edge))
            .collect();
        loop {
            let mut changes_made = false;
            for &(from, to) in &var_edges {
                let from_action = self.graph[from].details.action;
                if matches!(from_action, Action::Update | Action::ConditionalUpdate)
                    && self.graph[to].details.action == Action::None
                {
                    self.graph[to].details.action = Action::ConditionalUpdate;
                    changes_made = true;
                }
            }
            if !changes_made {
                break;
            }
        }
    }

    fn set_status_skipped(&mut self) {
        for node in self.graph.node_weights_mut() {
            if node.details.action == Action::None || node.details.skip {
                node.details.status = Status::Skipped;
            }
        }
    }

    /// Return the next step to process, transitioning it to ongoing.
    ///
    /// Walks a topological order twice: destroys first from the end of the
    /// order (deployments are destroyed before their ancestors), then
    /// creations and updates from the beginning. Fails with
    /// `NoProcessableStep` when pending steps remain but none is runnable
    /// now, and with `NoMorePendingStep` when the run is complete.
    pub fn next(&mut self) -> Result<DeploymentKey> {
        let order = toposort(&self.graph, None)
            .map_err(|_| OrchestrationError::CycleDetected("graph is not acyclic".to_string()))?;
        let now = Utc::now();

        for &index in order.iter().rev() {
            if self.graph[index].details.wait_until > now {
                continue;
            }
            if self.graph[index].details.action == Action::Destroy
                && self.graph[index].details.status == Status::Pending
            {
                if self.any_neighbor_failed(index, Direction::Outgoing) {
                    self.mark_as_failed(index);
                } else if self.all_neighbors_settled(index, Direction::Outgoing) {
                    return Ok(self.mark_as_ongoing(index));
                }
            }
        }

        for &index in order.iter() {
            if self.graph[index].details.wait_until > now {
                continue;
            }
            if matches!(
                self.graph[index].details.action,
                Action::Create | Action::Update | Action::ConditionalUpdate
            ) && self.graph[index].details.status == Status::Pending
            {
                if self.any_neighbor_failed(index, Direction::Incoming) {
                    self.mark_as_failed(index);
                } else if self.all_neighbors_settled(index, Direction::Incoming) {
                    return Ok(self.mark_as_ongoing(index));
                }
            }
        }

        if self
            .graph
            .node_weights()
            .any(|node| node.details.status == Status::Pending)
        {
            return Err(OrchestrationError::NoProcessableStep);
        }
        Err(OrchestrationError::NoMorePendingStep)
    }

    fn any_neighbor_failed(&self, index: NodeIndex, direction: Direction) -> bool {
        self.graph
            .neighbors_directed(index, direction)
            .any(|neighbor| self.graph[neighbor].details.status == Status::Failed)
    }

    fn all_neighbors_settled(&self, index: NodeIndex, direction: Direction) -> bool {
        self.graph
            .neighbors_directed(index, direction)
            .all(|neighbor| {
                matches!(
                    self.graph[neighbor].details.status,
                    Status::Completed | Status::Skipped
                )
            })
    }

    fn mark_as_ongoing(&mut self, index: NodeIndex) -> DeploymentKey {
        let node = &mut self.graph[index];
        node.details.status = Status::Ongoing;
        node.details.nb_attempts += 1;
        node.key.clone()
    }

    fn mark_as_failed(&mut self, index: NodeIndex) {
        let node = &mut self.graph[index];
        node.details.status = Status::Failed;
        node.details.result = "Failed because at least one dependency failed".to_string();
        error!("{} Failed because at least one dependency failed", node.key);
    }

    /// Mark a step completed and record its result.
    pub fn complete(
        &mut self,
        key: &DeploymentKey,
        made_changes: bool,
        result: impl Into<String>,
        detailed_results: Option<serde_json::Value>,
    ) -> Result<()> {
        let index = self.index_of(key)?;
        let details = &mut self.graph[index].details;
        details.status = Status::Completed;
        details.made_changes = made_changes;
        details.result = result.into();
        details.detailed_results = detailed_results;
        Ok(())
    }

    /// Record a failed attempt. The step is re-armed as pending with a retry
    /// delay while attempts remain; otherwise it becomes failed.
    pub fn fail(
        &mut self,
        key: &DeploymentKey,
        result: impl Into<String>,
        detailed_results: Option<serde_json::Value>,
    ) -> Result<()> {
        let index = self.index_of(key)?;
        let details = &mut self.graph[index].details;
        details.result = result.into();
        details.detailed_results = detailed_results;
        if details.nb_attempts < details.max_attempts {
            details.status = Status::Pending;
            details.wait_until = Utc::now() + Duration::seconds(details.delay as i64);
        } else {
            details.status = Status::Failed;
        }
        Ok(())
    }
}
