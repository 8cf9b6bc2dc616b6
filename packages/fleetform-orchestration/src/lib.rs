//! Fleetform orchestration: the deployment planner, the dependency graph and
//! the concurrent executor that drive infrastructure modules across every
//! (account, region) of a fleet.
//!
//! The flow is: the planner reads the manifest, the fleet inventory and the
//! persisted state, populates the [`graph::DeploymentGraph`], and the
//! [`executor::Executor`] repeatedly asks for the next ready step, runs the
//! module engine's subprocess sequence, and reports the outcome back to the
//! plan and the state store.

pub mod credentials;
pub mod engines;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod graph;
pub mod manifest;
pub mod patterns;
pub mod planner;

pub use credentials::{CredentialCache, CredentialSource, Credentials};
pub use engines::{
    Engine, ModuleRegistry, PackageCommand, PrepareRequest, PostprocessRequest, ScriptEngine,
    StepCommand, StepOutcome,
};
pub use error::{OrchestrationError, Result};
pub use executor::{Executor, ExecutorConfig, DEFAULT_CONCURRENT_WORKERS};
pub use fleet::{AccountInfo, FleetInventory, OrgUnitInfo};
pub use graph::{Action, DeploymentGraph, Status};
pub use manifest::Manifest;
pub use planner::{CliFilters, DeploymentPlan, NextStep, PlanOptions};
