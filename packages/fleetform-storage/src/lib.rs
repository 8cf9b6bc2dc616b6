//! Durable fleet state: deployment identity, state records, and the
//! object-store-backed `CurrentStateStore`.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod store;

pub use domain::{
    CurrentState, DependencyRef, DeploymentKey, ObjectStore, OutputRef, StateDocument, StateEntry,
    TargetState, VariableMap,
};
pub use error::{Result, StorageError};
pub use infrastructure::{LocalObjectStore, S3ObjectStore};
pub use store::{CurrentStateStore, STATE_OBJECT};
