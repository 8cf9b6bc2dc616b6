use fleetform_storage::DeploymentKey;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("The package manifest is invalid - {0}")]
    ManifestInvalid(String),

    #[error("{to} depends on {from} which does not exist")]
    MissingDependency {
        from: DeploymentKey,
        to: DeploymentKey,
    },

    #[error("The package contains circular dependencies: {0}")]
    CycleDetected(String),

    #[error("{0}")]
    ForbiddenOrdering(String),

    #[error(
        "There must be a block for the module \"{0}\" even with an empty list of deployments"
    )]
    ModuleBlockMissing(String),

    #[error("Step not found in the graph: {0}")]
    UnknownStep(DeploymentKey),

    /// Some steps are still pending but all of them wait on dependencies.
    #[error("No step can be processed right now")]
    NoProcessableStep,

    /// Every pending step has been processed; the run is over.
    #[error("No more pending steps")]
    NoMorePendingStep,

    #[error("Subprocess '{name}' failed: {reason}")]
    Subprocess { name: String, reason: String },

    #[error("Prepare failed: {0}")]
    Prepare(String),

    #[error("Postprocess failed: {0}")]
    Postprocess(String),

    #[error("Credential acquisition failed for role {role}: {reason}")]
    Credentials { role: String, reason: String },

    #[error("Interrupted")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] fleetform_storage::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestrationError {
    pub fn manifest<E: std::fmt::Display>(e: E) -> Self {
        Self::ManifestInvalid(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }
}
