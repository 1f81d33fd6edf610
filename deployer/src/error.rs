use modelbay_common::deployment::Kind;
use uuid::Uuid;

/// A wrapper to capture any error possible from the deployment engine
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("model name is empty after sanitization")]
    InvalidName,
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
    #[error("malformed bundle: {0}")]
    BundleMalformed(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("no deployment package found for model: {0}")]
    MissingBundle(String),
    #[error("unknown instance: {0}")]
    UnknownInstance(Uuid),
    #[error("deployment of {kind} for {model} is already in progress")]
    AlreadyDeploying { model: String, kind: Kind },
    #[error("could not find a free port to deploy the instance on")]
    PortExhausted,
    #[error("sandbox provisioning failed: {0}")]
    SandboxFailure(String),
    #[error("failed to spawn application process: {0}")]
    SpawnFailure(#[source] std::io::Error),
    #[error("deployment failed for {failed:?}; {succeeded:?} left running")]
    PartialDeployment {
        failed: Vec<Kind>,
        succeeded: Vec<Kind>,
    },
    #[error("no running instance and none could be deployed")]
    BackendUnavailable,
    #[error("upstream request failed: {0}")]
    ProxyUpstream(String),
    #[error("encountered IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
