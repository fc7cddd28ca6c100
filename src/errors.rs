use std::time::Duration;

/// Failure taxonomy of a harness run. Variants follow the job lifecycle:
/// configuration, launch, readiness, injection, lifecycle RPC, user code,
/// teardown.
#[derive(thiserror::Error, Debug)]
pub enum HarnessError {
    #[error("invalid job config: {0}")]
    Config(String),

    #[error("kubernetes api call failed: {0}")]
    Launch(#[from] kube::Error),

    #[error("{resource} was not ready within {timeout:?}")]
    ReadinessTimeout { resource: String, timeout: Duration },

    #[error("file injection into pod failed: {0}")]
    Injection(String),

    #[error("lifecycle call {method} on {worker} failed: {status}")]
    Lifecycle {
        method: &'static str,
        worker: String,
        status: tonic::Status,
    },

    #[error("cannot reach worker {worker}: {source}")]
    Transport {
        worker: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("suite {suite} failed: {message}")]
    User { suite: String, message: String },

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// True when `err` is a Kubernetes API error carrying the given HTTP status.
pub fn is_kube_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(api) if api.code == code)
}
