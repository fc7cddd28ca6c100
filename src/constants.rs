//! Container contract shared between the launcher and the worker runtime.
//! Paths, port numbers and environment names here are wire format: changing
//! any of them breaks pods launched by an older driver.

/// Directory where the job config map is mounted read-only.
pub const CONFIG_DIR: &str = "/etc/helmit";
/// Config map key, also the file name under [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "job.json";
/// Full path of the serialized job config inside a worker container.
pub const CONFIG_PATH: &str = "/etc/helmit/job.json";

/// Gate released once the user executable has been uploaded. Contains the
/// executable basename; the in-container supervisor execs it.
pub const BIN_READY_FILE: &str = "/tmp/bin-ready";
/// Gate released once value files and the context directory have been
/// uploaded. Contains the context basename, a working-directory hint.
pub const JOB_READY_FILE: &str = "/tmp/job-ready";

/// Port the lifecycle RPC listens on, and its service port name.
pub const MANAGEMENT_PORT: u16 = 5000;
pub const MANAGEMENT_PORT_NAME: &str = "management";

/// Name of the main container of every worker pod.
pub const JOB_CONTAINER: &str = "job";

/// Cluster-wide role and binding shared by every job in a cluster.
pub const CLUSTER_ROLE: &str = "kube-test-cluster";

/// Image used when a local executable is injected instead of a prebuilt one.
pub const DEFAULT_RUNNER_IMAGE: &str = "chart-harness/runner:latest";

// Environment injected into every worker container.
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const ENV_POD_NAME: &str = "POD_NAME";
pub const ENV_SERVICE_NAMESPACE: &str = "SERVICE_NAMESPACE";
pub const ENV_SERVICE_NAME: &str = "SERVICE_NAME";
pub const ENV_JOB_TYPE: &str = "JOB_TYPE";
pub const ENV_SIMULATION_TYPE: &str = "SIMULATION_TYPE";
pub const ENV_SIMULATION_WORKER: &str = "SIMULATION_WORKER";
pub const ENV_SIMULATION_JOB: &str = "SIMULATION_JOB";
