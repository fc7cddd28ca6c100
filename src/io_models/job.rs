use crate::constants::DEFAULT_RUNNER_IMAGE;
use crate::errors::HarnessError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// Default wall-clock bound for a job when the driver does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Kind of workload a job drives.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobType {
    Test,
    Benchmark,
    Simulation,
}

impl JobType {
    /// Whether workers of this type serve the lifecycle RPC. Test workers
    /// are single-shot and expose no service.
    pub fn uses_rpc(&self) -> bool {
        matches!(self, JobType::Benchmark | JobType::Simulation)
    }
}

/// Role of a harness process inside the cluster, injected through the
/// `SIMULATION_TYPE` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ProcessRole {
    Coordinator,
    Worker,
}

/// How the orchestrator waits out the run phase of a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunWait {
    Duration(Duration),
    Iterations,
}

/// Job envelope passed from the driver to every worker through the config
/// map (`job.json`). Field names are part of the wire contract.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub id: String,
    pub namespace: String,
    #[serde(default)]
    pub service_account: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,
    /// Local path on the driver; basename only inside the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    /// Local path on the driver; basename only inside the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Release name -> inline `path=value` overrides.
    #[serde(default)]
    pub values: BTreeMap<String, Vec<String>>,
    /// Release name -> value file paths (basenames inside the pod).
    #[serde(default)]
    pub value_files: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Wall-clock bound for the whole job, serialized in nanoseconds.
    #[serde(with = "duration_nanos")]
    pub timeout: Duration,
    #[serde(default)]
    pub no_teardown: bool,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,

    // test and benchmark suite selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(default)]
    pub suites: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,

    // benchmark
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<String>,
    #[serde(default)]
    pub iterations: u64,
    #[serde(default = "default_count")]
    pub workers: usize,
    #[serde(default = "default_count")]
    pub parallelism: usize,
    #[serde(default, with = "opt_duration_nanos", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(default, with = "opt_duration_nanos", skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<Duration>,

    // simulation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation: Option<String>,
    #[serde(default = "default_count")]
    pub simulators: usize,
    /// Operation name -> rate override, nanoseconds.
    #[serde(default, with = "duration_nanos_map")]
    pub rates: BTreeMap<String, Duration>,
    /// Operation name -> jitter factor override.
    #[serde(default)]
    pub jitter: BTreeMap<String, f64>,
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_count() -> usize {
    1
}

impl JobConfig {
    /// Minimal config for `job_type`; the namespace defaults to the job id
    /// and the timeout to [`DEFAULT_TIMEOUT`].
    pub fn new(id: impl Into<String>, job_type: JobType) -> Self {
        let id = id.into();
        JobConfig {
            namespace: id.clone(),
            id,
            service_account: String::new(),
            job_type,
            image: String::new(),
            image_pull_policy: default_pull_policy(),
            executable: None,
            context: None,
            values: BTreeMap::new(),
            value_files: BTreeMap::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            no_teardown: false,
            secrets: BTreeMap::new(),
            suite: None,
            suites: Vec::new(),
            tests: Vec::new(),
            benchmark: None,
            iterations: 0,
            workers: 1,
            parallelism: 1,
            duration: None,
            max_latency: None,
            simulation: None,
            simulators: 1,
            rates: BTreeMap::new(),
            jitter: BTreeMap::new(),
        }
    }

    /// Rejects configs that cannot be launched, before any cluster mutation.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if !is_dns_label(&self.id) {
            return Err(HarnessError::Config(format!(
                "job id {:?} must be a lowercase dns label, it doubles as a namespace name",
                self.id
            )));
        }
        if self.namespace.is_empty() {
            return Err(HarnessError::Config("job namespace must not be empty".to_string()));
        }
        if self.image.is_empty() && self.executable.is_none() {
            return Err(HarnessError::Config(
                "one of image or executable is required to start a worker".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(HarnessError::Config("job timeout must be positive".to_string()));
        }

        let has_duration = self.duration.is_some_and(|d| !d.is_zero());
        match self.job_type {
            JobType::Test => {}
            JobType::Benchmark => {
                if self.iterations == 0 && !has_duration {
                    return Err(HarnessError::Config(
                        "either iterations or duration must be positive for benchmarks".to_string(),
                    ));
                }
            }
            JobType::Simulation => {
                if !has_duration {
                    return Err(HarnessError::Config(
                        "duration must be positive for simulations".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Service account the worker pods run under; defaults to the namespace.
    pub fn service_account(&self) -> String {
        if self.service_account.is_empty() {
            self.namespace.clone()
        } else {
            self.service_account.clone()
        }
    }

    /// Container image for the worker pods. When a local executable is
    /// injected the default runner image supplies the supervisor shell.
    pub fn worker_image(&self) -> String {
        if self.image.is_empty() {
            DEFAULT_RUNNER_IMAGE.to_string()
        } else {
            self.image.clone()
        }
    }

    /// Number of worker pods per suite.
    pub fn worker_count(&self) -> usize {
        let count = match self.job_type {
            JobType::Test | JobType::Benchmark => self.workers,
            JobType::Simulation => self.simulators,
        };
        count.max(1)
    }

    /// Explicitly selected suite names; empty means "all registered".
    pub fn suite_selectors(&self) -> Vec<String> {
        let single = match self.job_type {
            JobType::Simulation => self.simulation.clone(),
            JobType::Test | JobType::Benchmark => self.suite.clone(),
        };
        match single {
            Some(suite) => vec![suite],
            None => self.suites.clone(),
        }
    }

    /// How the orchestrator waits for the run phase of this job to end.
    pub fn run_wait(&self) -> RunWait {
        match self.duration {
            Some(duration) if !duration.is_zero() => RunWait::Duration(duration),
            _ => RunWait::Iterations,
        }
    }

    /// Derives the coordinator-managed sub-job driving one suite: the id is
    /// `<job-id>-<suite>` and doubles as the namespace.
    pub fn sub_job(&self, suite: &str) -> JobConfig {
        let mut sub = self.clone();
        sub.id = format!("{}-{}", self.id, suite);
        sub.namespace = sub.id.clone();
        sub.service_account = String::new();
        match self.job_type {
            JobType::Simulation => sub.simulation = Some(suite.to_string()),
            JobType::Test | JobType::Benchmark => sub.suite = Some(suite.to_string()),
        }
        sub.suites = Vec::new();
        sub
    }

    /// Copy of the config as serialized into the pod's config map: local
    /// paths are reduced to their in-pod basenames.
    pub fn to_pod_config(&self) -> JobConfig {
        let mut pod = self.clone();
        pod.executable = self.executable.as_deref().map(basename);
        pod.context = self.context.as_deref().map(basename);
        pod.value_files = self
            .value_files
            .iter()
            .map(|(release, files)| {
                let files = files.iter().map(|f| basename(f)).collect();
                (release.clone(), files)
            })
            .collect();
        pod
    }
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub(crate) fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

mod opt_duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_nanos() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_nanos))
    }
}

mod duration_nanos_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let nanos: BTreeMap<&String, u64> = map.iter().map(|(k, v)| (k, v.as_nanos() as u64)).collect();
        nanos.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Duration>, D::Error> {
        let nanos = BTreeMap::<String, u64>::deserialize(deserializer)?;
        Ok(nanos.into_iter().map(|(k, v)| (k, Duration::from_nanos(v))).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        // setup:
        let mut config = JobConfig::new("alpha-bee", JobType::Simulation);
        config.service_account = "runner".to_string();
        config.timeout = Duration::from_secs(60);
        config.duration = Some(Duration::from_secs(10));
        config.max_latency = Some(Duration::from_millis(500));
        config.value_files.insert("atomix".to_string(), vec!["values.yaml".to_string()]);
        config.rates.insert("put".to_string(), Duration::from_secs(2));
        config.jitter.insert("get".to_string(), 0.5);

        // execute:
        let json: serde_json::Value = serde_json::to_value(&config).unwrap();

        // verify: camelCase keys and nanosecond durations on the wire
        assert_eq!(json["id"], "alpha-bee");
        assert_eq!(json["serviceAccount"], "runner");
        assert_eq!(json["type"], "simulation");
        assert_eq!(json["imagePullPolicy"], "IfNotPresent");
        assert_eq!(json["timeout"], 60_000_000_000u64);
        assert_eq!(json["duration"], 10_000_000_000u64);
        assert_eq!(json["maxLatency"], 500_000_000u64);
        assert_eq!(json["noTeardown"], false);
        assert_eq!(json["valueFiles"]["atomix"][0], "values.yaml");
        assert_eq!(json["rates"]["put"], 2_000_000_000u64);
        assert_eq!(json["jitter"]["get"], 0.5);
    }

    #[test]
    fn test_minimal_config_deserializes_with_defaults() {
        let raw = r#"{
            "id": "alpha-bee",
            "namespace": "alpha-bee",
            "type": "test",
            "image": "runner:latest",
            "timeout": 60000000000
        }"#;

        let config: JobConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.job_type, JobType::Test);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.image_pull_policy, "IfNotPresent");
        assert_eq!(config.workers, 1);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.worker_count(), 1);
        assert!(config.rates.is_empty());
        assert!(!config.no_teardown);
    }

    #[test]
    fn test_validate_rejects_ids_that_are_not_dns_labels() {
        let mut config = JobConfig::new("Alpha-Bee", JobType::Test);
        config.image = "runner:latest".to_string();
        assert!(config.validate().is_err());

        config.id = "alpha-bee-".to_string();
        assert!(config.validate().is_err());

        config.id = "alpha-bee-2".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_image_or_executable() {
        let config = JobConfig::new("alpha-bee", JobType::Test);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("image or executable"));
    }

    #[test]
    fn test_validate_benchmark_needs_iterations_or_duration() {
        let mut config = JobConfig::new("alpha-bee", JobType::Benchmark);
        config.image = "runner:latest".to_string();

        assert!(config.validate().is_err());

        config.iterations = 100;
        assert!(config.validate().is_ok());

        config.iterations = 0;
        config.duration = Some(Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_simulation_needs_duration() {
        let mut config = JobConfig::new("alpha-bee", JobType::Simulation);
        config.image = "runner:latest".to_string();

        assert!(config.validate().is_err());

        config.duration = Some(Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sub_job_id_doubles_as_namespace() {
        let mut config = JobConfig::new("alpha-bee", JobType::Simulation);
        config.service_account = "custom".to_string();

        let sub = config.sub_job("map");

        assert_eq!(sub.id, "alpha-bee-map");
        assert_eq!(sub.namespace, "alpha-bee-map");
        assert_eq!(sub.simulation.as_deref(), Some("map"));
        // sub-jobs fall back to the namespace-named service account
        assert_eq!(sub.service_account(), "alpha-bee-map");
    }

    #[test]
    fn test_pod_config_reduces_paths_to_basenames() {
        let mut config = JobConfig::new("alpha-bee", JobType::Test);
        config.executable = Some("/home/user/target/release/checks".to_string());
        config.context = Some("/home/user/charts".to_string());
        config
            .value_files
            .insert("atomix".to_string(), vec!["/home/user/values/atomix.yaml".to_string()]);

        let pod = config.to_pod_config();

        assert_eq!(pod.executable.as_deref(), Some("checks"));
        assert_eq!(pod.context.as_deref(), Some("charts"));
        assert_eq!(pod.value_files["atomix"], vec!["atomix.yaml".to_string()]);
    }

    #[test]
    fn test_suite_selectors() {
        let mut config = JobConfig::new("alpha-bee", JobType::Test);
        assert!(config.suite_selectors().is_empty());

        config.suites = vec!["chart".to_string(), "raft".to_string()];
        assert_eq!(config.suite_selectors(), vec!["chart", "raft"]);

        config.suite = Some("chart".to_string());
        assert_eq!(config.suite_selectors(), vec!["chart"]);

        let mut sim = JobConfig::new("alpha-bee", JobType::Simulation);
        sim.simulation = Some("map".to_string());
        assert_eq!(sim.suite_selectors(), vec!["map"]);
    }

    #[test]
    fn test_job_type_tokens_match_env_contract() {
        assert_eq!(JobType::Benchmark.to_string(), "benchmark");
        assert_eq!("simulation".parse::<JobType>().unwrap(), JobType::Simulation);
        assert_eq!("coordinator".parse::<ProcessRole>().unwrap(), ProcessRole::Coordinator);
        assert_eq!(ProcessRole::Worker.to_string(), "worker");
    }
}
