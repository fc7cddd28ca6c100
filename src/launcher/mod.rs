//! Worker launcher: builds the service, config map and batch job for one
//! worker, waits through the two-gate ready handshake, and injects the user
//! binary, value files and context over the exec channel.

pub mod copy;
pub mod logs;

use crate::constants::{
    CONFIG_DIR, CONFIG_FILE, ENV_JOB_TYPE, ENV_POD_NAME, ENV_POD_NAMESPACE, ENV_SERVICE_NAME,
    ENV_SERVICE_NAMESPACE, ENV_SIMULATION_JOB, ENV_SIMULATION_TYPE, ENV_SIMULATION_WORKER, BIN_READY_FILE,
    JOB_CONTAINER, JOB_READY_FILE, MANAGEMENT_PORT, MANAGEMENT_PORT_NAME,
};
use crate::errors::{HarnessError, is_kube_code};
use crate::io_models::job::{JobConfig, ProcessRole};
use crate::progress;
use anyhow::Context;
use itertools::Itertools;
use k8s_openapi::api::batch::v1::{Job as K8sJob, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction,
    ObjectFieldSelector, Pod, PodSpec, PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec,
    TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::api::{ListParams, PostParams};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Server-side timeout for pod list calls.
const LIST_TIMEOUT_SECS: u32 = 60;

/// Identity of one pod within a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub ordinal: usize,
    pub role: ProcessRole,
}

impl Worker {
    pub fn worker(ordinal: usize) -> Self {
        Worker {
            ordinal,
            role: ProcessRole::Worker,
        }
    }

    pub fn coordinator() -> Self {
        Worker {
            ordinal: 0,
            role: ProcessRole::Coordinator,
        }
    }

    /// Object name; for RPC workers it doubles as the service DNS label.
    pub fn name(&self) -> String {
        match self.role {
            ProcessRole::Coordinator => "coordinator".to_string(),
            ProcessRole::Worker => format!("worker-{}", self.ordinal),
        }
    }
}

#[derive(Clone)]
pub struct Launcher {
    client: kube::Client,
    config: JobConfig,
}

impl Launcher {
    pub fn new(client: kube::Client, config: JobConfig) -> Self {
        Launcher { client, config }
    }

    /// Launches one worker end to end: objects, running-wait, injection,
    /// gate writes, ready-wait. Returns the worker's pod name.
    pub async fn launch(&self, worker: &Worker) -> Result<String, HarnessError> {
        let name = worker.name();
        if self.exposes_rpc(worker) {
            progress::step(&format!("Create service {name}"), self.create_service(worker)).await?;
        }
        progress::step(
            &format!("Create config map {}", self.config.id),
            self.create_config_map(),
        )
        .await?;
        progress::step(&format!("Create job {name}"), self.create_job(worker)).await?;

        let pod = progress::step(&format!("Wait for {name} to start"), self.await_pod_running(worker)).await?;
        let pods = self.pods();

        if let Some(executable) = &self.config.executable {
            progress::step(
                &format!("Copy binary to {name}"),
                copy::inject_executable(&pods, &pod, Path::new(executable)),
            )
            .await?;
        }
        for (release, files) in &self.config.value_files {
            for file in files {
                progress::step(
                    &format!("Copy {release} values {file} to {name}"),
                    copy::inject_file(&pods, &pod, Path::new(file)),
                )
                .await?;
            }
        }
        let mut context_hint = String::new();
        if let Some(context) = &self.config.context {
            context_hint = progress::step(
                &format!("Copy context to {name}"),
                copy::inject_context(&pods, &pod, Path::new(context)),
            )
            .await?;
        }
        copy::release_job_ready(&pods, &pod, &context_hint).await?;

        progress::step(&format!("Wait for {name} to become ready"), self.await_pod_ready(worker)).await?;

        Ok(pod)
    }

    /// Starts a detached log streamer for the worker's pod.
    pub fn stream_logs(&self, worker: &Worker, pod: String) {
        tokio::spawn(logs::stream_pod_logs(self.pods(), pod, worker.name()));
    }

    pub(crate) fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn exposes_rpc(&self, worker: &Worker) -> bool {
        worker.role == ProcessRole::Worker && self.config.job_type.uses_rpc()
    }

    fn labels(&self, worker: &Worker) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("job".to_string(), self.config.id.clone()),
            ("worker".to_string(), worker.name()),
        ])
    }

    fn selector(&self, worker: &Worker) -> String {
        format!("job={},worker={}", self.config.id, worker.name())
    }

    async fn create_service(&self, worker: &Worker) -> Result<(), HarnessError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        match api.create(&PostParams::default(), &self.service_object(worker)).await {
            Ok(_) => Ok(()),
            Err(err) if is_kube_code(&err, 409) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_config_map(&self) -> Result<(), HarnessError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.config.namespace);
        match api.create(&PostParams::default(), &self.config_map_object()?).await {
            Ok(_) => Ok(()),
            Err(err) if is_kube_code(&err, 409) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_job(&self, worker: &Worker) -> Result<(), HarnessError> {
        let api: Api<K8sJob> = Api::namespaced(self.client.clone(), &self.config.namespace);
        api.create(&PostParams::default(), &self.job_object(worker)).await?;

        Ok(())
    }

    /// Polls every 100 ms until the worker pod's first container is running.
    /// A container that terminated before running counts as a failed launch.
    async fn await_pod_running(&self, worker: &Worker) -> Result<String, HarnessError> {
        let pod = self
            .await_pod(worker, |pod| first_container_running(pod), false)
            .await?;
        pod.metadata
            .name
            .ok_or_else(|| HarnessError::Other(anyhow::anyhow!("pod of {} has no name", worker.name())))
    }

    /// Polls until the container reports `Ready=true`. A terminated
    /// container also resolves the wait: single-shot workers may legally
    /// complete before the probe is observed.
    async fn await_pod_ready(&self, worker: &Worker) -> Result<(), HarnessError> {
        self.await_pod(worker, |pod| first_container_ready(pod) || first_container_terminated(pod), true)
            .await
            .map(|_| ())
    }

    async fn await_pod(
        &self,
        worker: &Worker,
        predicate: impl Fn(&Pod) -> bool,
        allow_terminated: bool,
    ) -> Result<Pod, HarnessError> {
        let pods = self.pods();
        let params = ListParams::default()
            .labels(&self.selector(worker))
            .timeout(LIST_TIMEOUT_SECS);
        let deadline = tokio::time::Instant::now() + self.config.timeout;

        loop {
            let list = pods.list(&params).await?;
            if let Some(pod) = list.items.iter().find(|pod| predicate(pod)) {
                return Ok(pod.clone());
            }
            if !allow_terminated && list.items.iter().any(first_container_terminated) {
                return Err(HarnessError::ReadinessTimeout {
                    resource: format!("pod of {} (terminated early)", worker.name()),
                    timeout: self.config.timeout,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HarnessError::ReadinessTimeout {
                    resource: format!("pod of {}", worker.name()),
                    timeout: self.config.timeout,
                });
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn service_object(&self, worker: &Worker) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(worker.name()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(self.labels(worker)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(self.labels(worker)),
                ports: Some(vec![ServicePort {
                    name: Some(MANAGEMENT_PORT_NAME.to_string()),
                    port: MANAGEMENT_PORT as i32,
                    target_port: Some(IntOrString::Int(MANAGEMENT_PORT as i32)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn config_map_object(&self) -> Result<ConfigMap, HarnessError> {
        let serialized = serde_json::to_string(&self.config.to_pod_config())
            .context("cannot serialize job config")
            .map_err(HarnessError::Other)?;

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.config.id.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), serialized)])),
            ..Default::default()
        })
    }

    fn job_object(&self, worker: &Worker) -> K8sJob {
        let labels = self.labels(worker);

        let mut container = Container {
            name: JOB_CONTAINER.to_string(),
            image: Some(self.config.worker_image()),
            image_pull_policy: Some(self.config.image_pull_policy.clone()),
            env: Some(self.env(worker)),
            readiness_probe: Some(self.readiness_probe(worker)),
            volume_mounts: Some(vec![VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };
        if self.exposes_rpc(worker) {
            container.ports = Some(vec![ContainerPort {
                container_port: MANAGEMENT_PORT as i32,
                name: Some(MANAGEMENT_PORT_NAME.to_string()),
                ..Default::default()
            }]);
        }
        if self.config.executable.is_some() {
            container.command = Some(supervisor_command(&self.config.args));
        } else if !self.config.args.is_empty() {
            container.args = Some(self.config.args.clone());
        }

        K8sJob {
            metadata: ObjectMeta {
                name: Some(worker.name()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                parallelism: Some(1),
                completions: Some(1),
                backoff_limit: Some(0),
                active_deadline_seconds: Some(self.config.timeout.as_secs() as i64),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.config.service_account()),
                        restart_policy: Some("Never".to_string()),
                        containers: vec![container],
                        volumes: Some(vec![Volume {
                            name: "config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: self.config.id.clone(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    fn env(&self, worker: &Worker) -> Vec<EnvVar> {
        let mut env = vec![
            downward_env(ENV_POD_NAMESPACE, "metadata.namespace"),
            downward_env(ENV_POD_NAME, "metadata.name"),
            plain_env(ENV_SERVICE_NAMESPACE, &self.config.namespace),
            plain_env(ENV_SERVICE_NAME, &worker.name()),
            plain_env(ENV_JOB_TYPE, &self.config.job_type.to_string()),
            plain_env(ENV_SIMULATION_TYPE, &worker.role.to_string()),
            plain_env(ENV_SIMULATION_WORKER, &worker.ordinal.to_string()),
            plain_env(ENV_SIMULATION_JOB, &self.config.id),
        ];
        env.extend(self.config.env.iter().map(|(name, value)| plain_env(name, value)));

        env
    }

    fn readiness_probe(&self, worker: &Worker) -> Probe {
        if self.exposes_rpc(worker) {
            Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(MANAGEMENT_PORT as i32),
                    ..Default::default()
                }),
                period_seconds: Some(1),
                ..Default::default()
            }
        } else {
            Probe {
                exec: Some(ExecAction {
                    command: Some(vec!["cat".to_string(), JOB_READY_FILE.to_string()]),
                }),
                period_seconds: Some(1),
                ..Default::default()
            }
        }
    }
}

/// The runner image carries no payload: block until the launcher releases
/// the bin-ready gate, then exec the uploaded binary.
fn supervisor_command(args: &[String]) -> Vec<String> {
    let args = if args.is_empty() {
        String::new()
    } else {
        format!(" {}", args.iter().join(" "))
    };
    let script =
        format!("while [ ! -f {BIN_READY_FILE} ]; do sleep 1; done; exec \"/$(cat {BIN_READY_FILE})\"{args}");

    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

fn first_container_status(pod: &Pod) -> Option<&k8s_openapi::api::core::v1::ContainerStatus> {
    pod.status.as_ref()?.container_statuses.as_ref()?.first()
}

fn first_container_running(pod: &Pod) -> bool {
    first_container_status(pod)
        .and_then(|status| status.state.as_ref())
        .is_some_and(|state| state.running.is_some())
}

fn first_container_ready(pod: &Pod) -> bool {
    first_container_status(pod).is_some_and(|status| status.ready)
}

pub(crate) fn first_container_terminated(pod: &Pod) -> bool {
    pod_exit_code(pod).is_some()
}

/// Exit code of the first terminated container, if any.
pub(crate) fn pod_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| statuses.iter())
        .unwrap_or_default()
        .filter_map(|status| status.state.as_ref())
        .filter_map(|state| state.terminated.as_ref())
        .next()
        .map(|terminated| terminated.exit_code)
}
