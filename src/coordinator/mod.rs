//! Fan-out orchestrator. For each selected suite the coordinator provisions
//! a sub-job namespace, launches its workers in parallel, then drives the
//! lifecycle phases: suite setup on the leader, instance setup on every
//! worker, start, the run wait, stop, and teardown. Teardown always runs;
//! the first error wins.

use crate::errors::HarnessError;
use crate::io_models::job::{JobConfig, JobType, RunWait};
use crate::launcher::{Launcher, Worker, first_container_terminated, pod_exit_code};
use crate::provisioner;
use crate::rpc;
use crate::rpc::client::WorkerClient;
use crate::worker::registry;
use anyhow::anyhow;
use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::runtime::wait::await_condition;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

/// Runs every selected suite to completion and returns the process exit
/// code: the first non-zero suite status wins, a hard error stops the run.
pub async fn run(client: kube::Client, config: JobConfig) -> Result<i32, HarnessError> {
    config.validate()?;
    let config = resolve_local_paths(config);

    let selectors = config.suite_selectors();
    let suites = if selectors.is_empty() { registry::names() } else { selectors };
    if suites.is_empty() {
        return Err(HarnessError::Config("no suites selected and none registered".to_string()));
    }

    let mut status = 0;
    for suite in suites {
        let code = run_suite(&client, &config, &suite).await?;
        if status == 0 {
            status = code;
        }
    }

    Ok(status)
}

/// Inside the coordinator pod the injected payloads live under `/` by their
/// basenames; re-root paths that do not resolve from here.
fn resolve_local_paths(mut config: JobConfig) -> JobConfig {
    let resolve = |path: String| -> String {
        if Path::new(&path).exists() {
            return path;
        }
        let rooted = Path::new("/").join(&path);
        if rooted.exists() {
            rooted.to_string_lossy().into_owned()
        } else {
            path
        }
    };

    config.executable = config.executable.map(&resolve);
    config.context = config.context.map(&resolve);
    config.value_files = config
        .value_files
        .into_iter()
        .map(|(release, files)| (release, files.into_iter().map(&resolve).collect()))
        .collect();

    config
}

async fn run_suite(client: &kube::Client, config: &JobConfig, suite: &str) -> Result<i32, HarnessError> {
    let sub = config.sub_job(suite);
    info!("running suite {suite} as job {}", sub.id);

    // a mid-provisioning failure still tears the sub-job namespace down
    if let Err(err) = provisioner::provision(client, &sub).await {
        if let Err(teardown_err) = provisioner::teardown(client, &sub).await {
            warn!("teardown of {} also failed after provisioning error: {teardown_err}", sub.id);
        }
        return Err(err);
    }
    let result = run_suite_inner(client, &sub, suite).await;
    let teardown = provisioner::teardown(client, &sub).await;

    match (result, teardown) {
        (Ok(code), Ok(())) => Ok(code),
        (Ok(_), Err(teardown_err)) => Err(teardown_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(teardown_err)) => {
            warn!("teardown of {} also failed after primary error: {teardown_err}", sub.id);
            Err(err)
        }
    }
}

async fn run_suite_inner(client: &kube::Client, sub: &JobConfig, suite: &str) -> Result<i32, HarnessError> {
    let launcher = Launcher::new(client.clone(), sub.clone());
    let count = sub.worker_count();

    // launch all workers in parallel; the first error wins once all joined
    let mut tasks = JoinSet::new();
    for ordinal in 0..count {
        let launcher = launcher.clone();
        tasks.spawn(async move {
            let worker = Worker::worker(ordinal);
            launcher.launch(&worker).await.map(|pod| (ordinal, pod))
        });
    }
    let mut pods = vec![String::new(); count];
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((ordinal, pod))) => pods[ordinal] = pod,
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(HarnessError::Other(anyhow!("launch task failed: {join_err}")));
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    for (ordinal, pod) in pods.iter().enumerate() {
        launcher.stream_logs(&Worker::worker(ordinal), pod.clone());
    }

    match sub.job_type {
        JobType::Test => {
            let api = launcher.pods();
            let mut status = 0;
            for pod in &pods {
                let code = await_pod_exit(&api, pod, sub.timeout).await?;
                if status == 0 && code != 0 {
                    status = code;
                }
            }
            Ok(status)
        }
        JobType::Benchmark | JobType::Simulation => {
            let addresses = (0..count).map(|ordinal| rpc::worker_address(ordinal, &sub.namespace)).collect();
            let pool = Arc::new(WorkerPool::new(addresses, sub.timeout));
            run_lifecycle(&pool, sub, suite).await
        }
    }
}

/// Waits for the pod's main container to terminate and returns its exit
/// code. A pod that disappears counts as a failure.
pub(crate) async fn await_pod_exit(
    pods: &Api<Pod>,
    pod: &str,
    timeout: Duration,
) -> Result<i32, HarnessError> {
    let done = |pod: Option<&Pod>| pod.is_none_or(first_container_terminated);
    let observed = tokio::time::timeout(timeout, await_condition(pods.clone(), pod, done))
        .await
        .map_err(|_| HarnessError::ReadinessTimeout {
            resource: format!("completion of pod {pod}"),
            timeout,
        })?
        .map_err(|err| HarnessError::Other(anyhow!("watch on pod {pod} failed: {err}")))?;

    Ok(observed.as_ref().and_then(pod_exit_code).unwrap_or(1))
}

/// Lazily connected, cached clients for one sub-job's workers.
pub(crate) struct WorkerPool {
    addresses: Vec<String>,
    timeout: Duration,
    clients: Mutex<HashMap<usize, WorkerClient>>,
}

impl WorkerPool {
    pub(crate) fn new(addresses: Vec<String>, timeout: Duration) -> Self {
        WorkerPool {
            addresses,
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.addresses.len()
    }

    pub(crate) async fn client(&self, ordinal: usize) -> Result<WorkerClient, HarnessError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&ordinal) {
            return Ok(client.clone());
        }

        let client = WorkerClient::connect(self.addresses[ordinal].clone(), self.timeout).await?;
        clients.insert(ordinal, client.clone());

        Ok(client)
    }
}

/// The fixed phase sequence over one suite's workers. Teardown phases always
/// run; their error only surfaces when the run itself succeeded.
pub(crate) async fn run_lifecycle(
    pool: &Arc<WorkerPool>,
    sub: &JobConfig,
    suite: &str,
) -> Result<i32, HarnessError> {
    let primary = run_phases(pool, sub, suite).await;
    let teardown = teardown_phases(pool, sub, suite).await;

    match (primary, teardown) {
        (Ok(()), Ok(())) => Ok(0),
        (Ok(()), Err(teardown_err)) => Err(teardown_err),
        (Err(err), teardown) => {
            if let Err(teardown_err) = teardown {
                warn!("lifecycle teardown of suite {suite} failed after primary error: {teardown_err}");
            }
            Err(err)
        }
    }
}

async fn run_phases(pool: &Arc<WorkerPool>, sub: &JobConfig, suite: &str) -> Result<(), HarnessError> {
    let args = sub.args.clone();

    // suite-scope setup on the leader only
    pool.client(0).await?.setup_suite(suite, &args).await?;

    {
        let suite = suite.to_string();
        let args = args.clone();
        fan_out(pool, move |client, _| {
            let suite = suite.clone();
            let args = args.clone();
            async move { client.setup_instance(&suite, &args).await }.boxed()
        })
        .await?;
    }

    {
        let suite = suite.to_string();
        fan_out(pool, move |client, _| {
            let suite = suite.clone();
            async move { client.start(&suite).await }.boxed()
        })
        .await?;
    }

    match sub.run_wait() {
        RunWait::Duration(duration) => {
            info!("running suite {suite} for {duration:?}");
            tokio::time::sleep(duration).await;
        }
        RunWait::Iterations => {
            info!("running suite {suite} to its iteration target");
            let suite_name = suite.to_string();
            fan_out(pool, move |client, _| {
                let suite = suite_name.clone();
                async move { client.await_completion(&suite).await }.boxed()
            })
            .await?;
        }
    }

    {
        let suite = suite.to_string();
        fan_out(pool, move |client, _| {
            let suite = suite.clone();
            async move { client.stop(&suite).await }.boxed()
        })
        .await?;
    }

    Ok(())
}

async fn teardown_phases(pool: &Arc<WorkerPool>, sub: &JobConfig, suite: &str) -> Result<(), HarnessError> {
    {
        let suite = suite.to_string();
        let args = sub.args.clone();
        fan_out(pool, move |client, _| {
            let suite = suite.clone();
            let args = args.clone();
            async move { client.teardown_instance(&suite, &args).await }.boxed()
        })
        .await?;
    }

    pool.client(0).await?.teardown_suite(suite, &sub.args).await?;

    Ok(())
}

/// Calls `f` once per worker in parallel. Errors are collected on a channel;
/// the first one wins, returned only after every task joined.
async fn fan_out<F>(pool: &Arc<WorkerPool>, f: F) -> Result<(), HarnessError>
where
    F: Fn(WorkerClient, usize) -> BoxFuture<'static, Result<(), HarnessError>> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let (tx, mut rx) = mpsc::channel::<HarnessError>(pool.len().max(1));
    let mut tasks = JoinSet::new();
    for ordinal in 0..pool.len() {
        let pool = Arc::clone(pool);
        let f = Arc::clone(&f);
        let tx = tx.clone();
        tasks.spawn(async move {
            let result = match pool.client(ordinal).await {
                Ok(client) => f(client, ordinal).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                let _ = tx.send(err).await;
            }
        });
    }
    drop(tx);

    while tasks.join_next().await.is_some() {}

    match rx.recv().await {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
