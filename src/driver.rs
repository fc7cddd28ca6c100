//! Driver-side submission: provisions the job namespace, launches the single
//! in-cluster entry pod (the coordinator, or a single-shot worker for test
//! jobs), streams its logs, propagates its exit code, and tears the
//! namespace down.

use crate::errors::HarnessError;
use crate::io_models::job::{JobConfig, JobType};
use crate::launcher::{Launcher, Worker};
use crate::{coordinator, provisioner};

/// Submits one job and returns the driver's exit code.
pub async fn submit(client: kube::Client, config: JobConfig) -> Result<i32, HarnessError> {
    config.validate()?;

    // a mid-provisioning failure still tears the namespace down
    if let Err(err) = provisioner::provision(&client, &config).await {
        if let Err(teardown_err) = provisioner::teardown(&client, &config).await {
            warn!("teardown of {} also failed after provisioning error: {teardown_err}", config.id);
        }
        return Err(err);
    }
    let result = submit_inner(&client, &config).await;
    let teardown = provisioner::teardown(&client, &config).await;

    match (result, teardown) {
        (Ok(code), Ok(())) => Ok(code),
        (Ok(_), Err(teardown_err)) => Err(teardown_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(teardown_err)) => {
            warn!("teardown of {} also failed after primary error: {teardown_err}", config.id);
            Err(err)
        }
    }
}

async fn submit_inner(client: &kube::Client, config: &JobConfig) -> Result<i32, HarnessError> {
    let launcher = Launcher::new(client.clone(), config.clone());
    let entry = match config.job_type {
        // test jobs run their suites in the submitted pod itself
        JobType::Test => Worker::worker(0),
        JobType::Benchmark | JobType::Simulation => Worker::coordinator(),
    };

    let pod = launcher.launch(&entry).await?;
    launcher.stream_logs(&entry, pod.clone());

    // the pod's exit code is the job's status, propagated verbatim
    coordinator::await_pod_exit(&launcher.pods(), &pod, config.timeout).await
}
