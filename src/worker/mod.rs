//! In-pod worker runtime: waits for the ready gate the launcher releases,
//! loads the job config, then either runs the selected suites single-shot
//! (test) or serves the lifecycle RPC (benchmark, simulation).

pub mod bench;
pub mod registry;
pub mod scheduler;
pub mod suite;

use crate::constants::{CONFIG_PATH, ENV_SIMULATION_WORKER, JOB_READY_FILE};
use crate::errors::HarnessError;
use crate::io_models::job::{JobConfig, JobType};
use crate::progress;
use crate::rpc;
use crate::worker::suite::{Capabilities, Suite, SuiteContext};
use std::path::Path;
use std::time::Duration;

pub async fn run() -> Result<i32, HarnessError> {
    let hint = await_ready_gate(Path::new(JOB_READY_FILE)).await;
    change_working_dir(&hint);
    let config = load_config(Path::new(CONFIG_PATH))?;

    run_with_config(config).await
}

/// Polls at 1 Hz until the launcher releases the gate. Returns the gate
/// content, the context basename hint.
pub(crate) async fn await_ready_gate(path: &Path) -> String {
    loop {
        match std::fs::read_to_string(path) {
            Ok(contents) => return contents.trim().to_string(),
            Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
        }
    }
}

fn change_working_dir(hint: &str) {
    if hint.is_empty() {
        return;
    }
    let dir = Path::new(hint);
    if dir.is_dir() {
        if let Err(err) = std::env::set_current_dir(dir) {
            warn!("cannot change into context directory {hint}: {err}");
        }
    }
}

pub(crate) fn load_config(path: &Path) -> Result<JobConfig, HarnessError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| HarnessError::Config(format!("cannot read job config {}: {err}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|err| HarnessError::Config(format!("cannot parse job config {}: {err}", path.display())))
}

pub(crate) async fn run_with_config(config: JobConfig) -> Result<i32, HarnessError> {
    match config.job_type {
        JobType::Test => run_tests(&config).await,
        JobType::Benchmark | JobType::Simulation => {
            rpc::server::serve(config).await?;
            Ok(0)
        }
    }
}

/// Runs the selected suites in-process; the exit code reflects aggregated
/// pass/fail.
pub(crate) async fn run_tests(config: &JobConfig) -> Result<i32, HarnessError> {
    let selectors = config.suite_selectors();
    let suites = if selectors.is_empty() { registry::names() } else { selectors };
    if suites.is_empty() {
        return Err(HarnessError::Config("no suites selected and none registered".to_string()));
    }

    let ordinal = worker_ordinal();
    let mut failures = 0u32;
    for name in suites {
        let Some(suite) = registry::lookup(&name) else {
            error!("suite {name} is not registered");
            failures += 1;
            continue;
        };
        let ctx = SuiteContext::new(config, &name, ordinal, config.args.clone());
        match run_suite_tests(config, suite.as_ref(), &ctx).await {
            Ok(failed) => failures += failed,
            Err(err) => {
                error!("{err}");
                failures += 1;
            }
        }
    }

    Ok(if failures > 0 { 1 } else { 0 })
}

/// One single-shot worker is both the suite leader and its only instance:
/// it runs suite-scope and instance-scope hooks around its test cases.
async fn run_suite_tests(
    config: &JobConfig,
    suite: &dyn Suite,
    ctx: &SuiteContext,
) -> Result<u32, HarnessError> {
    let capabilities = suite.capabilities();
    if capabilities.contains(Capabilities::SETUP_SUITE) {
        suite.setup_suite(ctx).await.map_err(|err| user_failure(&ctx.suite, &err))?;
    }
    if capabilities.contains(Capabilities::SETUP_INSTANCE) {
        suite.setup_instance(ctx).await.map_err(|err| user_failure(&ctx.suite, &err))?;
    }

    let mut failed = 0u32;
    for case in suite.tests() {
        if !config.tests.is_empty() && !config.tests.contains(&case.name) {
            continue;
        }
        let result = progress::step(&format!("Run test {}", case.name), (case.body)(ctx.clone())).await;
        if result.is_err() {
            failed += 1;
        }
    }

    // teardown hooks run even after failed cases
    if capabilities.contains(Capabilities::TEARDOWN_INSTANCE) {
        if let Err(err) = suite.teardown_instance(ctx).await {
            warn!("instance teardown of suite {} failed: {err:#}", ctx.suite);
        }
    }
    if capabilities.contains(Capabilities::TEARDOWN_SUITE) {
        if let Err(err) = suite.teardown_suite(ctx).await {
            warn!("teardown of suite {} failed: {err:#}", ctx.suite);
        }
    }

    Ok(failed)
}

fn user_failure(suite: &str, err: &anyhow::Error) -> HarnessError {
    HarnessError::User {
        suite: suite.to_string(),
        message: format!("{err:#}"),
    }
}

fn worker_ordinal() -> usize {
    std::env::var(ENV_SIMULATION_WORKER)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::suite::{SuiteResult, TestCase, body};
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_await_ready_gate_returns_hint() {
        let dir = tempfile::tempdir().expect("error creating temporary dir");
        let gate = dir.path().join("job-ready");
        fs::write(&gate, "charts\n").expect("error writing gate file");

        assert_eq!(await_ready_gate(&gate).await, "charts");
    }

    #[test]
    fn test_load_config_rejects_garbage() {
        let dir = tempfile::tempdir().expect("error creating temporary dir");
        let path = dir.path().join("job.json");

        fs::write(&path, "{not json").expect("error writing config");
        assert!(load_config(&path).is_err());

        fs::write(
            &path,
            r#"{"id":"a-b","namespace":"a-b","type":"test","image":"r:l","timeout":60000000000}"#,
        )
        .expect("error writing config");
        let config = load_config(&path).expect("error loading config");
        assert_eq!(config.id, "a-b");
    }

    struct CountingSuite {
        setups: Arc<AtomicU32>,
        teardowns: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Suite for CountingSuite {
        fn capabilities(&self) -> Capabilities {
            Capabilities::SETUP_INSTANCE | Capabilities::TEARDOWN_INSTANCE
        }

        async fn setup_instance(&self, _ctx: &SuiteContext) -> SuiteResult {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn teardown_instance(&self, _ctx: &SuiteContext) -> SuiteResult {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn tests(&self) -> Vec<TestCase> {
            vec![
                TestCase {
                    name: "pass".to_string(),
                    body: body(|_ctx| async { Ok(()) }),
                },
                TestCase {
                    name: "fail".to_string(),
                    body: body(|_ctx| async { Err(anyhow::anyhow!("expected failure")) }),
                },
            ]
        }
    }

    #[tokio::test]
    async fn test_run_tests_aggregates_failures_and_filters() {
        // setup:
        let setups = Arc::new(AtomicU32::new(0));
        let teardowns = Arc::new(AtomicU32::new(0));
        registry::register(
            "worker-counting",
            CountingSuite {
                setups: setups.clone(),
                teardowns: teardowns.clone(),
            },
        );
        let mut config = JobConfig::new("alpha-bee", JobType::Test);
        config.image = "runner:latest".to_string();
        config.suite = Some("worker-counting".to_string());

        // execute: one passing and one failing case
        let code = run_tests(&config).await.expect("error running tests");

        // verify: non-zero exit, hooks ran exactly once
        assert_eq!(code, 1);
        assert_eq!(setups.load(Ordering::SeqCst), 1);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);

        // selecting only the passing case yields success
        config.tests = vec!["pass".to_string()];
        let code = run_tests(&config).await.expect("error running tests");
        assert_eq!(code, 0);
    }

    struct BrokenSetupSuite;

    #[async_trait::async_trait]
    impl Suite for BrokenSetupSuite {
        fn capabilities(&self) -> Capabilities {
            Capabilities::SETUP_INSTANCE
        }

        async fn setup_instance(&self, _ctx: &SuiteContext) -> SuiteResult {
            Err(anyhow::anyhow!("instance setup exploded"))
        }
    }

    #[tokio::test]
    async fn test_run_tests_surfaces_setup_failures_as_user_errors() {
        registry::register("worker-broken-setup", BrokenSetupSuite);
        let mut config = JobConfig::new("alpha-bee", JobType::Test);
        config.image = "runner:latest".to_string();
        config.suite = Some("worker-broken-setup".to_string());

        let ctx = SuiteContext::new(&config, "worker-broken-setup", 0, Vec::new());
        let err = run_suite_tests(&config, &BrokenSetupSuite, &ctx)
            .await
            .expect_err("setup failure swallowed");
        assert!(matches!(err, HarnessError::User { .. }));
        assert!(err.to_string().contains("instance setup exploded"));

        assert_eq!(run_tests(&config).await.expect("error running tests"), 1);
    }

    #[tokio::test]
    async fn test_run_tests_fails_on_unregistered_suite() {
        let mut config = JobConfig::new("alpha-bee", JobType::Test);
        config.image = "runner:latest".to_string();
        config.suite = Some("worker-missing".to_string());

        assert_eq!(run_tests(&config).await.expect("error running tests"), 1);
    }
}
