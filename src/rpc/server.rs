use crate::constants::{ENV_SIMULATION_WORKER, MANAGEMENT_PORT};
use crate::errors::HarnessError;
use crate::io_models::job::{JobConfig, JobType};
use crate::rpc::proto::lifecycle_server::{Lifecycle, LifecycleServer};
use crate::rpc::proto::{SuiteRequest, SuiteResponse};
use crate::worker::bench::BenchRunner;
use crate::worker::registry;
use crate::worker::scheduler::Scheduler;
use crate::worker::suite::{Capabilities, Suite, SuiteContext};
use anyhow::anyhow;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// Serves the lifecycle surface of a benchmark or simulation worker. The
/// process keeps serving after `Stop`; the coordinator ends it through pod
/// deletion or the job deadline.
pub struct LifecycleService {
    config: JobConfig,
    ordinal: usize,
    runners: Mutex<HashMap<String, SuiteRunner>>,
}

enum SuiteRunner {
    Simulator(Scheduler),
    Benchmark(BenchRunner),
}

impl LifecycleService {
    pub fn new(config: JobConfig) -> Self {
        let ordinal = std::env::var(ENV_SIMULATION_WORKER)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        Self::with_ordinal(config, ordinal)
    }

    pub fn with_ordinal(config: JobConfig, ordinal: usize) -> Self {
        LifecycleService {
            config,
            ordinal,
            runners: Mutex::new(HashMap::new()),
        }
    }

    fn suite(&self, name: &str) -> Result<Arc<dyn Suite>, Status> {
        registry::lookup(name).ok_or_else(|| Status::not_found(format!("unknown suite {name}")))
    }

    fn context(&self, request: &SuiteRequest) -> SuiteContext {
        SuiteContext::new(&self.config, &request.suite, self.ordinal, request.args.clone())
    }

    async fn call_hook(
        &self,
        request: &SuiteRequest,
        capability: Capabilities,
        invoke: impl FnOnce(Arc<dyn Suite>, SuiteContext) -> BoxFuture<'static, anyhow::Result<()>> + Send,
    ) -> Result<Response<SuiteResponse>, Status> {
        let suite = self.suite(&request.suite)?;
        if suite.capabilities().contains(capability) {
            let ctx = self.context(request);
            invoke(suite, ctx)
                .await
                .map_err(|err| user_error(&err))?;
        }

        Ok(Response::new(SuiteResponse {}))
    }

    fn start_simulator(&self, suite: &Arc<dyn Suite>, ctx: SuiteContext) -> Result<SuiteRunner, Status> {
        let mut scheduler = Scheduler::new();
        if suite.capabilities().contains(Capabilities::SCHEDULE) {
            suite.schedule(&ctx, &mut scheduler);
        }
        scheduler.apply_overrides(&self.config.rates, &self.config.jitter);
        scheduler
            .start()
            .map_err(|err| Status::failed_precondition(err.to_string()))?;

        Ok(SuiteRunner::Simulator(scheduler))
    }

    fn start_benchmark(&self, suite: &Arc<dyn Suite>, ctx: SuiteContext, name: &str) -> Result<SuiteRunner, Status> {
        let mut benchmarks = suite.benchmarks();
        let case = match &self.config.benchmark {
            Some(selected) => benchmarks
                .into_iter()
                .find(|case| &case.name == selected)
                .ok_or_else(|| Status::not_found(format!("unknown benchmark {selected} in suite {name}")))?,
            None if benchmarks.len() == 1 => benchmarks.remove(0),
            None => {
                return Err(Status::failed_precondition(format!(
                    "suite {name} has {} benchmarks, a selector is required",
                    benchmarks.len()
                )));
            }
        };

        let iterations = (self.config.iterations > 0).then_some(self.config.iterations);
        Ok(SuiteRunner::Benchmark(BenchRunner::start(
            case.name.clone(),
            case.body,
            ctx,
            self.config.parallelism,
            iterations,
            self.config.max_latency,
        )))
    }
}

#[tonic::async_trait]
impl Lifecycle for LifecycleService {
    async fn setup_suite(&self, request: Request<SuiteRequest>) -> Result<Response<SuiteResponse>, Status> {
        let request = request.into_inner();
        info!("setting up suite {}", request.suite);
        self.call_hook(&request, Capabilities::SETUP_SUITE, |suite, ctx| {
            async move { suite.setup_suite(&ctx).await }.boxed()
        })
        .await
    }

    async fn setup_instance(&self, request: Request<SuiteRequest>) -> Result<Response<SuiteResponse>, Status> {
        let request = request.into_inner();
        info!("setting up instance of suite {}", request.suite);
        self.call_hook(&request, Capabilities::SETUP_INSTANCE, |suite, ctx| {
            async move { suite.setup_instance(&ctx).await }.boxed()
        })
        .await
    }

    async fn start(&self, request: Request<SuiteRequest>) -> Result<Response<SuiteResponse>, Status> {
        let request = request.into_inner();
        let suite = self.suite(&request.suite)?;
        let ctx = self.context(&request);

        let mut runners = self.runners.lock().await;
        if runners.contains_key(&request.suite) {
            // operations are never restartable
            return Err(Status::failed_precondition(format!(
                "suite {} was already started",
                request.suite
            )));
        }

        info!("starting suite {}", request.suite);
        let runner = match self.config.job_type {
            JobType::Simulation => self.start_simulator(&suite, ctx)?,
            JobType::Benchmark => self.start_benchmark(&suite, ctx, &request.suite)?,
            JobType::Test => {
                return Err(Status::failed_precondition("test workers are single-shot"));
            }
        };
        runners.insert(request.suite, runner);

        Ok(Response::new(SuiteResponse {}))
    }

    async fn stop(&self, request: Request<SuiteRequest>) -> Result<Response<SuiteResponse>, Status> {
        let request = request.into_inner();
        info!("stopping suite {}", request.suite);

        let mut runners = self.runners.lock().await;
        match runners.get_mut(&request.suite) {
            Some(SuiteRunner::Simulator(scheduler)) => scheduler.stop().await,
            Some(SuiteRunner::Benchmark(runner)) => runner.stop(),
            None => {
                return Err(Status::failed_precondition(format!(
                    "suite {} is not running",
                    request.suite
                )));
            }
        }

        Ok(Response::new(SuiteResponse {}))
    }

    async fn await_completion(&self, request: Request<SuiteRequest>) -> Result<Response<SuiteResponse>, Status> {
        let request = request.into_inner();

        // Take the completion signal under the lock, await it outside so a
        // concurrent Stop is never blocked.
        let mut done = {
            let runners = self.runners.lock().await;
            match runners.get(&request.suite) {
                Some(SuiteRunner::Benchmark(runner)) => runner.done_signal(),
                Some(SuiteRunner::Simulator(_)) => {
                    return Err(Status::failed_precondition("simulations have no iteration target"));
                }
                None => {
                    return Err(Status::failed_precondition(format!(
                        "suite {} is not running",
                        request.suite
                    )));
                }
            }
        };

        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }

        Ok(Response::new(SuiteResponse {}))
    }

    async fn tear_down_instance(&self, request: Request<SuiteRequest>) -> Result<Response<SuiteResponse>, Status> {
        let request = request.into_inner();
        info!("tearing down instance of suite {}", request.suite);

        let failure = {
            let runners = self.runners.lock().await;
            match runners.get(&request.suite) {
                Some(SuiteRunner::Benchmark(runner)) => runner.take_failure(),
                _ => None,
            }
        };

        let response = self
            .call_hook(&request, Capabilities::TEARDOWN_INSTANCE, |suite, ctx| {
                async move { suite.teardown_instance(&ctx).await }.boxed()
            })
            .await;

        // A recorded run failure wins over a teardown hook error.
        match failure {
            Some(message) => Err(Status::unknown(message)),
            None => response,
        }
    }

    async fn tear_down_suite(&self, request: Request<SuiteRequest>) -> Result<Response<SuiteResponse>, Status> {
        let request = request.into_inner();
        info!("tearing down suite {}", request.suite);
        self.call_hook(&request, Capabilities::TEARDOWN_SUITE, |suite, ctx| {
            async move { suite.teardown_suite(&ctx).await }.boxed()
        })
        .await
    }
}

// Suite hook failures travel as Unknown; the caller turns them back into
// its user-error taxonomy with the suite name attached.
fn user_error(err: &anyhow::Error) -> Status {
    Status::unknown(format!("{err:#}"))
}

/// Binds the management port and serves until the pod is deleted.
pub async fn serve(config: JobConfig) -> Result<(), HarnessError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], MANAGEMENT_PORT));
    info!("serving lifecycle rpc on {addr}");

    Server::builder()
        .add_service(LifecycleServer::new(LifecycleService::new(config)))
        .serve(addr)
        .await
        .map_err(|err| HarnessError::Other(anyhow!("lifecycle server failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::WorkerClient;
    use crate::worker::scheduler::operation;
    use crate::worker::suite::{BenchmarkCase, SuiteResult, body};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio_stream::wrappers::TcpListenerStream;

    async fn spawn_service(config: JobConfig) -> WorkerClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("error binding listener");
        let address = listener.local_addr().expect("error reading local addr").to_string();
        tokio::spawn(
            Server::builder()
                .add_service(LifecycleServer::new(LifecycleService::with_ordinal(config, 0)))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        WorkerClient::connect(address, Duration::from_secs(5))
            .await
            .expect("error connecting to lifecycle service")
    }

    fn lifecycle_code(err: &HarnessError) -> Option<tonic::Code> {
        match err {
            HarnessError::Lifecycle { status, .. } => Some(status.code()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_unknown_suite_is_not_found() {
        let mut config = JobConfig::new("rpc-unknown", JobType::Simulation);
        config.duration = Some(Duration::from_secs(1));
        let client = spawn_service(config).await;

        let err = client.setup_suite("rpc-missing", &[]).await.expect_err("lookup unexpectedly succeeded");

        assert_eq!(lifecycle_code(&err), Some(tonic::Code::NotFound));
    }

    struct HookSuite;

    #[async_trait::async_trait]
    impl Suite for HookSuite {
        fn capabilities(&self) -> Capabilities {
            Capabilities::SETUP_SUITE
        }

        async fn setup_suite(&self, _ctx: &SuiteContext) -> SuiteResult {
            Err(anyhow::anyhow!("hook exploded"))
        }
    }

    #[tokio::test]
    async fn test_hook_errors_surface_as_unknown_and_missing_hooks_are_noops() {
        registry::register("rpc-hooks", HookSuite);
        let mut config = JobConfig::new("rpc-hooks-job", JobType::Simulation);
        config.duration = Some(Duration::from_secs(1));
        let client = spawn_service(config).await;

        // the advertised hook fails and surfaces as a user error
        let err = client.setup_suite("rpc-hooks", &[]).await.expect_err("hook error swallowed");
        assert!(matches!(err, HarnessError::User { .. }));
        assert!(err.to_string().contains("suite rpc-hooks failed"));
        assert!(err.to_string().contains("hook exploded"));

        // hooks outside the capability set are successful no-ops
        client.setup_instance("rpc-hooks", &[]).await.expect("error on no-op hook");
        client.teardown_suite("rpc-hooks", &[]).await.expect("error on no-op hook");
    }

    struct TickSuite {
        fired: Arc<AtomicU64>,
    }

    impl Suite for TickSuite {
        fn capabilities(&self) -> Capabilities {
            Capabilities::SCHEDULE
        }

        fn schedule(&self, _ctx: &SuiteContext, scheduler: &mut Scheduler) {
            let fired = self.fired.clone();
            // the registered rate is deliberately far too slow; the config
            // override must bring it down for this test to observe fires
            scheduler.register(
                "tick",
                Duration::from_secs(600),
                1.0,
                operation(move || {
                    let fired = fired.clone();
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }
    }

    #[tokio::test]
    async fn test_simulation_start_applies_overrides_and_stop_is_terminal() {
        // setup:
        let fired = Arc::new(AtomicU64::new(0));
        registry::register("rpc-ticks", TickSuite { fired: fired.clone() });
        let mut config = JobConfig::new("rpc-ticks-job", JobType::Simulation);
        config.duration = Some(Duration::from_secs(1));
        config.rates.insert("tick".to_string(), Duration::from_millis(1));
        let client = spawn_service(config).await;

        // execute:
        client.start("rpc-ticks").await.expect("error starting suite");
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.stop("rpc-ticks").await.expect("error stopping suite");

        // verify: the override made the operation fire, stop froze it
        let after_stop = fired.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_stop);

        // a second start is rejected, the suite is terminal
        let err = client.start("rpc-ticks").await.expect_err("restart unexpectedly accepted");
        assert_eq!(lifecycle_code(&err), Some(tonic::Code::FailedPrecondition));
    }

    struct QuickBench;

    impl Suite for QuickBench {
        fn benchmarks(&self) -> Vec<BenchmarkCase> {
            vec![BenchmarkCase {
                name: "writes".to_string(),
                body: body(|_ctx| async { Ok(()) }),
            }]
        }
    }

    #[tokio::test]
    async fn test_benchmark_runs_to_iteration_target() {
        registry::register("rpc-bench", QuickBench);
        let mut config = JobConfig::new("rpc-bench-job", JobType::Benchmark);
        config.iterations = 25;
        config.parallelism = 2;
        let client = spawn_service(config).await;

        client.start("rpc-bench").await.expect("error starting benchmark");
        client.await_completion("rpc-bench").await.expect("error awaiting completion");
        client.stop("rpc-bench").await.expect("error stopping benchmark");
        client
            .teardown_instance("rpc-bench", &[])
            .await
            .expect("clean benchmark reported a failure");
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_precondition_failure() {
        registry::register("rpc-idle", QuickBench);
        let mut config = JobConfig::new("rpc-idle-job", JobType::Benchmark);
        config.iterations = 1;
        let client = spawn_service(config).await;

        let err = client.stop("rpc-idle").await.expect_err("stop on idle suite accepted");
        assert_eq!(lifecycle_code(&err), Some(tonic::Code::FailedPrecondition));
    }
}
