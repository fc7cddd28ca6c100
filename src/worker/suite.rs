use crate::io_models::job::JobConfig;
use crate::worker::scheduler::Scheduler;
use bitflags::bitflags;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

bitflags! {
    /// Optional lifecycle hooks a suite implements. The RPC server queries
    /// the set before invoking a hook; a missing capability is a successful
    /// no-op.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const SETUP_SUITE       = 1 << 0;
        const SETUP_INSTANCE    = 1 << 1;
        const TEARDOWN_INSTANCE = 1 << 2;
        const TEARDOWN_SUITE    = 1 << 3;
        const SCHEDULE          = 1 << 4;
    }
}

/// Call context passed explicitly to every lifecycle hook and body.
#[derive(Debug, Clone)]
pub struct SuiteContext {
    pub job: String,
    pub suite: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Ordinal of this worker within its sub-job.
    pub worker: usize,
    pub workers: usize,
}

impl SuiteContext {
    pub fn new(config: &JobConfig, suite: &str, worker: usize, args: Vec<String>) -> Self {
        SuiteContext {
            job: config.id.clone(),
            suite: suite.to_string(),
            args,
            env: config.env.clone(),
            secrets: config.secrets.clone(),
            timeout: config.timeout,
            worker,
            workers: config.worker_count(),
        }
    }

    /// The leader runs suite-scope setup and teardown exactly once.
    pub fn is_leader(&self) -> bool {
        self.worker == 0
    }
}

pub type SuiteResult = anyhow::Result<()>;

/// An async body taking the call context, shared by tests and benchmarks.
pub type AsyncBody = Arc<dyn Fn(SuiteContext) -> BoxFuture<'static, SuiteResult> + Send + Sync>;

/// Wraps an async function into a registrable body.
pub fn body<F, Fut>(f: F) -> AsyncBody
where
    F: Fn(SuiteContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SuiteResult> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

pub struct TestCase {
    pub name: String,
    pub body: AsyncBody,
}

pub struct BenchmarkCase {
    pub name: String,
    pub body: AsyncBody,
}

/// A named unit of work: tests, benchmarks, or simulator operations.
///
/// Suites are registered once at program start and looked up by name from
/// both the single-shot runner and the lifecycle RPC server. Hooks default
/// to no-ops; implementors advertise the ones they carry via
/// [`Suite::capabilities`].
#[async_trait::async_trait]
pub trait Suite: Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    async fn setup_suite(&self, _ctx: &SuiteContext) -> SuiteResult {
        Ok(())
    }

    async fn setup_instance(&self, _ctx: &SuiteContext) -> SuiteResult {
        Ok(())
    }

    async fn teardown_instance(&self, _ctx: &SuiteContext) -> SuiteResult {
        Ok(())
    }

    async fn teardown_suite(&self, _ctx: &SuiteContext) -> SuiteResult {
        Ok(())
    }

    /// Registers simulator operations. Only consulted when `SCHEDULE` is
    /// advertised.
    fn schedule(&self, _ctx: &SuiteContext, _scheduler: &mut Scheduler) {}

    /// Test bodies, run in-process by single-shot workers.
    fn tests(&self) -> Vec<TestCase> {
        Vec::new()
    }

    /// Benchmark bodies, driven by the benchmark runner.
    fn benchmarks(&self) -> Vec<BenchmarkCase> {
        Vec::new()
    }
}
