//! Benchmark runner for RPC-driven benchmark workers. `Start` spawns the
//! runner; it stops at the iteration target, on cancel, or after a recorded
//! failure.

use crate::worker::suite::{AsyncBody, SuiteContext};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Outcome of a finished benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchReport {
    pub iterations: u64,
    pub mean_latency: Duration,
}

struct BenchState {
    iterations: AtomicU64,
    latency_nanos: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl BenchState {
    fn record_failure(&self, message: String) {
        let mut failure = self.failure.lock().unwrap();
        if failure.is_none() {
            *failure = Some(message);
        }
    }

    fn report(&self) -> BenchReport {
        let iterations = self.iterations.load(Ordering::SeqCst);
        let total = self.latency_nanos.load(Ordering::SeqCst);
        let mean_latency = if iterations == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total / iterations)
        };
        BenchReport { iterations, mean_latency }
    }
}

pub struct BenchRunner {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    state: Arc<BenchState>,
}

impl BenchRunner {
    /// Spawns `parallelism` concurrent callers of `body` and returns
    /// immediately. `iterations` of `None` means "run until stopped".
    pub fn start(
        name: String,
        body: AsyncBody,
        ctx: SuiteContext,
        parallelism: usize,
        iterations: Option<u64>,
        max_latency: Option<Duration>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let state = Arc::new(BenchState {
            iterations: AtomicU64::new(0),
            latency_nanos: AtomicU64::new(0),
            failure: Mutex::new(None),
        });

        let supervisor_state = state.clone();
        let supervisor_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut callers = JoinSet::new();
            for _ in 0..parallelism.max(1) {
                callers.spawn(run_caller(
                    name.clone(),
                    body.clone(),
                    ctx.clone(),
                    iterations,
                    max_latency,
                    supervisor_state.clone(),
                    supervisor_cancel.clone(),
                ));
            }
            while callers.join_next().await.is_some() {}

            let report = supervisor_state.report();
            info!(
                "benchmark {name}: {} iterations, mean latency {:?}",
                report.iterations, report.mean_latency
            );
            let _ = done_tx.send(true);
        });

        BenchRunner { cancel, done: done_rx, state }
    }

    /// Completion signal, `true` once every caller has finished. Cloneable
    /// so waiters never hold a reference to the runner across an await.
    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }

    /// Resolves once every caller has finished.
    pub async fn await_completion(&self) {
        let mut done = self.done_signal();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signals cancel; callers finish their in-flight call and exit.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// First recorded failure (body error or latency breach), if any.
    pub fn take_failure(&self) -> Option<String> {
        self.state.failure.lock().unwrap().take()
    }

    pub fn report(&self) -> BenchReport {
        self.state.report()
    }
}

async fn run_caller(
    name: String,
    body: AsyncBody,
    ctx: SuiteContext,
    iterations: Option<u64>,
    max_latency: Option<Duration>,
    state: Arc<BenchState>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if let Some(target) = iterations {
            if state.iterations.load(Ordering::SeqCst) >= target {
                return;
            }
        }

        let started = tokio::time::Instant::now();
        let result = (body)(ctx.clone()).await;
        let latency = started.elapsed();

        state.iterations.fetch_add(1, Ordering::SeqCst);
        state.latency_nanos.fetch_add(latency.as_nanos() as u64, Ordering::SeqCst);

        if let Err(err) = result {
            state.record_failure(format!("benchmark {name} failed: {err:#}"));
            return;
        }
        if let Some(max) = max_latency {
            if latency > max {
                state.record_failure(format!(
                    "benchmark {name} exceeded max latency: {latency:?} > {max:?}"
                ));
                return;
            }
        }
    }
}
