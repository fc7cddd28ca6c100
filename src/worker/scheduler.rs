//! Jittered operation scheduler for simulation workers. One cooperative task
//! per registered operation; a single per-worker mutex serialises bodies.

use futures::future::BoxFuture;
use rand::Rng;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Body of a scheduled simulator operation; the call context is captured at
/// registration time.
pub type OperationFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wraps an async function into a registrable operation body.
pub fn operation<F, Fut>(f: F) -> OperationFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

struct Operation {
    rate: Duration,
    jitter: f64,
    body: OperationFn,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler was stopped and cannot be restarted")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

pub struct Scheduler {
    operations: BTreeMap<String, Operation>,
    exclusion: Arc<Mutex<()>>,
    cancel: CancellationToken,
    state: State,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            operations: BTreeMap::new(),
            exclusion: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
            state: State::Idle,
        }
    }

    /// Registers `body` to fire every `rate`, spread by a uniform jitter
    /// factor. Re-registering a name replaces the previous operation.
    pub fn register(&mut self, name: impl Into<String>, rate: Duration, jitter: f64, body: OperationFn) {
        self.operations.insert(name.into(), Operation { rate, jitter, body });
    }

    /// Applies per-operation overrides from the job config. Names with no
    /// registered operation are ignored.
    pub fn apply_overrides(&mut self, rates: &BTreeMap<String, Duration>, jitter: &BTreeMap<String, f64>) {
        for (name, rate) in rates {
            match self.operations.get_mut(name) {
                Some(operation) => operation.rate = *rate,
                None => warn!("rate override for unknown operation {name}"),
            }
        }
        for (name, factor) in jitter {
            match self.operations.get_mut(name) {
                Some(operation) => operation.jitter = *factor,
                None => warn!("jitter override for unknown operation {name}"),
            }
        }
    }

    /// Spawns one task per operation. Rejected once the scheduler has been
    /// stopped; operations are never restartable.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        match self.state {
            State::Running => return Err(SchedulerError::AlreadyRunning),
            State::Stopped => return Err(SchedulerError::Stopped),
            State::Idle => {}
        }

        for (name, operation) in &self.operations {
            tokio::spawn(run_operation(
                name.clone(),
                operation.rate,
                operation.jitter,
                operation.body.clone(),
                self.exclusion.clone(),
                self.cancel.clone(),
            ));
        }
        self.state = State::Running;

        Ok(())
    }

    /// Cancels every operation task. On return no body is mid-flight and no
    /// new body will start; the scheduler is terminal.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        // Taking the exclusion mutex once proves any in-flight body finished.
        drop(self.exclusion.lock().await);
        self.state = State::Stopped;
    }

    #[cfg(test)]
    fn operation(&self, name: &str) -> Option<(Duration, f64)> {
        self.operations.get(name).map(|op| (op.rate, op.jitter))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_operation(
    name: String,
    rate: Duration,
    jitter: f64,
    body: OperationFn,
    exclusion: Arc<Mutex<()>>,
    cancel: CancellationToken,
) {
    loop {
        let wait = jittered_wait(rate, jitter);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let _guard = exclusion.lock().await;
        // The stop signal may have fired while queued behind another body.
        if cancel.is_cancelled() {
            return;
        }
        if let Err(err) = (body)().await {
            warn!("operation {name} failed: {err:#}");
        }
    }
}

/// Next firing delay: `rate + u * jitter * rate` with `u` uniform in [0, 1).
/// A non-positive factor degenerates to a fixed cadence, so it is widened to
/// a full rate of spread.
fn jittered_wait(rate: Duration, jitter: f64) -> Duration {
    let jitter = if jitter <= 0.0 { 1.0 } else { jitter };
    let u: f64 = rand::rng().random();
    rate + rate.mul_f64(u * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[test]
    fn test_jittered_wait_bounds() {
        let rate = Duration::from_secs(1);

        for _ in 0..1000 {
            let wait = jittered_wait(rate, 0.5);
            assert!(wait >= rate);
            assert!(wait <= rate.mul_f64(1.5));
        }

        // non-positive jitter widens to one full rate of spread
        for _ in 0..1000 {
            let wait = jittered_wait(rate, 0.0);
            assert!(wait >= rate);
            assert!(wait <= rate * 2);
        }
    }

    #[test]
    fn test_overrides_replace_registered_values() {
        let mut scheduler = Scheduler::new();
        scheduler.register("put", Duration::from_secs(5), 0.2, operation(|| async { Ok(()) }));

        let rates = BTreeMap::from([
            ("put".to_string(), Duration::from_secs(2)),
            ("missing".to_string(), Duration::from_secs(1)),
        ]);
        let jitter = BTreeMap::from([("put".to_string(), 0.5)]);
        scheduler.apply_overrides(&rates, &jitter);

        assert_eq!(scheduler.operation("put"), Some((Duration::from_secs(2), 0.5)));
        assert!(scheduler.operation("missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_bodies_never_overlap() {
        // setup: two fast operations sharing an in-flight flag
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicU64::new(0));

        let mut scheduler = Scheduler::new();
        for name in ["a", "b"] {
            let in_flight = in_flight.clone();
            let overlapped = overlapped.clone();
            let fired = fired.clone();
            scheduler.register(
                name,
                Duration::from_millis(1),
                1.0,
                operation(move || {
                    let in_flight = in_flight.clone();
                    let overlapped = overlapped.clone();
                    let fired = fired.clone();
                    async move {
                        if in_flight.swap(true, Ordering::SeqCst) {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        in_flight.store(false, Ordering::SeqCst);
                        fired.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }

        // execute:
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        // verify:
        assert!(fired.load(Ordering::SeqCst) > 0);
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_terminal_and_silences_operations() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut scheduler = Scheduler::new();
        {
            let fired = fired.clone();
            scheduler.register(
                "tick",
                Duration::from_millis(1),
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

        scheduler.start().unwrap();
        assert_eq!(scheduler.start(), Err(SchedulerError::AlreadyRunning));
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;

        // no body begins after stop returns
        let after_stop = fired.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_stop);

        // a stopped scheduler is terminal
        assert_eq!(scheduler.start(), Err(SchedulerError::Stopped));
    }
}
