use crate::errors::HarnessError;
use crate::rpc::proto::SuiteRequest;
use crate::rpc::proto::lifecycle_client::LifecycleClient;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// One cached channel to a worker's management port. Every call carries the
/// job-wide timeout; the deadline does not leak across invocations.
#[derive(Clone)]
pub struct WorkerClient {
    worker: String,
    inner: LifecycleClient<Channel>,
}

impl WorkerClient {
    pub async fn connect(address: String, timeout: Duration) -> Result<Self, HarnessError> {
        let endpoint = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|err| HarnessError::Config(format!("invalid worker address {address}: {err}")))?
            .connect_timeout(timeout)
            .timeout(timeout);
        let channel = endpoint.connect().await.map_err(|source| HarnessError::Transport {
            worker: address.clone(),
            source,
        })?;

        Ok(WorkerClient {
            worker: address,
            inner: LifecycleClient::new(channel),
        })
    }

    fn request(&self, suite: &str, args: &[String]) -> SuiteRequest {
        SuiteRequest {
            suite: suite.to_string(),
            args: args.to_vec(),
        }
    }

    fn lifecycle_error(&self, method: &'static str, suite: &str, status: tonic::Status) -> HarnessError {
        // the worker wraps suite hook failures in Unknown; every other code
        // is a transport or protocol failure
        if status.code() == tonic::Code::Unknown {
            return HarnessError::User {
                suite: suite.to_string(),
                message: status.message().to_string(),
            };
        }
        HarnessError::Lifecycle {
            method,
            worker: self.worker.clone(),
            status,
        }
    }

    pub async fn setup_suite(&self, suite: &str, args: &[String]) -> Result<(), HarnessError> {
        let mut client = self.inner.clone();
        client
            .setup_suite(self.request(suite, args))
            .await
            .map(|_| ())
            .map_err(|status| self.lifecycle_error("SetupSuite", suite, status))
    }

    pub async fn setup_instance(&self, suite: &str, args: &[String]) -> Result<(), HarnessError> {
        let mut client = self.inner.clone();
        client
            .setup_instance(self.request(suite, args))
            .await
            .map(|_| ())
            .map_err(|status| self.lifecycle_error("SetupInstance", suite, status))
    }

    pub async fn start(&self, suite: &str) -> Result<(), HarnessError> {
        let mut client = self.inner.clone();
        client
            .start(self.request(suite, &[]))
            .await
            .map(|_| ())
            .map_err(|status| self.lifecycle_error("Start", suite, status))
    }

    pub async fn stop(&self, suite: &str) -> Result<(), HarnessError> {
        let mut client = self.inner.clone();
        client
            .stop(self.request(suite, &[]))
            .await
            .map(|_| ())
            .map_err(|status| self.lifecycle_error("Stop", suite, status))
    }

    pub async fn await_completion(&self, suite: &str) -> Result<(), HarnessError> {
        let mut client = self.inner.clone();
        client
            .await_completion(self.request(suite, &[]))
            .await
            .map(|_| ())
            .map_err(|status| self.lifecycle_error("AwaitCompletion", suite, status))
    }

    pub async fn teardown_instance(&self, suite: &str, args: &[String]) -> Result<(), HarnessError> {
        let mut client = self.inner.clone();
        client
            .tear_down_instance(self.request(suite, args))
            .await
            .map(|_| ())
            .map_err(|status| self.lifecycle_error("TearDownInstance", suite, status))
    }

    pub async fn teardown_suite(&self, suite: &str, args: &[String]) -> Result<(), HarnessError> {
        let mut client = self.inner.clone();
        client
            .tear_down_suite(self.request(suite, args))
            .await
            .map(|_| ())
            .map_err(|status| self.lifecycle_error("TearDownSuite", suite, status))
    }
}
