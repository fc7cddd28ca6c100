#[macro_use]
extern crate tracing;

pub mod constants;
pub mod coordinator;
pub mod driver;
pub mod errors;
pub mod io_models;
pub mod launcher;
pub mod progress;
pub mod provisioner;
pub mod rpc;
pub mod runtime;
pub mod worker;

use crate::constants::{CONFIG_PATH, ENV_SIMULATION_TYPE, JOB_READY_FILE};
use crate::errors::HarnessError;
use crate::io_models::job::ProcessRole;
use std::path::Path;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

pub use worker::registry::register;

/// Process entry point for harness binaries, called from `main` after suite
/// registration. The behaviour is selected by the environment the launcher
/// injected; exits the process with the job's status code.
pub fn run() -> ! {
    init_tracing();
    let outcome = runtime::block_on(async {
        tokio::select! {
            result = dispatch() => result,
            // dropping the dispatch future cancels outstanding RPCs,
            // injections and pod watches at their next suspension point
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, abandoning outstanding work");
                Ok(130)
            }
        }
    });
    let code = match outcome {
        Ok(code) => code,
        Err(err) => {
            error!("harness run failed: {err}");
            1
        }
    };

    std::process::exit(code)
}

async fn dispatch() -> Result<i32, HarnessError> {
    let role = std::env::var(ENV_SIMULATION_TYPE)
        .ok()
        .and_then(|raw| ProcessRole::from_str(&raw).ok())
        .unwrap_or(ProcessRole::Worker);

    match role {
        ProcessRole::Worker => worker::run().await,
        ProcessRole::Coordinator => {
            // the coordinator pod bootstraps through the same gate contract
            worker::await_ready_gate(Path::new(JOB_READY_FILE)).await;
            let config = worker::load_config(Path::new(CONFIG_PATH))?;
            let client = kube::Client::try_default().await?;

            coordinator::run(client, config).await
        }
    }
}

fn init_tracing() {
    let _ = match std::env::var_os("CI") {
        Some(_) => tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::INFO)
            .with_current_span(true)
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .try_init(),
    };
}
