//! Per-job namespace lifecycle: creation with the `test=<job-id>` label,
//! shared RBAC setup, and teardown that only returns once the namespace is
//! fully gone.

pub mod rbac;

use crate::errors::{HarnessError, is_kube_code};
use crate::io_models::job::JobConfig;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::wait::await_condition;
use std::collections::BTreeMap;

/// Creates the job namespace, the shared cluster role and binding, and the
/// job's service account.
pub async fn provision(client: &kube::Client, config: &JobConfig) -> Result<(), HarnessError> {
    create_namespace(client, &config.namespace, &config.id).await?;
    rbac::ensure_cluster_role(client).await?;
    rbac::bind_service_account(client, &config.namespace, &config.service_account()).await?;

    Ok(())
}

/// Creates a namespace labelled `test=<job-id>`; an existing one is reused.
pub async fn create_namespace(client: &kube::Client, name: &str, job_id: &str) -> Result<(), HarnessError> {
    let api: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([("test".to_string(), job_id.to_string())])),
            ..Default::default()
        },
        ..Default::default()
    };

    match api.create(&PostParams::default(), &namespace).await {
        Ok(_) => {
            info!("created namespace {name}");
            Ok(())
        }
        Err(err) if is_kube_code(&err, 409) => {
            debug!("namespace {name} already exists");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Deletes the job namespace and waits for the deletion to be observed.
/// A no-op when the job disables teardown.
pub async fn teardown(client: &kube::Client, config: &JobConfig) -> Result<(), HarnessError> {
    if config.no_teardown {
        info!("teardown disabled, keeping namespace {}", config.namespace);
        return Ok(());
    }

    let api: Api<Namespace> = Api::all(client.clone());
    match api.delete(&config.namespace, &DeleteParams::background()).await {
        Ok(_) => {}
        Err(err) if is_kube_code(&err, 404) => return Ok(()),
        Err(err) => return Err(HarnessError::Teardown(format!("cannot delete namespace {}: {err}", config.namespace))),
    }

    let gone = |namespace: Option<&Namespace>| namespace.is_none();
    tokio::time::timeout(
        config.timeout,
        await_condition(api, &config.namespace, gone),
    )
    .await
    .map_err(|_| {
        HarnessError::Teardown(format!(
            "namespace {} was not deleted within {:?}",
            config.namespace, config.timeout
        ))
    })?
    .map_err(|err| HarnessError::Teardown(format!("watch on namespace {} failed: {err}", config.namespace)))?;

    info!("deleted namespace {}", config.namespace);
    Ok(())
}
