//! Cluster-wide RBAC shared by every job in a cluster. The role and binding
//! are created idempotently; the binding's subject list grows one entry per
//! (namespace, service account) pair under conflict retry.

use crate::constants::CLUSTER_ROLE;
use crate::errors::{HarnessError, is_kube_code};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::api::PostParams;

const CONFLICT_RETRIES: usize = 5;

/// Ensures the shared `kube-test-cluster` role exists. An existing role is
/// reused untouched.
pub async fn ensure_cluster_role(client: &kube::Client) -> Result<(), HarnessError> {
    let api: Api<ClusterRole> = Api::all(client.clone());
    let role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE.to_string()),
            ..Default::default()
        },
        rules: Some(rules()),
        ..Default::default()
    };

    match api.create(&PostParams::default(), &role).await {
        Ok(_) => {
            info!("created cluster role {CLUSTER_ROLE}");
            Ok(())
        }
        Err(err) if is_kube_code(&err, 409) => {
            debug!("cluster role {CLUSTER_ROLE} already exists");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Creates the job's service account and adds it as a subject of the shared
/// binding. Concurrent drivers race on the binding; update conflicts are
/// retried with a fresh read.
pub async fn bind_service_account(
    client: &kube::Client,
    namespace: &str,
    service_account: &str,
) -> Result<(), HarnessError> {
    create_service_account(client, namespace, service_account).await?;

    let api: Api<ClusterRoleBinding> = Api::all(client.clone());
    for _ in 0..CONFLICT_RETRIES {
        match api.get_opt(CLUSTER_ROLE).await? {
            None => {
                let binding = new_binding(namespace, service_account);
                match api.create(&PostParams::default(), &binding).await {
                    Ok(_) => return Ok(()),
                    // another driver created it first, re-read and update
                    Err(err) if is_kube_code(&err, 409) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            Some(mut binding) => {
                if !upsert_subject(&mut binding, namespace, service_account) {
                    return Ok(());
                }
                match api.replace(CLUSTER_ROLE, &PostParams::default(), &binding).await {
                    Ok(_) => return Ok(()),
                    Err(err) if is_kube_code(&err, 409) => {
                        debug!("cluster role binding update conflict, retrying");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    Err(HarnessError::Launch(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("cluster role binding update conflicted {CONFLICT_RETRIES} times"),
        reason: "Conflict".to_string(),
        code: 409,
    })))
}

async fn create_service_account(client: &kube::Client, namespace: &str, name: &str) -> Result<(), HarnessError> {
    let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    match api.create(&PostParams::default(), &account).await {
        Ok(_) => Ok(()),
        Err(err) if is_kube_code(&err, 409) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn new_binding(namespace: &str, service_account: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![subject(namespace, service_account)]),
    }
}

fn subject(namespace: &str, service_account: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: service_account.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Adds the subject unless it is already present. Returns whether the
/// binding changed.
fn upsert_subject(binding: &mut ClusterRoleBinding, namespace: &str, service_account: &str) -> bool {
    let subjects = binding.subjects.get_or_insert_with(Vec::new);
    let present = subjects
        .iter()
        .any(|s| s.name == service_account && s.namespace.as_deref() == Some(namespace));
    if present {
        return false;
    }

    subjects.push(subject(namespace, service_account));
    true
}

/// Broad verbs over the resources a worker needs to deploy charts.
fn rules() -> Vec<PolicyRule> {
    let all = vec!["*".to_string()];
    let rule = |api_groups: &[&str], resources: &[&str]| PolicyRule {
        api_groups: Some(api_groups.iter().map(|g| g.to_string()).collect()),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: all.clone(),
        ..Default::default()
    };

    vec![
        rule(
            &[""],
            &[
                "pods",
                "pods/log",
                "pods/exec",
                "services",
                "endpoints",
                "persistentvolumeclaims",
                "events",
                "configmaps",
                "secrets",
                "serviceaccounts",
                "namespaces",
            ],
        ),
        rule(&["apps"], &["deployments", "daemonsets", "replicasets", "statefulsets"]),
        rule(&["policy"], &["poddisruptionbudgets"]),
        rule(&["batch"], &["jobs"]),
        rule(
            &["rbac.authorization.k8s.io"],
            &["roles", "rolebindings", "clusterroles", "clusterrolebindings"],
        ),
        rule(&["apiextensions.k8s.io"], &["customresourcedefinitions"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_subject_deduplicates() {
        // setup:
        let mut binding = new_binding("alpha-bee", "alpha-bee");

        // execute: same pair again, then a second namespace
        let unchanged = upsert_subject(&mut binding, "alpha-bee", "alpha-bee");
        let grown = upsert_subject(&mut binding, "alpha-bee-map", "alpha-bee-map");

        // verify:
        assert!(!unchanged);
        assert!(grown);
        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects.len(), 2);
        assert_eq!(subjects[1].namespace.as_deref(), Some("alpha-bee-map"));
    }

    #[test]
    fn test_rules_cover_chart_deployments() {
        let rules = rules();

        let covers = |group: &str, resource: &str| {
            rules.iter().any(|rule| {
                rule.api_groups.as_ref().is_some_and(|g| g.iter().any(|x| x == group))
                    && rule.resources.as_ref().is_some_and(|r| r.iter().any(|x| x == resource))
            })
        };

        assert!(covers("", "namespaces"));
        assert!(covers("", "pods/exec"));
        assert!(covers("apps", "statefulsets"));
        assert!(covers("batch", "jobs"));
        assert!(covers("policy", "poddisruptionbudgets"));
        assert!(covers("rbac.authorization.k8s.io", "rolebindings"));
        assert!(covers("apiextensions.k8s.io", "customresourcedefinitions"));
        assert!(rules.iter().all(|rule| rule.verbs == vec!["*".to_string()]));
    }
}
