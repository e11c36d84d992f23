//! Ownership check tying a forwarded username to the running workspace.
//!
//! The verifier fails closed: any directory error, timeout or missing context
//! is a denial. The target workspace comes from configuration only, never from
//! the request.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

const RUNNING_PHASE_SELECTOR: &str = "status.phase=Running";

#[derive(Debug, thiserror::Error)]
pub(crate) enum DirectoryError {
    #[error("workload directory unavailable: {0}")]
    Unavailable(String),
    #[error("workload directory query failed: {0}")]
    Query(String),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum NamespaceError {
    #[error("failed to read namespace file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("namespace file {0} is empty")]
    Empty(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct InstanceQuery {
    pub namespace: String,
    pub label_selector: String,
    pub field_selector: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct WorkloadRecord {
    pub name: String,
    pub owner: Option<String>,
}

/// Lookup of workload instances by label and phase.
#[async_trait]
pub(crate) trait WorkloadDirectory: Send + Sync {
    async fn running_instances(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<WorkloadRecord>, DirectoryError>;
}

/// Pod listing through the in-cluster Kubernetes API.
pub(crate) struct KubeDirectory {
    client: tokio::sync::OnceCell<Client>,
    owner_annotation: String,
}

impl KubeDirectory {
    pub fn new(owner_annotation: impl Into<String>) -> Self {
        Self {
            client: tokio::sync::OnceCell::new(),
            owner_annotation: owner_annotation.into(),
        }
    }

    // Connect lazily and retry on the next call if credentials are not usable yet.
    async fn client(&self) -> Result<&Client, DirectoryError> {
        self.client
            .get_or_try_init(|| async {
                Client::try_default()
                    .await
                    .map_err(|err| DirectoryError::Unavailable(err.to_string()))
            })
            .await
    }
}

#[async_trait]
impl WorkloadDirectory for KubeDirectory {
    async fn running_instances(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<WorkloadRecord>, DirectoryError> {
        let client = self.client().await?;
        let pods: Api<Pod> = Api::namespaced(client.clone(), &query.namespace);
        let params = ListParams::default()
            .labels(&query.label_selector)
            .fields(&query.field_selector);
        let list = pods
            .list(&params)
            .await
            .map_err(|err| DirectoryError::Query(err.to_string()))?;
        Ok(list
            .items
            .into_iter()
            .map(|pod| WorkloadRecord {
                owner: pod
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|annotations| annotations.get(&self.owner_annotation).cloned()),
                name: pod.metadata.name.unwrap_or_default(),
            })
            .collect())
    }
}

/// Read the execution namespace. Callers treat failure as fatal.
pub(crate) fn read_namespace(path: &Path) -> Result<String, NamespaceError> {
    let raw = std::fs::read_to_string(path).map_err(|source| NamespaceError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let namespace = raw.trim();
    if namespace.is_empty() {
        return Err(NamespaceError::Empty(path.display().to_string()));
    }
    Ok(namespace.to_string())
}

pub(crate) struct IdentityVerifier {
    directory: Arc<dyn WorkloadDirectory>,
    namespace: String,
    workspace_id: Option<String>,
    workspace_label: String,
    timeout: Duration,
}

impl IdentityVerifier {
    pub fn new(
        directory: Arc<dyn WorkloadDirectory>,
        namespace: String,
        config: &ServerConfig,
    ) -> Self {
        Self {
            directory,
            namespace,
            workspace_id: config.workspace_id.clone(),
            workspace_label: config.workspace_label.clone(),
            timeout: config.directory_timeout,
        }
    }

    /// True iff a running instance of the configured workspace is owned by `username`.
    pub async fn verify(&self, username: &str) -> bool {
        if username.is_empty() {
            debug!("refusing ownership check for empty username");
            return false;
        }
        let Some(workspace_id) = self.workspace_id.as_deref() else {
            warn!("workspace id not configured; ownership check denied");
            return false;
        };

        let query = InstanceQuery {
            namespace: self.namespace.clone(),
            label_selector: format!("{}={}", self.workspace_label, workspace_id),
            field_selector: RUNNING_PHASE_SELECTOR.to_string(),
        };

        let records =
            match tokio::time::timeout(self.timeout, self.directory.running_instances(&query))
                .await
            {
                Ok(Ok(records)) => records,
                Ok(Err(err)) => {
                    warn!(%err, namespace = %query.namespace, "ownership lookup failed; denying");
                    return false;
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.timeout.as_secs(),
                        namespace = %query.namespace,
                        "ownership lookup timed out; denying"
                    );
                    return false;
                }
            };

        match records
            .iter()
            .find(|record| record.owner.as_deref() == Some(username))
        {
            Some(record) => {
                info!(instance = %record.name, "user matches workspace owner");
                true
            }
            None => {
                debug!(instances = records.len(), "no running instance owned by user");
                false
            }
        }
    }
}
