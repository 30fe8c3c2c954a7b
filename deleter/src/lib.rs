//! Thin client over the Kubernetes dynamic API. Deletes by
//! `(group/version/kind, namespace, name)` with background propagation,
//! treating "already gone" as success.

use std::time::Duration;

use kube::api::{Api, DeleteParams, DynamicObject, PropagationPolicy};
use kube::core::GroupVersionKind;
use kube::{Client, discovery};
use kubearchive_types::{DeleteOutcome, Gvk};
use tokio::time::timeout;

const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("delete timed out after {0:?}")]
    Timeout(Duration),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

pub struct ClusterDeleter {
    client: Client,
}

impl ClusterDeleter {
    pub fn new(client: Client) -> Self {
        ClusterDeleter { client }
    }

    pub async fn delete(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<DeleteOutcome, DeleteError> {
        let kube_gvk = parse_gvk(gvk);

        let (api_resource, _caps) = timeout(DELETE_TIMEOUT, discovery::pinned_kind(&self.client, &kube_gvk))
            .await
            .map_err(|_| DeleteError::Timeout(DELETE_TIMEOUT))??;

        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &api_resource);

        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };

        let result = timeout(DELETE_TIMEOUT, api.delete(name, &params))
            .await
            .map_err(|_| DeleteError::Timeout(DELETE_TIMEOUT))?;

        match result {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                tracing::debug!(namespace, name, resource_type = %gvk.resource_type(), "object already gone");
                Ok(DeleteOutcome::NotFound)
            }
            Err(e) => Err(DeleteError::Kube(e)),
        }
    }
}

fn parse_gvk(gvk: &Gvk) -> GroupVersionKind {
    match gvk.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &gvk.kind),
        None => GroupVersionKind::gvk("", &gvk.api_version, &gvk.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_api_version_splits_on_slash() {
        let gvk = Gvk::new("apps/v1", "Deployment");
        let parsed = parse_gvk(&gvk);
        assert_eq!(parsed.group, "apps");
        assert_eq!(parsed.version, "v1");
        assert_eq!(parsed.kind, "Deployment");
    }

    #[test]
    fn core_api_version_has_no_group() {
        let gvk = Gvk::new("v1", "Pod");
        let parsed = parse_gvk(&gvk);
        assert_eq!(parsed.group, "");
        assert_eq!(parsed.version, "v1");
        assert_eq!(parsed.kind, "Pod");
    }
}
