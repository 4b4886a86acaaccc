//! Target object lookup for custom metric queries
//!
//! Selector declarations match on the labels of the object a custom metric
//! describes, and wildcard queries list objects by label. Both go through
//! [`TargetLookup`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info};

use cloudmetrics_cache::GroupResource;
use cloudmetrics_common::Selector;

#[cfg(test)]
use mockall::automock;

/// An object a custom metric value describes
#[derive(Clone, Debug, PartialEq)]
pub struct TargetObject {
    /// Object kind, e.g. `Pod`
    pub kind: String,
    /// Object apiVersion, e.g. `v1` or `apps/v1`
    pub api_version: String,
    /// Object name
    pub name: String,
    /// Object labels
    pub labels: BTreeMap<String, String>,
}

/// Errors from [`TargetLookup`]
#[derive(Debug, Error)]
pub enum LookupError {
    /// The group/resource is not served by the cluster
    #[error("resource {resource} is not served by the cluster")]
    UnknownResource {
        /// `resource.group` as queried
        resource: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Reads target objects from the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetLookup: Send + Sync {
    /// Fetch one object; `None` if it does not exist
    async fn get(
        &self,
        namespace: &str,
        resource: &GroupResource,
        name: &str,
    ) -> Result<Option<TargetObject>, LookupError>;

    /// List objects matching `selector`, sorted by name
    async fn list(
        &self,
        namespace: &str,
        resource: &GroupResource,
        selector: &Selector,
    ) -> Result<Vec<TargetObject>, LookupError>;
}

/// [`TargetLookup`] backed by the Kubernetes API
///
/// Resources are resolved through API discovery, which runs once at
/// construction. Resources installed later are reported as unknown until
/// the adapter restarts.
pub struct KubeTargetLookup {
    client: Client,
    discovery: Discovery,
}

impl KubeTargetLookup {
    /// Run API discovery and build the lookup
    pub async fn new(client: Client) -> Result<Self, LookupError> {
        let discovery = Discovery::new(client.clone()).run().await?;
        info!(
            groups = discovery.groups().count(),
            "API discovery complete"
        );
        Ok(Self { client, discovery })
    }

    fn api(&self, namespace: &str, resource: &GroupResource) -> Result<(Api<DynamicObject>, ApiResource), LookupError> {
        let (ar, caps) = self.resolve(resource)?;
        let api = match caps.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, &ar),
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }

    fn resolve(&self, resource: &GroupResource) -> Result<(ApiResource, ApiCapabilities), LookupError> {
        self.discovery
            .get(&resource.group)
            .and_then(|group| {
                group
                    .recommended_resources()
                    .into_iter()
                    .find(|(ar, _)| ar.plural == resource.resource)
            })
            .ok_or_else(|| LookupError::UnknownResource {
                resource: resource.to_string(),
            })
    }
}

#[async_trait]
impl TargetLookup for KubeTargetLookup {
    async fn get(
        &self,
        namespace: &str,
        resource: &GroupResource,
        name: &str,
    ) -> Result<Option<TargetObject>, LookupError> {
        let (api, ar) = self.api(namespace, resource)?;
        let object = api.get_opt(name).await?;
        if object.is_none() {
            debug!(namespace, resource = %resource, name, "Target object not found");
        }
        Ok(object.map(|o| target_object(o, &ar)))
    }

    async fn list(
        &self,
        namespace: &str,
        resource: &GroupResource,
        selector: &Selector,
    ) -> Result<Vec<TargetObject>, LookupError> {
        let (api, ar) = self.api(namespace, resource)?;
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels_from(&selector.to_kube());
        }

        let mut objects: Vec<TargetObject> = api
            .list(&params)
            .await?
            .items
            .into_iter()
            .map(|o| target_object(o, &ar))
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }
}

fn target_object(object: DynamicObject, ar: &ApiResource) -> TargetObject {
    TargetObject {
        kind: ar.kind.clone(),
        api_version: ar.api_version.clone(),
        name: object.name_any(),
        labels: object.labels().clone(),
    }
}
