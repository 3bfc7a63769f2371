//! Shared Kubernetes utilities using kube-rs
//!
//! The record store wraps the cluster API for one record type. Every write
//! goes through `replace`/`replace_status`, which carry the observed
//! resourceVersion, so all mutations are optimistic compare-and-swap: a 409
//! means another worker got there first.

use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::Result;

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context("client", format!("failed to read kubeconfig: {}", e))
            })?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// Access to the persisted records of one movement direction.
///
/// The reconcilers and the resume sweeper consume this trait; production
/// wires [`KubeRecordStore`], tests wire a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore<R: 'static + Sync + Send>: Send + Sync {
    /// Fetch a record by name; `None` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<R>>;

    /// List every record in the controller namespace
    async fn list(&self) -> Result<Vec<R>>;

    /// Replace the main resource (spec + metadata), conflict-checked
    async fn replace(&self, record: &R) -> Result<R>;

    /// Replace the status subresource, conflict-checked
    async fn replace_status(&self, record: &R) -> Result<R>;
}

/// Production record store over a namespaced `Api`
pub struct KubeRecordStore<R> {
    api: Api<R>,
}

impl<R> KubeRecordStore<R>
where
    R: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    /// Create a store scoped to the controller namespace
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl<R> RecordStore<R> for KubeRecordStore<R>
where
    R: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<R>> {
        match self.api.get(name).await {
            Ok(record) => Ok(Some(record)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<R>> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn replace(&self, record: &R) -> Result<R> {
        let name = record.name_any();
        Ok(self
            .api
            .replace(&name, &PostParams::default(), record)
            .await?)
    }

    async fn replace_status(&self, record: &R) -> Result<R> {
        let name = record.name_any();
        let data = serde_json::to_vec(record).map_err(|e| {
            Error::internal_with_context("store", format!("failed to serialize status: {}", e))
        })?;
        Ok(self
            .api
            .replace_status(&name, &PostParams::default(), data)
            .await?)
    }
}

/// Check whether a resource carries the given finalizer
pub fn has_finalizer<R: Resource>(record: &R, finalizer: &str) -> bool {
    record
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Attach a finalizer in place; returns false if it was already present
pub fn add_finalizer<R: Resource>(record: &mut R, finalizer: &str) -> bool {
    if has_finalizer(record, finalizer) {
        return false;
    }
    record
        .meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Detach a finalizer in place; returns false if it was not present
pub fn remove_finalizer<R: Resource>(record: &mut R, finalizer: &str) -> bool {
    if !has_finalizer(record, finalizer) {
        return false;
    }
    if let Some(finalizers) = record.meta_mut().finalizers.as_mut() {
        finalizers.retain(|s| s != finalizer);
    }
    true
}
