//! Contract for exposing restore targets (download direction)

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;

use portage_common::Result;

use crate::types::{ExposeResult, RestoreExposeParam};

/// Materializes write access to a restore volume through a hosting pod.
///
/// One generic flavor serves every download. After a successful restore the
/// reconciler calls `rebind_volume` to swap the restored volume's binding
/// onto the user's target PVC; rebind must complete before `clean_up`, and a
/// failed rebind turns the download into a failure.
#[async_trait]
pub trait RestoreExposer: Send + Sync {
    /// Asynchronously create the restore volume and its hosting pod.
    async fn expose(&self, owner: &ObjectReference, param: &RestoreExposeParam) -> Result<()>;

    /// Return the access point once the hosting pod is running on
    /// `node_name`; `None` while not yet ready; `Err` on terminal failure.
    async fn get_exposed(
        &self,
        owner: &ObjectReference,
        node_name: &str,
    ) -> Result<Option<ExposeResult>>;

    /// Atomically swap the restored volume's binding to the target PVC.
    async fn rebind_volume(
        &self,
        owner: &ObjectReference,
        target_namespace: &str,
        target_pvc: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Tear down the hosting pod and transient volumes; idempotent.
    async fn clean_up(&self, owner: &ObjectReference);
}
