//! Contract for exposing volume snapshots (upload direction)

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;

use portage_common::Result;

use crate::types::{ExposeResult, SnapshotExposeParam};

/// Materializes read access to a volume snapshot through a hosting pod.
///
/// Implementations are selected by the record's `snapshotType` key. `expose`
/// means "submitted"; readiness is observed by polling `get_exposed`, which
/// must verify the hosting pod landed on the caller's node so only the
/// intended node proceeds.
#[async_trait]
pub trait SnapshotExposer: Send + Sync {
    /// Asynchronously create the hosting pod and any transient volumes.
    ///
    /// Success means the expose was submitted, not that it is ready.
    async fn expose(&self, owner: &ObjectReference, param: &SnapshotExposeParam) -> Result<()>;

    /// Return the access point once the hosting pod is running on
    /// `node_name`; `None` while not yet ready; `Err` on terminal failure.
    async fn get_exposed(
        &self,
        owner: &ObjectReference,
        node_name: &str,
    ) -> Result<Option<ExposeResult>>;

    /// Tear down the hosting pod and transient volumes; idempotent.
    async fn clean_up(&self, owner: &ObjectReference);
}
