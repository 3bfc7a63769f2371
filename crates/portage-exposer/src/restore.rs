//! Generic restore exposer
//!
//! Exposes a restore target for writing by provisioning a fresh restore PVC
//! and a hold pod on the accepting node. After the session finishes,
//! `rebind_volume` moves the restored volume's binding onto the user's
//! target PVC: the backing PV is retained, the transient claim is deleted,
//! and the PV's claimRef is pointed at the target.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use portage_common::{Error, Result};

use crate::csi::{exposed_pod_state, hold_pod, is_already_exists, is_not_found, owner_coords, PodGate};
use crate::generic::RestoreExposer;
use crate::types::{ExposeByPod, ExposeResult, RestoreExposeParam};

const REBIND_POLL: Duration = Duration::from_secs(2);

fn restore_pvc(name: &str, namespace: &str, param: &RestoreExposeParam) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(param.hosting_pod_labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(
                    [("storage".to_string(), Quantity("1Gi".to_string()))]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Exposer serving every DataDownload
pub struct PvcRestoreExposer {
    client: Client,
}

impl PvcRestoreExposer {
    /// Create a restore exposer
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn restored_pv_name(&self, name: &str, namespace: &str) -> Result<String> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvc = pvcs.get(name).await.map_err(|e| {
            Error::expose(name, format!("reading restore PVC for rebind: {}", e))
        })?;
        pvc.spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::expose(name, "restore PVC is not bound to a volume"))
    }
}

#[async_trait]
impl RestoreExposer for PvcRestoreExposer {
    async fn expose(&self, owner: &ObjectReference, param: &RestoreExposeParam) -> Result<()> {
        let (name, namespace) = owner_coords(owner)?;

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match pvcs.create(&PostParams::default(), &restore_pvc(name, namespace, param)).await {
            Ok(_) => info!(request = %name, "restore PVC created"),
            Err(e) if is_already_exists(&e) => {
                debug!(request = %name, "restore PVC already exists");
            }
            Err(e) => return Err(Error::expose(name, format!("creating restore PVC: {}", e))),
        }

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = hold_pod(name, namespace, &param.hosting_pod_labels, &param.node_name, name);
        match pods.create(&PostParams::default(), &pod).await {
            Ok(_) => info!(request = %name, node = %param.node_name, "hosting pod submitted"),
            Err(e) if is_already_exists(&e) => {
                debug!(request = %name, "hosting pod already exists");
            }
            Err(e) => return Err(Error::expose(name, format!("creating hosting pod: {}", e))),
        }

        Ok(())
    }

    async fn get_exposed(
        &self,
        owner: &ObjectReference,
        node_name: &str,
    ) -> Result<Option<ExposeResult>> {
        let (name, namespace) = owner_coords(owner)?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = match pods.get(name).await {
            Ok(pod) => pod,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match exposed_pod_state(&pod, node_name) {
            PodGate::Terminal(phase) => Err(Error::expose(
                name,
                format!("hosting pod ended in phase {}", phase),
            )),
            PodGate::NotReady => Ok(None),
            PodGate::Ready => Ok(Some(ExposeResult {
                by_pod: ExposeByPod {
                    hosting_pod: pod,
                    volume_name: name.to_string(),
                },
            })),
        }
    }

    async fn rebind_volume(
        &self,
        owner: &ObjectReference,
        target_namespace: &str,
        target_pvc: &str,
        timeout: Duration,
    ) -> Result<()> {
        let (name, namespace) = owner_coords(owner)?;
        let pv_name = self.restored_pv_name(name, namespace).await?;

        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        let params = PatchParams::apply("portage-restore-exposer");

        // Keep the volume alive across the claim swap
        let retain = serde_json::json!({
            "spec": { "persistentVolumeReclaimPolicy": "Retain" }
        });
        pvs.patch(&pv_name, &params, &Patch::Merge(&retain))
            .await
            .map_err(|e| Error::expose(name, format!("retaining restored volume: {}", e)))?;

        // The transient claim must go before the PV can bind elsewhere
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        if let Err(e) = pvcs.delete(name, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                return Err(Error::expose(name, format!("releasing restore PVC: {}", e)));
            }
        }

        // Point the volume at the user's claim; clearing uid lets the PV
        // controller complete the bind
        let rebind = serde_json::json!({
            "spec": {
                "claimRef": {
                    "apiVersion": "v1",
                    "kind": "PersistentVolumeClaim",
                    "namespace": target_namespace,
                    "name": target_pvc,
                    "uid": null,
                    "resourceVersion": null,
                }
            }
        });
        pvs.patch(&pv_name, &params, &Patch::Merge(&rebind))
            .await
            .map_err(|e| Error::expose(name, format!("rebinding restored volume: {}", e)))?;

        // Wait for the target claim to observe the bind
        let target_api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), target_namespace);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match target_api.get(target_pvc).await {
                Ok(pvc) => {
                    let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
                    if phase == Some("Bound") {
                        info!(request = %name, pv = %pv_name, target = %target_pvc, "volume rebound");
                        return Ok(());
                    }
                }
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    return Err(Error::expose(name, format!("watching target PVC: {}", e)))
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::expose(
                    name,
                    format!("target PVC {} not bound within {:?}", target_pvc, timeout),
                ));
            }
            tokio::time::sleep(REBIND_POLL).await;
        }
    }

    async fn clean_up(&self, owner: &ObjectReference) {
        let (name, namespace) = match owner_coords(owner) {
            Ok(coords) => coords,
            Err(e) => {
                warn!(error = %e, "cannot clean up expose without owner coordinates");
                return;
            }
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        if let Err(e) = pods.delete(name, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                warn!(request = %name, error = %e, "failed to delete hosting pod");
            }
        }

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        if let Err(e) = pvcs.delete(name, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                warn!(request = %name, error = %e, "failed to delete restore PVC");
            }
        }
    }
}
