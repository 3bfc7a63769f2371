//! CSI snapshot exposer
//!
//! Exposes a CSI volume snapshot for reading by provisioning a backup PVC
//! from the snapshot and pinning a hold pod that mounts it onto the
//! accepting node. The producer stages the VolumeSnapshot in the controller
//! namespace alongside the DataUpload record.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ObjectReference, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, TypedLocalObjectReference, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use portage_common::{Error, Result};

use crate::host_path::is_pod_on_node;
use crate::snapshot::SnapshotExposer;
use crate::types::{ExposeByPod, ExposeResult, SnapshotExposeParam};

const HOLD_IMAGE: &str = "busybox:1.36";

/// Extract the owner record's name and namespace
pub(crate) fn owner_coords(owner: &ObjectReference) -> Result<(&str, &str)> {
    let name = owner
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("exposer", "owner has no name"))?;
    let namespace = owner
        .namespace
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("exposer", "owner has no namespace"))?;
    Ok((name, namespace))
}

/// Whether a running hosting pod is usable by the caller's node
pub(crate) fn exposed_pod_state(pod: &Pod, node_name: &str) -> PodGate {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    match phase {
        "Failed" | "Succeeded" => PodGate::Terminal(phase.to_string()),
        "Running" if is_pod_on_node(pod, node_name) => PodGate::Ready,
        _ => PodGate::NotReady,
    }
}

/// Readiness verdict for a hosting pod
pub(crate) enum PodGate {
    /// Running on the right node
    Ready,
    /// Still coming up, or scheduled elsewhere
    NotReady,
    /// Ended; carries the terminal pod phase
    Terminal(String),
}

fn backup_pvc(name: &str, namespace: &str, param: &SnapshotExposeParam) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(param.hosting_pod_labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: param.storage_class.clone(),
            data_source: Some(TypedLocalObjectReference {
                api_group: Some("snapshot.storage.k8s.io".to_string()),
                kind: "VolumeSnapshot".to_string(),
                name: param.volume_snapshot.clone(),
            }),
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

pub(crate) fn hold_pod(
    name: &str,
    namespace: &str,
    labels: &std::collections::BTreeMap<String, String>,
    node_name: &str,
    claim_name: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "hold".to_string(),
                image: Some(HOLD_IMAGE.to_string()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                volume_mounts: Some(vec![VolumeMount {
                    name: name.to_string(),
                    mount_path: format!("/{}", name),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: name.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

pub(crate) fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Exposer for `snapshotType: CSI` uploads
pub struct CsiSnapshotExposer {
    client: Client,
}

impl CsiSnapshotExposer {
    /// Create a CSI snapshot exposer
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SnapshotExposer for CsiSnapshotExposer {
    async fn expose(&self, owner: &ObjectReference, param: &SnapshotExposeParam) -> Result<()> {
        let (name, namespace) = owner_coords(owner)?;

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvc = backup_pvc(name, namespace, param);
        match pvcs.create(&PostParams::default(), &pvc).await {
            Ok(_) => info!(request = %name, snapshot = %param.volume_snapshot, "backup PVC created"),
            Err(e) if is_already_exists(&e) => {
                debug!(request = %name, "backup PVC already exists");
            }
            Err(e) => return Err(Error::expose(name, format!("creating backup PVC: {}", e))),
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
                warn!(request = %name, error = %e, "failed to delete backup PVC");
            }
        }
    }
}
