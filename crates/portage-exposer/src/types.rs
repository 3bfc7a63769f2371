//! Parameter and result types shared by the exposer contracts

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;

/// Volume access through a hosting pod
#[derive(Clone, Debug)]
pub struct ExposeByPod {
    /// The transient pod mounting the exposed volume
    pub hosting_pod: Pod,
    /// Name of the exposed volume inside the pod spec
    pub volume_name: String,
}

/// What an exposer hands back once the volume is reachable
#[derive(Clone, Debug)]
pub struct ExposeResult {
    /// The pod-based access point
    pub by_pod: ExposeByPod,
}

/// Inputs for exposing a volume snapshot (upload direction)
#[derive(Clone, Debug, Default)]
pub struct SnapshotExposeParam {
    /// Namespace of the snapshotted PVC and its VolumeSnapshot
    pub source_namespace: String,
    /// Name of the VolumeSnapshot to expose
    pub volume_snapshot: String,
    /// Storage class for the transient backup volume
    pub storage_class: Option<String>,
    /// Labels to stamp on the hosting pod (carries the request-name label)
    pub hosting_pod_labels: BTreeMap<String, String>,
    /// Node the hosting pod must land on
    pub node_name: String,
}

/// Inputs for exposing a restore target (download direction)
#[derive(Clone, Debug, Default)]
pub struct RestoreExposeParam {
    /// Namespace of the user's target PVC
    pub target_namespace: String,
    /// Name of the user's target PVC
    pub target_pvc: String,
    /// Labels to stamp on the hosting pod (carries the request-name label)
    pub hosting_pod_labels: BTreeMap<String, String>,
    /// Node the hosting pod must land on
    pub node_name: String,
}
