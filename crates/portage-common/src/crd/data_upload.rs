//! DataUpload Custom Resource Definition
//!
//! A DataUpload moves the contents of a volume snapshot into the object
//! store. The producing control plane creates the record; exactly one node
//! agent accepts it and drives it through the phase machine.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{MoveRecord, MoveStatus};
use crate::DATA_UPLOAD_LABEL;

/// Coordinates of the CSI snapshot to expose for reading
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CsiSnapshotSpec {
    /// Name of the VolumeSnapshot in the source namespace
    pub volume_snapshot: String,

    /// Storage class to use for the backup volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// VolumeSnapshotClass of the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_class: Option<String>,
}

/// Specification for a DataUpload
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "portage.dev",
    version = "v1alpha1",
    kind = "DataUpload",
    plural = "datauploads",
    shortname = "du",
    namespaced,
    status = "MoveStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.node"}"#,
    printcolumn = r#"{"name":"Bytes Done","type":"integer","jsonPath":".status.progress.bytesDone"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataUploadSpec {
    /// Which data mover should handle this record (empty means any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_mover: Option<String>,

    /// Snapshot type key selecting the exposer (e.g. "CSI")
    pub snapshot_type: String,

    /// CSI snapshot coordinates; required when snapshotType is "CSI"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csi_snapshot: Option<CsiSnapshotSpec>,

    /// Namespace of the snapshotted PVC
    pub source_namespace: String,

    /// Name of the snapshotted PVC
    #[serde(rename = "sourcePVC")]
    pub source_pvc: String,

    /// Key into the object-store configuration
    pub backup_storage_location: String,

    /// Producer-set cancellation flag
    #[serde(default)]
    pub cancel: bool,
}

impl MoveRecord for DataUpload {
    const POD_LABEL: &'static str = DATA_UPLOAD_LABEL;

    fn data_mover(&self) -> Option<&str> {
        self.spec.data_mover.as_deref()
    }

    fn cancel_requested(&self) -> bool {
        self.spec.cancel
    }

    fn request_cancel(&mut self) {
        self.spec.cancel = true;
    }

    fn move_status(&self) -> Option<&MoveStatus> {
        self.status.as_ref()
    }

    fn move_status_mut(&mut self) -> &mut MoveStatus {
        self.status.get_or_insert_with(MoveStatus::default)
    }
}
