//! DataDownload Custom Resource Definition
//!
//! A DataDownload restores object-store contents into a freshly provisioned
//! volume, then rebinds that volume to the user's target PVC.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{MoveRecord, MoveStatus};
use crate::DATA_DOWNLOAD_LABEL;

/// Coordinates of the volume the restored data must end up bound to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetVolumeSpec {
    /// Name of the user's target PVC
    #[serde(rename = "pvc")]
    pub pvc: String,

    /// Name of the PV backing the target PVC, if pre-provisioned
    #[serde(default, rename = "pv", skip_serializing_if = "String::is_empty")]
    pub pv: String,

    /// Namespace of the target PVC
    pub namespace: String,
}

/// Specification for a DataDownload
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "portage.dev",
    version = "v1alpha1",
    kind = "DataDownload",
    plural = "datadownloads",
    shortname = "dd",
    namespaced,
    status = "MoveStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.node"}"#,
    printcolumn = r#"{"name":"Bytes Done","type":"integer","jsonPath":".status.progress.bytesDone"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataDownloadSpec {
    /// Which data mover should handle this record (empty means any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_mover: Option<String>,

    /// Volume the restored data is rebound to on completion
    pub target_volume: TargetVolumeSpec,

    /// Key into the object-store configuration
    pub backup_storage_location: String,

    /// Identifier of the snapshot to restore
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,

    /// Producer-set cancellation flag
    #[serde(default)]
    pub cancel: bool,
}

impl MoveRecord for DataDownload {
    const POD_LABEL: &'static str = DATA_DOWNLOAD_LABEL;

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
