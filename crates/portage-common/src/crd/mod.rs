//! Custom Resource Definitions for Portage data movement
//!
//! A `DataUpload` asks a node agent to move a volume snapshot into the
//! object store; a `DataDownload` asks it to restore object-store contents
//! into a target volume. Both share one status shape and one phase machine.

mod data_download;
mod data_upload;
mod types;

pub use data_download::{DataDownload, DataDownloadSpec, TargetVolumeSpec};
pub use data_upload::{CsiSnapshotSpec, DataUpload, DataUploadSpec};
pub use types::{MovePhase, MoveProgress, MoveRecord, MoveStatus, SNAPSHOT_TYPE_CSI};
