//! Exposers materialize volume access for the data movers
//!
//! Given a source snapshot (upload) or a target PVC (download), an exposer
//! brings up a transient hosting pod on the accepting node whose filesystem
//! the data-path session reads or writes. The reconcilers consume the
//! [`SnapshotExposer`] and [`RestoreExposer`] contracts and never touch the
//! pods directly; every terminal transition and every finalizer pass calls
//! `clean_up`, which must be idempotent.

#![deny(missing_docs)]

mod csi;
mod generic;
mod host_path;
mod restore;
mod snapshot;
mod types;

pub use csi::CsiSnapshotExposer;
pub use generic::RestoreExposer;
pub use host_path::{host_pods_pattern, is_pod_on_node, single_path_match, volume_directory};
pub use restore::PvcRestoreExposer;
pub use snapshot::SnapshotExposer;
pub use types::{ExposeByPod, ExposeResult, RestoreExposeParam, SnapshotExposeParam};
