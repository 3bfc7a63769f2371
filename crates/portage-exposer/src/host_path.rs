//! Resolving a hosting pod's volume to a path on the node
//!
//! The node agent mounts the kubelet pods directory, so an exposed volume is
//! reachable at `<host_pods>/<pod-uid>/volumes/<plugin>/<volume-dir>`. The
//! plugin segment varies by CSI driver, so the lookup is a glob that must
//! match exactly one directory.

use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};

use portage_common::{Error, Result};

/// Check whether a pod was scheduled onto the given node
pub fn is_pod_on_node(pod: &Pod, node: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|n| n == node)
}

/// Resolve the on-disk directory name of a pod volume.
///
/// A volume backed by a PVC lives in a directory named after the bound PV,
/// so the caller supplies the claim when the volume references one. Other
/// volume types use the volume name directly.
pub fn volume_directory(
    pod: &Pod,
    volume_name: &str,
    claim: Option<&PersistentVolumeClaim>,
) -> Result<String> {
    let volume = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .and_then(|vols| vols.iter().find(|v| v.name == volume_name))
        .ok_or_else(|| {
            Error::internal_with_context(
                "host-path",
                format!("pod has no volume named {}", volume_name),
            )
        })?;

    if volume.persistent_volume_claim.is_some() {
        let claim = claim.ok_or_else(|| {
            Error::internal_with_context(
                "host-path",
                format!("volume {} is PVC-backed but no claim was supplied", volume_name),
            )
        })?;
        let pv_name = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.as_deref())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::internal_with_context("host-path", "claim is not bound to a volume")
            })?;
        return Ok(pv_name.to_string());
    }

    Ok(volume_name.to_string())
}

/// Build the glob pattern locating a pod volume under the host pods root
pub fn host_pods_pattern(host_pods_root: &Path, pod_uid: &str, volume_dir: &str) -> String {
    format!(
        "{}/{}/volumes/*/{}",
        host_pods_root.display(),
        pod_uid,
        volume_dir
    )
}

/// Expand a glob pattern that must match exactly one path.
///
/// Zero matches means the volume never appeared; more than one means the
/// pattern is ambiguous. Both are errors.
pub fn single_path_match(pattern: &str) -> Result<PathBuf> {
    let mut matches = glob::glob(pattern)
        .map_err(|e| {
            Error::internal_with_context("host-path", format!("bad glob {}: {}", pattern, e))
        })?
        .filter_map(|entry| entry.ok());

    let first = matches.next().ok_or_else(|| {
        Error::internal_with_context("host-path", format!("no path matches {}", pattern))
    })?;

    if matches.next().is_some() {
        return Err(Error::internal_with_context(
            "host-path",
            format!("multiple paths match {}", pattern),
        ));
    }

    Ok(first)
}
