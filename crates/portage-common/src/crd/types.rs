//! Types shared by the DataUpload and DataDownload resources

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Snapshot type key selecting the CSI snapshot exposer
pub const SNAPSHOT_TYPE_CSI: &str = "CSI";

/// Phase of a data movement request.
///
/// The phase strings are a wire contract shared with the request producer;
/// an empty string on input is read as `New`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MovePhase {
    /// Created by the producer, not yet claimed by any node
    #[default]
    #[serde(rename = "New", alias = "")]
    New,
    /// Claimed by a node; waiting for the hosting pod to come up
    Accepted,
    /// Hosting pod is ready on the accepting node
    Prepared,
    /// A data-path session is running
    InProgress,
    /// Data movement finished successfully
    Completed,
    /// Data movement failed; see `status.message`
    Failed,
    /// Cancellation was forwarded to the session
    Canceling,
    /// Data movement was cancelled
    Canceled,
}

impl MovePhase {
    /// Whether this phase is terminal; terminal phases never revert.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for MovePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::Accepted => "Accepted",
            Self::Prepared => "Prepared",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Canceling => "Canceling",
            Self::Canceled => "Canceled",
        };
        write!(f, "{}", s)
    }
}

/// Byte counters reported by the data-path session
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MoveProgress {
    /// Total bytes the session expects to move
    #[serde(default)]
    pub total_bytes: i64,

    /// Bytes moved so far
    #[serde(default)]
    pub bytes_done: i64,
}

/// Status shared by DataUpload and DataDownload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoveStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MovePhase,

    /// Human-readable error on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Name of the node that accepted the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Set when the request is accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Time>,

    /// Set on every terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<Time>,

    /// Data movement progress
    #[serde(default)]
    pub progress: MoveProgress,

    /// Identifier of the produced snapshot (uploads only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

/// One view over both record shapes for the reconcilers.
///
/// The reconcilers, resume sweeper, and retry helpers are written against
/// this trait so they do not care which direction a record drives.
pub trait MoveRecord: Resource<DynamicType = ()> + Clone + Send + Sync {
    /// Label key carried by this record's hosting pod
    const POD_LABEL: &'static str;

    /// The record's dataMover selector, if set
    fn data_mover(&self) -> Option<&str>;

    /// Whether the producer has requested cancellation
    fn cancel_requested(&self) -> bool;

    /// Set the cancellation flag (used when a record is deleted mid-flight)
    fn request_cancel(&mut self);

    /// The record's status, if initialized
    fn move_status(&self) -> Option<&MoveStatus>;

    /// The record's status, initializing it if absent
    fn move_status_mut(&mut self) -> &mut MoveStatus;

    /// Current phase; an uninitialized status reads as `New`.
    fn phase(&self) -> MovePhase {
        self.move_status().map(|s| s.phase).unwrap_or_default()
    }

    /// Node that accepted this record, if any
    fn node(&self) -> Option<&str> {
        self.move_status().and_then(|s| s.node.as_deref())
    }
}
