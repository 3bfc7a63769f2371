//! Data-path sessions and their per-node registry
//!
//! A session ([`AsyncBr`]) is the long-running worker that streams data
//! between a local access point and the object store. The reconcilers never
//! see its internals: they start it, may cancel it, and hear back through
//! [`SessionNotify`] callbacks. The [`DataPathManager`] bounds how many
//! sessions one node runs at a time.

#![deny(missing_docs)]

mod manager;

pub use manager::{CreateError, DataPathManager};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use portage_common::crd::MoveProgress;
use portage_common::{Error, Result};

/// Local filesystem location a session reads from or writes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessPoint {
    /// Path of the volume as mounted into the node agent
    pub by_path: PathBuf,
}

/// Outcome reported by a successful session
#[derive(Clone, Debug, Default)]
pub struct SessionResult {
    /// Identifier of the produced snapshot (backups only)
    pub snapshot_id: Option<String>,
    /// Total bytes moved
    pub total_bytes: i64,
}

/// Callbacks a session fires as it runs.
///
/// Implementations patch the record; the session knows nothing about the
/// cluster. Callbacks carry only namespace and name, and sessions hold the
/// notify handle weakly, so a wound-down reconciler never keeps sessions
/// alive (and vice versa).
#[async_trait]
pub trait SessionNotify: Send + Sync {
    /// The session finished successfully
    async fn on_completed(&self, namespace: &str, name: &str, result: SessionResult);

    /// The session failed
    async fn on_failed(&self, namespace: &str, name: &str, error: Error);

    /// The session wound down after a cancel request
    async fn on_cancelled(&self, namespace: &str, name: &str);

    /// The session moved more bytes
    async fn on_progress(&self, namespace: &str, name: &str, progress: MoveProgress);
}

/// A data-mover session.
///
/// `start_backup` / `start_restore` kick the transfer off and return once it
/// is running; terminal outcomes and progress arrive through the
/// [`SessionNotify`] handle given at construction. An immediate `Err` means
/// the transfer never started.
#[async_trait]
pub trait AsyncBr: Send + Sync {
    /// Start moving the access point's contents into the object store
    async fn start_backup(&self, source: AccessPoint, tags: HashMap<String, String>) -> Result<()>;

    /// Start restoring the identified snapshot into the access point
    async fn start_restore(&self, snapshot_id: &str, target: AccessPoint) -> Result<()>;

    /// Ask a running transfer to stop; the session reports `on_cancelled`
    /// when it has wound down
    fn cancel(&self);

    /// Release the session's resources; idempotent
    async fn close(&self);
}

/// What a factory needs to build one session
pub struct SessionParams {
    /// Namespace of the driving record
    pub namespace: String,
    /// Name of the driving record
    pub name: String,
    /// Key into the object-store configuration
    pub backup_storage_location: String,
    /// Where the session reports back; held weakly
    pub notify: Weak<dyn SessionNotify>,
}

/// Builds sessions on demand.
///
/// Injected into the reconcilers at construction; tests swap in factories
/// producing mock sessions.
pub type SessionFactory = Arc<dyn Fn(SessionParams) -> Arc<dyn AsyncBr> + Send + Sync>;
