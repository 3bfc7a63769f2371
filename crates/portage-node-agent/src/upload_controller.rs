//! DataUpload controller
//!
//! Drives a DataUpload from New to a terminal phase: win the accept race,
//! ask the exposer for a hosting pod, start a data-path session once the
//! pod is ready, and finalize on the session callbacks. Only the node named
//! in `status.node` performs work-bearing transitions after Accepted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use portage_common::crd::{DataUpload, MovePhase, MoveProgress, MoveRecord};
use portage_common::events::{actions, reasons};
use portage_common::kube_utils::{add_finalizer, has_finalizer, remove_finalizer};
use portage_common::metrics::{self, ReconcileTimer};
use portage_common::retry::{update_record_with_retry, update_status_with_retry};
use portage_common::{
    is_our_record, Error, EventPublisher, RecordStore, DATA_MOVER_FINALIZER, DATA_UPLOAD_LABEL,
};
use portage_datapath::{
    AccessPoint, CreateError, DataPathManager, SessionFactory, SessionNotify, SessionParams,
    SessionResult,
};
use portage_exposer::{
    host_pods_pattern, single_path_match, volume_directory, ExposeResult, SnapshotExposeParam,
    SnapshotExposer,
};

use crate::config::NodeAgentConfig;

/// Requeue delay when the data-path manager refuses a slot
pub const REQUEUE_CAPACITY: Duration = Duration::from_secs(5);

/// Bound on conflict-retrying status updates
const UPDATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Message recorded when a record times out waiting for its hosting pod
pub const PREPARE_TIMEOUT_MESSAGE: &str = "prepare timeout";

/// Message recorded when an in-flight record is found after an agent restart
pub const NODE_RESTART_MESSAGE: &str = "node restarted";

/// Shared context for the DataUpload controller
pub struct UploadContext {
    /// Record store (trait object for testability)
    pub store: Arc<dyn RecordStore<DataUpload>>,
    /// Raw client for PVC lookups during access-point resolution.
    /// None only in tests.
    pub client: Option<Client>,
    /// Snapshot exposers keyed by the record's snapshotType
    pub exposers: HashMap<String, Arc<dyn SnapshotExposer>>,
    /// Per-node bounded session registry
    pub data_path: Arc<DataPathManager>,
    /// Builds a session when a slot is acquired
    pub session_factory: SessionFactory,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Agent configuration (node identity, timeouts, paths)
    pub config: NodeAgentConfig,
}

/// Has a record been waiting for its hosting pod longer than allowed?
pub fn prepare_timed_out(start: &Time, now: DateTime<Utc>, timeout: Duration) -> bool {
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => now.signed_duration_since(start.0) > timeout,
        Err(_) => false,
    }
}

/// Request name carried by a hosting pod's label, if any
pub fn pod_request_name(pod: &Pod, label: &str) -> Option<String> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(label))
        .cloned()
}

/// A pod event re-triggers reconciliation only for records still waiting
/// for their hosting pod
pub fn wants_pod_events(phase: MovePhase) -> bool {
    phase == MovePhase::Accepted
}

fn expose_param(du: &DataUpload, node_name: &str) -> SnapshotExposeParam {
    let name = du.name_any();
    SnapshotExposeParam {
        source_namespace: du.spec.source_namespace.clone(),
        volume_snapshot: du
            .spec
            .csi_snapshot
            .as_ref()
            .map(|s| s.volume_snapshot.clone())
            .unwrap_or_default(),
        storage_class: du
            .spec
            .csi_snapshot
            .as_ref()
            .and_then(|s| s.storage_class.clone()),
        hosting_pod_labels: [(DATA_UPLOAD_LABEL.to_string(), name)].into_iter().collect(),
        node_name: node_name.to_string(),
    }
}

impl UploadContext {
    fn exposer_for(&self, du: &DataUpload) -> Result<Arc<dyn SnapshotExposer>, Error> {
        self.exposers
            .get(&du.spec.snapshot_type)
            .cloned()
            .ok_or_else(|| {
                Error::expose(
                    du.name_any(),
                    format!("{} type of snapshot exposer is not registered", du.spec.snapshot_type),
                )
            })
    }

    async fn publish(&self, owner: &ObjectReference, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        self.events.publish(owner, type_, reason, action, note).await;
    }

    /// Patch the record to Failed and tear the expose down.
    ///
    /// Used for every unrecoverable condition; observationally idempotent
    /// because the closure leaves already-terminal records alone.
    async fn fail_with_cleanup(&self, du: &DataUpload, message: String) {
        let name = du.name_any();
        warn!(request = %name, message = %message, "data upload failed");

        let result = update_status_with_retry(self.store.as_ref(), &name, UPDATE_TIMEOUT, |r| {
            let status = r.move_status_mut();
            if status.phase.is_terminal() {
                return;
            }
            status.phase = MovePhase::Failed;
            status.message = Some(message.clone());
            if status.start_timestamp.is_none() {
                status.start_timestamp = Some(Time(Utc::now()));
            }
            status.completion_timestamp = Some(Time(Utc::now()));
        })
        .await;
        if let Err(e) = result {
            warn!(request = %name, error = %e, "failed to mark data upload failed");
        }

        metrics::count_terminal_phase("dataupload", "Failed");
        let owner = du.object_ref(&());
        self.publish(
            &owner,
            EventType::Warning,
            reasons::FAILED,
            actions::RECONCILE,
            Some(message),
        )
        .await;

        self.data_path.remove(&name).await;
        if let Ok(exposer) = self.exposer_for(du) {
            exposer.clean_up(&owner).await;
            self.publish(&owner, EventType::Normal, reasons::CLEANED_UP, actions::RECONCILE, None)
                .await;
        }
    }

    /// Move a record without a running session straight to Canceled.
    ///
    /// Single optimistic attempt; a conflict means another actor is driving
    /// the record and the cancel will be honored elsewhere.
    async fn try_cancel(&self, du: &DataUpload) {
        let name = du.name_any();
        let mut record = du.clone();
        let status = record.move_status_mut();
        if status.phase.is_terminal() {
            return;
        }
        status.phase = MovePhase::Canceled;
        if status.start_timestamp.is_none() {
            status.start_timestamp = Some(Time(Utc::now()));
        }
        status.completion_timestamp = Some(Time(Utc::now()));

        match self.store.replace_status(&record).await {
            Ok(_) => {
                info!(request = %name, "data upload canceled");
                metrics::count_terminal_phase("dataupload", "Canceled");
                let owner = du.object_ref(&());
                self.publish(&owner, EventType::Normal, reasons::CANCELED, actions::RECONCILE, None)
                    .await;
                self.data_path.remove(&name).await;
                if let Ok(exposer) = self.exposer_for(du) {
                    exposer.clean_up(&owner).await;
                }
            }
            Err(e) if e.is_conflict() => {
                debug!(request = %name, "cancel raced with another update");
            }
            Err(e) => {
                warn!(request = %name, error = %e, "failed to cancel data upload");
            }
        }
    }

    /// The accept CAS: exactly one node wins the status write.
    async fn accept(&self, du: &DataUpload) -> Result<bool, Error> {
        let mut record = du.clone();
        let status = record.move_status_mut();
        status.phase = MovePhase::Accepted;
        status.node = Some(self.config.node_name.clone());
        status.start_timestamp = Some(Time(Utc::now()));

        match self.store.replace_status(&record).await {
            Ok(mut updated) => {
                if add_finalizer(&mut updated, DATA_MOVER_FINALIZER) {
                    self.store.replace(&updated).await?;
                }
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Single-attempt prepare-timeout transition; conflicts are absorbed.
    async fn on_prepare_timeout(&self, du: &DataUpload) {
        let name = du.name_any();
        let mut record = du.clone();
        let status = record.move_status_mut();
        status.phase = MovePhase::Failed;
        status.message = Some(PREPARE_TIMEOUT_MESSAGE.to_string());
        status.completion_timestamp = Some(Time(Utc::now()));

        match self.store.replace_status(&record).await {
            Ok(_) => {
                warn!(request = %name, "data upload timed out waiting for its hosting pod");
                metrics::count_terminal_phase("dataupload", "Failed");
                let owner = du.object_ref(&());
                self.publish(
                    &owner,
                    EventType::Warning,
                    reasons::PREPARE_TIMEOUT,
                    actions::RECONCILE,
                    Some(PREPARE_TIMEOUT_MESSAGE.to_string()),
                )
                .await;
                if let Ok(exposer) = self.exposer_for(du) {
                    exposer.clean_up(&owner).await;
                }
            }
            Err(e) if e.is_conflict() => {
                debug!(request = %name, "prepare timeout raced with another update");
            }
            Err(e) => {
                warn!(request = %name, error = %e, "failed to fail timed-out data upload");
            }
        }
    }

    /// Resolve the hosting pod's volume to a path on this node
    pub(crate) async fn resolve_access_point(
        &self,
        exposed: &ExposeResult,
    ) -> Result<AccessPoint, Error> {
        let pod = &exposed.by_pod.hosting_pod;
        let volume_name = &exposed.by_pod.volume_name;

        let claim_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .and_then(|vols| vols.iter().find(|v| &v.name == volume_name))
            .and_then(|v| v.persistent_volume_claim.as_ref())
            .map(|pvc| pvc.claim_name.clone());

        let claim = match claim_name {
            Some(claim_name) => {
                let client = self.client.as_ref().ok_or_else(|| {
                    Error::internal_with_context("access-point", "no client for PVC lookup")
                })?;
                let namespace = pod.namespace().ok_or_else(|| {
                    Error::internal_with_context("access-point", "hosting pod has no namespace")
                })?;
                let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &namespace);
                Some(api.get(&claim_name).await?)
            }
            None => None,
        };

        let dir = volume_directory(pod, volume_name, claim.as_ref())?;
        let uid = pod
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("access-point", "hosting pod has no uid"))?;
        let pattern = host_pods_pattern(&self.config.host_pods_path, uid, &dir);
        let path = single_path_match(&pattern)?;

        Ok(AccessPoint { by_path: path })
    }

    async fn clean_up_by_name(&self, name: &str) {
        match self.store.get(name).await {
            Ok(Some(du)) => {
                if let Ok(exposer) = self.exposer_for(&du) {
                    exposer.clean_up(&du.object_ref(&())).await;
                }
            }
            Ok(None) => debug!(request = %name, "record gone before expose cleanup"),
            Err(e) => warn!(request = %name, error = %e, "failed to fetch record for cleanup"),
        }
    }
}

/// Reconcile a DataUpload record
#[instrument(skip(du, ctx), fields(request = %du.name_any(), phase = %du.phase()))]
pub async fn reconcile(du: Arc<DataUpload>, ctx: Arc<UploadContext>) -> Result<Action, Error> {
    if !is_our_record(du.data_mover(), &ctx.config.data_mover) {
        debug!("record addresses a different data mover, ignoring");
        return Ok(Action::await_change());
    }

    let timer = ReconcileTimer::start("dataupload");
    let result = run_phase(&du, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(if e.is_retryable() { "transient" } else { "permanent" }),
    }
    result
}

async fn run_phase(du: &Arc<DataUpload>, ctx: &Arc<UploadContext>) -> Result<Action, Error> {
    if du.metadata.deletion_timestamp.is_some() && has_finalizer(du.as_ref(), DATA_MOVER_FINALIZER)
    {
        match handle_deletion(du, ctx).await? {
            Some(action) => return Ok(action),
            // cancel already requested; keep driving the phases below so
            // the record winds down through the normal cancel path
            None => {}
        }
    }

    match du.phase() {
        MovePhase::New => handle_new(du, ctx).await,
        MovePhase::Accepted => handle_accepted(du, ctx).await,
        MovePhase::Prepared => handle_prepared(du, ctx).await,
        MovePhase::InProgress => handle_in_progress(du, ctx).await,
        MovePhase::Canceling => Ok(Action::await_change()),
        MovePhase::Completed | MovePhase::Failed | MovePhase::Canceled => {
            Ok(Action::await_change())
        }
    }
}

/// Deletion processing. `Some(action)` ends the reconcile; `None` falls
/// through to normal phase handling.
async fn handle_deletion(
    du: &Arc<DataUpload>,
    ctx: &Arc<UploadContext>,
) -> Result<Option<Action>, Error> {
    let name = du.name_any();

    if !du.phase().is_terminal() {
        if !du.cancel_requested() {
            info!(request = %name, "deletion requested, cancelling the record first");
            update_record_with_retry(ctx.store.as_ref(), &name, UPDATE_TIMEOUT, |r| {
                r.request_cancel();
            })
            .await?;
            return Ok(Some(Action::await_change()));
        }
        return Ok(None);
    }

    info!(request = %name, "releasing resources and removing finalizer");
    ctx.data_path.remove(&name).await;
    let owner = du.object_ref(&());
    if let Ok(exposer) = ctx.exposer_for(du) {
        exposer.clean_up(&owner).await;
    }
    update_record_with_retry(ctx.store.as_ref(), &name, UPDATE_TIMEOUT, |r| {
        remove_finalizer(r, DATA_MOVER_FINALIZER);
    })
    .await?;
    ctx.publish(&owner, EventType::Normal, reasons::CLEANED_UP, actions::FINALIZE, None)
        .await;

    Ok(Some(Action::await_change()))
}

async fn handle_new(du: &Arc<DataUpload>, ctx: &Arc<UploadContext>) -> Result<Action, Error> {
    let name = du.name_any();

    if du.cancel_requested() {
        ctx.try_cancel(du).await;
        return Ok(Action::await_change());
    }

    // An unknown snapshot type can never progress; fail it up front and
    // leave the record alone, like any other terminal exposer error
    let exposer = match ctx.exposer_for(du) {
        Ok(exposer) => exposer,
        Err(e) => {
            ctx.fail_with_cleanup(du, e.to_string()).await;
            return Ok(Action::await_change());
        }
    };

    if !ctx.accept(du).await? {
        debug!(request = %name, "another node accepted this record");
        return Ok(Action::await_change());
    }
    info!(request = %name, node = %ctx.config.node_name, "data upload accepted");
    let owner = du.object_ref(&());
    ctx.publish(&owner, EventType::Normal, reasons::ACCEPTED, actions::RECONCILE, None)
        .await;

    let param = expose_param(du, &ctx.config.node_name);
    if let Err(e) = exposer.expose(&owner, &param).await {
        ctx.fail_with_cleanup(du, format!("exposing snapshot: {}", e)).await;
        return Ok(Action::await_change());
    }
    ctx.publish(&owner, EventType::Normal, reasons::EXPOSED, actions::RECONCILE, None)
        .await;

    Ok(Action::requeue(ctx.config.exposer_poll_interval))
}

async fn handle_accepted(du: &Arc<DataUpload>, ctx: &Arc<UploadContext>) -> Result<Action, Error> {
    let name = du.name_any();

    if du.cancel_requested() {
        ctx.try_cancel(du).await;
        return Ok(Action::await_change());
    }

    if let Some(start) = du.move_status().and_then(|s| s.start_timestamp.as_ref()) {
        if prepare_timed_out(start, Utc::now(), ctx.config.prepare_timeout) {
            ctx.on_prepare_timeout(du).await;
            return Ok(Action::await_change());
        }
    }

    // Only the accepting node polls the exposer
    if du.node() != Some(ctx.config.node_name.as_str()) {
        return Ok(Action::await_change());
    }

    // The finalizer rides a second write after the accept CAS; re-assert
    // it in case the accept was interrupted between the two
    if !has_finalizer(du.as_ref(), DATA_MOVER_FINALIZER) {
        update_record_with_retry(ctx.store.as_ref(), &name, UPDATE_TIMEOUT, |r| {
            add_finalizer(r, DATA_MOVER_FINALIZER);
        })
        .await?;
    }

    let exposer = ctx.exposer_for(du)?;
    let owner = du.object_ref(&());
    match exposer.get_exposed(&owner, &ctx.config.node_name).await {
        Err(e) => {
            ctx.fail_with_cleanup(du, format!("waiting for exposed snapshot: {}", e))
                .await;
            Ok(Action::await_change())
        }
        Ok(None) => {
            debug!(request = %name, "hosting pod not ready yet");
            Ok(Action::requeue(ctx.config.exposer_poll_interval))
        }
        Ok(Some(_)) => {
            update_status_with_retry(ctx.store.as_ref(), &name, UPDATE_TIMEOUT, |r| {
                let status = r.move_status_mut();
                if status.phase == MovePhase::Accepted {
                    status.phase = MovePhase::Prepared;
                }
            })
            .await?;
            info!(request = %name, "data upload prepared");
            ctx.publish(&owner, EventType::Normal, reasons::PREPARED, actions::RECONCILE, None)
                .await;
            Ok(Action::await_change())
        }
    }
}

async fn handle_prepared(du: &Arc<DataUpload>, ctx: &Arc<UploadContext>) -> Result<Action, Error> {
    let name = du.name_any();

    if du.cancel_requested() {
        ctx.try_cancel(du).await;
        return Ok(Action::await_change());
    }

    if du.node() != Some(ctx.config.node_name.as_str()) {
        return Ok(Action::await_change());
    }

    if ctx.data_path.get(&name).is_some() {
        debug!(request = %name, "session already driving this record");
        return Ok(Action::await_change());
    }

    let exposer = ctx.exposer_for(du)?;
    let owner = du.object_ref(&());
    let exposed = match exposer.get_exposed(&owner, &ctx.config.node_name).await {
        Ok(Some(exposed)) => exposed,
        Ok(None) => {
            ctx.fail_with_cleanup(du, "exposed snapshot is gone".to_string()).await;
            return Ok(Action::await_change());
        }
        Err(e) => {
            ctx.fail_with_cleanup(du, format!("fetching exposed snapshot: {}", e))
                .await;
            return Ok(Action::await_change());
        }
    };

    start_session(ctx, du, &exposed).await
}

/// Acquire a slot, flip the record to InProgress, and start the session
pub(crate) async fn start_session(
    ctx: &Arc<UploadContext>,
    du: &DataUpload,
    exposed: &ExposeResult,
) -> Result<Action, Error> {
    let name = du.name_any();
    let namespace = du.namespace().unwrap_or_default();

    let notify: Arc<dyn SessionNotify> = ctx.clone();
    let params = SessionParams {
        namespace: namespace.clone(),
        name: name.clone(),
        backup_storage_location: du.spec.backup_storage_location.clone(),
        notify: Arc::downgrade(&notify),
    };

    let session = match ctx.data_path.create(&name, &ctx.session_factory, params) {
        Ok(session) => session,
        Err(CreateError::ConcurrencyLimit) => {
            debug!(request = %name, "data path concurrency limit reached, waiting");
            return Ok(Action::requeue(REQUEUE_CAPACITY));
        }
        Err(CreateError::AlreadyExists(_)) => {
            debug!(request = %name, "session already registered");
            return Ok(Action::await_change());
        }
    };

    let access = match ctx.resolve_access_point(exposed).await {
        Ok(access) => access,
        Err(e) => {
            ctx.data_path.remove(&name).await;
            ctx.fail_with_cleanup(du, format!("resolving access point: {}", e))
                .await;
            return Ok(Action::await_change());
        }
    };

    // The slot is held before the phase flips so a post-crash sweeper
    // never sees InProgress without a session on a live node
    let mut record = du.clone();
    record.move_status_mut().phase = MovePhase::InProgress;
    match ctx.store.replace_status(&record).await {
        Ok(_) => {}
        Err(e) if e.is_conflict() => {
            ctx.data_path.remove(&name).await;
            debug!(request = %name, "lost the InProgress transition, requeueing");
            return Ok(Action::requeue(REQUEUE_CAPACITY));
        }
        Err(e) => {
            ctx.data_path.remove(&name).await;
            return Err(e);
        }
    }

    let tags = [
        ("source-namespace".to_string(), du.spec.source_namespace.clone()),
        ("source-pvc".to_string(), du.spec.source_pvc.clone()),
    ]
    .into_iter()
    .collect();

    if let Err(e) = session.start_backup(access, tags).await {
        ctx.data_path.remove(&name).await;
        ctx.fail_with_cleanup(du, format!("starting data path backup: {}", e))
            .await;
        return Ok(Action::await_change());
    }

    info!(request = %name, "data path backup started");
    ctx.publish(
        &du.object_ref(&()),
        EventType::Normal,
        reasons::STARTED,
        actions::RECONCILE,
        None,
    )
    .await;

    Ok(Action::await_change())
}

async fn handle_in_progress(
    du: &Arc<DataUpload>,
    ctx: &Arc<UploadContext>,
) -> Result<Action, Error> {
    let name = du.name_any();
    let namespace = du.namespace().unwrap_or_default();

    if !du.cancel_requested() {
        return Ok(Action::await_change());
    }

    match ctx.data_path.get(&name) {
        // No session survived (agent restart); nothing to wind down
        None => {
            SessionNotify::on_cancelled(ctx.as_ref(), &namespace, &name).await;
            Ok(Action::await_change())
        }
        Some(session) => {
            info!(request = %name, "forwarding cancel to the data path session");
            if let Err(e) = update_status_with_retry(ctx.store.as_ref(), &name, UPDATE_TIMEOUT, |r| {
                let status = r.move_status_mut();
                if status.phase == MovePhase::InProgress {
                    status.phase = MovePhase::Canceling;
                }
            })
            .await
            {
                warn!(request = %name, error = %e, "failed to mark record Canceling");
            }
            session.cancel();
            Ok(Action::await_change())
        }
    }
}

#[async_trait]
impl SessionNotify for UploadContext {
    async fn on_completed(&self, _namespace: &str, name: &str, result: SessionResult) {
        info!(request = %name, "data upload completed");

        // Terminal patch precedes session close and slot release
        let patched = update_status_with_retry(self.store.as_ref(), name, UPDATE_TIMEOUT, |r| {
            let status = r.move_status_mut();
            if status.phase.is_terminal() {
                return;
            }
            status.phase = MovePhase::Completed;
            status.snapshot_id = result.snapshot_id.clone();
            status.completion_timestamp = Some(Time(Utc::now()));
        })
        .await;
        if let Err(e) = patched {
            error!(request = %name, error = %e, "failed to mark data upload completed");
        }

        metrics::count_terminal_phase("dataupload", "Completed");
        metrics::count_bytes_moved("upload", result.total_bytes);

        self.data_path.remove(name).await;
        self.clean_up_by_name(name).await;
    }

    async fn on_failed(&self, _namespace: &str, name: &str, error: Error) {
        error!(request = %name, error = %error, "data upload session failed");

        let patched = update_status_with_retry(self.store.as_ref(), name, UPDATE_TIMEOUT, |r| {
            let status = r.move_status_mut();
            if status.phase.is_terminal() {
                return;
            }
            status.phase = MovePhase::Failed;
            status.message = Some(error.to_string());
            if status.start_timestamp.is_none() {
                status.start_timestamp = Some(Time(Utc::now()));
            }
            status.completion_timestamp = Some(Time(Utc::now()));
        })
        .await;
        if let Err(e) = patched {
            error!(request = %name, error = %e, "failed to mark data upload failed");
        }

        metrics::count_terminal_phase("dataupload", "Failed");
        self.data_path.remove(name).await;
        self.clean_up_by_name(name).await;
    }

    async fn on_cancelled(&self, _namespace: &str, name: &str) {
        warn!(request = %name, "data upload canceled by the session");

        let patched = update_status_with_retry(self.store.as_ref(), name, UPDATE_TIMEOUT, |r| {
            let status = r.move_status_mut();
            if status.phase.is_terminal() {
                return;
            }
            status.phase = MovePhase::Canceled;
            if status.start_timestamp.is_none() {
                status.start_timestamp = Some(Time(Utc::now()));
            }
            status.completion_timestamp = Some(Time(Utc::now()));
        })
        .await;
        if let Err(e) = patched {
            error!(request = %name, error = %e, "failed to mark data upload canceled");
        }

        metrics::count_terminal_phase("dataupload", "Canceled");
        self.data_path.remove(name).await;
        self.clean_up_by_name(name).await;
    }

    async fn on_progress(&self, _namespace: &str, name: &str, progress: MoveProgress) {
        let patched = update_status_with_retry(self.store.as_ref(), name, UPDATE_TIMEOUT, |r| {
            r.move_status_mut().progress = progress;
        })
        .await;
        if let Err(e) = patched {
            warn!(request = %name, error = %e, "failed to patch data upload progress");
        }
    }
}

/// Error policy for the DataUpload controller
pub fn error_policy(du: Arc<DataUpload>, error: &Error, _ctx: Arc<UploadContext>) -> Action {
    error!(request = %du.name_any(), error = %error, "data upload reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use portage_datapath::DataPathManager;

    use crate::testing::{
        expose_result, probe_factory, stage_host_volume, upload, upload_ctx, upload_in,
        FakeSnapshotExposer, InMemoryStore, SessionMode, SessionProbe, TEST_NAMESPACE, TEST_NODE,
    };

    fn minutes_ago(minutes: i64) -> Time {
        Time(Utc::now() - chrono::Duration::minutes(minutes))
    }

    fn plain_ctx(
        store: Arc<InMemoryStore<DataUpload>>,
        exposer: Arc<FakeSnapshotExposer>,
    ) -> (Arc<UploadContext>, Arc<SessionProbe>) {
        let probe = Arc::new(SessionProbe::default());
        let ctx = upload_ctx(
            store,
            exposer,
            Arc::new(DataPathManager::new(1)),
            probe_factory(SessionMode::Hold, probe.clone()),
            std::env::temp_dir(),
        );
        (ctx, probe)
    }

    #[tokio::test]
    async fn test_foreign_data_mover_is_ignored() {
        let mut du = upload("u1");
        du.spec.data_mover = Some("velero".to_string());
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer.clone());

        let action = reconcile(Arc::new(du), ctx).await.expect("reconcile");

        assert_eq!(action, Action::await_change());
        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::New);
        assert_eq!(exposer.expose_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_new_record_is_accepted_and_exposed() {
        let du = upload("u1");
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer.clone());

        let action = reconcile(Arc::new(du), ctx.clone()).await.expect("reconcile");

        assert_eq!(action, Action::requeue(ctx.config.exposer_poll_interval));
        let stored = store.stored("u1").unwrap();
        assert_eq!(stored.phase(), MovePhase::Accepted);
        assert_eq!(stored.node(), Some(TEST_NODE));
        assert!(stored.move_status().unwrap().start_timestamp.is_some());
        assert!(has_finalizer(&stored, DATA_MOVER_FINALIZER));
        assert_eq!(exposer.expose_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_accept_conflict_means_another_node_won() {
        let du = upload("u1");
        let store = InMemoryStore::with(vec![du.clone()]);
        store.conflicts.store(1, Ordering::SeqCst);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer.clone());

        let action = reconcile(Arc::new(du), ctx).await.expect("reconcile");

        assert_eq!(action, Action::await_change());
        // The loser takes no side-effectful action
        let stored = store.stored("u1").unwrap();
        assert_eq!(stored.phase(), MovePhase::New);
        assert!(!has_finalizer(&stored, DATA_MOVER_FINALIZER));
        assert_eq!(exposer.expose_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_snapshot_type_fails_the_record_without_requeue() {
        let mut du = upload("u1");
        du.spec.snapshot_type = "unknown type".to_string();
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer);

        let action = reconcile(Arc::new(du), ctx).await.expect("reconcile");

        // Terminal exposer errors flip the record once and never requeue
        assert_eq!(action, Action::await_change());
        let stored = store.stored("u1").unwrap();
        assert_eq!(stored.phase(), MovePhase::Failed);
        let status = stored.move_status().unwrap();
        assert!(status.message.as_ref().unwrap().contains("not registered"));
        assert!(status.completion_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_accepted_polls_until_hosting_pod_ready() {
        let du = upload_in("u1", MovePhase::Accepted, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer);

        let action = reconcile(Arc::new(du), ctx.clone()).await.expect("reconcile");

        assert_eq!(action, Action::requeue(ctx.config.exposer_poll_interval));
        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::Accepted);
    }

    #[tokio::test]
    async fn test_accepted_ready_moves_to_prepared() {
        let du = upload_in("u1", MovePhase::Accepted, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::ready("u1", expose_result("u1", "uid-1"));
        let (ctx, _) = plain_ctx(store.clone(), exposer);

        let action = reconcile(Arc::new(du), ctx).await.expect("reconcile");

        assert_eq!(action, Action::await_change());
        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::Prepared);
    }

    #[tokio::test]
    async fn test_accepted_on_another_node_is_left_alone() {
        let du = upload_in("u1", MovePhase::Accepted, Some("node-2"));
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::ready("u1", expose_result("u1", "uid-1"));
        let (ctx, _) = plain_ctx(store.clone(), exposer);

        let action = reconcile(Arc::new(du), ctx).await.expect("reconcile");

        assert_eq!(action, Action::await_change());
        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::Accepted);
    }

    #[tokio::test]
    async fn test_prepare_timeout_fails_exactly_once() {
        let mut du = upload_in("u1", MovePhase::Accepted, Some(TEST_NODE));
        du.move_status_mut().start_timestamp = Some(minutes_ago(6));
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer.clone());

        let action = reconcile(Arc::new(du), ctx.clone()).await.expect("reconcile");

        assert_eq!(action, Action::await_change());
        let stored = store.stored("u1").unwrap();
        assert_eq!(stored.phase(), MovePhase::Failed);
        let status = stored.move_status().unwrap();
        assert_eq!(status.message.as_deref(), Some(PREPARE_TIMEOUT_MESSAGE));
        assert!(status.completion_timestamp.is_some());
        assert_eq!(exposer.clean_up_calls.load(Ordering::SeqCst), 1);
        assert!(ctx.data_path.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_timeout_not_reached_within_window() {
        let mut du = upload_in("u1", MovePhase::Accepted, Some(TEST_NODE));
        du.move_status_mut().start_timestamp = Some(minutes_ago(4));
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer);

        reconcile(Arc::new(du), ctx).await.expect("reconcile");

        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::Accepted);
    }

    #[tokio::test]
    async fn test_prepare_timeout_conflict_is_absorbed() {
        let mut du = upload_in("u1", MovePhase::Accepted, Some(TEST_NODE));
        du.move_status_mut().start_timestamp = Some(minutes_ago(6));
        let store = InMemoryStore::with(vec![du.clone()]);
        store.conflicts.store(1, Ordering::SeqCst);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer.clone());

        reconcile(Arc::new(du), ctx).await.expect("no error on conflict");

        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::Accepted);
        assert_eq!(exposer.clean_up_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prepared_without_capacity_requeues_five_seconds() {
        let du = upload_in("u1", MovePhase::Prepared, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::ready("u1", expose_result("u1", "uid-1"));
        let probe = Arc::new(SessionProbe::default());
        let ctx = upload_ctx(
            store.clone(),
            exposer,
            Arc::new(DataPathManager::new(0)),
            probe_factory(SessionMode::Hold, probe.clone()),
            std::env::temp_dir(),
        );

        let action = reconcile(Arc::new(du), ctx).await.expect("reconcile");

        assert_eq!(action, Action::requeue(REQUEUE_CAPACITY));
        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::Prepared);
        assert_eq!(probe.backups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prepared_starts_session_and_moves_in_progress() {
        let du = upload_in("u1", MovePhase::Prepared, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::ready("u1", expose_result("u1", "uid-1"));
        let probe = Arc::new(SessionProbe::default());
        let host_pods = stage_host_volume("starts-session", "uid-1", "u1");
        let ctx = upload_ctx(
            store.clone(),
            exposer,
            Arc::new(DataPathManager::new(1)),
            probe_factory(SessionMode::Hold, probe.clone()),
            host_pods,
        );

        let action = reconcile(Arc::new(du), ctx.clone()).await.expect("reconcile");

        assert_eq!(action, Action::await_change());
        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::InProgress);
        assert_eq!(probe.backups.load(Ordering::SeqCst), 1);
        assert!(ctx.data_path.get("u1").is_some());
    }

    #[tokio::test]
    async fn test_happy_path_completes_with_single_cleanup() {
        let du = upload_in("u1", MovePhase::Prepared, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::ready("u1", expose_result("u1", "uid-1"));
        let probe = Arc::new(SessionProbe::default());
        let host_pods = stage_host_volume("happy-path", "uid-1", "u1");
        let ctx = upload_ctx(
            store.clone(),
            exposer.clone(),
            Arc::new(DataPathManager::new(1)),
            probe_factory(
                SessionMode::CompleteImmediately(SessionResult {
                    snapshot_id: Some("snap-x".to_string()),
                    total_bytes: 1024,
                }),
                probe.clone(),
            ),
            host_pods,
        );

        reconcile(Arc::new(du), ctx.clone()).await.expect("reconcile");

        let stored = store.stored("u1").unwrap();
        assert_eq!(stored.phase(), MovePhase::Completed);
        let status = stored.move_status().unwrap();
        assert!(status.completion_timestamp.is_some());
        assert_eq!(status.snapshot_id.as_deref(), Some("snap-x"));
        // Slot released, session closed, expose torn down exactly once
        assert!(ctx.data_path.is_empty());
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
        assert_eq!(exposer.clean_up_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_frees_after_completion() {
        let u2 = upload_in("u2", MovePhase::Prepared, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![u2.clone()]);
        let exposer = FakeSnapshotExposer::ready("u2", expose_result("u2", "uid-2"));
        let probe = Arc::new(SessionProbe::default());
        let data_path = Arc::new(DataPathManager::new(1));
        let host_pods = stage_host_volume("capacity-frees", "uid-2", "u2");
        let factory = probe_factory(SessionMode::Hold, probe.clone());
        let ctx = upload_ctx(store.clone(), exposer, data_path.clone(), factory.clone(), host_pods);

        // u1 holds the only slot
        let notify: Arc<dyn SessionNotify> = ctx.clone();
        data_path
            .create(
                "u1",
                &factory,
                SessionParams {
                    namespace: TEST_NAMESPACE.to_string(),
                    name: "u1".to_string(),
                    backup_storage_location: "default".to_string(),
                    notify: Arc::downgrade(&notify),
                },
            )
            .expect("slot for u1");

        let action = reconcile(Arc::new(u2.clone()), ctx.clone()).await.expect("reconcile");
        assert_eq!(action, Action::requeue(REQUEUE_CAPACITY));
        assert_eq!(store.stored("u2").unwrap().phase(), MovePhase::Prepared);

        // u1 winds down; the next reconcile of u2 takes the slot
        data_path.remove("u1").await;
        let action = reconcile(Arc::new(u2), ctx).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
        assert_eq!(store.stored("u2").unwrap().phase(), MovePhase::InProgress);
    }

    #[tokio::test]
    async fn test_in_progress_cancel_forwards_to_session() {
        let mut du = upload_in("u1", MovePhase::InProgress, Some(TEST_NODE));
        du.spec.cancel = true;
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let probe = Arc::new(SessionProbe::default());
        let data_path = Arc::new(DataPathManager::new(1));
        let factory = probe_factory(SessionMode::Hold, probe.clone());
        let ctx = upload_ctx(
            store.clone(),
            exposer,
            data_path.clone(),
            factory.clone(),
            std::env::temp_dir(),
        );

        let notify: Arc<dyn SessionNotify> = ctx.clone();
        data_path
            .create(
                "u1",
                &factory,
                SessionParams {
                    namespace: TEST_NAMESPACE.to_string(),
                    name: "u1".to_string(),
                    backup_storage_location: "default".to_string(),
                    notify: Arc::downgrade(&notify),
                },
            )
            .expect("slot");

        reconcile(Arc::new(du), ctx).await.expect("reconcile");

        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::Canceling);
        assert_eq!(probe.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_progress_cancel_without_session_cancels_directly() {
        let mut du = upload_in("u1", MovePhase::InProgress, Some(TEST_NODE));
        du.spec.cancel = true;
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, probe) = plain_ctx(store.clone(), exposer.clone());

        reconcile(Arc::new(du), ctx).await.expect("reconcile");

        let stored = store.stored("u1").unwrap();
        assert_eq!(stored.phase(), MovePhase::Canceled);
        assert!(stored.move_status().unwrap().completion_timestamp.is_some());
        assert_eq!(probe.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(exposer.clean_up_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_accepted_cancel_moves_straight_to_canceled() {
        let mut du = upload_in("u1", MovePhase::Accepted, Some(TEST_NODE));
        du.spec.cancel = true;
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer.clone());

        reconcile(Arc::new(du), ctx).await.expect("reconcile");

        let stored = store.stored("u1").unwrap();
        assert_eq!(stored.phase(), MovePhase::Canceled);
        assert!(stored.move_status().unwrap().start_timestamp.is_some());
        assert!(stored.move_status().unwrap().completion_timestamp.is_some());
        assert_eq!(exposer.clean_up_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deletion_of_live_record_requests_cancel_first() {
        let mut du = upload_in("u1", MovePhase::Accepted, Some(TEST_NODE));
        du.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()));
        add_finalizer(&mut du, DATA_MOVER_FINALIZER);
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer);

        let action = reconcile(Arc::new(du), ctx).await.expect("reconcile");

        assert_eq!(action, Action::await_change());
        let stored = store.stored("u1").unwrap();
        assert!(stored.cancel_requested());
        assert_eq!(stored.phase(), MovePhase::Accepted);
        assert!(has_finalizer(&stored, DATA_MOVER_FINALIZER));
    }

    #[tokio::test]
    async fn test_deletion_of_terminal_record_releases_and_unblocks() {
        let mut du = upload_in("u1", MovePhase::Failed, Some(TEST_NODE));
        du.spec.cancel = true;
        du.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()));
        add_finalizer(&mut du, DATA_MOVER_FINALIZER);
        let store = InMemoryStore::with(vec![du.clone()]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer.clone());

        reconcile(Arc::new(du), ctx.clone()).await.expect("reconcile");

        let stored = store.stored("u1").unwrap();
        assert!(!has_finalizer(&stored, DATA_MOVER_FINALIZER));
        assert_eq!(exposer.clean_up_calls.load(Ordering::SeqCst), 1);
        assert!(ctx.data_path.is_empty());
    }

    #[tokio::test]
    async fn test_progress_callbacks_keep_last_value() {
        let du = upload_in("u1", MovePhase::InProgress, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer);

        for done in [512i64, 1024] {
            SessionNotify::on_progress(
                ctx.as_ref(),
                TEST_NAMESPACE,
                "u1",
                MoveProgress {
                    total_bytes: 1024,
                    bytes_done: done,
                },
            )
            .await;
        }

        let progress = store.stored("u1").unwrap().move_status().unwrap().progress;
        assert_eq!(progress.total_bytes, 1024);
        assert_eq!(progress.bytes_done, 1024);
    }

    #[tokio::test]
    async fn test_on_failed_records_message_and_timestamps() {
        let du = upload_in("u1", MovePhase::InProgress, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer.clone());

        SessionNotify::on_failed(
            ctx.as_ref(),
            TEST_NAMESPACE,
            "u1",
            Error::data_path("u1", "mover exited with signal 9"),
        )
        .await;

        let stored = store.stored("u1").unwrap();
        assert_eq!(stored.phase(), MovePhase::Failed);
        let status = stored.move_status().unwrap();
        assert!(status.message.as_ref().unwrap().contains("signal 9"));
        assert!(status.start_timestamp.is_some());
        assert!(status.completion_timestamp.is_some());
        assert_eq!(exposer.clean_up_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_cancelled_records_timestamps() {
        let du = upload_in("u1", MovePhase::Canceling, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer);

        SessionNotify::on_cancelled(ctx.as_ref(), TEST_NAMESPACE, "u1").await;

        let stored = store.stored("u1").unwrap();
        assert_eq!(stored.phase(), MovePhase::Canceled);
        let status = stored.move_status().unwrap();
        assert!(status.start_timestamp.is_some());
        assert!(status.completion_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_terminal_phase_never_reverts_on_late_callbacks() {
        let du = upload_in("u1", MovePhase::Canceled, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du]);
        let exposer = FakeSnapshotExposer::not_ready();
        let (ctx, _) = plain_ctx(store.clone(), exposer);

        SessionNotify::on_completed(ctx.as_ref(), TEST_NAMESPACE, "u1", SessionResult::default())
            .await;

        assert_eq!(store.stored("u1").unwrap().phase(), MovePhase::Canceled);
    }

    #[test]
    fn test_prepare_timed_out_boundary() {
        let timeout = Duration::from_secs(300);
        let now = Utc::now();
        let just_inside = Time(now - chrono::Duration::seconds(299));
        let just_past = Time(now - chrono::Duration::seconds(301));
        assert!(!prepare_timed_out(&just_inside, now, timeout));
        assert!(prepare_timed_out(&just_past, now, timeout));
    }

    #[test]
    fn test_pod_request_name_reads_label() {
        let pod = crate::testing::running_hosting_pod("u1", "uid-1");
        assert_eq!(pod_request_name(&pod, DATA_UPLOAD_LABEL), Some("u1".to_string()));
        assert_eq!(pod_request_name(&pod, "portage.dev/data-download"), None);
    }

    #[test]
    fn test_pod_events_only_matter_while_accepted() {
        assert!(wants_pod_events(MovePhase::Accepted));
        assert!(!wants_pod_events(MovePhase::New));
        assert!(!wants_pod_events(MovePhase::Prepared));
        assert!(!wants_pod_events(MovePhase::InProgress));
        assert!(!wants_pod_events(MovePhase::Completed));
    }

    #[tokio::test]
    async fn test_update_conflict_exhaustion_surfaces_deadline() {
        // Conflicts on every attempt push the retry loop into its deadline
        let du = upload_in("u1", MovePhase::InProgress, Some(TEST_NODE));
        let store = InMemoryStore::with(vec![du]);
        store.conflicts.store(usize::MAX, Ordering::SeqCst);

        let err = update_status_with_retry(
            store.as_ref() as &dyn RecordStore<DataUpload>,
            "u1",
            Duration::from_millis(50),
            |r| r.move_status_mut().phase = MovePhase::Canceling,
        )
        .await
        .expect_err("deadline");

        assert!(matches!(err, Error::DeadlineExceeded { .. }));
    }
}
