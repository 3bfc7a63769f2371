//! DataDownload controller
//!
//! Drives a DataDownload from New to a terminal phase. The shape mirrors
//! the DataUpload controller with one generic restore exposer instead of
//! the snapshot-typed registry, and one extra obligation: after the session
//! completes, the restored volume is rebound to the user's target PVC
//! before cleanup, and a failed rebind turns the download into a failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use portage_common::crd::{DataDownload, MovePhase, MoveProgress, MoveRecord};
use portage_common::events::{actions, reasons};
use portage_common::kube_utils::{has_finalizer, remove_finalizer};
use portage_common::metrics::{self, ReconcileTimer};
use portage_common::retry::{update_record_with_retry, update_status_with_retry};
use portage_common::{
    is_our_record, Error, EventPublisher, RecordStore, DATA_DOWNLOAD_LABEL, DATA_MOVER_FINALIZER,
};
use portage_datapath::{
    CreateError, DataPathManager, SessionFactory, SessionNotify, SessionParams, SessionResult,
};
use portage_exposer::{ExposeResult, RestoreExposeParam, RestoreExposer};

use crate::config::NodeAgentConfig;
use crate::upload_controller::{prepare_timed_out, PREPARE_TIMEOUT_MESSAGE, REQUEUE_CAPACITY};

/// Bound on conflict-retrying status updates
const UPDATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared context for the DataDownload controller
pub struct DownloadContext {
    /// Record store (trait object for testability)
    pub store: Arc<dyn RecordStore<DataDownload>>,
    /// Raw client for PVC lookups during access-point resolution.
    /// None only in tests.
    pub client: Option<Client>,
    /// The one generic restore exposer
    pub exposer: Arc<dyn RestoreExposer>,
    /// Per-node bounded session registry
    pub data_path: Arc<DataPathManager>,
    /// Builds a session when a slot is acquired
    pub session_factory: SessionFactory,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Agent configuration (node identity, timeouts, paths)
    pub config: NodeAgentConfig,
}

fn expose_param(dd: &DataDownload, node_name: &str) -> RestoreExposeParam {
    let name = dd.name_any();
    RestoreExposeParam {
        target_namespace: dd.spec.target_volume.namespace.clone(),
        target_pvc: dd.spec.target_volume.pvc.clone(),
        hosting_pod_labels: [(DATA_DOWNLOAD_LABEL.to_string(), name)].into_iter().collect(),
        node_name: node_name.to_string(),
    }
}

impl DownloadContext {
    async fn publish(
        &self,
        owner: &k8s_openapi::api::core::v1::ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.publish(owner, type_, reason, action, note).await;
    }

    /// Patch the record to Failed and tear the expose down
    pub(crate) async fn fail_with_cleanup(&self, dd: &DataDownload, message: String) {
        let name = dd.name_any();
        warn!(request = %name, message = %message, "data download failed");

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
            warn!(request = %name, error = %e, "failed to mark data download failed");
        }

        metrics::count_terminal_phase("datadownload", "Failed");
        let owner = dd.object_ref(&());
        self.publish(
            &owner,
            EventType::Warning,
            reasons::FAILED,
            actions::RECONCILE,
            Some(message),
        )
        .await;

        self.data_path.remove(&name).await;
        self.exposer.clean_up(&owner).await;
        self.publish(&owner, EventType::Normal, reasons::CLEANED_UP, actions::RECONCILE, None)
            .await;
    }

    /// Move a record without a running session straight to Canceled
    async fn try_cancel(&self, dd: &DataDownload) {
        let name = dd.name_any();
        let mut record = dd.clone();
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
                info!(request = %name, "data download canceled");
                metrics::count_terminal_phase("datadownload", "Canceled");
                let owner = dd.object_ref(&());
                self.publish(&owner, EventType::Normal, reasons::CANCELED, actions::RECONCILE, None)
                    .await;
                self.data_path.remove(&name).await;
                self.exposer.clean_up(&owner).await;
            }
            Err(e) if e.is_conflict() => {
                debug!(request = %name, "cancel raced with another update");
            }
            Err(e) => {
                warn!(request = %name, error = %e, "failed to cancel data download");
            }
        }
    }

    /// The accept CAS: exactly one node wins the status write
    async fn accept(&self, dd: &DataDownload) -> Result<bool, Error> {
        let mut record = dd.clone();
        let status = record.move_status_mut();
        status.phase = MovePhase::Accepted;
        status.node = Some(self.config.node_name.clone());
        status.start_timestamp = Some(Time(Utc::now()));

        match self.store.replace_status(&record).await {
            Ok(mut updated) => {
                if portage_common::kube_utils::add_finalizer(&mut updated, DATA_MOVER_FINALIZER) {
                    self.store.replace(&updated).await?;
                }
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Single-attempt prepare-timeout transition; conflicts are absorbed
    async fn on_prepare_timeout(&self, dd: &DataDownload) {
        let name = dd.name_any();
        let mut record = dd.clone();
        let status = record.move_status_mut();
        status.phase = MovePhase::Failed;
        status.message = Some(PREPARE_TIMEOUT_MESSAGE.to_string());
        status.completion_timestamp = Some(Time(Utc::now()));

        match self.store.replace_status(&record).await {
            Ok(_) => {
                warn!(request = %name, "data download timed out waiting for its hosting pod");
                metrics::count_terminal_phase("datadownload", "Failed");
                let owner = dd.object_ref(&());
                self.publish(
                    &owner,
                    EventType::Warning,
                    reasons::PREPARE_TIMEOUT,
                    actions::RECONCILE,
                    Some(PREPARE_TIMEOUT_MESSAGE.to_string()),
                )
                .await;
                self.exposer.clean_up(&owner).await;
            }
            Err(e) if e.is_conflict() => {
                debug!(request = %name, "prepare timeout raced with another update");
            }
            Err(e) => {
                warn!(request = %name, error = %e, "failed to fail timed-out data download");
            }
        }
    }
}

/// Reconcile a DataDownload record
#[instrument(skip(dd, ctx), fields(request = %dd.name_any(), phase = %dd.phase()))]
pub async fn reconcile(dd: Arc<DataDownload>, ctx: Arc<DownloadContext>) -> Result<Action, Error> {
    if !is_our_record(dd.data_mover(), &ctx.config.data_mover) {
        debug!("record addresses a different data mover, ignoring");
        return Ok(Action::await_change());
    }

    let timer = ReconcileTimer::start("datadownload");
    let result = run_phase(&dd, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(if e.is_retryable() { "transient" } else { "permanent" }),
    }
    result
}

async fn run_phase(dd: &Arc<DataDownload>, ctx: &Arc<DownloadContext>) -> Result<Action, Error> {
    if dd.metadata.deletion_timestamp.is_some() && has_finalizer(dd.as_ref(), DATA_MOVER_FINALIZER)
    {
        match handle_deletion(dd, ctx).await? {
            Some(action) => return Ok(action),
            None => {}
        }
    }

    match dd.phase() {
        MovePhase::New => handle_new(dd, ctx).await,
        MovePhase::Accepted => handle_accepted(dd, ctx).await,
        MovePhase::Prepared => handle_prepared(dd, ctx).await,
        MovePhase::InProgress => handle_in_progress(dd, ctx).await,
        MovePhase::Canceling => Ok(Action::await_change()),
        MovePhase::Completed | MovePhase::Failed | MovePhase::Canceled => {
            Ok(Action::await_change())
        }
    }
}

async fn handle_deletion(
    dd: &Arc<DataDownload>,
    ctx: &Arc<DownloadContext>,
) -> Result<Option<Action>, Error> {
    let name = dd.name_any();

    if !dd.phase().is_terminal() {
        if !dd.cancel_requested() {
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
    let owner = dd.object_ref(&());
    ctx.exposer.clean_up(&owner).await;
    update_record_with_retry(ctx.store.as_ref(), &name, UPDATE_TIMEOUT, |r| {
        remove_finalizer(r, DATA_MOVER_FINALIZER);
    })
    .await?;
    ctx.publish(&owner, EventType::Normal, reasons::CLEANED_UP, actions::FINALIZE, None)
        .await;

    Ok(Some(Action::await_change()))
}

async fn handle_new(dd: &Arc<DataDownload>, ctx: &Arc<DownloadContext>) -> Result<Action, Error> {
    let name = dd.name_any();

    if dd.cancel_requested() {
        ctx.try_cancel(dd).await;
        return Ok(Action::await_change());
    }

    if !ctx.accept(dd).await? {
        debug!(request = %name, "another node accepted this record");
        return Ok(Action::await_change());
    }
    info!(request = %name, node = %ctx.config.node_name, "data download accepted");
    let owner = dd.object_ref(&());
    ctx.publish(&owner, EventType::Normal, reasons::ACCEPTED, actions::RECONCILE, None)
        .await;

    let param = expose_param(dd, &ctx.config.node_name);
    if let Err(e) = ctx.exposer.expose(&owner, &param).await {
        ctx.fail_with_cleanup(dd, format!("exposing restore volume: {}", e)).await;
        return Ok(Action::await_change());
    }
    ctx.publish(&owner, EventType::Normal, reasons::EXPOSED, actions::RECONCILE, None)
        .await;

    Ok(Action::requeue(ctx.config.exposer_poll_interval))
}

async fn handle_accepted(
    dd: &Arc<DataDownload>,
    ctx: &Arc<DownloadContext>,
) -> Result<Action, Error> {
    let name = dd.name_any();

    if dd.cancel_requested() {
        ctx.try_cancel(dd).await;
        return Ok(Action::await_change());
    }

    if let Some(start) = dd.move_status().and_then(|s| s.start_timestamp.as_ref()) {
        if prepare_timed_out(start, Utc::now(), ctx.config.prepare_timeout) {
            ctx.on_prepare_timeout(dd).await;
            return Ok(Action::await_change());
        }
    }

    if dd.node() != Some(ctx.config.node_name.as_str()) {
        return Ok(Action::await_change());
    }

    // The finalizer rides a second write after the accept CAS; re-assert
    // it in case the accept was interrupted between the two
    if !has_finalizer(dd.as_ref(), DATA_MOVER_FINALIZER) {
        update_record_with_retry(ctx.store.as_ref(), &name, UPDATE_TIMEOUT, |r| {
            portage_common::kube_utils::add_finalizer(r, DATA_MOVER_FINALIZER);
        })
        .await?;
    }

    let owner = dd.object_ref(&());
    match ctx.exposer.get_exposed(&owner, &ctx.config.node_name).await {
        Err(e) => {
            ctx.fail_with_cleanup(dd, format!("waiting for restore volume: {}", e))
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
            info!(request = %name, "data download prepared");
            ctx.publish(&owner, EventType::Normal, reasons::PREPARED, actions::RECONCILE, None)
                .await;
            Ok(Action::await_change())
        }
    }
}

async fn handle_prepared(
    dd: &Arc<DataDownload>,
    ctx: &Arc<DownloadContext>,
) -> Result<Action, Error> {
    let name = dd.name_any();

    if dd.cancel_requested() {
        ctx.try_cancel(dd).await;
        return Ok(Action::await_change());
    }

    if dd.node() != Some(ctx.config.node_name.as_str()) {
        return Ok(Action::await_change());
    }

    if ctx.data_path.get(&name).is_some() {
        debug!(request = %name, "session already driving this record");
        return Ok(Action::await_change());
    }

    let owner = dd.object_ref(&());
    let exposed = match ctx.exposer.get_exposed(&owner, &ctx.config.node_name).await {
        Ok(Some(exposed)) => exposed,
        Ok(None) => {
            ctx.fail_with_cleanup(dd, "exposed restore volume is gone".to_string())
                .await;
            return Ok(Action::await_change());
        }
        Err(e) => {
            ctx.fail_with_cleanup(dd, format!("fetching restore volume: {}", e))
                .await;
            return Ok(Action::await_change());
        }
    };

    start_session(ctx, dd, &exposed).await
}

/// Acquire a slot, flip the record to InProgress, and start the session
pub(crate) async fn start_session(
    ctx: &Arc<DownloadContext>,
    dd: &DataDownload,
    exposed: &ExposeResult,
) -> Result<Action, Error> {
    let name = dd.name_any();
    let namespace = dd.namespace().unwrap_or_default();

    let notify: Arc<dyn SessionNotify> = ctx.clone();
    let params = SessionParams {
        namespace: namespace.clone(),
        name: name.clone(),
        backup_storage_location: dd.spec.backup_storage_location.clone(),
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

    let access = match resolve_access_point(ctx, exposed).await {
        Ok(access) => access,
        Err(e) => {
            ctx.data_path.remove(&name).await;
            ctx.fail_with_cleanup(dd, format!("resolving access point: {}", e))
                .await;
            return Ok(Action::await_change());
        }
    };

    let mut record = dd.clone();
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

    if let Err(e) = session.start_restore(&dd.spec.snapshot_id, access).await {
        ctx.data_path.remove(&name).await;
        ctx.fail_with_cleanup(dd, format!("starting data path restore: {}", e))
            .await;
        return Ok(Action::await_change());
    }

    info!(request = %name, snapshot = %dd.spec.snapshot_id, "data path restore started");
    ctx.publish(
        &dd.object_ref(&()),
        EventType::Normal,
        reasons::STARTED,
        actions::RECONCILE,
        None,
    )
    .await;

    Ok(Action::await_change())
}

/// Resolve the hosting pod's volume to a path on this node
async fn resolve_access_point(
    ctx: &Arc<DownloadContext>,
    exposed: &ExposeResult,
) -> Result<portage_datapath::AccessPoint, Error> {
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use kube::api::Api;
    use portage_exposer::{host_pods_pattern, single_path_match, volume_directory};

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
            let client = ctx.client.as_ref().ok_or_else(|| {
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
    let pattern = host_pods_pattern(&ctx.config.host_pods_path, uid, &dir);
    let path = single_path_match(&pattern)?;

    Ok(portage_datapath::AccessPoint { by_path: path })
}

async fn handle_in_progress(
    dd: &Arc<DataDownload>,
    ctx: &Arc<DownloadContext>,
) -> Result<Action, Error> {
    let name = dd.name_any();
    let namespace = dd.namespace().unwrap_or_default();

    if !dd.cancel_requested() {
        return Ok(Action::await_change());
    }

    match ctx.data_path.get(&name) {
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
impl SessionNotify for DownloadContext {
    async fn on_completed(&self, _namespace: &str, name: &str, result: SessionResult) {
        info!(request = %name, "data download session completed");

        let dd = match self.store.get(name).await {
            Ok(Some(dd)) => dd,
            Ok(None) => {
                warn!(request = %name, "record gone before completion handling");
                self.data_path.remove(name).await;
                return;
            }
            Err(e) => {
                error!(request = %name, error = %e, "failed to fetch record on completion");
                self.data_path.remove(name).await;
                return;
            }
        };
        let owner = dd.object_ref(&());

        // Rebind runs before the terminal patch: a record that reached
        // Completed must never demote, so completion is only recorded once
        // the restored volume is bound to the user's claim
        if let Err(e) = self
            .exposer
            .rebind_volume(
                &owner,
                &dd.spec.target_volume.namespace,
                &dd.spec.target_volume.pvc,
                self.config.rebind_timeout,
            )
            .await
        {
            self.fail_with_cleanup(&dd, format!("rebinding restored volume: {}", e))
                .await;
            return;
        }

        let patched = update_status_with_retry(self.store.as_ref(), name, UPDATE_TIMEOUT, |r| {
            let status = r.move_status_mut();
            if status.phase.is_terminal() {
                return;
            }
            status.phase = MovePhase::Completed;
            status.completion_timestamp = Some(Time(Utc::now()));
        })
        .await;
        if let Err(e) = patched {
            error!(request = %name, error = %e, "failed to mark data download completed");
        }

        metrics::count_terminal_phase("datadownload", "Completed");
        metrics::count_bytes_moved("download", result.total_bytes);

        self.data_path.remove(name).await;
        self.exposer.clean_up(&owner).await;
        self.publish(&owner, EventType::Normal, reasons::COMPLETED, actions::SESSION, None)
            .await;
    }

    async fn on_failed(&self, _namespace: &str, name: &str, error: Error) {
        error!(request = %name, error = %error, "data download session failed");

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
            error!(request = %name, error = %e, "failed to mark data download failed");
        }

        metrics::count_terminal_phase("datadownload", "Failed");
        self.data_path.remove(name).await;
        if let Ok(Some(dd)) = self.store.get(name).await {
            self.exposer.clean_up(&dd.object_ref(&())).await;
        }
    }

    async fn on_cancelled(&self, _namespace: &str, name: &str) {
        warn!(request = %name, "data download canceled by the session");

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
            error!(request = %name, error = %e, "failed to mark data download canceled");
        }

        metrics::count_terminal_phase("datadownload", "Canceled");
        self.data_path.remove(name).await;
        if let Ok(Some(dd)) = self.store.get(name).await {
            self.exposer.clean_up(&dd.object_ref(&())).await;
        }
    }

    async fn on_progress(&self, _namespace: &str, name: &str, progress: MoveProgress) {
        let patched = update_status_with_retry(self.store.as_ref(), name, UPDATE_TIMEOUT, |r| {
            r.move_status_mut().progress = progress;
        })
        .await;
        if let Err(e) = patched {
            warn!(request = %name, error = %e, "failed to patch data download progress");
        }
    }
}

/// Error policy for the DataDownload controller
pub fn error_policy(dd: Arc<DataDownload>, error: &Error, _ctx: Arc<DownloadContext>) -> Action {
    error!(request = %dd.name_any(), error = %error, "data download reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}
