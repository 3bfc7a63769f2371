//! Startup resume sweep
//!
//! On node-agent startup the persisted records are the only truth: any
//! in-memory session state died with the previous process. The sweeper
//! walks the records assigned to this node and re-anchors them — records
//! whose hosting pod survived get a fresh session, records whose pod is
//! gone fail with a restart message, and Prepared records are left for the
//! regular reconcile to pick up. A listing failure aborts agent startup.

use std::sync::Arc;

use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use portage_common::crd::{MovePhase, MoveRecord};
use portage_common::retry::update_status_with_retry;
use portage_common::Error;

use crate::download_controller::{self, DownloadContext};
use crate::upload_controller::{self, UploadContext, NODE_RESTART_MESSAGE};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::time::Duration;

const UPDATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Re-anchor DataUploads assigned to this node after an agent restart
pub async fn resume_uploads(ctx: &Arc<UploadContext>) -> Result<(), Error> {
    let records = ctx.store.list().await.map_err(|e| {
        Error::internal_with_context("sweeper", format!("listing data uploads: {}", e))
    })?;

    for du in records {
        if du.node() != Some(ctx.config.node_name.as_str()) {
            continue;
        }
        let name = du.name_any();
        match du.phase() {
            MovePhase::InProgress => resume_upload(ctx, &du).await,
            MovePhase::Prepared => {
                debug!(request = %name, "prepared record left for the reconciler");
            }
            phase => {
                debug!(request = %name, %phase, "no resume action for this phase");
            }
        }
    }

    Ok(())
}

async fn resume_upload(ctx: &Arc<UploadContext>, du: &portage_common::crd::DataUpload) {
    let name = du.name_any();
    let owner = du.object_ref(&());

    let exposer = match ctx.exposers.get(&du.spec.snapshot_type) {
        Some(exposer) => exposer.clone(),
        None => {
            fail_restarted(ctx.store.as_ref(), &name).await;
            return;
        }
    };

    match exposer.get_exposed(&owner, &ctx.config.node_name).await {
        Ok(Some(exposed)) => {
            info!(request = %name, "hosting pod survived the restart, restarting the session");
            match upload_controller::start_session(ctx, du, &exposed).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(request = %name, error = %e, "failed to restart upload session");
                }
            }
        }
        Ok(None) | Err(_) => {
            warn!(request = %name, "hosting pod is gone, failing the record");
            fail_restarted(ctx.store.as_ref(), &name).await;
            exposer.clean_up(&owner).await;
        }
    }
}

/// Re-anchor DataDownloads assigned to this node after an agent restart
pub async fn resume_downloads(ctx: &Arc<DownloadContext>) -> Result<(), Error> {
    let records = ctx.store.list().await.map_err(|e| {
        Error::internal_with_context("sweeper", format!("listing data downloads: {}", e))
    })?;

    for dd in records {
        if dd.node() != Some(ctx.config.node_name.as_str()) {
            continue;
        }
        let name = dd.name_any();
        match dd.phase() {
            MovePhase::InProgress => resume_download(ctx, &dd).await,
            MovePhase::Prepared => {
                debug!(request = %name, "prepared record left for the reconciler");
            }
            phase => {
                debug!(request = %name, %phase, "no resume action for this phase");
            }
        }
    }

    Ok(())
}

async fn resume_download(ctx: &Arc<DownloadContext>, dd: &portage_common::crd::DataDownload) {
    let name = dd.name_any();
    let owner = dd.object_ref(&());

    match ctx.exposer.get_exposed(&owner, &ctx.config.node_name).await {
        Ok(Some(exposed)) => {
            info!(request = %name, "hosting pod survived the restart, restarting the session");
            match download_controller::start_session(ctx, dd, &exposed).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(request = %name, error = %e, "failed to restart download session");
                }
            }
        }
        Ok(None) | Err(_) => {
            warn!(request = %name, "hosting pod is gone, failing the record");
            fail_restarted(ctx.store.as_ref(), &name).await;
            ctx.exposer.clean_up(&owner).await;
        }
    }
}

async fn fail_restarted<R>(store: &dyn portage_common::RecordStore<R>, name: &str)
where
    R: MoveRecord + 'static,
{
    let result = update_status_with_retry(store, name, UPDATE_TIMEOUT, |r| {
        let status = r.move_status_mut();
        if status.phase.is_terminal() {
            return;
        }
        status.phase = MovePhase::Failed;
        status.message = Some(NODE_RESTART_MESSAGE.to_string());
        status.completion_timestamp = Some(Time(Utc::now()));
    })
    .await;

    if let Err(e) = result {
        warn!(request = %name, error = %e, "failed to fail record after restart");
    }
}
