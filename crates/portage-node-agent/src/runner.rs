//! Controller runner - starts and manages the data mover controllers
//!
//! Builds the DataUpload and DataDownload controllers, each watching its
//! hosting pods so a pod becoming ready re-triggers the owning record. Pod
//! events map to a record only while the record still waits in Accepted;
//! every other phase produces no enqueue.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client};
use tracing::{info, warn};

use portage_common::crd::{DataDownload, DataUpload, MoveRecord};
use portage_common::{DATA_DOWNLOAD_LABEL, DATA_UPLOAD_LABEL};

use crate::download_controller::{self, DownloadContext};
use crate::upload_controller::{self, pod_request_name, wants_pod_events, UploadContext};

/// Map a pod event to the upload record it hosts, gated on phase
fn upload_requests_for_pod(
    reader: &Store<DataUpload>,
    namespace: &str,
    pod: &Pod,
) -> Vec<ObjectRef<DataUpload>> {
    let Some(name) = pod_request_name(pod, DATA_UPLOAD_LABEL) else {
        return vec![];
    };
    let key = ObjectRef::new(&name).within(namespace);
    match reader.get(&key) {
        Some(du) if wants_pod_events(du.phase()) => vec![key],
        _ => vec![],
    }
}

/// Map a pod event to the download record it hosts, gated on phase
fn download_requests_for_pod(
    reader: &Store<DataDownload>,
    namespace: &str,
    pod: &Pod,
) -> Vec<ObjectRef<DataDownload>> {
    let Some(name) = pod_request_name(pod, DATA_DOWNLOAD_LABEL) else {
        return vec![];
    };
    let key = ObjectRef::new(&name).within(namespace);
    match reader.get(&key) {
        Some(dd) if wants_pod_events(dd.phase()) => vec![key],
        _ => vec![],
    }
}

/// Keep a reflector cache of records warm for the pod-watch mappers
fn spawn_reflector<K>(api: Api<K>) -> Store<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, WatcherConfig::default()));
    tokio::spawn(async move {
        stream
            .default_backoff()
            .touched_objects()
            .for_each(|item| async {
                if let Err(e) = item {
                    warn!(error = %e, "record reflector error");
                }
            })
            .await;
    });
    reader
}

/// Run both controllers until shutdown
pub async fn run_controllers(
    client: Client,
    upload_ctx: Arc<UploadContext>,
    download_ctx: Arc<DownloadContext>,
) {
    let namespace = upload_ctx.config.namespace.clone();

    let uploads: Api<DataUpload> = Api::namespaced(client.clone(), &namespace);
    let downloads: Api<DataDownload> = Api::namespaced(client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(client, &namespace);

    let upload_reader = spawn_reflector(uploads.clone());
    let download_reader = spawn_reflector(downloads.clone());

    info!("Starting Portage node-agent controllers...");
    info!("- DataUpload controller");
    info!("- DataDownload controller");

    let upload_ns = namespace.clone();
    let upload_controller = Controller::new(uploads, WatcherConfig::default())
        .watches(
            pods.clone(),
            WatcherConfig::default().labels(DATA_UPLOAD_LABEL),
            move |pod| upload_requests_for_pod(&upload_reader, &upload_ns, &pod),
        )
        .shutdown_on_signal()
        .run(
            upload_controller::reconcile,
            upload_controller::error_policy,
            upload_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "DataUpload reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "DataUpload reconciliation error"),
            }
        });

    let download_ns = namespace.clone();
    let download_controller = Controller::new(downloads, WatcherConfig::default())
        .watches(
            pods,
            WatcherConfig::default().labels(DATA_DOWNLOAD_LABEL),
            move |pod| download_requests_for_pod(&download_reader, &download_ns, &pod),
        )
        .shutdown_on_signal()
        .run(
            download_controller::reconcile,
            download_controller::error_policy,
            download_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "DataDownload reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "DataDownload reconciliation error"),
            }
        });

    tokio::select! {
        _ = upload_controller => info!("DataUpload controller completed"),
        _ = download_controller => info!("DataDownload controller completed"),
    }
}
