//! Portage node agent - moves persistent-volume contents between the
//! cluster and the object store

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use kube::CustomResourceExt;
use tracing::info;

use portage_common::credentials::CredentialFileStore;
use portage_common::crd::{DataDownload, DataUpload, SNAPSHOT_TYPE_CSI};
use portage_common::telemetry::{init_telemetry, TelemetryConfig};
use portage_common::{KubeEventPublisher, KubeRecordStore};
use portage_datapath::DataPathManager;
use portage_exposer::{CsiSnapshotExposer, PvcRestoreExposer, SnapshotExposer};
use portage_node_agent::session::ExecSession;
use portage_node_agent::{resume, runner, DownloadContext, NodeAgentConfig, UploadContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeAgentConfig::parse();

    if config.crd {
        print!("{}", serde_yaml::to_string(&DataUpload::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&DataDownload::crd())?);
        return Ok(());
    }

    // TLS must be ready before any kube client exists
    portage_common::install_crypto_provider();

    init_telemetry(TelemetryConfig {
        service_name: "portage-node-agent".to_string(),
        ..Default::default()
    })?;

    info!(
        node = %config.node_name,
        namespace = %config.namespace,
        concurrent_limit = config.concurrent_limit,
        "starting Portage node agent"
    );

    let client = portage_common::kube_utils::create_client(None).await?;

    let data_path = Arc::new(DataPathManager::new(config.concurrent_limit));
    let credentials = Arc::new(CredentialFileStore::new(
        client.clone(),
        &config.namespace,
        &config.credentials_dir,
    ));
    let session_factory = ExecSession::factory(config.mover_command.clone(), credentials);

    let exposers: HashMap<String, Arc<dyn SnapshotExposer>> = [(
        SNAPSHOT_TYPE_CSI.to_string(),
        Arc::new(CsiSnapshotExposer::new(client.clone())) as Arc<dyn SnapshotExposer>,
    )]
    .into_iter()
    .collect();

    let upload_ctx = Arc::new(UploadContext {
        store: Arc::new(KubeRecordStore::<DataUpload>::new(
            client.clone(),
            &config.namespace,
        )),
        client: Some(client.clone()),
        exposers,
        data_path: data_path.clone(),
        session_factory: session_factory.clone(),
        events: Arc::new(KubeEventPublisher::new(
            client.clone(),
            "portage-data-upload-controller",
        )),
        config: config.clone(),
    });

    let download_ctx = Arc::new(DownloadContext {
        store: Arc::new(KubeRecordStore::<DataDownload>::new(
            client.clone(),
            &config.namespace,
        )),
        client: Some(client.clone()),
        exposer: Arc::new(PvcRestoreExposer::new(client.clone())),
        data_path,
        session_factory,
        events: Arc::new(KubeEventPublisher::new(
            client.clone(),
            "portage-data-download-controller",
        )),
        config: config.clone(),
    });

    // Persisted records are the only truth after a restart; re-anchor
    // before the controllers start accepting new work
    resume::resume_uploads(&upload_ctx).await?;
    resume::resume_downloads(&download_ctx).await?;

    runner::run_controllers(client, upload_ctx, download_ctx).await;

    Ok(())
}
