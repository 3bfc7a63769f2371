//! Test doubles for the controller tests
//!
//! An in-memory record store with injectable conflicts, fake exposers whose
//! readiness is set per request, and a probing session factory. These stand
//! in for the cluster, the hosting pods, and the mover process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, PodSpec, PodStatus, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use kube::ResourceExt;

use portage_common::crd::{
    CsiSnapshotSpec, DataDownload, DataDownloadSpec, DataUpload, DataUploadSpec, MovePhase,
    MoveRecord, TargetVolumeSpec, SNAPSHOT_TYPE_CSI,
};
use portage_common::{Error, NoopEventPublisher, RecordStore, Result, DATA_UPLOAD_LABEL};
use portage_datapath::{
    AccessPoint, AsyncBr, DataPathManager, SessionFactory, SessionNotify, SessionParams,
    SessionResult,
};
use portage_exposer::{
    ExposeByPod, ExposeResult, RestoreExposeParam, RestoreExposer, SnapshotExposeParam,
    SnapshotExposer,
};

use crate::config::NodeAgentConfig;
use crate::download_controller::DownloadContext;
use crate::upload_controller::UploadContext;

pub const TEST_NODE: &str = "node-1";
pub const TEST_NAMESPACE: &str = "portage-system";

pub fn conflict_error() -> Error {
    Error::Kube {
        source: kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }),
    }
}

// ---------------------------------------------------------------------------
// In-memory record store

pub struct InMemoryStore<R> {
    pub records: Mutex<HashMap<String, R>>,
    /// Number of upcoming replace/replace_status calls answered with 409
    pub conflicts: AtomicUsize,
    /// Make list() fail once armed
    pub fail_list: AtomicBool,
}

impl<R: MoveRecord> InMemoryStore<R> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            conflicts: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
        })
    }

    pub fn with(records: Vec<R>) -> Arc<Self> {
        let store = Self::new();
        {
            let mut map = store.records.lock().unwrap();
            for record in records {
                map.insert(record.name_any(), record);
            }
        }
        store
    }

    pub fn stored(&self, name: &str) -> Option<R> {
        self.records.lock().unwrap().get(name).cloned()
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<R: MoveRecord + 'static> RecordStore<R> for InMemoryStore<R> {
    async fn get(&self, name: &str) -> Result<Option<R>> {
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<R>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Error::internal("list failed"));
        }
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn replace(&self, record: &R) -> Result<R> {
        if self.take_conflict() {
            return Err(conflict_error());
        }
        self.records
            .lock()
            .unwrap()
            .insert(record.name_any(), record.clone());
        Ok(record.clone())
    }

    async fn replace_status(&self, record: &R) -> Result<R> {
        if self.take_conflict() {
            return Err(conflict_error());
        }
        self.records
            .lock()
            .unwrap()
            .insert(record.name_any(), record.clone());
        Ok(record.clone())
    }
}

// ---------------------------------------------------------------------------
// Fake exposers

#[derive(Default)]
pub struct FakeSnapshotExposer {
    /// Ready access points by request name; absent means "not ready yet"
    pub exposed: Mutex<HashMap<String, ExposeResult>>,
    /// Arm to make expose() fail
    pub expose_error: Mutex<Option<String>>,
    /// Arm to make get_exposed() fail terminally
    pub get_error: Mutex<Option<String>>,
    pub expose_calls: AtomicUsize,
    pub clean_up_calls: AtomicUsize,
}

impl FakeSnapshotExposer {
    pub fn ready(name: &str, result: ExposeResult) -> Arc<Self> {
        let exposer = Arc::new(Self::default());
        exposer
            .exposed
            .lock()
            .unwrap()
            .insert(name.to_string(), result);
        exposer
    }

    pub fn not_ready() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SnapshotExposer for FakeSnapshotExposer {
    async fn expose(&self, owner: &ObjectReference, _param: &SnapshotExposeParam) -> Result<()> {
        self.expose_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.expose_error.lock().unwrap().clone() {
            return Err(Error::expose(owner.name.clone().unwrap_or_default(), message));
        }
        Ok(())
    }

    async fn get_exposed(
        &self,
        owner: &ObjectReference,
        _node_name: &str,
    ) -> Result<Option<ExposeResult>> {
        if let Some(message) = self.get_error.lock().unwrap().clone() {
            return Err(Error::expose(owner.name.clone().unwrap_or_default(), message));
        }
        let name = owner.name.as_deref().unwrap_or_default();
        Ok(self.exposed.lock().unwrap().get(name).cloned())
    }

    async fn clean_up(&self, _owner: &ObjectReference) {
        self.clean_up_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeRestoreExposer {
    pub exposed: Mutex<HashMap<String, ExposeResult>>,
    pub expose_error: Mutex<Option<String>>,
    pub get_error: Mutex<Option<String>>,
    /// Arm to make rebind_volume fail
    pub rebind_error: Mutex<Option<String>>,
    pub expose_calls: AtomicUsize,
    pub rebind_calls: AtomicUsize,
    pub clean_up_calls: AtomicUsize,
}

impl FakeRestoreExposer {
    pub fn ready(name: &str, result: ExposeResult) -> Arc<Self> {
        let exposer = Arc::new(Self::default());
        exposer
            .exposed
            .lock()
            .unwrap()
            .insert(name.to_string(), result);
        exposer
    }

    pub fn not_ready() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RestoreExposer for FakeRestoreExposer {
    async fn expose(&self, owner: &ObjectReference, _param: &RestoreExposeParam) -> Result<()> {
        self.expose_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.expose_error.lock().unwrap().clone() {
            return Err(Error::expose(owner.name.clone().unwrap_or_default(), message));
        }
        Ok(())
    }

    async fn get_exposed(
        &self,
        owner: &ObjectReference,
        _node_name: &str,
    ) -> Result<Option<ExposeResult>> {
        if let Some(message) = self.get_error.lock().unwrap().clone() {
            return Err(Error::expose(owner.name.clone().unwrap_or_default(), message));
        }
        let name = owner.name.as_deref().unwrap_or_default();
        Ok(self.exposed.lock().unwrap().get(name).cloned())
    }

    async fn rebind_volume(
        &self,
        owner: &ObjectReference,
        _target_namespace: &str,
        _target_pvc: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.rebind_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.rebind_error.lock().unwrap().clone() {
            return Err(Error::expose(owner.name.clone().unwrap_or_default(), message));
        }
        Ok(())
    }

    async fn clean_up(&self, _owner: &ObjectReference) {
        self.clean_up_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Probing sessions

#[derive(Clone)]
pub enum SessionMode {
    /// Start and keep running
    Hold,
    /// Refuse to start
    FailToStart,
    /// Report completion from inside the start call
    CompleteImmediately(SessionResult),
    /// Report failure from inside the start call
    FailImmediately(String),
}

#[derive(Default)]
pub struct SessionProbe {
    pub backups: AtomicUsize,
    pub restores: AtomicUsize,
    pub cancels: AtomicUsize,
    pub closes: AtomicUsize,
    pub progress: Mutex<Vec<(i64, i64)>>,
}

struct FakeSession {
    mode: SessionMode,
    probe: Arc<SessionProbe>,
    namespace: String,
    name: String,
    notify: std::sync::Weak<dyn SessionNotify>,
}

impl FakeSession {
    async fn finish(&self) -> Result<()> {
        match &self.mode {
            SessionMode::Hold => Ok(()),
            SessionMode::FailToStart => Err(Error::data_path(&self.name, "refused to start")),
            SessionMode::CompleteImmediately(result) => {
                if let Some(notify) = self.notify.upgrade() {
                    notify
                        .on_completed(&self.namespace, &self.name, result.clone())
                        .await;
                }
                Ok(())
            }
            SessionMode::FailImmediately(message) => {
                if let Some(notify) = self.notify.upgrade() {
                    notify
                        .on_failed(
                            &self.namespace,
                            &self.name,
                            Error::data_path(&self.name, message.clone()),
                        )
                        .await;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AsyncBr for FakeSession {
    async fn start_backup(
        &self,
        _source: AccessPoint,
        _tags: HashMap<String, String>,
    ) -> Result<()> {
        self.probe.backups.fetch_add(1, Ordering::SeqCst);
        self.finish().await
    }

    async fn start_restore(&self, _snapshot_id: &str, _target: AccessPoint) -> Result<()> {
        self.probe.restores.fetch_add(1, Ordering::SeqCst);
        self.finish().await
    }

    fn cancel(&self) {
        self.probe.cancels.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn probe_factory(mode: SessionMode, probe: Arc<SessionProbe>) -> SessionFactory {
    Arc::new(move |params: SessionParams| {
        Arc::new(FakeSession {
            mode: mode.clone(),
            probe: probe.clone(),
            namespace: params.namespace,
            name: params.name,
            notify: params.notify,
        }) as Arc<dyn AsyncBr>
    })
}

// ---------------------------------------------------------------------------
// Fixtures

pub fn test_config(host_pods_path: PathBuf) -> NodeAgentConfig {
    NodeAgentConfig {
        node_name: TEST_NODE.to_string(),
        namespace: TEST_NAMESPACE.to_string(),
        data_mover: "portage".to_string(),
        concurrent_limit: 1,
        prepare_timeout: Duration::from_secs(300),
        exposer_poll_interval: Duration::from_secs(5),
        rebind_timeout: Duration::from_secs(120),
        host_pods_path,
        credentials_dir: PathBuf::from("/tmp/credentials"),
        mover_command: PathBuf::from("portage-mover"),
        crd: false,
    }
}

pub fn upload(name: &str) -> DataUpload {
    let mut du = DataUpload::new(
        name,
        DataUploadSpec {
            data_mover: Some("portage".to_string()),
            snapshot_type: SNAPSHOT_TYPE_CSI.to_string(),
            csi_snapshot: Some(CsiSnapshotSpec {
                volume_snapshot: "snap-1".to_string(),
                storage_class: Some("standard".to_string()),
                snapshot_class: None,
            }),
            source_namespace: "workloads".to_string(),
            source_pvc: "data-pvc".to_string(),
            backup_storage_location: "default".to_string(),
            cancel: false,
        },
    );
    du.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    du
}

pub fn upload_in(name: &str, phase: MovePhase, node: Option<&str>) -> DataUpload {
    let mut du = upload(name);
    let status = du.move_status_mut();
    status.phase = phase;
    status.node = node.map(String::from);
    if phase != MovePhase::New {
        status.start_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
    }
    du
}

pub fn download(name: &str) -> DataDownload {
    let mut dd = DataDownload::new(
        name,
        DataDownloadSpec {
            data_mover: Some("portage".to_string()),
            target_volume: TargetVolumeSpec {
                pvc: "restored-data".to_string(),
                pv: String::new(),
                namespace: "workloads".to_string(),
            },
            backup_storage_location: "default".to_string(),
            snapshot_id: "snap-abc".to_string(),
            cancel: false,
        },
    );
    dd.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    dd
}

pub fn download_in(name: &str, phase: MovePhase, node: Option<&str>) -> DataDownload {
    let mut dd = download(name);
    let status = dd.move_status_mut();
    status.phase = phase;
    status.node = node.map(String::from);
    if phase != MovePhase::New {
        status.start_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
    }
    dd
}

/// A hosting pod running on the test node, carrying a plain volume named
/// after the request so access-point resolution needs no PVC lookup
pub fn running_hosting_pod(name: &str, uid: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            uid: Some(uid.to_string()),
            labels: Some(
                [(DATA_UPLOAD_LABEL.to_string(), name.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(TEST_NODE.to_string()),
            volumes: Some(vec![Volume {
                name: name.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn expose_result(name: &str, uid: &str) -> ExposeResult {
    ExposeResult {
        by_pod: ExposeByPod {
            hosting_pod: running_hosting_pod(name, uid),
            volume_name: name.to_string(),
        },
    }
}

/// Create the on-disk volume path the access-point glob will find
pub fn stage_host_volume(test_tag: &str, uid: &str, volume: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "portage-host-pods-{}-{}",
        test_tag,
        std::process::id()
    ));
    let dir = root.join(uid).join("volumes/kubernetes.io~csi").join(volume);
    std::fs::create_dir_all(&dir).expect("stage host volume");
    root
}

pub fn upload_ctx(
    store: Arc<InMemoryStore<DataUpload>>,
    exposer: Arc<FakeSnapshotExposer>,
    data_path: Arc<DataPathManager>,
    factory: SessionFactory,
    host_pods_path: PathBuf,
) -> Arc<UploadContext> {
    Arc::new(UploadContext {
        store,
        client: None,
        exposers: [(
            SNAPSHOT_TYPE_CSI.to_string(),
            exposer as Arc<dyn SnapshotExposer>,
        )]
        .into_iter()
        .collect(),
        data_path,
        session_factory: factory,
        events: Arc::new(NoopEventPublisher),
        config: test_config(host_pods_path),
    })
}

pub fn download_ctx(
    store: Arc<InMemoryStore<DataDownload>>,
    exposer: Arc<FakeRestoreExposer>,
    data_path: Arc<DataPathManager>,
    factory: SessionFactory,
    host_pods_path: PathBuf,
) -> Arc<DownloadContext> {
    Arc::new(DownloadContext {
        store,
        client: None,
        exposer: exposer as Arc<dyn RestoreExposer>,
        data_path,
        session_factory: factory,
        events: Arc::new(NoopEventPublisher),
        config: test_config(host_pods_path),
    })
}
