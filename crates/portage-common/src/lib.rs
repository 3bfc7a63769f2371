//! Common types for Portage: CRDs, errors, and node-agent utilities

#![cfg_attr(not(test), deny(missing_docs))]

pub mod crd;
pub mod credentials;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use kube_utils::{KubeRecordStore, RecordStore};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for Portage system resources (records, hosting pods, credentials)
pub const PORTAGE_SYSTEM_NAMESPACE: &str = "portage-system";

/// Identity of this data mover; records carrying another identity are ignored
pub const DATA_MOVER_PORTAGE: &str = "portage";

/// Finalizer held on a record until its session and hosting pod are released
pub const DATA_MOVER_FINALIZER: &str = "portage.dev/data-mover-cleanup";

/// Label carried by upload hosting pods, valued with the DataUpload name
pub const DATA_UPLOAD_LABEL: &str = "portage.dev/data-upload";

/// Label carried by download hosting pods, valued with the DataDownload name
pub const DATA_DOWNLOAD_LABEL: &str = "portage.dev/data-download";

/// Secret holding the repository credentials consumed by mover sessions
pub const REPO_CREDENTIALS_SECRET: &str = "portage-repo-credentials";

/// Key inside [`REPO_CREDENTIALS_SECRET`] holding the repository password
pub const REPO_CREDENTIALS_KEY: &str = "repository-password";

/// Check whether a record's dataMover selector addresses this mover.
///
/// An absent or empty selector matches; anything else must equal `identity`.
pub fn is_our_record(data_mover: Option<&str>, identity: &str) -> bool {
    match data_mover {
        None | Some("") => true,
        Some(mover) => mover == identity,
    }
}

/// Install the default rustls crypto provider (aws-lc-rs).
///
/// Must run before any kube client is created. Safe to call more than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
