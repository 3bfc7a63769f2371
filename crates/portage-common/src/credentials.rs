//! Repository credentials for data-path sessions
//!
//! Sessions authenticate to the object-store repository with a secret the
//! installer places in the controller namespace. The file store materializes
//! one secret key to a file under a configured root and hands back the path;
//! callers wrap it in [`ScopedCredentialFile`] so the file disappears on
//! every exit path of the session run.

use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use thiserror::Error;
use tracing::warn;

/// Errors when materializing credentials
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The credentials secret does not exist
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound {
        /// Namespace searched
        namespace: String,
        /// Secret name searched
        name: String,
    },

    /// The secret exists but lacks the requested key
    #[error("secret {name} has no key {key}")]
    MissingKey {
        /// Secret name
        name: String,
        /// Missing key
        key: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error writing the credential file
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Materializes secret keys to files under a configured root directory
pub struct CredentialFileStore {
    client: Client,
    namespace: String,
    root: PathBuf,
}

impl CredentialFileStore {
    /// Create a store reading secrets from `namespace` and writing under `root`
    pub fn new(client: Client, namespace: &str, root: &Path) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            root: root.to_path_buf(),
        }
    }

    /// Write the given secret key to a file and return its path.
    ///
    /// The file is owned by the caller; wrap it in [`ScopedCredentialFile`]
    /// so it is removed when the session winds down.
    pub async fn path_for(&self, secret_name: &str, key: &str) -> Result<PathBuf, CredentialError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = match api.get(secret_name).await {
            Ok(s) => s,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(CredentialError::SecretNotFound {
                    namespace: self.namespace.clone(),
                    name: secret_name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let value = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .ok_or_else(|| CredentialError::MissingKey {
                name: secret_name.to_string(),
                key: key.to_string(),
            })?;

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self
            .root
            .join(format!("{}-{}-{}", self.namespace, secret_name, key));
        tokio::fs::write(&path, &value.0).await?;

        Ok(path)
    }
}

/// Removes the credential file when dropped.
///
/// Sessions hold one of these for the lifetime of a run so the file is gone
/// on completion, failure, cancellation, and panic alike.
pub struct ScopedCredentialFile {
    path: PathBuf,
}

impl ScopedCredentialFile {
    /// Take ownership of a credential file
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The on-disk path of the credential file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedCredentialFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove credential file");
            }
        }
    }
}
