//! Data-path sessions driving an external mover process
//!
//! The actual object-store streaming lives in a separate mover binary; a
//! session spawns it against the resolved access point, relays its progress
//! lines, and reports the terminal outcome through the notify callbacks.
//! The mover's stdout protocol is line oriented:
//!
//! ```text
//! progress <bytes_done> <total_bytes>
//! snapshot <snapshot-id>
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use portage_common::credentials::{CredentialFileStore, ScopedCredentialFile};
use portage_common::crd::MoveProgress;
use portage_common::{Error, Result, REPO_CREDENTIALS_KEY, REPO_CREDENTIALS_SECRET};
use portage_datapath::{AccessPoint, AsyncBr, SessionFactory, SessionNotify, SessionParams, SessionResult};

/// One line of mover stdout, decoded
#[derive(Debug, PartialEq, Eq)]
pub enum MoverLine {
    /// Progress counters
    Progress {
        /// Bytes moved so far
        bytes_done: i64,
        /// Total bytes expected
        total_bytes: i64,
    },
    /// Identifier of the produced snapshot
    Snapshot(String),
    /// A recognized directive whose payload did not parse; dropped, but
    /// loudly, since it usually means a mover/agent protocol mismatch
    Malformed,
    /// Anything else; passed through to the logs
    Other,
}

/// Decode one line of the mover's stdout protocol
pub fn parse_mover_line(line: &str) -> MoverLine {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("progress") => {
            let done = parts.next().and_then(|s| s.parse::<i64>().ok());
            let total = parts.next().and_then(|s| s.parse::<i64>().ok());
            match (done, total) {
                (Some(bytes_done), Some(total_bytes)) => MoverLine::Progress {
                    bytes_done,
                    total_bytes,
                },
                _ => MoverLine::Malformed,
            }
        }
        Some("snapshot") => match parts.next() {
            Some(id) => MoverLine::Snapshot(id.to_string()),
            None => MoverLine::Malformed,
        },
        _ => MoverLine::Other,
    }
}

/// Session backed by an external mover subprocess
pub struct ExecSession {
    command: PathBuf,
    namespace: String,
    name: String,
    backup_storage_location: String,
    notify: Weak<dyn SessionNotify>,
    credentials: Arc<CredentialFileStore>,
    cancelled: Arc<AtomicBool>,
    kill: Arc<Notify>,
}

impl ExecSession {
    /// Build a session factory running `command` for every transfer
    pub fn factory(command: PathBuf, credentials: Arc<CredentialFileStore>) -> SessionFactory {
        Arc::new(move |params: SessionParams| {
            Arc::new(ExecSession {
                command: command.clone(),
                namespace: params.namespace,
                name: params.name,
                backup_storage_location: params.backup_storage_location,
                notify: params.notify,
                credentials: credentials.clone(),
                cancelled: Arc::new(AtomicBool::new(false)),
                kill: Arc::new(Notify::new()),
            }) as Arc<dyn AsyncBr>
        })
    }

    async fn credentials_file(&self) -> Result<ScopedCredentialFile> {
        let path = self
            .credentials
            .path_for(REPO_CREDENTIALS_SECRET, REPO_CREDENTIALS_KEY)
            .await
            .map_err(|e| Error::data_path(&self.name, format!("materializing credentials: {}", e)))?;
        Ok(ScopedCredentialFile::new(path))
    }

    async fn spawn(&self, mut cmd: Command, creds: ScopedCredentialFile) -> Result<()> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::data_path(&self.name, format!("spawning mover: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::data_path(&self.name, "mover stdout unavailable"))?;

        let namespace = self.namespace.clone();
        let name = self.name.clone();
        let notify = self.notify.clone();
        let cancelled = self.cancelled.clone();
        let kill = self.kill.clone();

        tokio::spawn(async move {
            // The credential file lives exactly as long as this run
            let _creds = creds;

            let mut lines = BufReader::new(stdout).lines();
            let mut last_progress = MoveProgress::default();
            let mut snapshot_id = None;

            let status = loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match parse_mover_line(&line) {
                            MoverLine::Progress { bytes_done, total_bytes } => {
                                last_progress = MoveProgress { total_bytes, bytes_done };
                                if let Some(notify) = notify.upgrade() {
                                    notify.on_progress(&namespace, &name, last_progress).await;
                                }
                            }
                            MoverLine::Snapshot(id) => snapshot_id = Some(id),
                            MoverLine::Malformed => {
                                warn!(request = %name, line, "malformed mover directive dropped")
                            }
                            MoverLine::Other => debug!(request = %name, line, "mover output"),
                        },
                        // stdout closed; wait for the process to end
                        Ok(None) | Err(_) => break child.wait().await,
                    },
                    _ = kill.notified() => {
                        if let Err(e) = child.start_kill() {
                            warn!(request = %name, error = %e, "failed to kill mover");
                        }
                    }
                    status = child.wait() => break status,
                }
            };

            let Some(notify) = notify.upgrade() else {
                warn!(request = %name, "session finished but its reconciler is gone");
                return;
            };

            if cancelled.load(Ordering::SeqCst) {
                info!(request = %name, "mover cancelled");
                notify.on_cancelled(&namespace, &name).await;
                return;
            }

            match status {
                Ok(status) if status.success() => {
                    notify
                        .on_completed(
                            &namespace,
                            &name,
                            SessionResult {
                                snapshot_id,
                                total_bytes: last_progress.total_bytes,
                            },
                        )
                        .await;
                }
                Ok(status) => {
                    notify
                        .on_failed(
                            &namespace,
                            &name,
                            Error::data_path(&name, format!("mover exited with {}", status)),
                        )
                        .await;
                }
                Err(e) => {
                    notify
                        .on_failed(
                            &namespace,
                            &name,
                            Error::data_path(&name, format!("waiting for mover: {}", e)),
                        )
                        .await;
                }
            }
        });

        Ok(())
    }
}

#[async_trait]
impl AsyncBr for ExecSession {
    async fn start_backup(&self, source: AccessPoint, tags: HashMap<String, String>) -> Result<()> {
        let creds = self.credentials_file().await?;

        let mut cmd = Command::new(&self.command);
        cmd.arg("backup")
            .arg("--path")
            .arg(&source.by_path)
            .arg("--storage-location")
            .arg(&self.backup_storage_location)
            .arg("--password-file")
            .arg(creds.path());
        for (key, value) in &tags {
            cmd.arg("--tag").arg(format!("{}={}", key, value));
        }

        info!(request = %self.name, path = %source.by_path.display(), "starting backup mover");
        self.spawn(cmd, creds).await
    }

    async fn start_restore(&self, snapshot_id: &str, target: AccessPoint) -> Result<()> {
        let creds = self.credentials_file().await?;

        let mut cmd = Command::new(&self.command);
        cmd.arg("restore")
            .arg("--snapshot-id")
            .arg(snapshot_id)
            .arg("--path")
            .arg(&target.by_path)
            .arg("--storage-location")
            .arg(&self.backup_storage_location)
            .arg("--password-file")
            .arg(creds.path());

        info!(request = %self.name, snapshot = %snapshot_id, "starting restore mover");
        self.spawn(cmd, creds).await
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.kill.notify_waiters();
    }

    async fn close(&self) {
        // A still-running mover has no business outliving its session
        self.kill.notify_waiters();
    }
}
