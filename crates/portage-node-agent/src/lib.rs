//! Portage node agent - per-node data mover controllers
//!
//! One agent runs on every node. Its two controllers race with their peers
//! to accept DataUpload/DataDownload records, stage volume access through
//! an exposer, and drive bounded data-path sessions against the object
//! store. The resume sweeper re-anchors in-memory state to the persisted
//! records after a restart.

pub mod config;
pub mod download_controller;
pub mod resume;
pub mod runner;
pub mod session;
pub mod upload_controller;

#[cfg(test)]
mod testing;

pub use config::NodeAgentConfig;
pub use download_controller::DownloadContext;
pub use upload_controller::UploadContext;
