//! Node-agent configuration
//!
//! Everything the agent needs to identify itself and pace its work. The
//! node name arrives through the downward API; durations accept humantime
//! strings ("5m", "30s").

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use portage_common::{DATA_MOVER_PORTAGE, PORTAGE_SYSTEM_NAMESPACE};

/// Per-node data mover agent configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "portage-node-agent", version, about)]
pub struct NodeAgentConfig {
    /// Name of the node this agent runs on (downward API)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Namespace holding the data movement records
    #[arg(long, default_value = PORTAGE_SYSTEM_NAMESPACE)]
    pub namespace: String,

    /// Data-mover identity; records addressed to other movers are ignored
    #[arg(long, default_value = DATA_MOVER_PORTAGE)]
    pub data_mover: String,

    /// Maximum number of concurrent data-path sessions on this node
    #[arg(long, default_value_t = 1)]
    pub concurrent_limit: usize,

    /// How long a record may sit in Accepted before it fails
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub prepare_timeout: Duration,

    /// How often to poll the exposer while the hosting pod comes up
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub exposer_poll_interval: Duration,

    /// Upper bound on post-restore volume rebinding
    #[arg(long, default_value = "2m", value_parser = humantime::parse_duration)]
    pub rebind_timeout: Duration,

    /// Where the kubelet pods directory is mounted into this agent
    #[arg(long, default_value = "/host_pods")]
    pub host_pods_path: PathBuf,

    /// Directory for materialized repository credentials
    #[arg(long, default_value = "/tmp/credentials")]
    pub credentials_dir: PathBuf,

    /// External mover binary driven by data-path sessions
    #[arg(long, default_value = "portage-mover")]
    pub mover_command: PathBuf,

    /// Generate CRD manifests on stdout and exit
    #[arg(long)]
    pub crd: bool,
}
