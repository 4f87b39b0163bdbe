//! Per-node settings, read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Serialized};
use scm_retry::RetryConfig;
use serde::{Deserialize, Serialize};

/// Environment prefix for every knob (`SCM_SECRET`, `SCM_IS_SLAVE`, ...).
pub const ENV_PREFIX: &str = "SCM_";

/// The per-node configuration.
///
/// Every field has a default so a master with an inline config can start
/// from a bare environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Whether this node is a slave (non-master) node.
    pub is_slave: bool,
    /// Shared secret for internal authentication between nodes.
    pub secret: Option<String>,
    /// Root directory for materialized sources on slave nodes.
    pub target: PathBuf,
    /// Root directory for materialized sources on the master node.
    pub master_target: PathBuf,
    /// Number of attempts when pulling a tarball from the master.
    pub retry_number: u32,
    /// Delay in seconds between tarball pull attempts.
    pub retry_delay: u64,
    /// Interval in seconds between drift-detector passes.
    pub watch_source_interval: u64,
    /// Base URL of the master API, used by slaves to pull tarballs.
    pub api_base_url: Option<String>,
    /// Set on a master that serves slaves; templates then run on the
    /// slaves, near the point of consumption.
    pub api_master: Option<String>,
    /// Tag filter: a slave only materializes sources carrying this tag.
    pub tag_filter: Option<String>,
    /// Inline master config (YAML text). When set, no self-fetch happens.
    pub master_config: Option<String>,
    /// Path of the master config file watched for changes.
    pub master_config_file: PathBuf,
    /// Whether `slave_fetch` events for the master source are honored.
    pub master_dispatch: bool,
    /// Colon-separated env-name prefixes exposed to template engines.
    pub env_prefixes: String,
    /// GitHub webhook secret for `X-Hub-Signature-256` validation.
    pub github_secret: Option<String>,
    /// GitHub API token (commit details in the UI, unused by the core).
    pub github_token: Option<String>,
    /// Route prefix of the HTTP surface.
    pub route_prefix: String,
    /// Run plain HTTP (disables the HTTPS redirect).
    pub http: bool,
    /// Listen address of the HTTP surface.
    pub bind: SocketAddr,
    /// Redis URL for the broadcast bus; in-process bus when unset.
    pub redis_url: Option<String>,
    /// Seconds to wait for broadcast replies.
    pub broadcast_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            is_slave: false,
            secret: None,
            target: PathBuf::from("/config"),
            master_target: PathBuf::from("/master_config"),
            retry_number: 3,
            retry_delay: 1,
            watch_source_interval: 600,
            api_base_url: None,
            api_master: None,
            tag_filter: None,
            master_config: None,
            master_config_file: PathBuf::from("/etc/shared_config_manager/config.yaml"),
            master_dispatch: true,
            env_prefixes: "MUTUALIZED_".to_string(),
            github_secret: None,
            github_token: None,
            route_prefix: "/scm".to_string(),
            http: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            redis_url: None,
            broadcast_timeout: 10,
        }
    }
}

impl Settings {
    /// Load the settings from `SCM_`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .context("failed to load settings from the environment")
    }

    /// Whether this node is the master.
    pub fn is_master(&self) -> bool {
        !self.is_slave
    }

    /// Whether this node is a master that dispatches to slaves.
    pub fn is_master_with_slaves(&self) -> bool {
        self.is_master() && self.api_master.is_some()
    }

    /// URL a slave pulls the tarball of `id` from.
    pub fn tarball_url(&self, id: &str) -> Result<String> {
        let base = self
            .api_base_url
            .as_deref()
            .context("api_base_url is not configured")?;
        let base = base.strip_suffix('/').unwrap_or(base);
        Ok(format!("{base}/1/tarball/{id}"))
    }

    /// The env-name prefixes exposed to template engines.
    pub fn env_prefixes(&self) -> Vec<String> {
        self.env_prefixes
            .split(':')
            .filter(|prefix| !prefix.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Retry policy of the tarball pull.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::constant(self.retry_number, Duration::from_secs(self.retry_delay))
    }

    /// Interval between drift-detector passes.
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_source_interval)
    }

    /// How long to wait for broadcast replies.
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout)
    }

    /// Root directory for a source, by node role.
    pub fn target_root(&self, is_master: bool) -> &PathBuf {
        if is_master { &self.master_target } else { &self.target }
    }
}
