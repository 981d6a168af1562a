//! Replication server configuration

use crate::csn::ReplicaId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the changelog decides that a change is visible to external readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityPolicy {
    /// Visible as soon as it is stored
    Immediate,
    /// Visible once every connected directory server has advanced past it
    #[default]
    MinimumAcknowledged,
}

/// Per replicated domain settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Replicated base DN
    pub base_dn: String,
    /// Overrides the server purge delay for this domain
    pub purge_delay_secs: Option<u64>,
    /// Original-entry attributes echoed in changelog entries (`*` for all)
    pub ecl_include_attributes: Vec<String>,
    /// Excluded from the external changelog
    pub private: bool,
}

impl DomainConfig {
    /// Public domain with default settings
    pub fn new(base_dn: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            ..Default::default()
        }
    }

    /// Mark the domain private
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    /// Set the projected attributes
    pub fn with_include_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ecl_include_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Override the purge delay
    pub fn with_purge_delay(mut self, delay: Duration) -> Self {
        self.purge_delay_secs = Some(delay.as_secs());
        self
    }
}

/// Replication server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationServerConfig {
    /// Identifier of this replication server
    pub server_id: ReplicaId,

    /// Directory holding the LMDB environment
    pub data_dir: PathBuf,

    /// Address to bind for replica connections
    pub bind_addr: SocketAddr,

    /// LMDB map size in bytes
    pub map_size: usize,

    /// Heartbeat interval expected from replicas
    pub heartbeat_interval_ms: u64,

    /// Number of missed heartbeats before a link is dropped
    pub missed_heartbeats_threshold: u32,

    /// Retention of change log records
    pub purge_delay_secs: u64,

    /// How often the purge task runs
    pub purge_interval_secs: u64,

    /// Default window size offered to replicas
    pub window_size: usize,

    /// How long `publish` waits for window credit
    pub publish_timeout_ms: u64,

    /// Largest accepted wire frame
    pub max_frame_bytes: usize,

    /// When changes become visible in the external changelog
    pub eligibility: EligibilityPolicy,

    /// Maximum concurrent persistent searches
    pub max_ecl_subscribers: usize,

    /// Records fetched per read transaction by changelog cursors
    pub ecl_batch_size: usize,

    /// Replicated domains
    pub domains: Vec<DomainConfig>,
}

impl Default for ReplicationServerConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            data_dir: PathBuf::from("./data/changelog"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], super::DEFAULT_REPLICATION_PORT)),
            map_size: 1024 * 1024 * 1024,
            heartbeat_interval_ms: 10_000,
            missed_heartbeats_threshold: 3,
            purge_delay_secs: 3 * 24 * 3600,
            purge_interval_secs: 60,
            window_size: 100,
            publish_timeout_ms: 30_000,
            max_frame_bytes: 16 * 1024 * 1024,
            eligibility: EligibilityPolicy::MinimumAcknowledged,
            max_ecl_subscribers: 64,
            ecl_batch_size: 256,
            domains: Vec::new(),
        }
    }
}

impl ReplicationServerConfig {
    /// Configuration rooted at a data directory
    pub fn new(server_id: ReplicaId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_id,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(
            path = %path.display(),
            domains = config.domains.len(),
            "Loaded replication server configuration"
        );
        Ok(config)
    }

    /// Add a replicated domain
    pub fn with_domain(mut self, domain: DomainConfig) -> Self {
        self.domains.push(domain);
        self
    }

    /// Set the eligibility policy
    pub fn with_eligibility(mut self, policy: EligibilityPolicy) -> Self {
        self.eligibility = policy;
        self
    }

    /// Set the default window size
    pub fn with_window_size(mut self, window: usize) -> Self {
        self.window_size = window;
        self
    }

    /// Set the publish timeout
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retention delay
    pub fn with_purge_delay(mut self, delay: Duration) -> Self {
        self.purge_delay_secs = delay.as_secs();
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the persistent search limit
    pub fn with_max_ecl_subscribers(mut self, max: usize) -> Self {
        self.max_ecl_subscribers = max;
        self
    }

    /// Set the bind address
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a link is considered dead
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats_threshold
    }

    /// Publish timeout
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Purge task period
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    /// Effective purge delay of one domain
    pub fn purge_delay_for(&self, domain: &DomainConfig) -> Duration {
        Duration::from_secs(domain.purge_delay_secs.unwrap_or(self.purge_delay_secs))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::config("window_size must be at least 1"));
        }
        if self.missed_heartbeats_threshold == 0 {
            return Err(Error::config("missed_heartbeats_threshold must be at least 1"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::config("heartbeat_interval_ms must be at least 1"));
        }
        if self.max_frame_bytes < 1024 {
            return Err(Error::config("max_frame_bytes must be at least 1024"));
        }
        if self.ecl_batch_size == 0 {
            return Err(Error::config("ecl_batch_size must be at least 1"));
        }
        let mut seen = std::collections::HashSet::new();
        for domain in &self.domains {
            if domain.base_dn.trim().is_empty() {
                return Err(Error::config("domain base_dn must not be empty"));
            }
            if !seen.insert(domain.base_dn.to_ascii_lowercase()) {
                return Err(Error::config(format!(
                    "domain {} is configured twice",
                    domain.base_dn
                )));
            }
        }
        Ok(())
    }
}
