//! Runtime configuration.
//!
//! Static configuration is parsed from the environment at startup. Dynamic configuration
//! governs placement, replication & throttling behavior, and may be swapped out at any time
//! without a restart.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::DEFAULT_MEDIUM;

/// The max replication factor of media which have no explicit config.
pub const DEFAULT_MAX_REPLICATION_FACTOR: u8 = 20;
const DEFAULT_HTTP_PORT: u16 = 7000;
const DEFAULT_SNAPSHOT_INTERVAL_SECONDS: u64 = 300;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port of the introspection & metrics HTTP server.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,
    /// The identity of this master replica.
    pub master_id: String,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The interval at which snapshots of master state are written.
    #[serde(default = "Config::default_snapshot_interval_seconds")]
    pub snapshot_interval_seconds: u64,

    /// An optional path to a JSON file holding the initial dynamic config.
    #[serde(default)]
    pub dynamic_config_path: Option<String>,
    /// Run as the only master replica, holding leadership for the lifetime of the process.
    #[serde(default)]
    pub assume_leadership: bool,
}

impl Config {
    /// Build the static config from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// Load the initial dynamic config, falling back to defaults if no path is configured.
    pub async fn load_dynamic_config(&self) -> Result<DynamicConfig> {
        let path = match &self.dynamic_config_path {
            Some(path) => path,
            None => return Ok(DynamicConfig::default()),
        };
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("error reading dynamic config file {}", path))?;
        let config: DynamicConfig = serde_json::from_slice(&data).context("error decoding dynamic config")?;
        config.validate().map_err(anyhow::Error::from)?;
        Ok(config)
    }

    /// The interval at which snapshots of master state are written.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_seconds.max(1))
    }

    fn default_http_port() -> u16 {
        DEFAULT_HTTP_PORT
    }

    fn default_snapshot_interval_seconds() -> u64 {
        DEFAULT_SNAPSHOT_INTERVAL_SECONDS
    }

    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        Ok((
            std::sync::Arc::new(Self {
                rust_log: "error".into(),
                http_port: DEFAULT_HTTP_PORT,
                master_id: "master-0".into(),
                storage_data_path: tmpdir.path().to_string_lossy().to_string(),
                snapshot_interval_seconds: DEFAULT_SNAPSHOT_INTERVAL_SECONDS,
                dynamic_config_path: None,
                assume_leadership: true,
            }),
            tmpdir,
        ))
    }
}

/// Hot-reloadable configuration of the chunk master.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicConfig {
    /// Globally enable or disable the chunk replicator.
    pub enable_chunk_replicator: bool,
    /// The replicator is disabled while fewer online nodes than this are available.
    pub safe_online_node_count: usize,
    /// The interval between replicator rounds.
    pub replicator_round_interval_ms: u64,
    /// The max number of jobs scheduled per replicator round.
    pub max_jobs_per_round: usize,
    /// The duration after which a running job is aborted.
    pub job_timeout_ms: u64,
    /// The number of consecutive job failures after which a chunk is parked.
    pub max_job_retries: u32,
    /// The initial backoff applied to a chunk after a job failure.
    pub job_retry_backoff_ms: u64,
    /// The max backoff applied to a chunk after repeated job failures.
    pub max_job_retry_backoff_ms: u64,
    /// The number of finished jobs retained for introspection.
    pub finished_jobs_queue_size: usize,
    /// The duration without heartbeats after which a node is considered offline.
    pub node_heartbeat_timeout_ms: u64,
    /// Allow multiple parts of an erasure chunk to be stored on the same node.
    pub allow_multiple_erasure_parts_per_node: bool,
    /// Per-medium config.
    pub media: BTreeMap<String, MediumConfig>,
    pub consistent_replica_placement: ConsistentPlacementConfig,
    pub chunk_service: ChunkServiceConfig,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        let mut media = BTreeMap::new();
        media.insert(DEFAULT_MEDIUM.into(), MediumConfig::default());
        Self {
            enable_chunk_replicator: true,
            safe_online_node_count: 0,
            replicator_round_interval_ms: 1_000,
            max_jobs_per_round: 1_000,
            job_timeout_ms: 60_000,
            max_job_retries: 5,
            job_retry_backoff_ms: 1_000,
            max_job_retry_backoff_ms: 60_000,
            finished_jobs_queue_size: 50,
            node_heartbeat_timeout_ms: 60_000,
            allow_multiple_erasure_parts_per_node: false,
            media,
            consistent_replica_placement: Default::default(),
            chunk_service: Default::default(),
        }
    }
}

/// Config of a storage medium.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediumConfig {
    /// The max number of replicas stored on this medium.
    pub max_replication_factor: u8,
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            max_replication_factor: DEFAULT_MAX_REPLICATION_FACTOR,
        }
    }
}

/// Config of consistent replica placement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistentPlacementConfig {
    pub enable: bool,
    /// The base number of tokens of each node.
    pub tokens_per_node: u32,
    /// The number of buckets across which nodes are spread by weight.
    pub token_distribution_bucket_count: u32,
    /// The period of token redistribution, disabled when not set.
    pub token_redistribution_period_ms: Option<u64>,
    /// The max number of replicas of a chunk governed by consistent placement.
    pub replicas_per_chunk: usize,
    /// Hand replication to target nodes instead of pushing from source nodes.
    pub enable_pull_replication: bool,
}

impl Default for ConsistentPlacementConfig {
    fn default() -> Self {
        Self {
            enable: false,
            tokens_per_node: 5,
            token_distribution_bucket_count: 5,
            token_redistribution_period_ms: Some(30_000),
            replicas_per_chunk: 16,
            enable_pull_replication: false,
        }
    }
}

/// Config of the chunk service request surface.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkServiceConfig {
    pub enable_per_user_request_bytes_throttling: bool,
    pub default_per_user_request_bytes_throttler: ThrottlerConfig,
}

/// Config of a byte-rate throttler.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlerConfig {
    /// The limit in bytes per second, unlimited when not set.
    pub limit: Option<f64>,
}

impl DynamicConfig {
    /// Validate this config as a whole.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: &str| Err(AppError::InvalidInput(msg.into()));
        if self.replicator_round_interval_ms == 0 {
            return invalid("replicator_round_interval_ms must be positive");
        }
        if self.max_jobs_per_round == 0 {
            return invalid("max_jobs_per_round must be positive");
        }
        if self.job_timeout_ms == 0 {
            return invalid("job_timeout_ms must be positive");
        }
        if self.node_heartbeat_timeout_ms == 0 {
            return invalid("node_heartbeat_timeout_ms must be positive");
        }
        if self.job_retry_backoff_ms > self.max_job_retry_backoff_ms {
            return invalid("job_retry_backoff_ms must not exceed max_job_retry_backoff_ms");
        }
        if let Some((name, _)) = self.media.iter().find(|(_, medium)| medium.max_replication_factor == 0) {
            return Err(AppError::InvalidInput(format!("max_replication_factor of medium {} must be positive", name)));
        }
        let crp = &self.consistent_replica_placement;
        if crp.tokens_per_node == 0 {
            return invalid("consistent_replica_placement.tokens_per_node must be positive");
        }
        if crp.token_distribution_bucket_count == 0 {
            return invalid("consistent_replica_placement.token_distribution_bucket_count must be positive");
        }
        if crp.token_redistribution_period_ms == Some(0) {
            return invalid("consistent_replica_placement.token_redistribution_period_ms must be positive when set");
        }
        if crp.replicas_per_chunk == 0 {
            return invalid("consistent_replica_placement.replicas_per_chunk must be positive");
        }
        if let Some(limit) = self.chunk_service.default_per_user_request_bytes_throttler.limit {
            validate_throttle_limit(limit)?;
        }
        Ok(())
    }

    /// The max replication factor of the given medium.
    pub fn max_replication_factor(&self, medium: &str) -> u8 {
        self.media
            .get(medium)
            .map(|medium| medium.max_replication_factor)
            .unwrap_or(DEFAULT_MAX_REPLICATION_FACTOR)
    }

    pub fn replicator_round_interval(&self) -> Duration {
        Duration::from_millis(self.replicator_round_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn node_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.node_heartbeat_timeout_ms)
    }

    /// The backoff to apply after the given number of consecutive failures.
    pub fn job_retry_backoff(&self, failures: u32) -> Duration {
        let factor = 1u64.checked_shl(failures.saturating_sub(1)).unwrap_or(u64::MAX);
        let backoff = self.job_retry_backoff_ms.saturating_mul(factor).min(self.max_job_retry_backoff_ms);
        Duration::from_millis(backoff)
    }

    /// The period of token redistribution, if enabled.
    pub fn token_redistribution_period(&self) -> Option<Duration> {
        self.consistent_replica_placement
            .token_redistribution_period_ms
            .map(Duration::from_millis)
    }
}

/// Validate a byte-rate throttle limit.
pub fn validate_throttle_limit(limit: f64) -> AppResult<()> {
    if !limit.is_finite() || limit <= 0.0 {
        return Err(AppError::InvalidInput(format!("throttle limit must be a positive finite number, got {}", limit)));
    }
    Ok(())
}
