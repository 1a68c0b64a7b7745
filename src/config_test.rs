use std::time::Duration;

use anyhow::Result;

use crate::config::{Config, DynamicConfig, MediumConfig};
use crate::error::AppError;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "7100".into()),
        ("MASTER_ID".into(), "master-1".into()),
        ("STORAGE_DATA_PATH".into(), "/var/lib/chunk-master".into()),
        ("SNAPSHOT_INTERVAL_SECONDS".into(), "60".into()),
        ("DYNAMIC_CONFIG_PATH".into(), "/etc/chunk-master/dynamic.json".into()),
        ("ASSUME_LEADERSHIP".into(), "true".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.http_port == 7100, "unexpected value parsed for HTTP_PORT, got {}, expected {}", config.http_port, 7100);
    assert!(config.master_id == "master-1", "unexpected value parsed for MASTER_ID, got {}, expected {}", config.master_id, "master-1");
    assert!(
        config.storage_data_path == "/var/lib/chunk-master",
        "unexpected value parsed for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/var/lib/chunk-master"
    );
    assert_eq!(config.snapshot_interval(), Duration::from_secs(60), "unexpected value parsed for SNAPSHOT_INTERVAL_SECONDS");
    assert_eq!(config.dynamic_config_path.as_deref(), Some("/etc/chunk-master/dynamic.json"));
    assert!(config.assume_leadership, "unexpected value parsed for ASSUME_LEADERSHIP");
    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("MASTER_ID".into(), "master-0".into()),
    ])?;

    assert!(config.http_port == 7000, "unexpected default for HTTP_PORT, got {}, expected {}", config.http_port, 7000);
    assert!(
        config.storage_data_path == crate::database::DEFAULT_DATA_PATH,
        "unexpected default for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        crate::database::DEFAULT_DATA_PATH
    );
    assert_eq!(config.snapshot_interval(), Duration::from_secs(300));
    assert!(config.dynamic_config_path.is_none());
    assert!(!config.assume_leadership, "expected leadership to be driven externally by default");
    Ok(())
}

#[test]
fn config_requires_master_id() {
    let res = envy::from_iter::<_, Config>(vec![("RUST_LOG".into(), "error".into())]);
    assert!(res.is_err(), "expected config without MASTER_ID to be rejected");
}

#[test]
fn dynamic_config_defaults_are_valid() -> Result<()> {
    let config = DynamicConfig::default();
    config.validate()?;
    let decoded: DynamicConfig = serde_json::from_str("{}")?;
    assert_eq!(decoded, config, "expected an empty document to decode to the defaults");
    Ok(())
}

#[test]
fn dynamic_config_decodes_partial_documents() -> Result<()> {
    let decoded: DynamicConfig = serde_json::from_str(
        r#"{
            "max_job_retries": 2,
            "consistent_replica_placement": {"enable": true, "replicas_per_chunk": 3},
            "chunk_service": {
                "enable_per_user_request_bytes_throttling": true,
                "default_per_user_request_bytes_throttler": {"limit": 1048576.0}
            }
        }"#,
    )?;
    assert_eq!(decoded.max_job_retries, 2);
    assert!(decoded.consistent_replica_placement.enable);
    assert_eq!(decoded.consistent_replica_placement.replicas_per_chunk, 3);
    assert_eq!(
        decoded.consistent_replica_placement.tokens_per_node, 5,
        "expected unset nested keys to keep their defaults"
    );
    assert_eq!(decoded.chunk_service.default_per_user_request_bytes_throttler.limit, Some(1048576.0));
    decoded.validate()?;
    Ok(())
}

#[test]
fn dynamic_config_validation_rejects_invalid_values() {
    let mut cases: Vec<(&str, DynamicConfig)> = vec![];

    let mut config = DynamicConfig::default();
    config.replicator_round_interval_ms = 0;
    cases.push(("zero round interval", config));

    let mut config = DynamicConfig::default();
    config.job_retry_backoff_ms = 10_000;
    config.max_job_retry_backoff_ms = 1_000;
    cases.push(("backoff above its cap", config));

    let mut config = DynamicConfig::default();
    config.media.insert("ssd".into(), MediumConfig { max_replication_factor: 0 });
    cases.push(("zero max replication factor", config));

    let mut config = DynamicConfig::default();
    config.consistent_replica_placement.token_distribution_bucket_count = 0;
    cases.push(("zero bucket count", config));

    let mut config = DynamicConfig::default();
    config.consistent_replica_placement.token_redistribution_period_ms = Some(0);
    cases.push(("zero redistribution period", config));

    let mut config = DynamicConfig::default();
    config.chunk_service.default_per_user_request_bytes_throttler.limit = Some(-1.0);
    cases.push(("negative throttle limit", config));

    let mut config = DynamicConfig::default();
    config.node_heartbeat_timeout_ms = 0;
    cases.push(("zero heartbeat timeout", config));

    for (name, config) in cases {
        let res = config.validate();
        assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected config with {} to be rejected", name);
    }
}

#[test]
fn job_retry_backoff_doubles_up_to_its_cap() {
    let mut config = DynamicConfig::default();
    config.job_retry_backoff_ms = 100;
    config.max_job_retry_backoff_ms = 1_000;

    assert_eq!(config.job_retry_backoff(1), Duration::from_millis(100));
    assert_eq!(config.job_retry_backoff(2), Duration::from_millis(200));
    assert_eq!(config.job_retry_backoff(4), Duration::from_millis(800));
    assert_eq!(config.job_retry_backoff(5), Duration::from_millis(1_000), "expected backoff to be capped");
    assert_eq!(config.job_retry_backoff(200), Duration::from_millis(1_000), "expected large failure counts not to overflow");
}

#[test]
fn unknown_media_use_the_default_max_replication_factor() {
    let mut config = DynamicConfig::default();
    config.media.insert("ssd".into(), MediumConfig { max_replication_factor: 3 });
    assert_eq!(config.max_replication_factor("ssd"), 3);
    assert_eq!(config.max_replication_factor("tape"), crate::config::DEFAULT_MAX_REPLICATION_FACTOR);
}
