use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{Config, DynamicConfig, MediumConfig};
use crate::controller::{CreateChunkRequest, Inspect, MasterCtl, MasterHandle};
use crate::database::Database;
use crate::error::AppError;
use crate::mailbox::JobMailbox;
use crate::master::Mutation;
use crate::models::{ErasureCodec, NodeHeartbeat, NodeId, ReplicationPolicy, StoredReplica, DEFAULT_MEDIUM};
use crate::replicator::{JobKind, JobState};
use crate::role::{role_channel, Role, RoleTx};
use crate::throttler::RequestThrottler;

const GIB: u64 = 1 << 30;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const POLL_ATTEMPTS: usize = 300;

/// A running master controller along with the channels driving it.
struct Harness {
    master: MasterHandle,
    role_tx: RoleTx,
    mailbox: JobMailbox,
    shutdown_tx: broadcast::Sender<()>,
    ctl: JoinHandle<Result<()>>,
}

impl Harness {
    async fn start(config: Arc<Config>, dynamic: DynamicConfig) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);
        let db = Database::new(config.clone()).await?;
        let throttler = Arc::new(RequestThrottler::new(&dynamic.chunk_service));
        let mailbox = JobMailbox::new();
        let (role_tx, role_rx) = role_channel();
        let (requests_tx, requests_rx) = mpsc::channel(100);
        let ctl = MasterCtl::new(
            config,
            Arc::new(ArcSwap::from_pointee(dynamic)),
            db,
            throttler.clone(),
            Arc::new(mailbox.clone()),
            role_rx,
            shutdown_tx.clone(),
            requests_rx,
        )
        .await?
        .spawn();
        Ok(Self {
            master: MasterHandle::new(requests_tx, throttler),
            role_tx,
            mailbox,
            shutdown_tx,
            ctl,
        })
    }

    async fn set_role(&self, role: Role) -> Result<()> {
        self.role_tx.send(role).context("error sending role")?;
        let expected = format!("{:?}", role);
        for _ in 0..POLL_ATTEMPTS {
            let status = self.master.inspect(Inspect::Status).await?;
            if status["role"] == expected.as_str() {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        bail!("timed out waiting for role {:?}", role)
    }

    /// Register & heartbeat the given number of nodes.
    async fn add_nodes(&self, count: u32) -> Result<Vec<NodeId>> {
        let mut nodes = vec![];
        for idx in 0..count {
            let node = self.master.register_node(format!("10.0.0.{}:9020", idx), 10 * GIB).await?;
            self.heartbeat(node, vec![]).await?;
            nodes.push(node);
        }
        Ok(nodes)
    }

    async fn heartbeat(&self, node: NodeId, inventory: Vec<StoredReplica>) -> Result<()> {
        self.master
            .heartbeat(NodeHeartbeat {
                node,
                capacity: 10 * GIB,
                used_space: 0,
                inventory,
            })
            .await?;
        Ok(())
    }

    async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.ctl.await.context("error joining master controller")?
    }
}

fn chunk_request(replication_factor: u8) -> CreateChunkRequest {
    CreateChunkRequest {
        codec: ErasureCodec::None,
        account: "tenant".into(),
        policy: ReplicationPolicy::new(replication_factor),
        vital: true,
        placement_group: None,
        statistics: Default::default(),
    }
}

fn fast_config() -> DynamicConfig {
    let mut config = DynamicConfig::default();
    config.replicator_round_interval_ms = 10;
    config
}

#[tokio::test]
async fn mutations_are_rejected_unless_leader() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let harness = Harness::start(config, fast_config()).await?;

    let res = harness.master.create_chunk(chunk_request(2)).await;
    assert!(matches!(res, Err(AppError::NotLeader(_))), "expected a candidate to reject chunk creation");
    let res = harness.master.register_node("10.0.0.1:9020".into(), GIB).await;
    assert!(matches!(res, Err(AppError::NotLeader(_))), "expected a candidate to reject node registration");
    let status = harness.master.inspect(Inspect::Status).await?;
    assert_eq!(status["applied"], 0, "expected introspection to be served by any role");

    harness.shutdown().await
}

#[tokio::test]
async fn leader_creates_chunks_with_write_targets() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let harness = Harness::start(config, fast_config()).await?;
    harness.set_role(Role::Leader).await?;
    let nodes = harness.add_nodes(4).await?;

    let created = harness.master.create_chunk(chunk_request(3)).await?;
    assert_eq!(created.targets.len(), 3, "expected a target per replica");
    assert!(created.targets.iter().all(|node| nodes.contains(node)));
    let chunk = harness.master.inspect(Inspect::Chunk(created.id)).await?;
    assert_eq!(chunk["chunk"]["vital"], true);

    harness.master.remove_chunk(created.id).await?;
    let res = harness.master.remove_chunk(created.id).await;
    assert!(res.is_err(), "expected removing a removed chunk to be rejected");
    let status = harness.master.inspect(Inspect::Status).await?;
    assert_eq!(status["applied"], 4 * 2 + 2, "expected every accepted mutation to be applied");

    harness.shutdown().await
}

#[test]
fn create_requests_are_vital_unless_stated_otherwise() -> Result<()> {
    let request: CreateChunkRequest = serde_json::from_value(serde_json::json!({
        "account": "a",
        "policy": {"replication_factor": 3},
    }))?;
    assert!(request.vital, "expected chunks to be vital by default");
    assert_eq!(request.codec, ErasureCodec::None);
    assert_eq!(request.placement_group, None);

    let request: CreateChunkRequest = serde_json::from_value(serde_json::json!({
        "account": "a",
        "policy": {"replication_factor": 3},
        "vital": false,
    }))?;
    assert!(!request.vital, "expected explicit vitality to be kept");
    Ok(())
}

#[tokio::test]
async fn write_targets_respect_the_max_replication_factor() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let mut dynamic = fast_config();
    dynamic.media.insert(DEFAULT_MEDIUM.into(), MediumConfig { max_replication_factor: 5 });
    let harness = Harness::start(config, dynamic).await?;
    harness.set_role(Role::Leader).await?;
    harness.add_nodes(12).await?;

    let created = harness.master.create_chunk(chunk_request(10)).await?;
    assert_eq!(created.targets.len(), 5, "expected write targets to be capped by the medium");
    let created = harness.master.create_chunk(chunk_request(3)).await?;
    assert_eq!(created.targets.len(), 3, "expected smaller replication factors to be unaffected");

    harness.shutdown().await
}

#[tokio::test]
async fn underreplicated_chunks_are_dispatched_to_nodes() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let harness = Harness::start(config, fast_config()).await?;
    harness.set_role(Role::Leader).await?;
    let nodes = harness.add_nodes(3).await?;
    let created = harness.master.create_chunk(chunk_request(2)).await?;
    let source = nodes[0];
    harness
        .heartbeat(source, vec![StoredReplica { chunk: created.id, part_index: None }])
        .await?;

    let mut jobs = vec![];
    for _ in 0..POLL_ATTEMPTS {
        jobs = harness.mailbox.take(source);
        if !jobs.is_empty() {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    let job = jobs.into_iter().next().context("expected a job to be dispatched to the source node")?;
    assert_eq!(job.chunk, created.id);
    assert!(
        matches!(job.kind, JobKind::Replicate { source: job_source, pull: false, .. } if job_source == source),
        "expected a push replication job, got {:?}",
        job.kind
    );
    assert_ne!(job.target, source, "expected the replica to be copied onto another node");

    harness
        .heartbeat(job.target, vec![StoredReplica { chunk: created.id, part_index: None }])
        .await?;
    harness.master.job_finished(job.id, JobState::Completed).await?;
    let mut running = None;
    for _ in 0..POLL_ATTEMPTS {
        let status = harness.master.inspect(Inspect::Status).await?;
        running = status["replicator"]["running_jobs"].as_u64();
        if running == Some(0) {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    assert_eq!(running, Some(0), "expected the finished job to be retired");

    harness.shutdown().await
}

#[tokio::test]
async fn silent_nodes_are_marked_offline() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let mut dynamic = fast_config();
    dynamic.node_heartbeat_timeout_ms = 50;
    let harness = Harness::start(config, dynamic).await?;
    harness.set_role(Role::Leader).await?;
    let nodes = harness.add_nodes(1).await?;

    let mut online = Some(true);
    for _ in 0..POLL_ATTEMPTS {
        let node = harness.master.inspect(Inspect::Node(nodes[0])).await?;
        online = node["node"]["online"].as_bool();
        if online == Some(false) {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    assert_eq!(online, Some(false), "expected a node without heartbeats to go offline");

    harness.shutdown().await
}

#[tokio::test]
async fn followers_apply_the_leader_log_in_order() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let harness = Harness::start(config, fast_config()).await?;
    harness.set_role(Role::Follower).await?;
    let register = |idx: u32| Mutation::RegisterNode {
        address: format!("10.0.0.{}:9020", idx),
        capacity: GIB,
        tokens_per_node: 5,
        bucket_count: 5,
    };

    harness.master.replicate(1, register(0)).await?;
    harness.master.replicate(1, register(0)).await?;
    let res = harness.master.replicate(3, register(1)).await;
    assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected a gap in the log to be rejected");
    harness.master.replicate(2, register(1)).await?;
    let status = harness.master.inspect(Inspect::Status).await?;
    assert_eq!(status["applied"], 2, "expected duplicate deliveries to be skipped");
    assert_eq!(status["node_count"], 2);

    harness.set_role(Role::Leader).await?;
    let res = harness.master.replicate(3, register(2)).await;
    assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected the leader to reject replicated mutations");

    harness.shutdown().await
}

#[tokio::test]
async fn state_survives_restart() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let harness = Harness::start(config.clone(), fast_config()).await?;
    harness.set_role(Role::Leader).await?;
    harness.add_nodes(2).await?;
    let created = harness.master.create_chunk(chunk_request(2)).await?;
    harness.master.set_user_throttle("tenant".into(), Some(4096.0)).await?;
    harness.shutdown().await?;

    let harness = Harness::start(config, fast_config()).await?;
    let status = harness.master.inspect(Inspect::Status).await?;
    assert_eq!(status["applied"], 2 * 2 + 2, "expected all mutations to be recovered");
    let chunk = harness.master.inspect(Inspect::Chunk(created.id)).await?;
    assert_eq!(chunk["chunk"]["id"], created.id.to_string());
    harness.shutdown().await
}

#[tokio::test]
async fn invalid_dynamic_config_is_rejected_whole() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let harness = Harness::start(config, fast_config()).await?;

    let mut invalid = fast_config();
    invalid.max_jobs_per_round = 0;
    let res = harness.master.update_dynamic_config(invalid).await;
    assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected invalid config to be rejected");

    let mut valid = fast_config();
    valid.finished_jobs_queue_size = 10;
    harness.master.update_dynamic_config(valid).await?;
    harness.shutdown().await
}
