//! Chunk master controller.
//!
//! A single task owns the replicated `ChunkMaster` state along with the leader-local
//! replicator. Every change flows through the controller as a `Mutation`: it is applied to the
//! state machine, durably appended to the mutation log, and its outcome is routed to the
//! replicator & the request throttler.
//!
//! Only the leader accepts requests which mutate state, schedules replicator rounds and
//! rebalances the token ring. Followers apply the leader's log, delivered in order by the
//! consensus layer through `MasterMsg::Replicate`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::chunks::{default_vital, ChunkCreateSpec, PolicyUpdate};
use crate::config::{Config, DynamicConfig};
use crate::database::Database;
use crate::error::{AppError, AppResult};
use crate::master::{ChunkMaster, Mutation, MutationOutcome};
use crate::models::{ChunkId, ChunkStatistics, ErasureCodec, JobId, NodeHealth, NodeHeartbeat, NodeId, ReplicationPolicy};
use crate::placement::{consistent_placement_hash, PlacementEngine, PlacementRequest};
use crate::replicator::{JobState, NodeClient, Replicator};
use crate::ring::RingGeneration;
use crate::role::{observe_role_change, Role, RoleRx};
use crate::throttler::RequestThrottler;

const METRIC_MUTATIONS: &str = "chunk_master_mutations_applied";
const METRIC_LAST_APPLIED: &str = "chunk_master_last_applied";

/// The delay before re-checking the token redistribution period while it is disabled.
const REBALANCE_RECHECK_INTERVAL: Duration = Duration::from_secs(60);
const ERR_CONTROLLER_GONE: &str = "chunk master controller is no longer running";

/// A request to create a new chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateChunkRequest {
    #[serde(default)]
    pub codec: ErasureCodec,
    /// The account on behalf of which the chunk is written.
    pub account: String,
    pub policy: ReplicationPolicy,
    #[serde(default = "default_vital")]
    pub vital: bool,
    /// Chunks of the same placement group collocate while consistent placement is enabled.
    #[serde(default)]
    pub placement_group: Option<String>,
    #[serde(default)]
    pub statistics: ChunkStatistics,
}

/// A newly created chunk along with the nodes it should be written to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedChunk {
    pub id: ChunkId,
    pub targets: Vec<NodeId>,
}

/// A read-only query of master state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inspect {
    Status,
    Chunk(ChunkId),
    Nodes,
    Node(NodeId),
    Requisitions,
    Histograms,
    LostChunks,
}

/// A message bound for the chunk master controller.
pub enum MasterMsg {
    /// A request to create a new chunk, resolved by the leader.
    CreateChunk {
        request: CreateChunkRequest,
        tx: oneshot::Sender<AppResult<CreatedChunk>>,
    },
    /// A request to register a new storage node.
    RegisterNode {
        address: String,
        capacity: u64,
        tx: oneshot::Sender<AppResult<NodeId>>,
    },
    /// A heartbeat of a storage node.
    Heartbeat {
        heartbeat: NodeHeartbeat,
        tx: oneshot::Sender<AppResult<()>>,
    },
    /// A fully resolved mutation, only accepted by the leader.
    Mutate {
        mutation: Mutation,
        tx: oneshot::Sender<AppResult<()>>,
    },
    /// A mutation of the leader's log, delivered to followers in log order.
    Replicate {
        seq: u64,
        mutation: Mutation,
        tx: oneshot::Sender<AppResult<()>>,
    },
    /// A storage node finished a job.
    JobFinished { id: JobId, state: JobState },
    /// Swap in a new dynamic config.
    UpdateDynamicConfig {
        config: DynamicConfig,
        tx: oneshot::Sender<AppResult<()>>,
    },
    /// A read-only query of master state.
    Inspect {
        query: Inspect,
        tx: oneshot::Sender<AppResult<serde_json::Value>>,
    },
}

/// The controller of the chunk master.
pub struct MasterCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The application's hot-reloadable config.
    dynamic: Arc<ArcSwap<DynamicConfig>>,
    /// The application's database system.
    db: Database,
    /// The replicated master state.
    master: ChunkMaster,
    /// The leader-local chunk replicator.
    replicator: Replicator,
    throttler: Arc<RequestThrottler>,
    /// The client used for dispatching jobs to storage nodes.
    client: Arc<dyn NodeClient>,
    rng: StdRng,

    /// The current role of this replica.
    role: Role,
    /// A signal of the role of this replica, driven by the consensus layer.
    role_rx: RoleRx,
    /// The last time each node was heard from, as observed by the leader.
    last_seen: HashMap<NodeId, Instant>,
    /// The applied count of the last written snapshot.
    last_snapshot: u64,

    /// A channel of inbound requests.
    requests_rx: ReceiverStream<MasterMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl MasterCtl {
    /// Create a new instance, recovering master state from the database.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: Arc<Config>, dynamic: Arc<ArcSwap<DynamicConfig>>, db: Database, throttler: Arc<RequestThrottler>, client: Arc<dyn NodeClient>,
        role_rx: RoleRx, shutdown_tx: broadcast::Sender<()>, requests_rx: mpsc::Receiver<MasterMsg>,
    ) -> Result<Self> {
        let master = db.recover().await?;
        throttler.sync_overrides(master.throttle_overrides());
        metrics::register_counter!(METRIC_MUTATIONS, metrics::Unit::Count, "the number of mutations applied by this replica");
        metrics::register_gauge!(METRIC_LAST_APPLIED, metrics::Unit::Count, "the sequence number of the last applied mutation");
        metrics::gauge!(METRIC_LAST_APPLIED, master.applied() as f64);

        Ok(Self {
            config,
            dynamic,
            db,
            last_snapshot: master.applied(),
            master,
            replicator: Replicator::default(),
            throttler,
            client,
            rng: StdRng::from_entropy(),
            role: Role::Candidate,
            role_rx,
            last_seen: HashMap::new(),
            requests_rx: ReceiverStream::new(requests_rx),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(master_id = %self.config.master_id, "chunk master controller has started");
        self.handle_role_change();

        let round_timer = tokio::time::sleep(self.dynamic.load().replicator_round_interval());
        tokio::pin!(round_timer);
        let rebalance_timer = tokio::time::sleep(self.rebalance_delay());
        tokio::pin!(rebalance_timer);
        let snapshot_period = self.config.snapshot_interval();
        let mut snapshot_interval = tokio::time::interval_at(tokio::time::Instant::now() + snapshot_period, snapshot_period);

        loop {
            tokio::select! {
                msg_opt = self.requests_rx.next() => self.handle_ctl_msg(msg_opt).await,
                changed_res = self.role_rx.changed() => match changed_res {
                    Ok(()) => self.handle_role_change(),
                    Err(_) => {
                        tracing::error!("role signal closed, shutting down");
                        let _ = self.shutdown_tx.send(());
                        break;
                    }
                },
                _ = &mut round_timer => {
                    round_timer.set(tokio::time::sleep(self.dynamic.load().replicator_round_interval()));
                    self.run_replicator_round().await;
                }
                _ = &mut rebalance_timer => {
                    rebalance_timer.set(tokio::time::sleep(self.rebalance_delay()));
                    self.rebalance_tokens().await;
                }
                _ = snapshot_interval.tick() => self.write_snapshot().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        self.write_snapshot().await;
        tracing::debug!(master_id = %self.config.master_id, "chunk master controller has shutdown");
        Ok(())
    }

    /// Handle a controller message.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    async fn handle_ctl_msg(&mut self, msg_opt: Option<MasterMsg>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                let _res = self.shutdown_tx.send(());
                return;
            }
        };
        match msg {
            MasterMsg::CreateChunk { request, tx } => {
                let _res = tx.send(self.handle_create_chunk(request).await);
            }
            MasterMsg::RegisterNode { address, capacity, tx } => {
                let _res = tx.send(self.handle_register_node(address, capacity).await);
            }
            MasterMsg::Heartbeat { heartbeat, tx } => {
                let _res = tx.send(self.handle_heartbeat(heartbeat).await);
            }
            MasterMsg::Mutate { mutation, tx } => {
                let res = match self.ensure_leader() {
                    Ok(()) => self.commit(mutation).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                let _res = tx.send(res);
            }
            MasterMsg::Replicate { seq, mutation, tx } => {
                let _res = tx.send(self.handle_replicate(seq, mutation).await);
            }
            MasterMsg::JobFinished { id, state } => self.handle_job_finished(id, state),
            MasterMsg::UpdateDynamicConfig { config, tx } => {
                let _res = tx.send(self.handle_update_dynamic_config(config));
            }
            MasterMsg::Inspect { query, tx } => {
                let _res = tx.send(self.handle_inspect(query));
            }
        }
    }

    fn ensure_leader(&self) -> AppResult<()> {
        if self.role.is_leader() {
            return Ok(());
        }
        Err(AppError::NotLeader(format!("{:?}", self.role)))
    }

    /// Apply a mutation, append it to the log, and route its outcome.
    ///
    /// **NOTE: a failure to persist the mutation will cause a shutdown to be issued.**
    #[tracing::instrument(level = "trace", skip(self, mutation), fields(kind = mutation.kind_label()))]
    async fn commit(&mut self, mutation: Mutation) -> AppResult<MutationOutcome> {
        let kind = mutation.kind_label();
        let previous = self.master.ring().current();
        let outcome = self.master.apply(mutation.clone())?;
        if let Err(err) = self.db.append_mutation(self.master.applied(), &mutation).await {
            tracing::error!(error = ?err, "error persisting mutation, shutting down");
            let _ = self.shutdown_tx.send(());
            return Err(AppError::Ise(err.0));
        }
        metrics::increment_counter!(METRIC_MUTATIONS, "kind" => kind);
        metrics::gauge!(METRIC_LAST_APPLIED, self.master.applied() as f64);
        self.route_outcome(&outcome, &previous);
        Ok(outcome)
    }

    /// Route the outcome of an applied mutation to the throttler & the replicator.
    fn route_outcome(&mut self, outcome: &MutationOutcome, previous: &RingGeneration) {
        if let Some((user, limit)) = &outcome.throttle {
            if let Err(err) = self.throttler.set_override(user, *limit) {
                tracing::error!(error = ?err, user = %user, "error applying throttle override");
            }
        }
        if !self.role.is_leader() {
            return;
        }
        for chunk in outcome.touched.iter() {
            self.replicator.enqueue(*chunk);
        }
        for (chunk, node) in outcome.reported.iter() {
            self.replicator.replica_reported(*chunk, *node);
        }
        if self.master.ring().current().generation() != previous.generation() {
            let config = self.dynamic.load();
            self.replicator.ring_changed(&self.master, previous, &config);
        }
    }

    /// Handle a request to create a new chunk.
    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn handle_create_chunk(&mut self, request: CreateChunkRequest) -> AppResult<CreatedChunk> {
        self.ensure_leader()?;
        let config = self.dynamic.load_full();
        let consistent_hash = match &request.placement_group {
            Some(group) if config.consistent_replica_placement.enable => Some(consistent_placement_hash(group)),
            _ => None,
        };
        let id = ChunkId::generate();
        let size = request.statistics.compressed_data_size;
        let spec = ChunkCreateSpec {
            codec: request.codec,
            account: request.account,
            policy: request.policy,
            vital: request.vital,
            consistent_placement_hash: consistent_hash,
            statistics: request.statistics,
        };
        self.commit(Mutation::CreateChunk { id, spec }).await?;

        let chunk = self.master.chunks().get(id)?;
        let desired = chunk.desired_replica_count(config.max_replication_factor(&chunk.medium));
        let ring = self.master.ring().current();
        let engine = PlacementEngine::new(self.master.nodes(), &ring, &config);
        let excluded = BTreeSet::new();
        let placement = PlacementRequest {
            chunk: id,
            size,
            consistent_hash,
            excluded: &excluded,
        };
        let targets = engine.place(&placement, desired, &mut self.rng);
        if targets.len() < desired {
            tracing::warn!(chunk = %id, desired, found = targets.len(), "not enough write targets for new chunk");
        }
        Ok(CreatedChunk { id, targets })
    }

    /// Handle a request to register a storage node.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_register_node(&mut self, address: String, capacity: u64) -> AppResult<NodeId> {
        self.ensure_leader()?;
        let config = self.dynamic.load();
        let mutation = Mutation::RegisterNode {
            address,
            capacity,
            tokens_per_node: config.consistent_replica_placement.tokens_per_node,
            bucket_count: config.consistent_replica_placement.token_distribution_bucket_count,
        };
        let outcome = self.commit(mutation).await?;
        outcome
            .node
            .ok_or_else(|| AppError::Ise(anyhow!("node registration did not yield a node ID")))
    }

    /// Handle a heartbeat from a storage node.
    async fn handle_heartbeat(&mut self, heartbeat: NodeHeartbeat) -> AppResult<()> {
        self.ensure_leader()?;
        let node = heartbeat.node;
        self.commit(Mutation::NodeHeartbeat { heartbeat }).await?;
        self.last_seen.insert(node, Instant::now());
        Ok(())
    }

    /// Handle a mutation of the leader's log.
    ///
    /// Followers must apply every mutation the leader applied. A mutation which can not be
    /// applied means that this replica diverged from the leader, and a shutdown is issued.
    #[tracing::instrument(level = "trace", skip(self, mutation))]
    async fn handle_replicate(&mut self, seq: u64, mutation: Mutation) -> AppResult<()> {
        if self.role.is_leader() {
            return Err(AppError::InvalidInput("the leader does not accept replicated mutations".into()));
        }
        let expected = self.master.applied() + 1;
        if seq < expected {
            tracing::debug!(seq, expected, "skipping already applied mutation");
            return Ok(());
        }
        if seq > expected {
            return Err(AppError::InvalidInput(format!("gap in replicated log, expected sequence {} found {}", expected, seq)));
        }
        if let Err(err) = self.commit(mutation).await {
            tracing::error!(error = ?err, seq, "replicated mutation rejected, state diverged from leader, shutting down");
            let _ = self.shutdown_tx.send(());
            return Err(err);
        }
        Ok(())
    }

    /// Handle the terminal state of a job reported by a storage node.
    fn handle_job_finished(&mut self, id: JobId, state: JobState) {
        if !self.role.is_leader() {
            return;
        }
        let config = self.dynamic.load();
        match self.replicator.job_finished(id, state, &config, Instant::now()) {
            Some(finished) => tracing::debug!(job = %id, chunk = %finished.job.chunk, ?state, "job finished"),
            None => tracing::debug!(job = %id, "finished job is not running, ignoring"),
        }
    }

    /// Validate & swap in a new dynamic config.
    #[tracing::instrument(level = "debug", skip(self, config))]
    fn handle_update_dynamic_config(&mut self, config: DynamicConfig) -> AppResult<()> {
        config.validate()?;
        let config = Arc::new(config);
        let previous = self.dynamic.swap(config.clone());
        self.throttler.reconfigure(&config.chunk_service);
        self.replicator.resize_history(config.finished_jobs_queue_size);
        if self.role.is_leader() && previous.consistent_replica_placement != config.consistent_replica_placement {
            self.replicator.enqueue_all(&self.master);
        }
        tracing::info!("dynamic config updated");
        Ok(())
    }

    /// Handle a change of the role of this replica.
    fn handle_role_change(&mut self) {
        let next = *self.role_rx.borrow();
        if next == self.role {
            return;
        }
        let was_leader = self.role.is_leader();
        observe_role_change(self.role, next);
        self.role = next;
        if next.is_leader() {
            let now = Instant::now();
            self.last_seen = self.master.nodes().iter().map(|node| (node.id, now)).collect();
            self.throttler.sync_overrides(self.master.throttle_overrides());
            self.replicator.enqueue_all(&self.master);
        } else if was_leader {
            self.replicator.drain();
            self.client.cancel_undelivered();
            self.last_seen.clear();
        }
    }

    /// Run a replicator round, dispatching all scheduled jobs.
    async fn run_replicator_round(&mut self) {
        if !self.role.is_leader() {
            return;
        }
        let config = self.dynamic.load_full();
        let now = Instant::now();
        self.expire_silent_nodes(&config, now).await;

        let jobs = self.replicator.run_round(&self.master, &config, now);
        for job in jobs {
            if let Err(err) = job.apply(self.client.as_ref()) {
                tracing::warn!(error = ?err, job = %job.id, chunk = %job.chunk, "error dispatching job");
                self.replicator.job_finished(job.id, JobState::Failed, &config, now);
            }
        }
    }

    /// Mark nodes which have not sent a heartbeat within the timeout as offline.
    async fn expire_silent_nodes(&mut self, config: &DynamicConfig, now: Instant) {
        let timeout = config.node_heartbeat_timeout();
        let silent: Vec<NodeId> = self
            .master
            .nodes()
            .iter()
            .filter(|node| node.online)
            .filter(|node| match self.last_seen.get(&node.id) {
                Some(seen) => now.saturating_duration_since(*seen) >= timeout,
                None => true,
            })
            .map(|node| node.id)
            .collect();
        for node in silent {
            tracing::warn!(%node, "node heartbeat timed out, marking node offline");
            self.last_seen.remove(&node);
            if let Err(err) = self.commit(Mutation::NodeOffline { node }).await {
                tracing::error!(error = ?err, %node, "error marking node offline");
            }
        }
    }

    /// The delay until the next token redistribution.
    fn rebalance_delay(&self) -> Duration {
        self.dynamic.load().token_redistribution_period().unwrap_or(REBALANCE_RECHECK_INTERVAL)
    }

    /// Rebalance the token ring, if consistent placement is enabled and the ring has drifted.
    async fn rebalance_tokens(&mut self) {
        if !self.role.is_leader() {
            return;
        }
        let config = self.dynamic.load_full();
        let crp = &config.consistent_replica_placement;
        if !crp.enable || crp.token_redistribution_period_ms.is_none() {
            return;
        }
        let (tokens_per_node, bucket_count) = (crp.tokens_per_node, crp.token_distribution_bucket_count);

        // Only log a rebalance which actually moves tokens.
        let mut ring = self.master.ring().clone();
        if ring.rebalance(tokens_per_node, bucket_count).is_empty() {
            return;
        }
        match self.commit(Mutation::RebalanceTokens { tokens_per_node, bucket_count }).await {
            Ok(outcome) => {
                let nodes = outcome.ring_delta.map(|delta| delta.affected_nodes().len()).unwrap_or(0);
                tracing::info!(nodes, "token ring redistributed");
            }
            Err(err) => tracing::error!(error = ?err, "error redistributing tokens"),
        }
    }

    /// Write a snapshot of master state, if anything changed since the last one.
    ///
    /// **NOTE: a failure to write the snapshot will cause a shutdown to be issued.**
    async fn write_snapshot(&mut self) {
        if self.master.applied() == self.last_snapshot {
            return;
        }
        match self.db.write_snapshot(&self.master.snapshot()).await {
            Ok(()) => self.last_snapshot = self.master.applied(),
            Err(err) => {
                tracing::error!(error = ?err, "error writing snapshot, shutting down");
                let _ = self.shutdown_tx.send(());
            }
        }
    }

    /// Handle a read-only query of master state.
    fn handle_inspect(&self, query: Inspect) -> AppResult<serde_json::Value> {
        let value = match query {
            Inspect::Status => {
                let ring = self.master.ring().current();
                let status = self.replicator.status();
                json!({
                    "master_id": self.config.master_id,
                    "role": format!("{:?}", self.role),
                    "applied": self.master.applied(),
                    "chunk_count": self.master.chunks().len(),
                    "node_count": self.master.nodes().len(),
                    "online_node_count": self.master.nodes().online_node_count(),
                    "requisition_count": self.master.requisitions().len(),
                    "ring": {
                        "generation": ring.generation(),
                        "token_count": ring.token_count(),
                    },
                    "replicator": {
                        "enabled": self.replicator.enabled(),
                        "queued": self.replicator.queue().len(),
                        "delayed": self.replicator.queue().delayed_len(),
                        "running_jobs": self.replicator.running_jobs().count(),
                        "pull_queue_len": self.replicator.pull_queue_len(),
                        "finished_jobs": self.replicator.history().len(),
                        "lost_chunks": status.lost_chunks.len(),
                        "lost_vital_chunks": status.lost_vital_chunks.len(),
                        "underreplicated_chunks": status.underreplicated_chunks.len(),
                        "overreplicated_chunks": status.overreplicated_chunks.len(),
                        "data_missing_chunks": status.data_missing_chunks.len(),
                        "parity_missing_chunks": status.parity_missing_chunks.len(),
                        "inconsistently_placed_chunks": status.inconsistently_placed_chunks.len(),
                        "unsafely_placed_chunks": status.unsafely_placed_chunks.len(),
                    },
                })
            }
            Inspect::Chunk(id) => {
                let chunk = self.master.chunks().get(id)?;
                let requisition = self.master.requisitions().get_registered(chunk.requisition);
                json!({
                    "chunk": chunk,
                    "requisition": requisition,
                    "running_job": self.replicator.running_job_of(id),
                    "finished_jobs": self.replicator.history().jobs_of(id),
                    "parked": self.replicator.is_parked(id),
                })
            }
            Inspect::Nodes => json!(self.master.nodes().iter().collect::<Vec<_>>()),
            Inspect::Node(id) => {
                let node = self.master.nodes().get(id)?;
                let ring = self.master.ring().current();
                json!({
                    "node": node,
                    "tokens": ring.tokens(id),
                    "pull_queue": self.replicator.pull_queue(id),
                })
            }
            Inspect::Requisitions => json!(self.master.requisitions().iter().collect::<Vec<_>>()),
            Inspect::Histograms => json!(self.master.chunks().histograms()),
            Inspect::LostChunks => {
                let status = self.replicator.status();
                json!({
                    "lost_chunks": status.lost_chunks,
                    "lost_vital_chunks": status.lost_vital_chunks,
                })
            }
        };
        Ok(value)
    }
}

/// A cloneable handle for submitting requests to the chunk master controller.
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::Sender<MasterMsg>,
    throttler: Arc<RequestThrottler>,
}

impl MasterHandle {
    pub fn new(tx: mpsc::Sender<MasterMsg>, throttler: Arc<RequestThrottler>) -> Self {
        Self { tx, throttler }
    }

    /// Send a message to the controller and await its response.
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<AppResult<T>>) -> MasterMsg) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| AppError::Ise(anyhow!(ERR_CONTROLLER_GONE)))?;
        rx.await.map_err(|_| AppError::Ise(anyhow!(ERR_CONTROLLER_GONE)))?
    }

    async fn mutate(&self, mutation: Mutation) -> AppResult<()> {
        self.request(|tx| MasterMsg::Mutate { mutation, tx }).await
    }

    pub async fn create_chunk(&self, request: CreateChunkRequest) -> AppResult<CreatedChunk> {
        self.request(|tx| MasterMsg::CreateChunk { request, tx }).await
    }

    pub async fn remove_chunk(&self, id: ChunkId) -> AppResult<()> {
        self.mutate(Mutation::RemoveChunk { id }).await
    }

    pub async fn attach_owner(&self, id: ChunkId, account: String, policy: ReplicationPolicy) -> AppResult<()> {
        self.mutate(Mutation::AttachOwner { id, account, policy }).await
    }

    pub async fn detach_owner(&self, id: ChunkId, account: String) -> AppResult<()> {
        self.mutate(Mutation::DetachOwner { id, account }).await
    }

    /// Transfer the ownership of a chunk from one account to another.
    pub async fn merge_owner(&self, id: ChunkId, old_account: String, new_account: String) -> AppResult<()> {
        self.mutate(Mutation::MergeOwner { id, old_account, new_account }).await
    }

    pub async fn update_policy(&self, id: ChunkId, update: PolicyUpdate) -> AppResult<()> {
        self.mutate(Mutation::UpdatePolicy { id, update }).await
    }

    pub async fn register_node(&self, address: String, capacity: u64) -> AppResult<NodeId> {
        self.request(|tx| MasterMsg::RegisterNode { address, capacity, tx }).await
    }

    /// Remove an offline storage node.
    pub async fn remove_node(&self, node: NodeId) -> AppResult<()> {
        self.mutate(Mutation::RemoveNode { node }).await
    }

    pub async fn set_node_health(&self, node: NodeId, health: NodeHealth) -> AppResult<()> {
        self.mutate(Mutation::SetNodeHealth { node, health }).await
    }

    pub async fn heartbeat(&self, heartbeat: NodeHeartbeat) -> AppResult<()> {
        self.request(|tx| MasterMsg::Heartbeat { heartbeat, tx }).await
    }

    pub async fn set_user_throttle(&self, user: String, limit: Option<f64>) -> AppResult<()> {
        self.mutate(Mutation::SetUserThrottle { user, limit }).await
    }

    /// Apply a mutation of the leader's log on a follower.
    pub async fn replicate(&self, seq: u64, mutation: Mutation) -> AppResult<()> {
        self.request(|tx| MasterMsg::Replicate { seq, mutation, tx }).await
    }

    /// Report the terminal state of a job.
    pub async fn job_finished(&self, id: JobId, state: JobState) -> AppResult<()> {
        self.tx
            .send(MasterMsg::JobFinished { id, state })
            .await
            .map_err(|_| AppError::Ise(anyhow!(ERR_CONTROLLER_GONE)))
    }

    pub async fn update_dynamic_config(&self, config: DynamicConfig) -> AppResult<()> {
        self.request(|tx| MasterMsg::UpdateDynamicConfig { config, tx }).await
    }

    pub async fn inspect(&self, query: Inspect) -> AppResult<serde_json::Value> {
        self.request(|tx| MasterMsg::Inspect { query, tx }).await
    }

    /// Throttle a chunk service request of the given user.
    pub async fn throttle_request(&self, user: &str, bytes: u64) {
        self.throttler.throttle(user, bytes).await
    }
}
