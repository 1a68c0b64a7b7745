//! Database management.
//!
//! The master persists its mutation log & its latest snapshot. Recovery restores the snapshot
//! and replays every logged mutation which the snapshot does not yet cover.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use sled::{Config as SledConfig, Db, IVec, Tree};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::master::{ChunkMaster, MasterSnapshot, Mutation};
use crate::utils;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/chunk-master/db";
/// The DB tree of the mutation log, keyed by big-endian sequence numbers.
const TREE_MUTATIONS: &str = "mutations";
/// The DB tree of master snapshots.
const TREE_SNAPSHOTS: &str = "snapshots";
/// The key of the latest snapshot.
const KEY_LATEST_SNAPSHOT: &[u8; 6] = b"latest";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the master database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    _db: Db,
    mutations: Tree,
    snapshots: Tree,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.master_id.as_str());
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for chunk master database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let mutations = db
                .open_tree(IVec::from(TREE_MUTATIONS))
                .with_context(|| format!("could not open DB tree {}", TREE_MUTATIONS))?;
            let snapshots = db
                .open_tree(IVec::from(TREE_SNAPSHOTS))
                .with_context(|| format!("could not open DB tree {}", TREE_SNAPSHOTS))?;
            let inner = Arc::new(DatabaseInner { _db: db, mutations, snapshots });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Durably append a mutation to the log under the given sequence number.
    #[tracing::instrument(level = "trace", skip(self, mutation))]
    pub async fn append_mutation(&self, seq: u64, mutation: &Mutation) -> ShutdownResult<()> {
        let data = utils::encode_model(mutation).map_err(ShutdownError::from)?;
        self.inner
            .mutations
            .insert(utils::encode_u64(seq), data)
            .context("error appending mutation to log")
            .map_err(ShutdownError::from)?;
        self.inner
            .mutations
            .flush_async()
            .await
            .context(ERR_DB_FLUSH)
            .map_err(ShutdownError::from)?;
        Ok(())
    }

    /// Durably write a snapshot, compacting all mutations which it covers.
    #[tracing::instrument(level = "debug", skip(self, snapshot), fields(applied = snapshot.applied))]
    pub async fn write_snapshot(&self, snapshot: &MasterSnapshot) -> ShutdownResult<()> {
        let data = utils::encode_model(snapshot).map_err(ShutdownError::from)?;
        let (snapshots, mutations, applied) = (self.inner.snapshots.clone(), self.inner.mutations.clone(), snapshot.applied);
        Self::spawn_blocking(move || -> Result<()> {
            snapshots.insert(KEY_LATEST_SNAPSHOT, data).context("error writing snapshot")?;
            snapshots.flush().context(ERR_DB_FLUSH)?;
            let mut batch = sled::Batch::default();
            for key_res in mutations.range(..=utils::encode_u64(applied)).keys() {
                let key = key_res.context(ERR_ITER_FAILURE)?;
                batch.remove(key);
            }
            mutations.apply_batch(batch).context("error compacting mutation log")?;
            mutations.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await
        .and_then(|res| res.map_err(ShutdownError::from))?;
        tracing::debug!("snapshot written");
        Ok(())
    }

    /// Recover the master state from the latest snapshot & the mutation log.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn recover(&self) -> ShutdownResult<ChunkMaster> {
        let (snapshots, mutations) = (self.inner.snapshots.clone(), self.inner.mutations.clone());
        let master = Self::spawn_blocking(move || -> ShutdownResult<ChunkMaster> {
            let snapshot: MasterSnapshot = snapshots
                .get(KEY_LATEST_SNAPSHOT)
                .context("error fetching latest snapshot during recovery")?
                .map(|data| utils::decode_model(&data).context("error decoding snapshot, data corrupted"))
                .transpose()?
                .unwrap_or_default();
            let mut master = ChunkMaster::restore(snapshot)?;
            replay_mutations(&mut master, &mutations)?;
            Ok(master)
        })
        .await??;
        tracing::info!(
            applied = master.applied(),
            chunks = master.chunks().len(),
            nodes = master.nodes().len(),
            "chunk master state recovered"
        );
        Ok(master)
    }
}

/// Replay all logged mutations not covered by the master's current state.
fn replay_mutations(master: &mut ChunkMaster, mutations: &Tree) -> Result<()> {
    for entry_res in mutations.range(utils::encode_u64(master.applied() + 1)..) {
        let (key, data) = entry_res.context(ERR_ITER_FAILURE)?;
        let seq = utils::decode_u64(&key).context("error decoding mutation sequence number")?;
        if seq != master.applied() + 1 {
            bail!("gap in mutation log, expected sequence {} found {}", master.applied() + 1, seq);
        }
        let mutation: Mutation = utils::decode_model(&data).context("error decoding mutation, data corrupted")?;
        master
            .apply(mutation)
            .map_err(|err| anyhow!("error replaying mutation {}: {}", seq, err))?;
    }
    Ok(())
}
