use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::controller::{MasterCtl, MasterHandle};
use crate::database::Database;
use crate::mailbox::JobMailbox;
use crate::role::{role_channel, Role, RoleTx};
use crate::server::spawn_server;
use crate::throttler::RequestThrottler;

/// The application object for when the chunk master is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// A handle for submitting requests to the master controller.
    master: MasterHandle,
    /// The role signal of this replica, driven by the consensus layer.
    role_tx: RoleTx,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the master controller.
    ctl_handle: JoinHandle<Result<()>>,
    /// The join handle of the HTTP server.
    server_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this replica's storage & config.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let dynamic = config.load_dynamic_config().await?;
        let throttler = Arc::new(RequestThrottler::new(&dynamic.chunk_service));
        let dynamic = Arc::new(ArcSwap::from_pointee(dynamic));

        // Spawn the master controller.
        let mailbox = JobMailbox::new();
        let (role_tx, role_rx) = role_channel();
        let (requests_tx, requests_rx) = mpsc::channel(1000);
        let ctl = MasterCtl::new(
            config.clone(),
            dynamic,
            db.clone(),
            throttler.clone(),
            Arc::new(mailbox.clone()),
            role_rx,
            shutdown_tx.clone(),
            requests_rx,
        )
        .await
        .context("error spawning master controller")?;
        let ctl_handle = ctl.spawn();
        let master = MasterHandle::new(requests_tx, throttler);

        let server_handle = spawn_server(&config, master.clone(), mailbox, shutdown_tx.subscribe());

        if config.assume_leadership {
            tracing::info!("assuming leadership as the only master replica");
            let _res = role_tx.send(Role::Leader);
        }

        Ok(Self {
            _config: config,
            _db: db,
            master,
            role_tx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            ctl_handle,
            server_handle,
        })
    }

    /// A handle for submitting requests to the master controller.
    pub fn master(&self) -> MasterHandle {
        self.master.clone()
    }

    /// The role signal of this replica, used by the consensus layer to drive role changes.
    pub fn role_signal(&self) -> &RoleTx {
        &self.role_tx
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("chunk master is shutting down");
        if let Err(err) = self.ctl_handle.await.context("error joining master controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down master controller");
        }
        if let Err(err) = self.server_handle.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }

        tracing::debug!("chunk master shutdown complete");
        Ok(())
    }
}
