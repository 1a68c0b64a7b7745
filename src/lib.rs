//! The chunk master.
//!
//! Tracks chunks & the storage nodes hosting their replicas, decides replica placement, and
//! continuously converges the stored replicas of every chunk towards its replication policy.

mod app;
pub mod chunks;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod controller;
#[cfg(test)]
mod controller_test;
pub mod database;
#[cfg(test)]
mod database_test;
pub mod error;
pub mod histogram;
pub mod mailbox;
pub mod master;
pub mod models;
pub mod nodes;
#[cfg(test)]
mod nodes_test;
pub mod placement;
pub mod replicator;
pub mod requisition;
pub mod ring;
#[cfg(test)]
mod ring_test;
pub mod role;
mod server;
pub mod throttler;
#[cfg(test)]
mod throttler_test;
mod utils;
#[cfg(test)]
mod utils_test;

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};

pub use crate::app::App;
pub use crate::config::Config;

/// Get a handle to the metrics recorder, building it on first use.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();
    RECORDER.get_or_init(|| {
        PrometheusBuilder::new()
            .add_global_label("master_id", config.master_id.clone())
            .build()
    })
}
