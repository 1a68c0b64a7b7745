//! The role of this master replica, as determined by the external consensus layer.

use tokio::sync::watch;

const METRIC_IS_LEADER: &str = "chunk_master_is_leader";
const METRIC_ROLE_CHANGES: &str = "chunk_master_num_role_changes";

/// The roles which a master replica may hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// This replica is the leader, and may schedule jobs & accept mutations.
    Leader,
    /// This replica follows the leader, applying its mutation log.
    Follower,
    /// An election is in progress, or the role is unknown.
    Candidate,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// The sending half of the role signal, held by the consensus layer.
pub type RoleTx = watch::Sender<Role>;
/// The receiving half of the role signal.
pub type RoleRx = watch::Receiver<Role>;

/// Create a new role signal, starting as a candidate.
pub fn role_channel() -> (RoleTx, RoleRx) {
    metrics::register_gauge!(METRIC_IS_LEADER, metrics::Unit::Count, "a gauge indicating if this replica is the leader, 1 if leader, else 0");
    metrics::register_counter!(METRIC_ROLE_CHANGES, metrics::Unit::Count, "the number of role changes observed by this replica");
    watch::channel(Role::Candidate)
}

/// Record a role change.
pub(crate) fn observe_role_change(from: Role, to: Role) {
    tracing::info!(?from, ?to, "master role changed");
    metrics::increment_counter!(METRIC_ROLE_CHANGES);
    let is_leader = if to.is_leader() { 1.0 } else { 0.0 };
    metrics::gauge!(METRIC_IS_LEADER, is_leader);
}
