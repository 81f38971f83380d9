//! Role-aware server selection.
//!
//! The picker partitions the resolved servers into the leader and the
//! followers. Mutating calls go to the leader; reads round-robin across
//! the followers so a hot consumer does not camp on one node, falling back
//! to the leader only when it stands alone.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use strand_api::Server;

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Default)]
struct Partition {
    leader: Option<String>,
    followers: Vec<String>,
}

/// Routes calls to server addresses by role.
#[derive(Debug, Default)]
pub struct Picker {
    partition: RwLock<Partition>,
    next_follower: AtomicU64,
}

impl Picker {
    /// An empty picker; every pick fails until [`Picker::update`] runs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the known servers.
    pub fn update(&self, servers: &[Server]) {
        let mut partition = Partition::default();
        for server in servers {
            if server.is_leader {
                partition.leader = Some(server.rpc_addr.clone());
            } else {
                partition.followers.push(server.rpc_addr.clone());
            }
        }
        *self.partition.write() = partition;
    }

    /// Picks an address for a call; `mutating` calls always go to the
    /// leader.
    pub fn pick(&self, mutating: bool) -> ClientResult<String> {
        let partition = self.partition.read();

        if mutating {
            return partition
                .leader
                .clone()
                .ok_or(ClientError::NoServerAvailable("write"));
        }

        if partition.followers.is_empty() {
            return partition
                .leader
                .clone()
                .ok_or(ClientError::NoServerAvailable("read"));
        }

        let n = self.next_follower.fetch_add(1, Ordering::Relaxed) as usize;
        Ok(partition.followers[n % partition.followers.len()].clone())
    }

    /// True when no leader is currently known.
    pub fn leaderless(&self) -> bool {
        self.partition.read().leader.is_none()
    }
}
