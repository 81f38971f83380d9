//! Gossip-based cluster membership.
//!
//! Each node advertises `{name, rpc_addr}` over UDP. On an interval, every
//! member pushes its full roster to a few random peers; receiving a roster
//! merges it and answers anything new with our own, so a joiner converges
//! on the cluster within a couple of rounds. Leaving is announced
//! explicitly.
//!
//! The roster is advisory: the replicated configuration decides who votes.
//! Joined/Left events feed the agent, which forwards them to the
//! distributed log (only the leader's calls take effect).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ServerResult;

const MAX_DATAGRAM: usize = 64 * 1024;

/// One advertised member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Cluster-unique node name.
    pub name: String,
    /// The member's RPC address (shared Raft + client listener).
    pub rpc_addr: String,
    /// The member's gossip address.
    pub gossip_addr: String,
}

/// Roster change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A member appeared (or changed address).
    Joined {
        /// The member's name.
        name: String,
        /// The member's RPC address.
        rpc_addr: String,
    },
    /// A member announced departure.
    Left {
        /// The member's name.
        name: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    /// Full roster push.
    Sync { members: Vec<Member> },
    /// Explicit departure.
    Leave { name: String },
}

/// Gossip configuration.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// This node's name.
    pub node_name: String,
    /// UDP bind address (port 0 picks one).
    pub bind_addr: SocketAddr,
    /// Advertised RPC address.
    pub rpc_addr: String,
    /// Gossip addresses of members to join on startup.
    pub start_join_addrs: Vec<String>,
    /// Push interval.
    pub gossip_interval: Duration,
    /// Random peers contacted per round.
    pub fanout: usize,
}

impl MembershipConfig {
    /// A config with the default interval and fanout.
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr, rpc_addr: String) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            rpc_addr,
            start_join_addrs: Vec::new(),
            gossip_interval: Duration::from_millis(250),
            fanout: 3,
        }
    }

    /// Sets the seed members to contact on startup.
    pub fn with_start_join_addrs(mut self, addrs: Vec<String>) -> Self {
        self.start_join_addrs = addrs;
        self
    }

    /// Sets the push interval.
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }
}

/// The gossiping membership handle.
pub struct Membership {
    local: Member,
    roster: Arc<Mutex<HashMap<String, Member>>>,
    socket: Arc<UdpSocket>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Membership {
    /// Binds the gossip socket, contacts the seeds, and starts gossiping.
    ///
    /// Returns the handle plus the event stream.
    pub async fn new(
        config: MembershipConfig,
    ) -> ServerResult<(Self, mpsc::Receiver<MembershipEvent>)> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let gossip_addr = socket.local_addr()?;

        let local = Member {
            name: config.node_name.clone(),
            rpc_addr: config.rpc_addr.clone(),
            gossip_addr: gossip_addr.to_string(),
        };

        let mut initial = HashMap::new();
        initial.insert(local.name.clone(), local.clone());
        let roster = Arc::new(Mutex::new(initial));

        let (event_tx, event_rx) = mpsc::channel(64);

        // Announce ourselves to the seeds; their next rounds pull us into
        // the cluster roster.
        for seed in &config.start_join_addrs {
            let hello = GossipMessage::Sync {
                members: vec![local.clone()],
            };
            if let Err(e) = send_message(&socket, seed, &hello).await {
                warn!(%seed, "failed to contact seed: {e}");
            }
        }

        let task = GossipTask {
            local: local.clone(),
            roster: Arc::clone(&roster),
            socket: Arc::clone(&socket),
            event_tx,
            interval: config.gossip_interval,
            fanout: config.fanout.max(1),
        };
        let handle = tokio::spawn(task.run());

        info!(name = %local.name, %gossip_addr, "membership started");

        Ok((
            Self {
                local,
                roster,
                socket,
                handle: Mutex::new(Some(handle)),
            },
            event_rx,
        ))
    }

    /// This node's advertised member record.
    pub fn local(&self) -> &Member {
        &self.local
    }

    /// The gossip address actually bound.
    pub fn gossip_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Current roster, sorted by name.
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.roster.lock().values().cloned().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Announces departure to every known member and stops gossiping.
    pub async fn leave(&self) {
        let targets: Vec<Member> = {
            let roster = self.roster.lock();
            roster
                .values()
                .filter(|m| m.name != self.local.name)
                .cloned()
                .collect()
        };

        let goodbye = GossipMessage::Leave {
            name: self.local.name.clone(),
        };
        for member in targets {
            if let Err(e) = send_message(&self.socket, &member.gossip_addr, &goodbye).await {
                debug!(to = %member.name, "leave announcement failed: {e}");
            }
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        info!(name = %self.local.name, "left the cluster");
    }
}

async fn send_message(
    socket: &UdpSocket,
    target: &str,
    message: &GossipMessage,
) -> ServerResult<()> {
    let bytes = bincode::serialize(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    socket.send_to(&bytes, target).await?;
    Ok(())
}

struct GossipTask {
    local: Member,
    roster: Arc<Mutex<HashMap<String, Member>>>,
    socket: Arc<UdpSocket>,
    event_tx: mpsc::Sender<MembershipEvent>,
    interval: Duration,
    fanout: usize,
}

impl GossipTask {
    async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => {
                            warn!("gossip socket error: {e}");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => self.push_round().await,
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let message: GossipMessage = match bincode::deserialize(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, "undecodable gossip datagram: {e}");
                return;
            }
        };

        match message {
            GossipMessage::Sync { members } => {
                let mut learned = false;
                for member in members {
                    if member.name == self.local.name {
                        continue;
                    }
                    if self.merge(member).await {
                        learned = true;
                    }
                }

                // Answer anything new with our roster so a joiner
                // converges without waiting for the next round.
                if learned {
                    let reply = GossipMessage::Sync {
                        members: self.roster.lock().values().cloned().collect(),
                    };
                    if let Err(e) = send_message(&self.socket, &from.to_string(), &reply).await {
                        debug!(%from, "gossip reply failed: {e}");
                    }
                }
            }
            GossipMessage::Leave { name } => {
                let removed = self.roster.lock().remove(&name).is_some();
                if removed {
                    debug!(%name, "member left");
                    let _ = self.event_tx.send(MembershipEvent::Left { name }).await;
                }
            }
        }
    }

    /// Merges one member into the roster; true when it was news.
    async fn merge(&self, member: Member) -> bool {
        let event = {
            let mut roster = self.roster.lock();
            match roster.get(&member.name) {
                Some(existing) if *existing == member => None,
                _ => {
                    roster.insert(member.name.clone(), member.clone());
                    Some(MembershipEvent::Joined {
                        name: member.name.clone(),
                        rpc_addr: member.rpc_addr.clone(),
                    })
                }
            }
        };

        match event {
            Some(event) => {
                debug!(name = %member.name, "member joined");
                let _ = self.event_tx.send(event).await;
                true
            }
            None => false,
        }
    }

    async fn push_round(&self) {
        let (members, targets) = {
            let roster = self.roster.lock();
            let members: Vec<Member> = roster.values().cloned().collect();
            let peers: Vec<Member> = roster
                .values()
                .filter(|m| m.name != self.local.name)
                .cloned()
                .collect();
            let targets: Vec<Member> = peers
                .choose_multiple(&mut rand::thread_rng(), self.fanout)
                .cloned()
                .collect();
            (members, targets)
        };

        let message = GossipMessage::Sync { members };
        for target in targets {
            if let Err(e) = send_message(&self.socket, &target.gossip_addr, &message).await {
                debug!(to = %target.name, "gossip push failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(
        name: &str,
        seeds: Vec<String>,
    ) -> (Membership, mpsc::Receiver<MembershipEvent>) {
        let config = MembershipConfig::new(
            name,
            "127.0.0.1:0".parse().unwrap(),
            format!("{name}.cluster.local:8400"),
        )
        .with_start_join_addrs(seeds)
        .with_gossip_interval(Duration::from_millis(50));
        Membership::new(config).await.unwrap()
    }

    async fn expect_joined(rx: &mut mpsc::Receiver<MembershipEvent>, name: &str) {
        let deadline = Duration::from_secs(3);
        let result = tokio::time::timeout(deadline, async {
            while let Some(event) = rx.recv().await {
                if let MembershipEvent::Joined { name: joined, .. } = &event {
                    if joined == name {
                        return;
                    }
                }
            }
            panic!("event stream ended");
        })
        .await;
        result.unwrap_or_else(|_| panic!("never saw {name} join"));
    }

    #[tokio::test]
    async fn test_members_converge() {
        let (a, mut a_events) = start("a", vec![]).await;
        let seed = a.gossip_addr().unwrap().to_string();

        let (b, mut b_events) = start("b", vec![seed.clone()]).await;
        let (c, mut c_events) = start("c", vec![seed]).await;

        expect_joined(&mut a_events, "b").await;
        expect_joined(&mut a_events, "c").await;
        expect_joined(&mut b_events, "a").await;
        expect_joined(&mut b_events, "c").await;
        expect_joined(&mut c_events, "a").await;
        expect_joined(&mut c_events, "b").await;

        for m in [&a, &b, &c] {
            assert_eq!(m.members().len(), 3);
        }

        a.leave().await;
        b.leave().await;
        c.leave().await;
    }

    #[tokio::test]
    async fn test_leave_emits_event() {
        let (a, mut a_events) = start("a", vec![]).await;
        let seed = a.gossip_addr().unwrap().to_string();
        let (b, _b_events) = start("b", vec![seed]).await;

        expect_joined(&mut a_events, "b").await;
        b.leave().await;

        let deadline = Duration::from_secs(3);
        tokio::time::timeout(deadline, async {
            while let Some(event) = a_events.recv().await {
                if event == (MembershipEvent::Left { name: "b".to_string() }) {
                    return;
                }
            }
            panic!("event stream ended");
        })
        .await
        .expect("never saw b leave");

        a.leave().await;
    }
}
