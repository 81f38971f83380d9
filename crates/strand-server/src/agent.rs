//! The node composition root.
//!
//! An agent wires together the shared listener, the Raft transport, the
//! distributed log, the RPC server, and gossip membership, and tears them
//! down in the right order. Membership events flow to the distributed log
//! through a forwarder task; the log never holds a pointer back into the
//! agent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use strand_raft::transport::TcpTransport;

use crate::auth::Authorizer;
use crate::config::AgentConfig;
use crate::distributed::{node_id_for, DistributedLog};
use crate::error::ServerError;
use crate::membership::{Membership, MembershipConfig, MembershipEvent};
use crate::server::RpcServer;
use crate::stream_layer::{StreamLayer, RAFT_TAG};

/// A running strand node.
pub struct Agent {
    config: AgentConfig,
    rpc_addr: SocketAddr,
    distributed: Arc<DistributedLog>,
    membership: Arc<Membership>,
    accept_handle: JoinHandle<()>,
    serve_handle: JoinHandle<()>,
    event_handle: JoinHandle<()>,
    shutdown: AtomicBool,
}

impl Agent {
    /// Starts every component and returns the running node.
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let layer = StreamLayer::bind(config.rpc_addr()?)
            .await
            .context("binding rpc listener")?;
        let rpc_addr = layer.local_addr()?;

        let raft_transport = TcpTransport::new(node_id_for(&config.node_name), Some(RAFT_TAG));

        let distributed = Arc::new(
            DistributedLog::new(&config, rpc_addr.to_string(), Arc::clone(&raft_transport))
                .context("opening distributed log")?,
        );

        let (conn_tx, conn_rx) = mpsc::channel(64);
        let accept_handle = layer.serve(Arc::clone(&raft_transport), conn_tx);

        let authorizer = match &config.acl_policy_file {
            Some(path) => Authorizer::from_policy_file(path).context("loading acl policy")?,
            None => Authorizer::allow_all(),
        };
        let serve_handle =
            RpcServer::new(Arc::clone(&distributed), Arc::new(authorizer)).serve(conn_rx);

        let membership_config = MembershipConfig::new(
            config.node_name.clone(),
            config.gossip_addr()?,
            rpc_addr.to_string(),
        )
        .with_start_join_addrs(config.start_join_addrs.clone());
        let (membership, events) = Membership::new(membership_config)
            .await
            .context("starting membership")?;
        let membership = Arc::new(membership);

        let event_handle = tokio::spawn(forward_events(events, Arc::clone(&distributed)));

        info!(
            name = %config.node_name,
            %rpc_addr,
            bootstrap = config.raft.bootstrap,
            "agent started"
        );

        Ok(Self {
            config,
            rpc_addr,
            distributed,
            membership,
            accept_handle,
            serve_handle,
            event_handle,
            shutdown: AtomicBool::new(false),
        })
    }

    /// The node's name.
    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    /// The bound RPC address.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// The bound gossip address (for other nodes' `start_join_addrs`).
    pub fn gossip_addr(&self) -> Result<SocketAddr> {
        Ok(self.membership.gossip_addr()?)
    }

    /// The replicated log.
    pub fn distributed(&self) -> &Arc<DistributedLog> {
        &self.distributed
    }

    /// Gossip membership.
    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// Stops the node: announces departure, stops serving, then shuts the
    /// replicated log down. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.config.node_name, "agent shutting down");

        self.membership.leave().await;
        self.event_handle.abort();
        self.accept_handle.abort();
        self.serve_handle.abort();
        self.distributed.shutdown().await;
    }
}

/// Forwards membership events into the distributed log.
///
/// Only the leader's join/leave proposals take effect; `NotLeader` from a
/// follower is the expected quiet case.
async fn forward_events(
    mut events: mpsc::Receiver<MembershipEvent>,
    distributed: Arc<DistributedLog>,
) {
    while let Some(event) = events.recv().await {
        match event {
            MembershipEvent::Joined { name, rpc_addr } => {
                match distributed.join(&name, &rpc_addr).await {
                    Ok(()) => info!(%name, %rpc_addr, "member joined the configuration"),
                    Err(ServerError::NotLeader) | Err(ServerError::NoLeader) => {
                        debug!(%name, "observed join as non-leader")
                    }
                    Err(e) => warn!(%name, "join failed: {e}"),
                }
            }
            MembershipEvent::Left { name } => match distributed.leave(&name).await {
                Ok(()) => info!(%name, "member left the configuration"),
                Err(ServerError::NotLeader) | Err(ServerError::NoLeader) => {
                    debug!(%name, "observed leave as non-leader")
                }
                Err(e) => warn!(%name, "leave failed: {e}"),
            },
        }
    }
}
