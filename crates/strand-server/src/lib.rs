//! # strand-server
//!
//! One node of the strand log service. The pieces, bottom up:
//!
//! - [`fsm::LogFsm`] applies committed Raft commands to the local
//!   segmented log and streams it as a snapshot.
//! - [`raft_log::RaftLogStore`] backs Raft's own log with a second
//!   segmented log.
//! - [`stream_layer::StreamLayer`] shares one TCP listener between Raft
//!   traffic and client RPC, told apart by the first byte.
//! - [`distributed::DistributedLog`] wraps the Raft node in an async
//!   driver task and exposes the replicated append/read surface.
//! - [`membership::Membership`] gossips the cluster roster.
//! - [`server::RpcServer`] serves the client protocol with ACL checks.
//! - [`agent::Agent`] composes all of the above into a running node.

#![warn(clippy::all)]

pub mod agent;
pub mod auth;
pub mod config;
pub mod distributed;
pub mod error;
pub mod fsm;
pub mod membership;
pub mod raft_log;
pub mod server;
pub mod stable;
pub mod stream_layer;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{ServerError, ServerResult};
