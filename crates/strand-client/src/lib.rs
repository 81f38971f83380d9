//! # strand-client
//!
//! Client for the strand log service. The [`resolver::Resolver`] turns a
//! seed address into the full server list (with leadership flags), the
//! [`picker::Picker`] routes each call (writes to the leader, reads
//! round-robin across followers) and [`client::Client`] ties them
//! together with cached connections and re-resolve-on-redirect retries.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod picker;
pub mod resolver;

pub use client::{Client, ClientConfig, ConsumeStream};
pub use error::{ClientError, ClientResult};
pub use picker::Picker;
pub use resolver::Resolver;

/// Re-exports of the wire types callers see.
pub use strand_api::{Code, Record, Server};
