//! One listener, two protocols.
//!
//! The service exposes a single TCP address: Raft peers and clients both
//! dial it, which keeps discovery down to one advertised `rpc_addr` per
//! node. The first byte of each inbound connection routes it: `0x01` marks
//! a Raft connection (the byte is consumed and the stream handed to the
//! Raft transport); anything else is the first byte of the client framing
//! and travels onward with the stream, unconsumed from the client
//! protocol's point of view.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use strand_raft::transport::TcpTransport;

use crate::error::ServerResult;

/// First-byte tag marking a Raft connection. Client frames start with a
/// magic whose first byte differs.
pub const RAFT_TAG: u8 = 0x01;

/// The shared listener and its demultiplexing accept loop.
pub struct StreamLayer {
    listener: TcpListener,
}

impl StreamLayer {
    /// Binds the shared listener.
    pub async fn bind(addr: SocketAddr) -> ServerResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop.
    ///
    /// Raft connections go to `raft`; anything else is sent to `app_tx`
    /// along with the already-read first byte, which the RPC server
    /// prepends to its read buffer.
    pub fn serve(
        self,
        raft: Arc<TcpTransport>,
        app_tx: mpsc::Sender<(TcpStream, u8)>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match self.listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };

                let raft = Arc::clone(&raft);
                let app_tx = app_tx.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    let mut tag = [0u8; 1];
                    match stream.read_exact(&mut tag).await {
                        Ok(_) if tag[0] == RAFT_TAG => {
                            debug!(%peer, "raft connection accepted");
                            TcpTransport::handle_inbound(&raft, stream);
                        }
                        Ok(_) => {
                            debug!(%peer, "client connection accepted");
                            let _ = app_tx.send((stream, tag[0])).await;
                        }
                        Err(e) => {
                            debug!(%peer, "connection closed before tag byte: {e}");
                        }
                    }
                });
            }
        })
    }
}
