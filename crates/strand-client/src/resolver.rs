//! Server discovery.
//!
//! The resolver dials a seed node, asks it for the cluster's servers (with
//! leadership flags), and remembers the answer. Later rounds may use any
//! previously seen server as a seed, so the client survives the original
//! seed going away.

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::debug;

use strand_api::{frame, request, response, GetServersRequest, Request, Response, Server};

use crate::error::{ClientError, ClientResult};

/// Resolves a set of seed addresses into the live server list.
#[derive(Debug)]
pub struct Resolver {
    seed_addrs: Vec<String>,
    identity: String,
    servers: RwLock<Vec<Server>>,
}

impl Resolver {
    /// Creates a resolver over the given seeds.
    pub fn new(seed_addrs: Vec<String>, identity: String) -> Self {
        Self {
            seed_addrs,
            identity,
            servers: RwLock::new(Vec::new()),
        }
    }

    /// The most recently resolved server list.
    pub fn servers(&self) -> Vec<Server> {
        self.servers.read().clone()
    }

    /// Asks the cluster for its current servers, trying each seed (and
    /// each previously resolved server) until one answers.
    pub async fn resolve(&self) -> ClientResult<Vec<Server>> {
        let mut candidates = self.seed_addrs.clone();
        for server in self.servers.read().iter() {
            if !candidates.contains(&server.rpc_addr) {
                candidates.push(server.rpc_addr.clone());
            }
        }

        let mut last_error = None;
        for addr in &candidates {
            match self.get_servers_from(addr).await {
                Ok(servers) if !servers.is_empty() => {
                    *self.servers.write() = servers.clone();
                    return Ok(servers);
                }
                Ok(_) => {
                    debug!(%addr, "seed returned an empty server list");
                }
                Err(e) => {
                    debug!(%addr, "seed unreachable: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(ClientError::NoServerAvailable("resolve")))
    }

    async fn get_servers_from(&self, addr: &str) -> ClientResult<Vec<Server>> {
        let mut stream = TcpStream::connect(addr).await?;

        let request = Request {
            identity: self.identity.clone(),
            body: Some(request::Body::GetServers(GetServersRequest {})),
        };
        frame::write_frame(&mut stream, &request).await?;

        let mut buf = BytesMut::new();
        let response: Response = frame::read_frame(&mut stream, &mut buf)
            .await?
            .ok_or(ClientError::UnexpectedResponse)?;

        match response.body {
            Some(response::Body::Servers(servers)) => Ok(servers.servers),
            Some(response::Body::Error(e)) => Err(ClientError::Rpc {
                code: e.code(),
                message: e.message,
            }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serves one scripted `GetServers` answer per connection.
    async fn stub_server(servers: Vec<Server>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let servers = servers.clone();
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    let Ok(Some(_request)) =
                        frame::read_frame::<_, Request>(&mut stream, &mut buf).await
                    else {
                        return;
                    };

                    let response = Response {
                        body: Some(response::Body::Servers(
                            strand_api::GetServersResponse { servers },
                        )),
                    };
                    let _ = frame::write_frame(&mut stream, &response).await;
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_resolves_from_seed() {
        let servers = vec![
            Server {
                id: "0".to_string(),
                rpc_addr: "10.0.0.1:8400".to_string(),
                is_leader: true,
            },
            Server {
                id: "1".to_string(),
                rpc_addr: "10.0.0.2:8400".to_string(),
                is_leader: false,
            },
        ];
        let addr = stub_server(servers.clone()).await;

        let resolver = Resolver::new(vec![addr.to_string()], "root".to_string());
        let resolved = resolver.resolve().await.unwrap();

        assert_eq!(resolved, servers);
        assert_eq!(resolver.servers(), servers);
    }

    #[tokio::test]
    async fn test_dead_seed_then_live_seed() {
        let servers = vec![Server {
            id: "0".to_string(),
            rpc_addr: "10.0.0.1:8400".to_string(),
            is_leader: true,
        }];

        // A bound-then-dropped listener gives a refused port.
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let live = stub_server(servers.clone()).await;

        let resolver = Resolver::new(
            vec![dead.to_string(), live.to_string()],
            "root".to_string(),
        );
        let resolved = resolver.resolve().await.unwrap();
        assert_eq!(resolved, servers);
    }

    #[tokio::test]
    async fn test_all_seeds_dead() {
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let resolver = Resolver::new(vec![dead.to_string()], "root".to_string());
        assert!(resolver.resolve().await.is_err());
    }
}
