//! The client RPC server.
//!
//! Connections arrive from the stream layer with their first byte already
//! read; the server seeds its frame buffer with it and then loops
//! request/response. Pipelined `Produce` frames on one connection are the
//! produce-stream path: responses come back 1:1, in order. `ConsumeStream`
//! flips the connection into server-push mode until the client goes away.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use strand_api::{
    frame, request, response, ConsumeRequest, ConsumeResponse, GetServersResponse,
    ProduceRequest, ProduceResponse, Request, Response,
};
use strand_log::LogError;

use crate::auth::{Authorizer, ACTION_CONSUME, ACTION_PRODUCE, OBJECT_WILDCARD};
use crate::distributed::DistributedLog;
use crate::error::ServerError;

/// The RPC service over the distributed log.
pub struct RpcServer {
    distributed: Arc<DistributedLog>,
    authorizer: Arc<Authorizer>,
}

fn error_response(e: &ServerError) -> Response {
    Response::error(e.code(), e.detail())
}

impl RpcServer {
    /// Creates the server.
    pub fn new(distributed: Arc<DistributedLog>, authorizer: Arc<Authorizer>) -> Arc<Self> {
        Arc::new(Self {
            distributed,
            authorizer,
        })
    }

    /// Accepts connections from the stream layer until the channel closes.
    pub fn serve(self: Arc<Self>, mut conn_rx: mpsc::Receiver<(TcpStream, u8)>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((stream, first_byte)) = conn_rx.recv().await {
                let server = Arc::clone(&self);
                tokio::spawn(async move {
                    server.handle_connection(stream, first_byte).await;
                });
            }
            info!("rpc server stopped");
        })
    }

    async fn handle_connection(&self, stream: TcpStream, first_byte: u8) {
        let (mut reader, mut writer) = stream.into_split();

        let mut buf = BytesMut::with_capacity(4096);
        buf.put_u8(first_byte);

        loop {
            let request: Request = match frame::read_frame(&mut reader, &mut buf).await {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    debug!("client framing error: {e}");
                    return;
                }
            };

            let identity = request.identity;
            let response = match request.body {
                Some(request::Body::Produce(produce)) => self.produce(&identity, produce).await,
                Some(request::Body::Consume(consume)) => self.consume(&identity, consume),
                Some(request::Body::GetServers(_)) => self.get_servers().await,
                Some(request::Body::ConsumeStream(consume)) => {
                    // Streaming consumes the rest of the connection.
                    self.consume_stream(&identity, consume, &mut reader, &mut writer)
                        .await;
                    return;
                }
                None => error_response(&ServerError::Raft(strand_raft::RaftError::Internal(
                    "request without body".to_string(),
                ))),
            };

            if frame::write_frame(&mut writer, &response).await.is_err() {
                return;
            }
        }
    }

    async fn produce(&self, identity: &str, request: ProduceRequest) -> Response {
        if let Err(e) = self
            .authorizer
            .authorize(identity, OBJECT_WILDCARD, ACTION_PRODUCE)
        {
            return error_response(&e);
        }

        let Some(record) = request.record else {
            return error_response(&ServerError::Raft(strand_raft::RaftError::Internal(
                "produce without record".to_string(),
            )));
        };

        match self.distributed.append(record.value).await {
            Ok(offset) => Response {
                body: Some(response::Body::Produce(ProduceResponse { offset })),
            },
            Err(e) => error_response(&e),
        }
    }

    fn consume(&self, identity: &str, request: ConsumeRequest) -> Response {
        if let Err(e) = self
            .authorizer
            .authorize(identity, OBJECT_WILDCARD, ACTION_CONSUME)
        {
            return error_response(&e);
        }

        match self.distributed.read(request.offset) {
            Ok(record) => Response {
                body: Some(response::Body::Consume(ConsumeResponse {
                    record: Some(record),
                })),
            },
            Err(e) => error_response(&e),
        }
    }

    async fn get_servers(&self) -> Response {
        match self.distributed.get_servers().await {
            Ok(servers) => Response {
                body: Some(response::Body::Servers(GetServersResponse { servers })),
            },
            Err(e) => error_response(&e),
        }
    }

    /// Streams records from `request.offset`; once caught up, waits for
    /// new commits and keeps going until the client disconnects.
    async fn consume_stream(
        &self,
        identity: &str,
        request: ConsumeRequest,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) {
        if let Err(e) = self
            .authorizer
            .authorize(identity, OBJECT_WILDCARD, ACTION_CONSUME)
        {
            let _ = frame::write_frame(writer, &error_response(&e)).await;
            return;
        }

        let mut offset = request.offset;
        let mut applied = self.distributed.applied_watch();
        // Clients send nothing more on this connection; reads only detect
        // hangup.
        let mut probe = [0u8; 64];

        loop {
            match self.distributed.read(offset) {
                Ok(record) => {
                    let response = Response {
                        body: Some(response::Body::Consume(ConsumeResponse {
                            record: Some(record),
                        })),
                    };
                    if frame::write_frame(writer, &response).await.is_err() {
                        return;
                    }
                    offset += 1;
                }
                Err(ServerError::Log(LogError::OffsetOutOfRange { .. })) => {
                    // Caught up. Re-check after the watch moves so a commit
                    // between the failed read and here is not missed.
                    if *applied.borrow_and_update() > offset {
                        continue;
                    }
                    tokio::select! {
                        changed = applied.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        read = reader.read(&mut probe) => {
                            match read {
                                Ok(0) | Err(_) => return,
                                Ok(_) => {}
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = frame::write_frame(writer, &error_response(&e)).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::distributed::node_id_for;
    use crate::stream_layer::StreamLayer;
    use bytes::Bytes;
    use std::io::Write as _;
    use std::time::Duration;
    use strand_api::{Code, Record};
    use strand_raft::transport::MemoryNetwork;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    struct TestServer {
        addr: std::net::SocketAddr,
        distributed: Arc<DistributedLog>,
        accept: JoinHandle<()>,
        serve: JoinHandle<()>,
    }

    async fn start_server(authorizer: Authorizer) -> (TestServer, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = AgentConfig::new(tmp.path().join("data"))
            .with_node_name("0")
            .with_bootstrap(true);
        config.raft.tick_interval_ms = 5;
        config.raft.min_election_ticks = 6;
        config.raft.max_election_ticks = 12;

        let network = MemoryNetwork::shared();
        let transport = network.create_transport(node_id_for("0"));
        let distributed = Arc::new(
            DistributedLog::new(&config, "127.0.0.1:0".to_string(), transport).unwrap(),
        );
        distributed
            .wait_for_leader(Duration::from_secs(5))
            .await
            .unwrap();

        let layer = StreamLayer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = layer.local_addr().unwrap();

        let raft = strand_raft::transport::TcpTransport::new(node_id_for("0"), Some(0x01));
        let (conn_tx, conn_rx) = mpsc::channel(16);
        let accept = layer.serve(raft, conn_tx);

        let server = RpcServer::new(Arc::clone(&distributed), Arc::new(authorizer));
        let serve = server.serve(conn_rx);

        (
            TestServer {
                addr,
                distributed,
                accept,
                serve,
            },
            tmp,
        )
    }

    async fn call(stream: &mut TcpStream, buf: &mut BytesMut, request: &Request) -> Response {
        let encoded = frame::encode(request).unwrap();
        stream.write_all(&encoded).await.unwrap();
        frame::read_frame(stream, buf).await.unwrap().unwrap()
    }

    fn produce_request(identity: &str, value: &str) -> Request {
        Request {
            identity: identity.to_string(),
            body: Some(request::Body::Produce(ProduceRequest {
                record: Some(Record {
                    value: Bytes::from(value.to_string()),
                    offset: 0,
                }),
            })),
        }
    }

    fn consume_request(identity: &str, offset: u64) -> Request {
        Request {
            identity: identity.to_string(),
            body: Some(request::Body::Consume(ConsumeRequest { offset })),
        }
    }

    async fn shutdown(server: TestServer) {
        server.accept.abort();
        server.serve.abort();
        server.distributed.shutdown().await;
    }

    #[tokio::test]
    async fn test_produce_consume_roundtrip() {
        let (server, _tmp) = start_server(Authorizer::allow_all()).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let mut buf = BytesMut::new();

        let response = call(&mut stream, &mut buf, &produce_request("root", "hello world")).await;
        let offset = match response.body {
            Some(response::Body::Produce(p)) => p.offset,
            other => panic!("unexpected response: {other:?}"),
        };
        assert_eq!(offset, 0);

        let response = call(&mut stream, &mut buf, &consume_request("root", 0)).await;
        match response.body {
            Some(response::Body::Consume(c)) => {
                assert_eq!(c.record.unwrap().value.as_ref(), b"hello world");
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Past-the-end reads map to NotFound with the offset in the detail.
        let response = call(&mut stream, &mut buf, &consume_request("root", 1)).await;
        match response.body {
            Some(response::Body::Error(e)) => {
                assert_eq!(e.code(), Code::NotFound);
                assert_eq!(
                    e.message,
                    "The requested offset is outside the log's range: 1"
                );
            }
            other => panic!("unexpected response: {other:?}"),
        }

        shutdown(server).await;
    }

    #[tokio::test]
    async fn test_pipelined_produce_stream() {
        let (server, _tmp) = start_server(Authorizer::allow_all()).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let mut buf = BytesMut::new();

        for value in ["first", "second"] {
            let encoded = frame::encode(&produce_request("root", value)).unwrap();
            stream.write_all(&encoded).await.unwrap();
        }

        // Responses come back 1:1, in order.
        for want in [0u64, 1] {
            let response: Response = frame::read_frame(&mut stream, &mut buf)
                .await
                .unwrap()
                .unwrap();
            match response.body {
                Some(response::Body::Produce(p)) => assert_eq!(p.offset, want),
                other => panic!("unexpected response: {other:?}"),
            }
        }

        shutdown(server).await;
    }

    #[tokio::test]
    async fn test_consume_stream_waits_for_new_records() {
        let (server, _tmp) = start_server(Authorizer::allow_all()).await;

        server
            .distributed
            .append(Bytes::from_static(b"first"))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let mut buf = BytesMut::new();

        let open = Request {
            identity: "root".to_string(),
            body: Some(request::Body::ConsumeStream(ConsumeRequest { offset: 0 })),
        };
        stream
            .write_all(&frame::encode(&open).unwrap())
            .await
            .unwrap();

        let response: Response = frame::read_frame(&mut stream, &mut buf)
            .await
            .unwrap()
            .unwrap();
        match response.body {
            Some(response::Body::Consume(c)) => {
                assert_eq!(c.record.unwrap().value.as_ref(), b"first");
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // The stream picks up records appended after it caught up.
        server
            .distributed
            .append(Bytes::from_static(b"second"))
            .await
            .unwrap();

        let response: Response = tokio::time::timeout(
            Duration::from_secs(3),
            frame::read_frame(&mut stream, &mut buf),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        match response.body {
            Some(response::Body::Consume(c)) => {
                assert_eq!(c.record.unwrap().value.as_ref(), b"second");
            }
            other => panic!("unexpected response: {other:?}"),
        }

        shutdown(server).await;
    }

    #[tokio::test]
    async fn test_acl_denial() {
        let mut policy = tempfile::NamedTempFile::new().unwrap();
        writeln!(policy, "p, root, *, produce").unwrap();
        writeln!(policy, "p, root, *, consume").unwrap();
        let authorizer = Authorizer::from_policy_file(policy.path()).unwrap();

        let (server, _tmp) = start_server(authorizer).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let mut buf = BytesMut::new();

        let response = call(&mut stream, &mut buf, &produce_request("nobody", "x")).await;
        match response.body {
            Some(response::Body::Error(e)) => {
                assert_eq!(e.code(), Code::PermissionDenied);
                assert_eq!(e.message, "nobody not permitted to produce to *");
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let response = call(&mut stream, &mut buf, &consume_request("nobody", 0)).await;
        match response.body {
            Some(response::Body::Error(e)) => {
                assert_eq!(e.code(), Code::PermissionDenied);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Root still goes through.
        let response = call(&mut stream, &mut buf, &produce_request("root", "ok")).await;
        assert!(matches!(
            response.body,
            Some(response::Body::Produce(ProduceResponse { offset: 0 }))
        ));

        shutdown(server).await;
    }
}
