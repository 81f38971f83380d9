//! The client: resolved routing, cached connections, retries.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use strand_api::{
    frame, request, response, ConsumeRequest, GetServersRequest, ProduceRequest, Record, Request,
    Response, Server,
};

use crate::error::{ClientError, ClientResult};
use crate::picker::Picker;
use crate::resolver::Resolver;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity presented for authorization.
    pub identity: String,
    /// Dial timeout per connection attempt.
    pub connect_timeout: Duration,
    /// Timeout per unary request.
    pub request_timeout: Duration,
    /// Background re-resolve interval.
    pub refresh_interval: Duration,
    /// Attempts per call before giving up.
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity: "root".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(3),
            max_retries: 3,
        }
    }
}

impl ClientConfig {
    /// Creates the default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity presented for authorization.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the background re-resolve interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    async fn open(addr: &str, timeout: Duration) -> ClientResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        })
    }

    async fn call(&mut self, request: &Request) -> ClientResult<Response> {
        frame::write_frame(&mut self.stream, request).await?;
        frame::read_frame(&mut self.stream, &mut self.buf)
            .await?
            .ok_or(ClientError::UnexpectedResponse)
    }

    async fn send(&mut self, request: &Request) -> ClientResult<()> {
        frame::write_frame(&mut self.stream, request).await?;
        Ok(())
    }

    async fn recv(&mut self) -> ClientResult<Response> {
        frame::read_frame(&mut self.stream, &mut self.buf)
            .await?
            .ok_or(ClientError::UnexpectedResponse)
    }
}

/// A connected, resolving client.
///
/// Writes route to the leader; reads round-robin across followers. A
/// leadership redirect (`NOT_LEADER` / `NO_LEADER`) or a broken connection
/// triggers a re-resolve and a retry, up to the configured budget.
pub struct Client {
    config: ClientConfig,
    resolver: Arc<Resolver>,
    picker: Arc<Picker>,
    connections: tokio::sync::Mutex<HashMap<String, Connection>>,
    refresher: JoinHandle<()>,
}

impl Client {
    /// Resolves the cluster through `seed_addrs` and starts the background
    /// refresher.
    pub async fn new(seed_addrs: Vec<String>, config: ClientConfig) -> ClientResult<Self> {
        let resolver = Arc::new(Resolver::new(seed_addrs, config.identity.clone()));
        let picker = Arc::new(Picker::new());

        let servers = resolver.resolve().await?;
        picker.update(&servers);

        let refresher = {
            let resolver = Arc::clone(&resolver);
            let picker = Arc::clone(&picker);
            let interval = config.refresh_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match resolver.resolve().await {
                        Ok(servers) => picker.update(&servers),
                        Err(e) => debug!("background resolve failed: {e}"),
                    }
                }
            })
        };

        Ok(Self {
            config,
            resolver,
            picker,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            refresher,
        })
    }

    /// Re-resolves the server list now.
    pub async fn refresh(&self) -> ClientResult<()> {
        let servers = self.resolver.resolve().await?;
        self.picker.update(&servers);
        Ok(())
    }

    /// Appends a record; returns its offset.
    pub async fn produce(&self, value: Bytes) -> ClientResult<u64> {
        let body = request::Body::Produce(ProduceRequest {
            record: Some(Record { value, offset: 0 }),
        });
        match self.request(true, body).await? {
            response::Body::Produce(produce) => Ok(produce.offset),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Reads the record at `offset`.
    pub async fn consume(&self, offset: u64) -> ClientResult<Record> {
        let body = request::Body::Consume(ConsumeRequest { offset });
        match self.request(false, body).await? {
            response::Body::Consume(consume) => {
                consume.record.ok_or(ClientError::UnexpectedResponse)
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// The cluster's servers with leadership flags.
    pub async fn get_servers(&self) -> ClientResult<Vec<Server>> {
        let body = request::Body::GetServers(GetServersRequest {});
        match self.request(false, body).await? {
            response::Body::Servers(servers) => Ok(servers.servers),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Appends a batch over one leader connection, pipelined; responses
    /// pair with requests 1:1 in order.
    pub async fn produce_stream(&self, values: Vec<Bytes>) -> ClientResult<Vec<u64>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }

        let addr = self.pick_with_refresh(true).await?;
        let mut conn = Connection::open(&addr, self.config.connect_timeout).await?;

        let count = values.len();
        for value in values {
            let request = Request {
                identity: self.config.identity.clone(),
                body: Some(request::Body::Produce(ProduceRequest {
                    record: Some(Record { value, offset: 0 }),
                })),
            };
            conn.send(&request).await?;
        }

        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            let response =
                tokio::time::timeout(self.config.request_timeout, conn.recv())
                    .await
                    .map_err(|_| ClientError::Timeout)??;
            match response.body {
                Some(response::Body::Produce(produce)) => offsets.push(produce.offset),
                Some(response::Body::Error(e)) => {
                    return Err(ClientError::Rpc {
                        code: e.code(),
                        message: e.message,
                    })
                }
                _ => return Err(ClientError::UnexpectedResponse),
            }
        }

        Ok(offsets)
    }

    /// Opens a server-push stream starting at `offset`.
    ///
    /// The server sends every existing record from `offset`, then keeps
    /// the stream open and pushes new records as they commit, until the
    /// handle is dropped.
    pub async fn consume_stream(&self, offset: u64) -> ClientResult<ConsumeStream> {
        let addr = self.pick_with_refresh(false).await?;
        let mut conn = Connection::open(&addr, self.config.connect_timeout).await?;

        let request = Request {
            identity: self.config.identity.clone(),
            body: Some(request::Body::ConsumeStream(ConsumeRequest { offset })),
        };
        conn.send(&request).await?;

        Ok(ConsumeStream { conn })
    }

    async fn pick_with_refresh(&self, mutating: bool) -> ClientResult<String> {
        match self.picker.pick(mutating) {
            Ok(addr) => Ok(addr),
            Err(_) => {
                self.refresh().await?;
                self.picker.pick(mutating)
            }
        }
    }

    async fn request(
        &self,
        mutating: bool,
        body: request::Body,
    ) -> ClientResult<response::Body> {
        let mut last_error: Option<ClientError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }

            let addr = match self.picker.pick(mutating) {
                Ok(addr) => addr,
                Err(e) => {
                    last_error = Some(e);
                    let _ = self.refresh().await;
                    continue;
                }
            };

            let request = Request {
                identity: self.config.identity.clone(),
                body: Some(body.clone()),
            };

            match self.call_on(&addr, &request).await {
                Ok(Response {
                    body: Some(response::Body::Error(e)),
                }) => {
                    let error = ClientError::Rpc {
                        code: e.code(),
                        message: e.message,
                    };
                    if error.is_redirect() {
                        debug!(%addr, "leadership redirect, re-resolving");
                        last_error = Some(error);
                        let _ = self.refresh().await;
                        continue;
                    }
                    return Err(error);
                }
                Ok(Response { body: Some(body) }) => return Ok(body),
                Ok(Response { body: None }) => return Err(ClientError::UnexpectedResponse),
                Err(e) => match e {
                    ClientError::Io(_) | ClientError::Frame(_) | ClientError::Timeout => {
                        debug!(%addr, "transport failure, re-resolving: {e}");
                        last_error = Some(e);
                        let _ = self.refresh().await;
                    }
                    other => return Err(other),
                },
            }
        }

        Err(last_error
            .unwrap_or_else(|| ClientError::RetriesExhausted("no usable server".to_string())))
    }

    async fn call_on(&self, addr: &str, request: &Request) -> ClientResult<Response> {
        let mut connections = self.connections.lock().await;

        let connection = match connections.entry(addr.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(
                Connection::open(addr, self.config.connect_timeout).await?,
            ),
        };

        let result =
            tokio::time::timeout(self.config.request_timeout, connection.call(request)).await;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                connections.remove(addr);
                Err(e)
            }
            Err(_) => {
                connections.remove(addr);
                Err(ClientError::Timeout)
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

/// A live server-push consume stream.
pub struct ConsumeStream {
    conn: Connection,
}

impl ConsumeStream {
    /// Awaits the next record.
    pub async fn next(&mut self) -> ClientResult<Record> {
        let response = self.conn.recv().await?;
        match response.body {
            Some(response::Body::Consume(consume)) => {
                consume.record.ok_or(ClientError::UnexpectedResponse)
            }
            Some(response::Body::Error(e)) => Err(ClientError::Rpc {
                code: e.code(),
                message: e.message,
            }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
