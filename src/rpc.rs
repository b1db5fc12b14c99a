//! # RPC Layer
//!
//! QUIC-based request/response plumbing for the overlay. One RPC is one
//! bidirectional stream carrying a length-prefixed bincode [`RpcRequest`]
//! and its [`RpcResponse`].
//!
//! ## Client
//!
//! [`RpcClient`] is a cheap-to-clone handle; a private actor owns the
//! connection cache (`network address → connection`). The cache is populated
//! on first use and deliberately never evicted or revalidated while the node
//! runs — a dead channel surfaces as a failed call, and the peer's
//! contribution is dropped by the caller. `quit` closes every cached
//! connection at teardown.
//!
//! ## Server
//!
//! [`handle_connection`] accepts streams for a connection's lifetime and
//! dispatches each request against the [`Node`] aggregate. Admission is
//! enforced inside the node handlers; handler errors travel back as
//! [`RpcResponse::Error`] with their kind.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, Incoming};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::crypto;
use crate::dht::{PeerInfo, ALPHA};
use crate::identity::NodeCertificate;
use crate::messages::{
    self, ErrorKind, IndexReply, ItemSummary, RpcRequest, RpcResponse, StoreItemRequest,
    MAX_WIRE_SIZE,
};
use crate::node::Node;
use crate::protocols::PeerRpc;

/// Deadline for one overlay-internal call (find/store/ping between nodes).
const OUTBOUND_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for client-facing calls (`PostUrl`, `GetIndex`), which crawl and
/// fan out on the server side before answering.
const CLIENT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the server waits for a request to arrive on an accepted stream.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-side bound on processing one request.
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Command channel capacity for the connection-cache actor.
const CLIENT_COMMAND_CHANNEL_SIZE: usize = 256;

enum ClientCommand {
    /// Return the cached channel for a peer, dialing on first use.
    GetOrConnect {
        network_address: String,
        reply: oneshot::Sender<Result<Connection>>,
    },
    /// Close all cached channels and stop.
    Quit,
}

/// Owns the connection cache. Running the cache in an actor makes
/// "first writer wins" trivial: all inserts happen on one task.
struct ClientActor {
    endpoint: Endpoint,
    client_config: ClientConfig,
    connections: HashMap<String, Connection>,
}

impl ClientActor {
    fn new(endpoint: Endpoint, client_config: ClientConfig) -> Self {
        Self {
            endpoint,
            client_config,
            connections: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ClientCommand>) {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                ClientCommand::GetOrConnect {
                    network_address,
                    reply,
                } => {
                    let result = self.get_or_connect(&network_address).await;
                    let _ = reply.send(result);
                }
                ClientCommand::Quit => break,
            }
        }

        for (peer, connection) in self.connections.drain() {
            connection.close(0u32.into(), b"shutdown");
            trace!(peer = %peer, "closed cached connection");
        }
        debug!("connection cache drained");
    }

    async fn get_or_connect(&mut self, network_address: &str) -> Result<Connection> {
        if let Some(connection) = self.connections.get(network_address) {
            return Ok(connection.clone());
        }

        let addr: SocketAddr = network_address
            .parse()
            .with_context(|| format!("invalid network address: {network_address}"))?;
        let connection = self
            .endpoint
            .connect_with(
                self.client_config.clone(),
                addr,
                crypto::TLS_SERVER_NAME,
            )
            .with_context(|| format!("failed to initiate connection to {addr}"))?
            .await
            .with_context(|| format!("failed to establish connection to {addr}"))?;

        self.connections
            .insert(network_address.to_string(), connection.clone());
        debug!(peer = %network_address, "cached new connection");
        Ok(connection)
    }
}

/// Handle for outbound RPCs. Clones share one connection cache.
#[derive(Clone)]
pub struct RpcClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl RpcClient {
    pub fn new(endpoint: Endpoint, client_config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CLIENT_COMMAND_CHANNEL_SIZE);
        let actor = ClientActor::new(endpoint, client_config);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Shut the cache actor down, closing every cached connection.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Quit).await;
    }

    async fn get_or_connect(&self, network_address: &str) -> Result<Connection> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::GetOrConnect {
                network_address: network_address.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow!("connection cache closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("connection cache closed"))?
    }

    async fn call(
        &self,
        to: &str,
        request: RpcRequest,
        deadline: Duration,
    ) -> Result<RpcResponse> {
        let connection = self.get_or_connect(to).await?;

        tokio::time::timeout(deadline, async {
            let (mut send, mut recv) = connection
                .open_bi()
                .await
                .context("failed to open bidirectional stream")?;

            let request_bytes =
                messages::serialize(&request).context("failed to serialize request")?;
            send.write_all(&(request_bytes.len() as u32).to_be_bytes())
                .await?;
            send.write_all(&request_bytes).await?;
            send.finish()?;

            let mut len_buf = [0u8; 4];
            recv.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_WIRE_SIZE {
                warn!(peer = %to, size = len, max = MAX_WIRE_SIZE, "peer sent oversized response");
                bail!("response too large: {len} bytes (max {MAX_WIRE_SIZE})");
            }

            let mut response_bytes = vec![0u8; len];
            recv.read_exact(&mut response_bytes).await?;

            let response: RpcResponse = messages::deserialize_bounded(&response_bytes)
                .context("failed to deserialize response")?;
            Ok(response)
        })
        .await
        .context("RPC timed out")?
    }

    /// Liveness check; no certificates exchanged.
    pub async fn ping(&self, to: &str) -> Result<String> {
        let request = RpcRequest::Ping {
            message: "ping".to_string(),
        };
        match self.call(to, request, OUTBOUND_CALL_TIMEOUT).await? {
            RpcResponse::Pong { message } => Ok(message),
            other => bail!("unexpected response to Ping: {other:?}"),
        }
    }

    /// Ask a node to relay a ping to `peer` and vouch for its certificate.
    pub async fn ping_to(&self, to: &str, peer: PeerInfo) -> Result<String> {
        match self
            .call(to, RpcRequest::PingTo { peer }, CLIENT_CALL_TIMEOUT)
            .await?
        {
            RpcResponse::Pong { message } => Ok(message),
            RpcResponse::Error { kind, message } => bail!("{kind:?}: {message}"),
            other => bail!("unexpected response to PingTo: {other:?}"),
        }
    }

    /// Client-facing publish: crawl and index one URL at the receiving node.
    pub async fn post_url(&self, to: &str, url: &str) -> Result<String> {
        let request = RpcRequest::PostUrl {
            url: url.to_string(),
        };
        match self.call(to, request, CLIENT_CALL_TIMEOUT).await? {
            RpcResponse::Posted { message } => Ok(message),
            RpcResponse::Error { kind, message } => bail!("{kind:?}: {message}"),
            other => bail!("unexpected response to PostUrl: {other:?}"),
        }
    }

    /// Client-facing query: ranked items for a keyword.
    pub async fn get_index(&self, to: &str, keyword: &str) -> Result<Vec<ItemSummary>> {
        let request = RpcRequest::GetIndex {
            keyword: keyword.to_string(),
        };
        match self.call(to, request, CLIENT_CALL_TIMEOUT).await? {
            RpcResponse::Results(results) => Ok(results),
            RpcResponse::Error { kind, message } => bail!("{kind:?}: {message}"),
            other => bail!("unexpected response to GetIndex: {other:?}"),
        }
    }
}

/// Cap peer lists accepted from a single response. The protocol never
/// returns more than α; anything beyond is a misbehaving peer.
fn bounded_peers(to: &str, peers: Vec<PeerInfo>) -> Vec<PeerInfo> {
    if peers.len() > ALPHA {
        warn!(peer = %to, count = peers.len(), max = ALPHA, "peer returned too many peer infos, truncating");
        peers.into_iter().take(ALPHA).collect()
    } else {
        peers
    }
}

#[async_trait]
impl PeerRpc for RpcClient {
    async fn ping_with_certificate(
        &self,
        to: &str,
        certificate: NodeCertificate,
    ) -> Result<NodeCertificate> {
        let request = RpcRequest::PingWithCertificate { certificate };
        match self.call(to, request, OUTBOUND_CALL_TIMEOUT).await? {
            RpcResponse::Certificate(certificate) => Ok(certificate),
            RpcResponse::Error { kind, message } => bail!("{kind:?}: {message}"),
            other => bail!("unexpected response to PingWithCertificate: {other:?}"),
        }
    }

    async fn find_node(
        &self,
        to: &str,
        certificate: NodeCertificate,
        target: Address,
    ) -> Result<Vec<PeerInfo>> {
        let request = RpcRequest::FindNode {
            certificate,
            target,
        };
        match self.call(to, request, OUTBOUND_CALL_TIMEOUT).await? {
            RpcResponse::Nodes(peers) => Ok(bounded_peers(to, peers)),
            RpcResponse::Error { kind, message } => bail!("{kind:?}: {message}"),
            other => bail!("unexpected response to FindNode: {other:?}"),
        }
    }

    async fn find_index(
        &self,
        to: &str,
        certificate: NodeCertificate,
        target: Address,
    ) -> Result<IndexReply> {
        let request = RpcRequest::FindIndex {
            certificate,
            target,
        };
        match self.call(to, request, OUTBOUND_CALL_TIMEOUT).await? {
            RpcResponse::Index(IndexReply::Nodes(peers)) => {
                Ok(IndexReply::Nodes(bounded_peers(to, peers)))
            }
            RpcResponse::Index(reply) => Ok(reply),
            RpcResponse::Error { kind, message } => bail!("{kind:?}: {message}"),
            other => bail!("unexpected response to FindIndex: {other:?}"),
        }
    }

    async fn store_item(&self, to: &str, request: StoreItemRequest) -> Result<()> {
        match self
            .call(to, RpcRequest::StoreItem(request), OUTBOUND_CALL_TIMEOUT)
            .await?
        {
            RpcResponse::Stored => Ok(()),
            RpcResponse::Error { kind, message } => bail!("{kind:?}: {message}"),
            other => bail!("unexpected response to StoreItem: {other:?}"),
        }
    }
}

/// Serve one inbound connection until the peer goes away.
pub async fn handle_connection(node: Node<RpcClient>, incoming: Incoming) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();
    debug!(remote = %remote, "peer connected");

    loop {
        let stream = match connection.accept_bi().await {
            Ok(stream) => stream,
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                debug!(remote = %remote, "connection closed by application");
                break Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "connection idle timeout");
                break Ok(());
            }
            Err(err) => break Err(err.into()),
        };

        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(node, stream).await {
                debug!(error = ?err, "stream error");
            }
        });
    }
}

async fn handle_stream(
    node: Node<RpcClient>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
) -> Result<()> {
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .map_err(|_| anyhow!("request header read timed out"))??;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_WIRE_SIZE {
        warn!(size = len, max = MAX_WIRE_SIZE, "rejecting oversized request");
        let response = RpcResponse::Error {
            kind: ErrorKind::Internal,
            message: format!("request too large: {len} bytes (max {MAX_WIRE_SIZE})"),
        };
        return write_response(&mut send, &response).await;
    }

    let mut request_bytes = vec![0u8; len];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut request_bytes))
        .await
        .map_err(|_| anyhow!("request body read timed out"))??;

    let request: RpcRequest =
        messages::deserialize_bounded(&request_bytes).context("failed to deserialize request")?;

    let response = match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, dispatch(&node, request))
        .await
    {
        Ok(response) => response,
        Err(_) => RpcResponse::Error {
            kind: ErrorKind::Internal,
            message: "request processing timed out".to_string(),
        },
    };

    write_response(&mut send, &response).await
}

async fn write_response(send: &mut quinn::SendStream, response: &RpcResponse) -> Result<()> {
    let bytes = messages::serialize(response).context("failed to serialize response")?;
    send.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    send.write_all(&bytes).await?;
    send.finish()?;
    Ok(())
}

async fn dispatch(node: &Node<RpcClient>, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Ping { message } => {
            trace!(message = %message, "handling Ping");
            RpcResponse::Pong {
                message: "pong".to_string(),
            }
        }
        RpcRequest::PingWithCertificate { certificate } => {
            match node.handle_ping_with_certificate(&certificate) {
                Ok(certificate) => RpcResponse::Certificate(certificate),
                Err(err) => failure(err),
            }
        }
        RpcRequest::PingTo { peer } => match node.handle_ping_to(&peer).await {
            Ok(message) => RpcResponse::Pong { message },
            Err(err) => failure(err),
        },
        RpcRequest::FindNode {
            certificate,
            target,
        } => match node.handle_find_node(&certificate, &target) {
            Ok(peers) => RpcResponse::Nodes(peers),
            Err(err) => failure(err),
        },
        RpcRequest::FindIndex {
            certificate,
            target,
        } => match node.handle_find_index(&certificate, &target) {
            Ok(reply) => RpcResponse::Index(reply),
            Err(err) => failure(err),
        },
        RpcRequest::StoreItem(request) => match node.handle_store_item(&request) {
            Ok(()) => RpcResponse::Stored,
            Err(err) => failure(err),
        },
        RpcRequest::PostUrl { url } => match node.post_url(&url).await {
            Ok(message) => RpcResponse::Posted { message },
            Err(err) => failure(err),
        },
        RpcRequest::GetIndex { keyword } => match node.get_index(&keyword).await {
            Ok(results) => RpcResponse::Results(results),
            Err(err) => failure(err),
        },
    }
}

fn failure(err: crate::node::NodeError) -> RpcResponse {
    RpcResponse::Error {
        kind: err.kind(),
        message: err.to_string(),
    }
}
