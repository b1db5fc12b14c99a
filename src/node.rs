//! # Node Aggregate
//!
//! [`Node`] is the explicit state aggregate handed to every RPC handler: the
//! keypair and PoW certificate, the routing table, the index store and item
//! registry, the crawler, and the outbound RPC handle. There is no global
//! mutable state; process-wide resources are the QUIC endpoint and the
//! connection cache, both owned by [`BoundNode`].
//!
//! `Node` is a cheap-to-clone handle over shared inner state, and is generic
//! over [`PeerRpc`] so the publish and query engines run against a stub
//! transport in tests.
//!
//! ## Publish
//!
//! `post_url` crawls one page and, for each token, stores the item record at
//! the α peers nearest `SHA1(token)` — locally when no peer is known. Remote
//! stores for one token fan out concurrently and join before the next token.
//!
//! ## Query
//!
//! `get_index` resolves `SHA1(keyword)` locally, fans `find_index` out to the
//! α nearest peers, merges the answers under one accumulator lock, and ranks
//! URLs by average rank across responders. Peers that answer with peer infos
//! instead of items are warmed up with a certificate exchange so they enter
//! the routing table; there is no recursive descent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use quinn::Endpoint;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::address::Address;
use crate::crawler::Crawler;
use crate::crypto;
use crate::dht::{DhtError, IndexStore, Item, ItemRegistry, PeerInfo, RoutingTable, ALPHA};
use crate::identity::{Keypair, NodeCertificate};
use crate::messages::{ErrorKind, IndexReply, ItemSummary, StoreItemRequest};
use crate::protocols::PeerRpc;
use crate::rpc::{self, RpcClient};

/// Maximum number of items returned by a query.
pub const MAX_RESULTS: usize = 20;

/// Error surface of the node's operations, mirrored on the wire as
/// [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The caller's certificate failed admission.
    #[error("invalid certificate")]
    BadCertificate,

    #[error(transparent)]
    Collision(#[from] DhtError),

    #[error("transport failure: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("crawl failed: {0}")]
    Crawl(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::BadCertificate => ErrorKind::BadCertificate,
            NodeError::Collision(_) => ErrorKind::Collision,
            NodeError::Transport(_) => ErrorKind::Transport,
            NodeError::Crawl(_) => ErrorKind::Crawl,
            NodeError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Per-URL rank accumulator for one query.
struct RankScore {
    count: u64,
    sum: f64,
}

/// Ordered result list plus score map, shielded by one mutex for the
/// duration of a query's fan-out.
#[derive(Default)]
struct MergedResults {
    results: Vec<ItemSummary>,
    scores: HashMap<String, RankScore>,
}

impl MergedResults {
    /// First sighting of a URL appends it (its title wins); later sightings
    /// only accumulate rank.
    fn merge(&mut self, item: ItemSummary) {
        match self.scores.get_mut(&item.url) {
            Some(score) => {
                score.count += 1;
                score.sum += item.local_rank;
            }
            None => {
                self.scores.insert(
                    item.url.clone(),
                    RankScore {
                        count: 1,
                        sum: item.local_rank,
                    },
                );
                self.results.push(item);
            }
        }
    }

    /// Rank by average and truncate. Stable on ties, so equal-ranked URLs
    /// keep insertion order.
    fn finish(&mut self) -> Vec<ItemSummary> {
        let mut results = std::mem::take(&mut self.results);
        let scores = std::mem::take(&mut self.scores);
        let average = |item: &ItemSummary| {
            scores
                .get(&item.url)
                .map(|score| score.sum / score.count as f64)
                .unwrap_or(0.0)
        };
        results.sort_by(|a, b| average(b).total_cmp(&average(a)));
        results.truncate(MAX_RESULTS);
        results
    }
}

struct NodeInner<R> {
    keypair: Keypair,
    certificate: NodeCertificate,
    difficulty: u32,
    routing: RoutingTable,
    index_store: IndexStore,
    items: ItemRegistry,
    crawler: Arc<dyn Crawler>,
    rpc: R,
    rank_queue: mpsc::Sender<Address>,
}

/// Handle to the overlay state; clones share everything.
pub struct Node<R> {
    inner: Arc<NodeInner<R>>,
}

impl<R> Clone for Node<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: PeerRpc> Node<R> {
    /// Assemble a node around an already-solved certificate.
    ///
    /// Returns the node and the receiving end of the rank-refinement queue;
    /// the consumer loop is external to the overlay.
    pub fn new(
        keypair: Keypair,
        certificate: NodeCertificate,
        difficulty: u32,
        crawler: Arc<dyn Crawler>,
        rpc: R,
        rank_queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Address>) {
        let (rank_queue, rank_updates) = mpsc::channel(rank_queue_capacity.max(1));
        let routing = RoutingTable::new(certificate.node_address);
        let node = Self {
            inner: Arc::new(NodeInner {
                keypair,
                certificate,
                difficulty,
                routing,
                index_store: IndexStore::new(),
                items: ItemRegistry::new(),
                crawler,
                rpc,
                rank_queue,
            }),
        };
        (node, rank_updates)
    }

    pub fn address(&self) -> &Address {
        &self.inner.certificate.node_address
    }

    pub fn certificate(&self) -> &NodeCertificate {
        &self.inner.certificate
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    pub fn difficulty(&self) -> u32 {
        self.inner.difficulty
    }

    pub fn known_peers(&self) -> usize {
        self.inner.routing.len()
    }

    /// Admission check for an inbound certificate. Our own certificate is
    /// always admitted; any other must declare at least our difficulty floor
    /// and verify. Admitted callers refresh the routing table.
    pub fn admit_sender(&self, certificate: &NodeCertificate) -> bool {
        if *certificate == self.inner.certificate {
            return true;
        }
        if certificate.difficulty < self.inner.difficulty || !certificate.verify() {
            return false;
        }

        let peer = PeerInfo::new(
            certificate.node_address,
            certificate.network_address.clone(),
        );
        if let Err(err) = self.inner.routing.touch(peer) {
            // A verified foreign certificate colliding with our address is a
            // broken invariant; the sender stays admitted, the table does not.
            error!(
                peer = %certificate.node_address,
                error = %err,
                "admitted sender not inserted into routing table"
            );
        }
        true
    }

    /// Up to α known peers nearest to `target`.
    pub fn find_node(&self, target: &Address) -> Result<Vec<PeerInfo>, NodeError> {
        Ok(self.inner.routing.nearest(target, ALPHA)?)
    }

    /// Local index resolution: materialized items on a hit, nearest peers on
    /// a miss.
    pub fn find_index(&self, target: &Address) -> Result<IndexReply, NodeError> {
        if let Some(addresses) = self.inner.index_store.load(target) {
            let mut items = Vec::with_capacity(addresses.len());
            for address in addresses {
                if let Some(item) = self.inner.items.load(&address) {
                    items.push(ItemSummary {
                        url: item.url,
                        title: item.title,
                        local_rank: item.local_rank,
                    });
                }
            }
            return Ok(IndexReply::Items(items));
        }
        Ok(IndexReply::Nodes(self.find_node(target)?))
    }

    /// Record one page under one index token. On the first sighting of the
    /// item, its outgoing links are handed to the crawler in the background.
    pub fn store_item(&self, request: &StoreItemRequest) {
        let item = Item::from_page(&request.url, &request.title, &request.edge_urls);
        let index_address = Address::hash(request.index_token.as_bytes());

        self.inner.index_store.insert(index_address, item.address);

        if self.inner.items.store(item) {
            let crawler = Arc::clone(&self.inner.crawler);
            let edges = request.edge_urls.clone();
            tokio::spawn(async move {
                crawler.crawl(edges).await;
            });
            info!(url = %request.url, token = %request.index_token, "new item stored");
        }
    }

    pub fn handle_ping_with_certificate(
        &self,
        certificate: &NodeCertificate,
    ) -> Result<NodeCertificate, NodeError> {
        if self.admit_sender(certificate) {
            Ok(self.inner.certificate.clone())
        } else {
            Err(NodeError::BadCertificate)
        }
    }

    pub fn handle_find_node(
        &self,
        certificate: &NodeCertificate,
        target: &Address,
    ) -> Result<Vec<PeerInfo>, NodeError> {
        if !self.admit_sender(certificate) {
            return Err(NodeError::BadCertificate);
        }
        self.find_node(target)
    }

    pub fn handle_find_index(
        &self,
        certificate: &NodeCertificate,
        target: &Address,
    ) -> Result<IndexReply, NodeError> {
        if !self.admit_sender(certificate) {
            return Err(NodeError::BadCertificate);
        }
        self.find_index(target)
    }

    pub fn handle_store_item(&self, request: &StoreItemRequest) -> Result<(), NodeError> {
        if !self.admit_sender(&request.certificate) {
            return Err(NodeError::BadCertificate);
        }
        self.store_item(request);
        Ok(())
    }

    /// Dial the named peer, exchange certificates, and report `pong` iff the
    /// peer answers with a certificate that admits.
    pub async fn handle_ping_to(&self, peer: &PeerInfo) -> Result<String, NodeError> {
        let reply = self
            .inner
            .rpc
            .ping_with_certificate(&peer.network_address, self.inner.certificate.clone())
            .await
            .map_err(|err| NodeError::Transport(err.into()))?;

        if self.admit_sender(&reply) {
            Ok("pong".to_string())
        } else {
            Err(NodeError::Internal(
                "recipient presented an invalid certificate".to_string(),
            ))
        }
    }

    /// Seed the routing table from a known peer.
    pub async fn bootstrap(&self, network_address: &str) -> Result<(), NodeError> {
        let reply = self
            .inner
            .rpc
            .ping_with_certificate(network_address, self.inner.certificate.clone())
            .await
            .map_err(|err| NodeError::Transport(err.into()))?;

        if self.admit_sender(&reply) {
            Ok(())
        } else {
            Err(NodeError::BadCertificate)
        }
    }

    /// Crawl `url` and publish an item record under every token of the page.
    pub async fn post_url(&self, url: &str) -> Result<String, NodeError> {
        let page = self
            .inner
            .crawler
            .analyze_page(url)
            .await
            .map_err(|err| NodeError::Crawl(err.into()))?;

        let template = StoreItemRequest {
            certificate: self.inner.certificate.clone(),
            url: url.to_string(),
            title: page.title.clone(),
            index_token: String::new(),
            edge_urls: page.edge_urls.clone(),
        };

        for token in &page.tokens {
            let target = Address::hash(token.as_bytes());
            let mut request = template.clone();
            request.index_token = token.clone();

            let peers = match self.find_node(&target) {
                Ok(peers) => peers,
                Err(err) => {
                    error!(token = %token, error = %err, "lookup failed during publish");
                    continue;
                }
            };

            if peers.is_empty() {
                self.store_item(&request);
                continue;
            }

            let mut stores = Vec::with_capacity(peers.len());
            for peer in peers {
                let node = self.clone();
                let request = request.clone();
                stores.push(tokio::spawn(async move {
                    if let Err(err) = node
                        .inner
                        .rpc
                        .store_item(&peer.network_address, request)
                        .await
                    {
                        error!(peer = %peer.network_address, error = %err, "remote store failed");
                    }
                }));
            }
            for store in stores {
                let _ = store.await;
            }
        }

        Ok("post url finished".to_string())
    }

    /// Resolve a keyword through the overlay and rank the merged results.
    pub async fn get_index(&self, keyword: &str) -> Result<Vec<ItemSummary>, NodeError> {
        let target = Address::hash(keyword.as_bytes());

        // Hint the rank-refinement loop; dropped when its queue is full.
        let _ = self.inner.rank_queue.try_send(target);

        let local = self.find_index(&target)?;

        let mut seed = MergedResults::default();
        let mut fanout: Vec<String> = Vec::with_capacity(ALPHA);
        match local {
            IndexReply::Items(items) => {
                for item in items {
                    seed.merge(item);
                }
                for peer in self.find_node(&target)? {
                    fanout.push(peer.network_address);
                }
            }
            IndexReply::Nodes(peers) => {
                fanout.extend(peers.into_iter().map(|peer| peer.network_address));
            }
        }

        let merged = Arc::new(Mutex::new(seed));
        let mut calls = Vec::with_capacity(fanout.len());
        for network_address in fanout {
            let node = self.clone();
            let merged = Arc::clone(&merged);
            calls.push(tokio::spawn(async move {
                node.merge_remote_index(&network_address, target, &merged)
                    .await;
            }));
        }
        for call in calls {
            let _ = call.await;
        }

        let results = merged
            .lock()
            .expect("result accumulator lock poisoned")
            .finish();
        Ok(results)
    }

    async fn merge_remote_index(
        &self,
        network_address: &str,
        target: Address,
        merged: &Mutex<MergedResults>,
    ) {
        match self
            .inner
            .rpc
            .find_index(network_address, self.inner.certificate.clone(), target)
            .await
        {
            Ok(IndexReply::Items(items)) => {
                let mut merged = merged.lock().expect("result accumulator lock poisoned");
                for item in items {
                    merged.merge(item);
                }
            }
            Ok(IndexReply::Nodes(peers)) => {
                // Warm-up: exchange certificates with the suggested peers so
                // they enter our routing table. No recursion into their index.
                for peer in peers {
                    match self
                        .inner
                        .rpc
                        .ping_with_certificate(
                            &peer.network_address,
                            self.inner.certificate.clone(),
                        )
                        .await
                    {
                        Ok(reply) => {
                            self.admit_sender(&reply);
                        }
                        Err(err) => {
                            debug!(peer = %peer.network_address, error = %err, "certificate exchange failed");
                        }
                    }
                }
            }
            Err(err) => {
                debug!(peer = %network_address, error = %err, "find_index fan-out failed");
            }
        }
    }
}

/// A node bound to a QUIC endpoint and serving the RPC surface.
pub struct BoundNode {
    node: Node<RpcClient>,
    rpc: RpcClient,
    endpoint: Endpoint,
    listener: tokio::task::JoinHandle<()>,
    rank_updates: Mutex<Option<mpsc::Receiver<Address>>>,
}

impl BoundNode {
    /// Generate an identity, solve the admission puzzle, bind the endpoint,
    /// and start serving.
    pub async fn bind(
        addr: &str,
        difficulty: u32,
        crawler: Arc<dyn Crawler>,
        rank_queue_capacity: usize,
    ) -> Result<Self> {
        let bind_addr: SocketAddr = addr.parse().context("invalid socket address")?;

        let keypair = Keypair::generate();
        let (certs, key) = crypto::generate_ed25519_cert(&keypair)?;
        let server_config = crypto::create_server_config(certs, key)?;
        let endpoint = Endpoint::server(server_config, bind_addr)
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        let local_addr = endpoint.local_addr()?;
        let network_address = local_addr.to_string();

        // The nonce search is CPU-bound; keep it off the runtime workers.
        let certificate = {
            let public_key = keypair.public_key_bytes();
            let network_address = network_address.clone();
            tokio::task::spawn_blocking(move || {
                NodeCertificate::issue(&network_address, &public_key, difficulty)
            })
            .await
            .context("proof-of-work task aborted")??
        };
        info!(
            address = %certificate.node_address,
            network = %network_address,
            difficulty,
            "admission puzzle solved"
        );

        let client_config = crypto::create_client_config()?;
        let rpc = RpcClient::new(endpoint.clone(), client_config);

        let (node, rank_updates) = Node::new(
            keypair,
            certificate,
            difficulty,
            crawler,
            rpc.clone(),
            rank_queue_capacity,
        );

        let listener = {
            let endpoint = endpoint.clone();
            let node = node.clone();
            tokio::spawn(async move {
                while let Some(incoming) = endpoint.accept().await {
                    let node = node.clone();
                    tokio::spawn(async move {
                        if let Err(err) = rpc::handle_connection(node, incoming).await {
                            debug!(error = ?err, "connection error");
                        }
                    });
                }
            })
        };

        Ok(Self {
            node,
            rpc,
            endpoint,
            listener,
            rank_updates: Mutex::new(Some(rank_updates)),
        })
    }

    pub fn node(&self) -> &Node<RpcClient> {
        &self.node
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("failed to get local address")
    }

    pub fn network_address(&self) -> &str {
        &self.node.certificate().network_address
    }

    /// Receiver of rank-refinement targets; the consumer loop is external.
    /// Can be taken exactly once.
    pub fn take_rank_updates(&self) -> Option<mpsc::Receiver<Address>> {
        self.rank_updates
            .lock()
            .expect("rank updates lock poisoned")
            .take()
    }

    /// Close all cached connections, stop accepting, and drain the endpoint.
    pub async fn shutdown(self) {
        self.rpc.quit().await;
        self.endpoint.close(0u32.into(), b"shutdown");
        self.listener.abort();
        let _ = self.listener.await;
        self.endpoint.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::PageSummary;
    use async_trait::async_trait;

    struct StubCrawler {
        pages: HashMap<String, PageSummary>,
    }

    impl StubCrawler {
        fn with_page(url: &str, summary: PageSummary) -> Arc<Self> {
            let mut pages = HashMap::new();
            pages.insert(url.to_string(), summary);
            Arc::new(Self { pages })
        }

        fn empty() -> Arc<Self> {
            Arc::new(Self {
                pages: HashMap::new(),
            })
        }
    }

    #[async_trait]
    impl Crawler for StubCrawler {
        async fn analyze_page(&self, url: &str) -> anyhow::Result<PageSummary> {
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown url {url}"))
        }

        async fn crawl(&self, _urls: Vec<String>) {}
    }

    #[derive(Clone, Default)]
    struct StubRpc {
        /// Certificate returned by `ping_with_certificate`.
        reply_certificate: Arc<Mutex<Option<NodeCertificate>>>,
        /// `find_index` answers keyed by network address.
        index_replies: Arc<Mutex<HashMap<String, IndexReply>>>,
        stored: Arc<Mutex<Vec<(String, StoreItemRequest)>>>,
    }

    #[async_trait]
    impl PeerRpc for StubRpc {
        async fn ping_with_certificate(
            &self,
            _to: &str,
            _certificate: NodeCertificate,
        ) -> anyhow::Result<NodeCertificate> {
            self.reply_certificate
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("peer unreachable"))
        }

        async fn find_node(
            &self,
            _to: &str,
            _certificate: NodeCertificate,
            _target: Address,
        ) -> anyhow::Result<Vec<PeerInfo>> {
            Ok(Vec::new())
        }

        async fn find_index(
            &self,
            to: &str,
            _certificate: NodeCertificate,
            _target: Address,
        ) -> anyhow::Result<IndexReply> {
            self.index_replies
                .lock()
                .unwrap()
                .get(to)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("peer unreachable"))
        }

        async fn store_item(&self, to: &str, request: StoreItemRequest) -> anyhow::Result<()> {
            self.stored.lock().unwrap().push((to.to_string(), request));
            Ok(())
        }
    }

    fn certificate_for(network_address: &str, difficulty: u32) -> NodeCertificate {
        let keypair = Keypair::generate();
        NodeCertificate::issue(network_address, &keypair.public_key_bytes(), difficulty)
            .expect("issue failed")
    }

    fn test_node(
        crawler: Arc<dyn Crawler>,
        rpc: StubRpc,
        difficulty: u32,
    ) -> (Node<StubRpc>, mpsc::Receiver<Address>) {
        let keypair = Keypair::generate();
        let certificate =
            NodeCertificate::issue("127.0.0.1:4410", &keypair.public_key_bytes(), difficulty)
                .expect("issue failed");
        Node::new(keypair, certificate, difficulty, crawler, rpc, 8)
    }

    #[tokio::test]
    async fn admission_rejects_below_difficulty_floor() {
        let (node, _rank) = test_node(StubCrawler::empty(), StubRpc::default(), 3);
        let weak = certificate_for("127.0.0.1:5000", 1);

        assert!(!node.admit_sender(&weak));
        assert_eq!(node.known_peers(), 0);
    }

    #[tokio::test]
    async fn admission_rejects_tampered_certificate() {
        let (node, _rank) = test_node(StubCrawler::empty(), StubRpc::default(), 1);
        let mut forged = certificate_for("127.0.0.1:5000", 1);
        forged.network_address = "10.0.0.1:5000".to_string();

        assert!(!node.admit_sender(&forged));
        assert_eq!(node.known_peers(), 0);
    }

    #[tokio::test]
    async fn admission_inserts_valid_peer() {
        let (node, _rank) = test_node(StubCrawler::empty(), StubRpc::default(), 1);
        let peer = certificate_for("127.0.0.1:5000", 2);

        assert!(node.admit_sender(&peer));
        assert_eq!(node.known_peers(), 1);

        let found = node.find_node(&peer.node_address).expect("lookup failed");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, peer.node_address);
    }

    #[tokio::test]
    async fn admission_accepts_own_certificate_without_insert() {
        let (node, _rank) = test_node(StubCrawler::empty(), StubRpc::default(), 1);
        let own = node.certificate().clone();

        assert!(node.admit_sender(&own));
        assert_eq!(node.known_peers(), 0);
    }

    #[tokio::test]
    async fn solo_publish_then_query_returns_item() {
        let page = PageSummary {
            title: "alpha".to_string(),
            tokens: vec!["alpha".to_string()],
            edge_urls: vec![],
        };
        let (node, _rank) = test_node(
            StubCrawler::with_page("http://x", page),
            StubRpc::default(),
            1,
        );

        let message = node.post_url("http://x").await.expect("publish failed");
        assert_eq!(message, "post url finished");

        let results = node.get_index("alpha").await.expect("query failed");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, "http://x");
        assert_eq!(results[0].title, "alpha");

        assert!(node.get_index("beta").await.expect("query failed").is_empty());
    }

    #[tokio::test]
    async fn repeated_publish_is_idempotent() {
        let page = PageSummary {
            title: "alpha".to_string(),
            tokens: vec!["alpha".to_string()],
            edge_urls: vec![],
        };
        let (node, _rank) = test_node(
            StubCrawler::with_page("http://x", page),
            StubRpc::default(),
            1,
        );

        node.post_url("http://x").await.expect("publish failed");
        node.post_url("http://x").await.expect("publish failed");

        let results = node.get_index("alpha").await.expect("query failed");
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn publish_fans_out_to_known_peers() {
        let page = PageSummary {
            title: "alpha".to_string(),
            tokens: vec!["alpha".to_string()],
            edge_urls: vec![],
        };
        let rpc = StubRpc::default();
        let (node, _rank) = test_node(StubCrawler::with_page("http://x", page), rpc.clone(), 1);

        let peer = certificate_for("127.0.0.1:5000", 1);
        assert!(node.admit_sender(&peer));

        node.post_url("http://x").await.expect("publish failed");

        let stored = rpc.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, "127.0.0.1:5000");
        assert_eq!(stored[0].1.index_token, "alpha");
        assert_eq!(stored[0].1.url, "http://x");
        // Nothing lands in the local index when peers take the store.
        assert!(node.inner.index_store.is_empty());
    }

    #[tokio::test]
    async fn query_merges_and_ranks_remote_items() {
        let rpc = StubRpc::default();
        rpc.index_replies.lock().unwrap().insert(
            "127.0.0.1:5000".to_string(),
            IndexReply::Items(vec![
                ItemSummary {
                    url: "http://low".to_string(),
                    title: "low".to_string(),
                    local_rank: 0.1,
                },
                ItemSummary {
                    url: "http://high".to_string(),
                    title: "high".to_string(),
                    local_rank: 0.9,
                },
            ]),
        );
        let (node, _rank) = test_node(StubCrawler::empty(), rpc, 1);

        let peer = certificate_for("127.0.0.1:5000", 1);
        assert!(node.admit_sender(&peer));

        let results = node.get_index("alpha").await.expect("query failed");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "http://high");
        assert_eq!(results[1].url, "http://low");
    }

    #[tokio::test]
    async fn query_averages_ranks_across_responders() {
        // Local copy of a URL at rank 0.0 plus a remote copy at rank 1.0
        // averages to 0.5, below a remote-only URL at rank 0.8.
        let rpc = StubRpc::default();
        rpc.index_replies.lock().unwrap().insert(
            "127.0.0.1:5000".to_string(),
            IndexReply::Items(vec![
                ItemSummary {
                    url: "http://x".to_string(),
                    title: "remote title".to_string(),
                    local_rank: 1.0,
                },
                ItemSummary {
                    url: "http://other".to_string(),
                    title: "other".to_string(),
                    local_rank: 0.8,
                },
            ]),
        );
        let page = PageSummary {
            title: "local title".to_string(),
            tokens: vec!["alpha".to_string()],
            edge_urls: vec![],
        };
        let (node, _rank) = test_node(StubCrawler::with_page("http://x", page), rpc, 1);

        // Publish locally first (empty table ⇒ local store), then admit the
        // peer so the query fans out to it.
        node.post_url("http://x").await.expect("publish failed");
        let peer = certificate_for("127.0.0.1:5000", 1);
        assert!(node.admit_sender(&peer));

        let results = node.get_index("alpha").await.expect("query failed");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "http://other");
        assert_eq!(results[1].url, "http://x");
        // First-seen (local) title wins for the merged URL.
        assert_eq!(results[1].title, "local title");
    }

    #[tokio::test]
    async fn query_enqueues_rank_target() {
        let (node, mut rank) = test_node(StubCrawler::empty(), StubRpc::default(), 1);

        node.get_index("alpha").await.expect("query failed");
        assert_eq!(rank.try_recv(), Ok(Address::hash(b"alpha")));
    }

    #[tokio::test]
    async fn ping_to_admits_valid_recipient() {
        let rpc = StubRpc::default();
        let recipient = certificate_for("127.0.0.1:5000", 2);
        *rpc.reply_certificate.lock().unwrap() = Some(recipient.clone());
        let (node, _rank) = test_node(StubCrawler::empty(), rpc, 1);

        let peer = PeerInfo::new(recipient.node_address, "127.0.0.1:5000");
        let message = node.handle_ping_to(&peer).await.expect("ping failed");
        assert_eq!(message, "pong");
        assert_eq!(node.known_peers(), 1);
    }

    #[tokio::test]
    async fn ping_to_rejects_recipient_below_difficulty_floor() {
        let rpc = StubRpc::default();
        let weak = certificate_for("127.0.0.1:5000", 1);
        *rpc.reply_certificate.lock().unwrap() = Some(weak.clone());
        let (node, _rank) = test_node(StubCrawler::empty(), rpc, 4);

        let peer = PeerInfo::new(weak.node_address, "127.0.0.1:5000");
        let result = node.handle_ping_to(&peer).await;
        assert!(matches!(result, Err(NodeError::Internal(_))));
        assert_eq!(node.known_peers(), 0);
    }

    #[tokio::test]
    async fn ping_to_surfaces_transport_failure() {
        let (node, _rank) = test_node(StubCrawler::empty(), StubRpc::default(), 1);
        let peer = PeerInfo::new(Address::hash(b"peer"), "127.0.0.1:5000");

        let result = node.handle_ping_to(&peer).await;
        assert!(matches!(result, Err(NodeError::Transport(_))));
    }

    #[tokio::test]
    async fn store_handler_requires_admission() {
        let (node, _rank) = test_node(StubCrawler::empty(), StubRpc::default(), 3);
        let weak = certificate_for("127.0.0.1:5000", 1);
        let request = StoreItemRequest {
            certificate: weak,
            url: "http://x".to_string(),
            title: "alpha".to_string(),
            index_token: "alpha".to_string(),
            edge_urls: vec![],
        };

        let result = node.handle_store_item(&request);
        assert!(matches!(result, Err(NodeError::BadCertificate)));
        assert!(node.inner.index_store.is_empty());
    }

    #[tokio::test]
    async fn store_preserves_rank_on_overwrite() {
        let (node, _rank) = test_node(StubCrawler::empty(), StubRpc::default(), 1);
        let request = StoreItemRequest {
            certificate: node.certificate().clone(),
            url: "http://x".to_string(),
            title: "first".to_string(),
            index_token: "alpha".to_string(),
            edge_urls: vec![],
        };
        node.store_item(&request);

        let address = Address::hash(b"http://x");
        assert!(node.inner.items.record_rank(&address, 0.6));

        let mut replacement = request;
        replacement.title = "second".to_string();
        node.store_item(&replacement);

        let item = node.inner.items.load(&address).expect("item missing");
        assert_eq!(item.title, "second");
        assert_eq!(item.local_rank, 0.6);
    }
}
