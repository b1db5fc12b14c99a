//! Outbound RPC seam.
//!
//! The publish and query engines talk to remote peers exclusively through
//! [`PeerRpc`], so the overlay logic stays independent of the QUIC transport
//! and can run against a stub in tests. Peers are addressed by their
//! `host:port` network address, as carried in certificates and peer infos.

use anyhow::Result;
use async_trait::async_trait;

use crate::address::Address;
use crate::dht::PeerInfo;
use crate::identity::NodeCertificate;
use crate::messages::{IndexReply, StoreItemRequest};

#[async_trait]
pub trait PeerRpc: Send + Sync + 'static {
    /// Exchange certificates with a peer; the reply is the peer's own
    /// certificate iff it admitted ours.
    async fn ping_with_certificate(
        &self,
        to: &str,
        certificate: NodeCertificate,
    ) -> Result<NodeCertificate>;

    /// Ask a peer for its closest known peers to `target`.
    async fn find_node(
        &self,
        to: &str,
        certificate: NodeCertificate,
        target: Address,
    ) -> Result<Vec<PeerInfo>>;

    /// Ask a peer for the items under `target`, or its closest peers to it.
    async fn find_index(
        &self,
        to: &str,
        certificate: NodeCertificate,
        target: Address,
    ) -> Result<IndexReply>;

    /// Publish one page record under one index token at a peer.
    async fn store_item(&self, to: &str, request: StoreItemRequest) -> Result<()>;
}
