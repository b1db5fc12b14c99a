//! # Wire Protocol Messages
//!
//! Every RPC exchanged between nodes is one [`RpcRequest`] answered by one
//! [`RpcResponse`], bincode-serialized and length-prefixed on the stream.
//! Deserialization always goes through [`deserialize_bounded`] so a peer
//! cannot declare an absurd allocation.
//!
//! Admission-checked requests carry the sender's [`NodeCertificate`]; `Ping`
//! and the client-facing `PostUrl`/`GetIndex` do not.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::address::Address;
use crate::dht::PeerInfo;
use crate::identity::NodeCertificate;

/// Maximum serialized size of a single request or response.
pub const MAX_WIRE_SIZE: usize = 256 * 1024;

/// bincode options with the wire size limit enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_WIRE_SIZE as u64)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

/// Deserialize with the size limit enforced. Use this for anything read off
/// the network.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// An item record as it travels between nodes and out to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub url: String,
    pub title: String,
    pub local_rank: f64,
}

/// Payload of a `StoreItem` RPC: one page, one index token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreItemRequest {
    pub certificate: NodeCertificate,
    pub url: String,
    pub title: String,
    pub index_token: String,
    pub edge_urls: Vec<String>,
}

/// Answer to an index lookup: either the materialized items, or the peers
/// the responder considers closest to the index address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IndexReply {
    Items(Vec<ItemSummary>),
    Nodes(Vec<PeerInfo>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Ping {
        message: String,
    },
    PingWithCertificate {
        certificate: NodeCertificate,
    },
    PingTo {
        peer: PeerInfo,
    },
    FindNode {
        certificate: NodeCertificate,
        target: Address,
    },
    FindIndex {
        certificate: NodeCertificate,
        target: Address,
    },
    StoreItem(StoreItemRequest),
    PostUrl {
        url: String,
    },
    GetIndex {
        keyword: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Pong { message: String },
    Certificate(NodeCertificate),
    Nodes(Vec<PeerInfo>),
    Index(IndexReply),
    Stored,
    Posted { message: String },
    Results(Vec<ItemSummary>),
    Error { kind: ErrorKind, message: String },
}

/// Error classification carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unadmitted caller; the gRPC-equivalent of `InvalidArgument`.
    BadCertificate,
    Collision,
    Transport,
    Crawl,
    Internal,
}
