//! # Sift - Decentralized Web-Search Overlay Node
//!
//! Sift is a peer in a structured peer-to-peer web-search network:
//!
//! - **Identity**: overlay addresses bound to network locations by proof of
//!   work, carried as certificates and checked on every admission-gated RPC
//! - **Routing**: XOR-metric k-buckets with strict LRU eviction
//! - **DHT**: per-token index entries mapping `SHA1(token)` to item records
//!   of crawled pages
//! - **Publish**: `PostUrl` crawls a page and stores one record per token at
//!   the α nearest peers
//! - **Query**: `GetIndex` resolves a keyword locally, fans out to the α
//!   nearest peers, and ranks the merged results by average rank
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | `Node` aggregate and the `BoundNode` server facade |
//! | `address` | 160-bit addresses, XOR metric, MSB index, SHA-1 |
//! | `identity` | Keypairs, PoW derivation, node certificates |
//! | `dht` | Routing table, index store, item registry |
//! | `crawler` | Page fetch and tokenization |
//! | `messages` | Wire types and bounded serialization |
//! | `protocols` | `PeerRpc`, the outbound RPC seam |
//! | `rpc` | QUIC client/server plumbing |
//! | `crypto` | TLS certificates for the transport |

pub mod address;
pub mod crawler;
pub mod crypto;
pub mod dht;
pub mod identity;
pub mod messages;
pub mod node;
pub mod protocols;
pub mod rpc;

pub use address::Address;
pub use crawler::{Crawler, HttpCrawler, PageSummary};
pub use dht::{PeerInfo, ALPHA, BUCKET_SIZE};
pub use identity::{Keypair, NodeCertificate, PowError};
pub use messages::ItemSummary;
pub use node::{BoundNode, Node, NodeError, MAX_RESULTS};
pub use protocols::PeerRpc;
pub use rpc::RpcClient;
