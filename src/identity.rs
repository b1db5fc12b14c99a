//! # Identity and Admission
//!
//! A node's overlay address is bound to its network location by proof of
//! work. The address itself is deterministic:
//!
//! ```text
//! address = SHA1(host ∥ port ∥ public_key)
//! ```
//!
//! and the work is finding a nonce such that `SHA1(address ∥ nonce)` has at
//! least `difficulty` leading zero bits. Verification is two SHA-1
//! invocations; forging an arbitrary overlay position costs CPU, which limits
//! Sybil attacks on the routing tables of honest peers.
//!
//! The keypair is Ed25519. Keys currently participate only as PoW input; they
//! are carried in certificates so signed messages can be added later without
//! changing the admission scheme.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::address::{leading_zero_bits, Address};

/// Fixed length of the proof-of-work nonce in bytes.
pub const NONCE_BYTES: usize = 10;

/// Upper bound on nonce samples before a derivation attempt gives up.
///
/// At difficulty `d` the expected number of samples is `2^d`; the bound
/// leaves many orders of magnitude of headroom for the difficulties a node
/// would realistically run with.
const POW_MAX_ATTEMPTS: u64 = 1 << 40;

/// Error type for identity construction failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PowError {
    #[error(
        "proof-of-work search exhausted after {attempts} nonces (difficulty {difficulty}); \
         this indicates a CSPRNG failure or an unreasonable difficulty"
    )]
    Exhausted { attempts: u64, difficulty: u32 },

    #[error("network address `{0}` is not of the form host:port")]
    MalformedNetworkAddress(String),
}

/// Ed25519 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Compute the deterministic overlay address for a network location and key.
fn address_for(host: &str, port: &str, public_key: &[u8]) -> Address {
    Address::hash_parts(&[host.as_bytes(), port.as_bytes(), public_key])
}

/// The puzzle digest: `SHA1(address ∥ nonce)`.
fn puzzle_hash(address: &Address, nonce: &[u8]) -> Address {
    Address::hash_parts(&[address.as_bytes(), nonce])
}

/// Derive an overlay address for `(host, port, public_key)` and solve the
/// admission puzzle at the given difficulty.
///
/// Returns the address together with the winning nonce. The nonce search is
/// bounded; exhausting the bound is astronomically unlikely with a working
/// CSPRNG and a sane difficulty.
pub fn derive_address(
    host: &str,
    port: &str,
    public_key: &[u8],
    difficulty: u32,
) -> Result<(Address, Vec<u8>), PowError> {
    let address = address_for(host, port, public_key);
    let mut nonce = [0u8; NONCE_BYTES];

    for _ in 0..POW_MAX_ATTEMPTS {
        OsRng.fill_bytes(&mut nonce);
        if leading_zero_bits(puzzle_hash(&address, &nonce).as_bytes()) >= difficulty {
            return Ok((address, nonce.to_vec()));
        }
    }

    Err(PowError::Exhausted {
        attempts: POW_MAX_ATTEMPTS,
        difficulty,
    })
}

/// Verify that `address` is the overlay address for `(host, port, public_key)`
/// and that `nonce` solves the admission puzzle at `difficulty`.
pub fn verify_address(
    address: &Address,
    host: &str,
    port: &str,
    public_key: &[u8],
    nonce: &[u8],
    difficulty: u32,
) -> bool {
    if address_for(host, port, public_key) != *address {
        return false;
    }
    leading_zero_bits(puzzle_hash(address, nonce).as_bytes()) >= difficulty
}

/// Split a `host:port` network address on its final colon.
pub fn split_network_address(network_address: &str) -> Result<(&str, &str), PowError> {
    network_address
        .rsplit_once(':')
        .filter(|(host, port)| !host.is_empty() && !port.is_empty())
        .ok_or_else(|| PowError::MalformedNetworkAddress(network_address.to_string()))
}

/// A node's admission ticket: its network location, overlay address, public
/// key, and the proof-of-work nonce binding them together.
///
/// Sent with every admission-checked RPC. A receiving node accepts the sender
/// iff the declared difficulty meets its local floor and the derivation
/// verifies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeCertificate {
    pub network_address: String,
    pub node_address: Address,
    pub public_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub difficulty: u32,
}

impl NodeCertificate {
    /// Issue a certificate for this node, solving the admission puzzle.
    pub fn issue(
        network_address: &str,
        public_key: &[u8],
        difficulty: u32,
    ) -> Result<Self, PowError> {
        let (host, port) = split_network_address(network_address)?;
        let (node_address, nonce) = derive_address(host, port, public_key, difficulty)?;
        Ok(Self {
            network_address: network_address.to_string(),
            node_address,
            public_key: public_key.to_vec(),
            nonce,
            difficulty,
        })
    }

    /// Recompute the derivation and check the puzzle at the certificate's
    /// own declared difficulty.
    pub fn verify(&self) -> bool {
        let Ok((host, port)) = split_network_address(&self.network_address) else {
            return false;
        };
        verify_address(
            &self.node_address,
            host,
            port,
            &self.public_key,
            &self.nonce,
            self.difficulty,
        )
    }
}
