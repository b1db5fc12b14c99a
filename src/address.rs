//! # Address Algebra
//!
//! The overlay uses one opaque 160-bit identifier type for three roles:
//!
//! - **Node address**: where a peer sits in the key space (PoW-bound, see `identity`)
//! - **Item address**: `SHA1(url)` of a crawled page
//! - **Index address**: `SHA1(token)` under which item records are published
//!
//! The XOR of two addresses is the routing distance. The index of the highest
//! set bit of a distance selects the k-bucket, and the lexicographic order
//! over big-endian bytes ranks candidates by closeness to a target.
//!
//! SHA-1 is the only digest in the system; its 20-byte width fixes the
//! address width everywhere.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Width of an address in bytes (SHA-1 digest size).
pub const ADDRESS_BYTES: usize = 20;

/// Width of an address in bits; also the number of routing buckets.
pub const ADDRESS_BITS: usize = ADDRESS_BYTES * 8;

/// A 160-bit overlay identifier.
///
/// The derived `Ord` is lexicographic over the big-endian bytes, which is
/// exactly the unsigned 160-bit integer order used to rank XOR distances.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_BYTES]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; ADDRESS_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_BYTES] {
        &self.0
    }

    /// SHA-1 of arbitrary bytes, as an address.
    pub fn hash(data: &[u8]) -> Self {
        let mut out = [0u8; ADDRESS_BYTES];
        out.copy_from_slice(&Sha1::digest(data));
        Self(out)
    }

    /// SHA-1 over a sequence of byte slices, fed in order.
    pub fn hash_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }
        let mut out = [0u8; ADDRESS_BYTES];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    /// Byte-wise XOR distance to another address.
    #[inline]
    pub fn xor_distance(&self, other: &Address) -> [u8; ADDRESS_BYTES] {
        let mut out = [0u8; ADDRESS_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ADDRESS_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut out = [0u8; ADDRESS_BYTES];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

/// Index of the highest set bit of a 160-bit distance, counted numerically:
/// bit 0 is the least-significant bit of the last byte, bit 159 the top bit
/// of the first. `None` iff the distance is zero, which only happens when two
/// identical addresses meet and is treated as a collision by callers.
#[inline]
pub fn msb(distance: &[u8; ADDRESS_BYTES]) -> Option<u32> {
    distance
        .iter()
        .enumerate()
        .find(|(_, byte)| **byte != 0)
        .map(|(i, byte)| {
            let bit_in_byte = 7 - byte.leading_zeros();
            ((ADDRESS_BYTES - 1 - i) as u32) * 8 + bit_in_byte
        })
}

/// Count of leading zero bits in a distance or digest.
#[inline]
pub fn leading_zero_bits(bytes: &[u8; ADDRESS_BYTES]) -> u32 {
    let mut zeros = 0u32;
    for byte in bytes {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
