//! The proof-of-work function.

use bitcoin::block::Header;
use sha2::{Digest, Sha256};

/// One-way function from a block header to a 256-bit value compared
/// against the target.
///
/// Output bytes are little-endian: byte 31 is the most significant.
pub trait PowHasher: Send + Sync {
    fn hash(&self, header: &Header) -> [u8; 32];
}

/// Double SHA-256 over the 80-byte serialized header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256dHasher;

impl PowHasher for Sha256dHasher {
    fn hash(&self, header: &Header) -> [u8; 32] {
        let bytes = bitcoin::consensus::serialize(header);
        Sha256::digest(Sha256::digest(&bytes)).into()
    }
}
