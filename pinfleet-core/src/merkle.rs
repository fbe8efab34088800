//! Chunked Merkle root for content integrity checks.

use sha2::{Digest, Sha256};

pub const MERKLE_CHUNK_SIZE: usize = 1024 * 1024;

/// Merkle root over fixed 1 MiB chunks: hash each chunk, then pair-hash
/// adjacent hashes (an odd hash out is paired with itself) until one
/// remains. Empty input yields the hash of the empty string.
pub fn merkle_root(data: &[u8]) -> [u8; 32] {
    if data.is_empty() {
        return hash_bytes(&[]);
    }

    let mut level: Vec<[u8; 32]> = data.chunks(MERKLE_CHUNK_SIZE).map(hash_bytes).collect();

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [odd] => hash_pair(odd, odd),
                _ => unreachable!(),
            })
            .collect();
    }

    level[0]
}

pub fn merkle_root_hex(data: &[u8]) -> String {
    hex_encode(&merkle_root(data))
}

fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn hex_encode(digest: &[u8; 32]) -> String {
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}
