//! CRC32 checksums for ledger records
//!
//! Every record carries a checksum over its length prefix, header and payload.
//! Any mismatch is corruption, except for a torn final record (see reader).

use crc32fast::Hasher;

/// Computes a CRC32 (IEEE) checksum over the provided data.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
