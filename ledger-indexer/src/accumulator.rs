//! Transaction accumulator
//!
//! The accumulator is a running double-SHA-256 digest over every committed
//! transaction: `next = SHA256(SHA256(parent ++ child_hash))`. A node's claimed
//! accumulator for a transaction proves the transaction extends the chain
//! we already hold.

use sha2::{Digest, Sha256};

/// Length of an accumulator and of a transaction identifier hash
pub const ACCUMULATOR_LENGTH: usize = 32;

/// Check that `claimed` is the accumulator obtained by extending `parent` with `child_hash`.
///
/// Returns false (rather than failing) if any input is not exactly 32 bytes.
pub fn is_valid(parent: &[u8], child_hash: &[u8], claimed: &[u8]) -> bool {
    let (Ok(parent), Ok(child_hash)) = (
        <&[u8; ACCUMULATOR_LENGTH]>::try_from(parent),
        <&[u8; ACCUMULATOR_LENGTH]>::try_from(child_hash),
    ) else {
        return false;
    };
    if claimed.len() != ACCUMULATOR_LENGTH {
        return false;
    }

    create_new_fixed(parent, child_hash).as_slice() == claimed
}

/// Extend `parent` with `child_hash`. Inputs may be of any length.
pub fn create_new(parent: &[u8], child_hash: &[u8]) -> [u8; ACCUMULATOR_LENGTH] {
    let first = Sha256::new()
        .chain_update(parent)
        .chain_update(child_hash)
        .finalize();
    Sha256::digest(first).into()
}

/// Extend a 32-byte `parent` with a 32-byte `child_hash`, on the stack.
pub fn create_new_fixed(
    parent: &[u8; ACCUMULATOR_LENGTH],
    child_hash: &[u8; ACCUMULATOR_LENGTH],
) -> [u8; ACCUMULATOR_LENGTH] {
    let mut buffer = [0u8; ACCUMULATOR_LENGTH * 2];
    buffer[..ACCUMULATOR_LENGTH].copy_from_slice(parent);
    buffer[ACCUMULATOR_LENGTH..].copy_from_slice(child_hash);
    Sha256::digest(Sha256::digest(buffer)).into()
}
