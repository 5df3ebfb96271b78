/// Time-ramped idle backoff for the engine loops.
pub(crate) mod backoff;

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};

/// Generate the connection manager incarnation identifier: a random 32-bit
/// value minted once per process, used by peers to detect restarts.
pub(crate) fn random_ident() -> u32 {
    // RandomState is seeded from OS entropy per instance.
    let hash = RandomState::new().build_hasher().finish();
    (hash ^ (hash >> 32)) as u32
}
