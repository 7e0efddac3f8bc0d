//! Deterministic hashing primitives
//!
//! A 64-bit simhash over canonical tokens for near-duplicate detection,
//! and a 32-dim pseudo-vector fingerprint used when a provider is
//! unavailable and for cold memories.

use crate::text::canonical_tokens;

/// Dimension of fingerprint vectors
pub const FINGERPRINT_DIM: usize = 32;

/// FNV-1a 64-bit hash
pub fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// xorshift64* step; expands one seed into a stream of pseudo-random words
fn xorshift64star(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    *state = x;
    x.wrapping_mul(0x2545f4914f6cdd1d)
}

/// 64-bit simhash over canonical tokens
pub fn simhash64(text: &str) -> u64 {
    let tokens = canonical_tokens(text);
    if tokens.is_empty() {
        return 0;
    }

    let mut counts = [0i32; 64];
    for token in &tokens {
        let hash = fnv1a64(token.as_bytes());
        for (bit, count) in counts.iter_mut().enumerate() {
            if hash & (1u64 << bit) != 0 {
                *count += 1;
            } else {
                *count -= 1;
            }
        }
    }

    let mut result = 0u64;
    for (bit, count) in counts.iter().enumerate() {
        if *count > 0 {
            result |= 1u64 << bit;
        }
    }
    result
}

/// Hamming distance between two simhashes
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Deterministic 32-dim pseudo-vector: FNV seed expanded by xorshift,
/// mapped to [-1,1] and L2-normalized.
pub fn fingerprint_vector(text: &str) -> Vec<f32> {
    let mut state = fnv1a64(text.as_bytes());
    if state == 0 {
        state = 0x9e3779b97f4a7c15;
    }

    let mut vec: Vec<f32> = (0..FINGERPRINT_DIM)
        .map(|_| {
            let word = xorshift64star(&mut state);
            // High 24 bits to a float in [-1, 1]
            ((word >> 40) as f32 / (1u64 << 23) as f32) - 1.0
        })
        .collect();

    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vec {
            *x /= norm;
        }
    }
    vec
}
