//! N-of-N secret sharing.
//!
//! Integers use additive shares mod 2^64, so nodes can sum their shares of
//! many secrets locally and only the combined sums are ever reconstructed.
//! Blobs use XOR shares. Any N-1 shares are uniformly random.

use rand::RngCore;
use zeroize::Zeroize;

/// Split `value` into `n` additive shares (element-wise, wrapping).
pub fn split_vector(value: &[u64], n: usize) -> Vec<Vec<u64>> {
    let mut rng = rand::rngs::OsRng;
    let mut shares: Vec<Vec<u64>> = (0..n.saturating_sub(1))
        .map(|_| value.iter().map(|_| rng.next_u64()).collect())
        .collect();

    let last = value
        .iter()
        .enumerate()
        .map(|(i, v)| {
            shares
                .iter()
                .fold(*v, |acc, share| acc.wrapping_sub(share[i]))
        })
        .collect();
    shares.push(last);
    shares
}

/// Element-wise wrapping sum of equal-length vectors.
pub fn sum_vectors<'a>(vectors: impl IntoIterator<Item = &'a Vec<u64>>, len: usize) -> Vec<u64> {
    let mut total = vec![0u64; len];
    for vector in vectors {
        for (acc, v) in total.iter_mut().zip(vector) {
            *acc = acc.wrapping_add(*v);
        }
    }
    total
}

/// Recombine additive shares.
pub fn combine_vector(shares: &[Vec<u64>]) -> Vec<u64> {
    let len = shares.first().map(Vec::len).unwrap_or(0);
    sum_vectors(shares, len)
}

/// Split `value` into `n` XOR shares.
pub fn split_blob(value: &[u8], n: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::rngs::OsRng;
    let mut last = value.to_vec();
    let mut shares = Vec::with_capacity(n);

    for _ in 0..n.saturating_sub(1) {
        let mut share = vec![0u8; value.len()];
        rng.fill_bytes(&mut share);
        for (l, s) in last.iter_mut().zip(&share) {
            *l ^= s;
        }
        shares.push(share);
    }
    shares.push(last);
    shares
}

/// Recombine XOR shares.
pub fn combine_blob(shares: &[Vec<u8>]) -> Vec<u8> {
    let len = shares.first().map(Vec::len).unwrap_or(0);
    let mut out = vec![0u8; len];
    for share in shares {
        for (o, s) in out.iter_mut().zip(share) {
            *o ^= s;
        }
    }
    out
}

/// Wipe shares in place.
pub fn wipe_blob_shares(shares: &mut [Vec<u8>]) {
    for share in shares {
        share.zeroize();
    }
}
