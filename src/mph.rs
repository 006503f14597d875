use thiserror::Error;

/// Fixed large prime from the historical implementation. Slot assignments in
/// prior run logs depend on this exact constant.
pub const MPH_PRIME: u64 = 479_001_599;

/// Upper bound on the multiplier search before the key set is declared
/// pathological.
pub const MAX_MULTIPLIER: u64 = 5_000_000;

/// A pathological key set is a configuration error, not an I/O problem, and
/// is surfaced as its own error kind.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MphError {
    #[error("no collision-free multiplier below {bound} for {nkeys} keys (pathological key set)")]
    SearchExhausted { bound: u64, nkeys: usize },
}

/// Map a key through the multiplier-parameterized hash into `[0, nslots)`.
/// Total for arbitrary keys, so datagrams from unregistered senders still
/// land in a valid slot.
pub fn slot(multiplier: u64, key: u32, nslots: usize) -> usize {
    ((multiplier * key as u64 % MPH_PRIME) % nslots as u64) as usize
}

/// Brute-force search for the smallest multiplier `k` such that
/// `(k*key mod P) mod N` is a bijection from the keys onto `[0, N)`.
///
/// O(N) per candidate; random endpoint keys need only a handful of
/// candidates. Must be re-run whenever the registered set changes.
pub fn find_multiplier(keys: &[u32]) -> Result<u64, MphError> {
    let n = keys.len();
    if n == 0 {
        return Ok(1);
    }

    let mut taken = vec![false; n];
    'candidate: for k in 1..=MAX_MULTIPLIER {
        taken.iter_mut().for_each(|t| *t = false);
        for &key in keys {
            let s = slot(k, key, n);
            if taken[s] {
                continue 'candidate;
            }
            taken[s] = true;
        }
        return Ok(k);
    }

    Err(MphError::SearchExhausted {
        bound: MAX_MULTIPLIER,
        nkeys: n,
    })
}
