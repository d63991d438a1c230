//! Hashing primitives shared by the index builder and the search engine
//!
//! A reference k-mer enters the index through exactly the same functions the
//! search engine later probes it with: one 64-bit code is split into two
//! 32-bit halves and expanded into `h` row positions by double hashing.
//! Row counts are constrained to powers of two so the modulo reduction is a
//! bitmask.

/// Largest supported Bloom filter length in bits (2^42)
pub const MAX_SIGNATURE_BITS: u64 = 1 << 42;

/// Finalizes an arbitrary 64-bit value into a well-mixed hash
///
/// Applied to k-mer codes of artifacts that were written without the
/// `hashed` flag, so that raw 2-bit-packed k-mers still spread evenly over
/// the filter rows. Pre-hashed streams skip this step.
#[inline]
#[must_use]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Hashes an arbitrary byte string to a well-mixed 64-bit value
///
/// FNV-1a folded through [`mix64`]. Used to assign artifacts to buckets
/// deterministically across runs and platforms (the repetition shuffles of a
/// database must be reproducible from `seed` alone).
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    mix64(hash)
}

/// Splits a 64-bit code into the two base hashes used for double hashing
#[inline]
#[must_use]
pub fn base_hashes(code: u64) -> (u32, u32) {
    (code as u32, (code >> 32) as u32)
}

/// Expands a 64-bit code into `out.len()` row positions below `mask + 1`
///
/// `mask` must be `m - 1` for a power-of-two row count `m`. Position `i` is
/// `(h1 + i * h2) & mask`, with `(h1, h2)` the low and high halves of the
/// code. The writer sets bits at these positions; the searcher reads rows at
/// these positions; both must call this exact function.
#[inline]
pub fn bloom_positions(code: u64, mask: u64, out: &mut [u64]) {
    let (h1, h2) = base_hashes(code);
    let (h1, h2) = (u64::from(h1), u64::from(h2));
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = h1.wrapping_add((i as u64).wrapping_mul(h2)) & mask;
    }
}

/// The single row position probed when one hash function is in use
///
/// Equivalent to [`bloom_positions`] with a one-element output, kept
/// separate because `h = 1` is the default and the hot path.
#[inline]
#[must_use]
pub fn single_position(code: u64, mask: u64) -> u64 {
    code & mask
}

/// Computes the row count for a filter holding `kmers` elements at the
/// requested false positive rate, rounded up to a power of two
///
/// The raw size is the textbook `-n * ln(p) / (ln 2)^2`; the power-of-two
/// rounding over-provisions by up to 2x and buys masked hashing in return.
///
/// # Errors
///
/// Returns [`crate::error::BuildError::FilterTooLarge`] when the required
/// size exceeds [`MAX_SIGNATURE_BITS`].
pub fn signature_size(kmers: u64, fpr: f64) -> crate::Result<u64> {
    let ln2sq = std::f64::consts::LN_2 * std::f64::consts::LN_2;
    let raw = (-(kmers as f64) * fpr.ln() / ln2sq).ceil();
    // Reject while still in float space: casting an oversized value to u64
    // saturates and next_power_of_two would overflow
    if raw > MAX_SIGNATURE_BITS as f64 {
        return Err(crate::error::BuildError::FilterTooLarge(raw as u64).into());
    }
    // raw <= 2^42, so the power-of-two rounding cannot exceed 2^42
    Ok((raw as u64).max(64).next_power_of_two())
}

/// The false positive rate actually achieved by a filter of `rows` bits
/// holding `kmers` elements with `num_hashes` hash functions
#[must_use]
pub fn achieved_fpr(rows: u64, kmers: u64, num_hashes: u8) -> f64 {
    let h = f64::from(num_hashes);
    let load = -h * kmers as f64 / rows as f64;
    (1.0 - load.exp()).powf(h)
}

/// Upper bound on the probability that a query of `num_kmers` k-mers sees
/// at least one false positive row hit on a single column
#[must_use]
pub fn query_fpr(fpr: f64, num_kmers: usize) -> f64 {
    if num_kmers == 0 {
        return 0.0;
    }
    1.0 - (1.0 - fpr).powi(num_kmers.min(i32::MAX as usize) as i32)
}
