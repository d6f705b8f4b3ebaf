//! Probabilistic primality, prime and safe-prime generation, and the
//! Diffie-Hellman parameter checks MTProto requires.

use std::sync::OnceLock;

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

/// Miller-Rabin rounds used by [`generate_prime`] and [`is_safe_prime`].
pub const MILLER_RABIN_ROUNDS: usize = 24;

/// The 2048-bit safe prime Telegram's own servers hand out.
pub const TELEGRAM_DH_PRIME_HEX: &str = concat!(
    "C71CAEB9C6B1C9048E6C522F70F13F73980D40238E3E21C14934D037563D930F",
    "48198A0AA7C14058229493D22530F4DBFA336F6E0AC925139543AED44CCE7C37",
    "20FD51F69458705AC68CD4FE6B6B13ABDC9746512969328454F18FAF8C595F64",
    "2477FE96BB2A941D5BCD1D4AC8CC49880708FA9B378E3C4F3A9060BEE67CF9A4",
    "A4A695811051907E162753B56B0F6B410DBA74D8A84B2A14B3144E0EF1284754",
    "FD17ED950D5965B4B9DD46582DB1178D169C6BC465B0D6FF9CA3928FEF5B9AE4",
    "E418FC15E83EBEA0F87FA9FF5EED70050DED2849F47BF959D956850CE929851F",
    "0D8115F635B105EE2E4E15D04B2454BF6F4FADF034B10403119CD8E3B92FCC5B",
);

/// Parsed [`TELEGRAM_DH_PRIME_HEX`].
pub fn telegram_dh_prime() -> BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME
        .get_or_init(|| {
            BigUint::parse_bytes(TELEGRAM_DH_PRIME_HEX.as_bytes(), 16).unwrap_or_default()
        })
        .clone()
}

fn small_primes() -> &'static [u32] {
    static TABLE: OnceLock<Vec<u32>> = OnceLock::new();
    TABLE.get_or_init(|| {
        const LIMIT: usize = 2048;
        let mut composite = vec![false; LIMIT];
        let mut primes = Vec::new();
        for i in 2..LIMIT {
            if !composite[i] {
                primes.push(i as u32);
                for j in (i * i..LIMIT).step_by(i) {
                    composite[j] = true;
                }
            }
        }
        primes
    })
}

/// Uniform random integer with at most `bits` bits.
pub fn random_bits(bits: u64) -> BigUint {
    let len = bits.div_ceil(8) as usize;
    let mut buf = vec![0u8; len];
    crate::fill_random(&mut buf);
    let excess = (len as u64 * 8 - bits) as u32;
    if excess > 0 {
        buf[0] &= 0xff >> excess;
    }
    BigUint::from_bytes_be(&buf)
}

/// Uniform random integer in `[low, high)`. Returns `low` for an empty range.
pub fn random_range(low: &BigUint, high: &BigUint) -> BigUint {
    if high <= low {
        return low.clone();
    }
    let span = high - low;
    let bits = span.bits();
    loop {
        let candidate = random_bits(bits);
        if candidate < span {
            return low + candidate;
        }
    }
}

/// `false` if some table prime properly divides `n`.
fn passes_trial_division(n: &BigUint) -> bool {
    for &p in small_primes() {
        let p = BigUint::from(p);
        if &p == n {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }
    true
}

fn miller_rabin(n: &BigUint, rounds: usize) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u8);
    let n_minus_one = n - &one;

    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    'witness: for _ in 0..rounds {
        let a = random_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Trial division by the small-prime table followed by `rounds` rounds of
/// Miller-Rabin with random bases.
pub fn is_probable_prime(n: &BigUint, rounds: usize) -> bool {
    match n.to_u32() {
        Some(0 | 1) => return false,
        Some(2 | 3) => return true,
        _ => {}
    }
    if !n.bit(0) {
        return false;
    }
    if !passes_trial_division(n) {
        return false;
    }
    if let Some(small) = n.to_u32() {
        if small < 2048 * 2048 {
            // Trial division already covered every possible factor.
            return true;
        }
    }
    miller_rabin(n, rounds)
}

fn odd_candidate(bits: u64) -> BigUint {
    let mut n = random_bits(bits);
    n.set_bit(bits - 1, true);
    n.set_bit(bits - 2, true);
    n.set_bit(0, true);
    n
}

/// A random probable prime of exactly `bits` bits with its two top bits set,
/// so the product of two such primes has exactly `2 * bits` bits.
///
/// `None` for `bits < 8`.
pub fn generate_prime(bits: u64) -> Option<BigUint> {
    if bits < 8 {
        return None;
    }
    loop {
        let candidate = odd_candidate(bits);
        if is_probable_prime(&candidate, MILLER_RABIN_ROUNDS) {
            return Some(candidate);
        }
    }
}

/// A random safe prime `p = 2q + 1` of exactly `bits` bits.
///
/// Slow for 2048 bits: expect seconds to minutes. `None` for `bits < 16`.
pub fn generate_safe_prime(bits: u64) -> Option<BigUint> {
    if bits < 16 {
        return None;
    }
    let one = BigUint::one();
    loop {
        let q = odd_candidate(bits - 1);
        let p: BigUint = (&q << 1u8) + &one;
        // Cheap sieve on both halves before any modpow.
        if !passes_trial_division(&q) || !passes_trial_division(&p) {
            continue;
        }
        if is_probable_prime(&q, MILLER_RABIN_ROUNDS) && is_probable_prime(&p, MILLER_RABIN_ROUNDS) {
            return Some(p);
        }
    }
}

/// `p` and `(p - 1) / 2` are both probable primes.
pub fn is_safe_prime(p: &BigUint) -> bool {
    if p.to_u32().is_some_and(|v| v < 5) {
        return false;
    }
    let q: BigUint = (p - BigUint::one()) >> 1u8;
    is_probable_prime(p, MILLER_RABIN_ROUNDS) && is_probable_prime(&q, MILLER_RABIN_ROUNDS)
}

/// Whether `g` generates the order-`q` subgroup of the safe prime `p`.
///
/// Only generators 2 through 7 are meaningful; anything else is rejected.
pub fn is_good_generator(g: u32, p: &BigUint) -> bool {
    let rem = |m: u32| (p % m).to_u32().unwrap_or(u32::MAX);
    match g {
        2 => rem(8) == 7,
        3 => rem(3) == 2,
        4 => true,
        5 => matches!(rem(5), 1 | 4),
        6 => matches!(rem(24), 19 | 23),
        7 => matches!(rem(7), 3 | 5 | 6),
        _ => false,
    }
}

/// Generators in `2..=7` usable with `p`.
pub fn good_generators(p: &BigUint) -> Vec<u32> {
    (2..=7).filter(|&g| is_good_generator(g, p)).collect()
}

/// Range check for `g`, `g_a` and `g_b`: `1 < v < p - 1`, and for primes
/// wider than 128 bits also `2^(bits-64) <= v <= p - 2^(bits-64)`.
pub fn check_dh_value(value: &BigUint, p: &BigUint) -> bool {
    let one = BigUint::one();
    if value <= &one || value >= &(p - &one) {
        return false;
    }
    let bits = p.bits();
    if bits > 128 {
        let margin = BigUint::one() << (bits - 64);
        if value < &margin || value > &(p - &margin) {
            return false;
        }
    }
    true
}
