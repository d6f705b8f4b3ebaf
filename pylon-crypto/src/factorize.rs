//! Pollard-rho factorization (Brent's cycle detection) of the handshake `pq`.

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

fn step(y: u64, c: u64, n: u64) -> u64 {
    ((mul_mod(y, y, n) as u128 + c as u128) % n as u128) as u64
}

/// One rho walk with polynomial `y² + c`. Returns a nontrivial divisor or
/// `None` when the walk collapsed onto `n` itself.
fn brent(n: u64, seed: u64, c: u64) -> Option<u64> {
    const BATCH: u64 = 128;

    let mut y = seed % n;
    let mut r = 1u64;
    let mut q = 1u64;
    let mut g = 1u64;
    let mut x = y;
    let mut ys = y;

    while g == 1 {
        x = y;
        for _ in 0..r {
            y = step(y, c, n);
        }
        let mut k = 0;
        while k < r && g == 1 {
            ys = y;
            for _ in 0..BATCH.min(r - k) {
                y = step(y, c, n);
                q = mul_mod(q, x.abs_diff(y), n);
            }
            g = gcd(q, n);
            k += BATCH;
        }
        r = r.checked_mul(2)?;
    }

    if g == n {
        // The batch overshot; replay it one step at a time.
        loop {
            ys = step(ys, c, n);
            g = gcd(x.abs_diff(ys), n);
            if g > 1 {
                break;
            }
        }
    }

    (g != n).then_some(g)
}

/// Split `pq` into `(p, q)` with `p <= q`.
///
/// `None` for inputs below 4 or when every walk fails, which for a product
/// of two primes does not happen in practice.
pub fn factorize(pq: u64) -> Option<(u64, u64)> {
    if pq < 4 {
        return None;
    }
    if pq % 2 == 0 {
        return Some((2, pq / 2));
    }
    for (seed, c) in [(2u64, 1u64), (3, 7), (5, 11), (11, 13), (17, 19), (23, 29)] {
        if let Some(p) = brent(pq, seed, c) {
            let q = pq / p;
            return Some((p.min(q), p.max(q)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_sized_products() {
        assert_eq!(factorize(1470626929934143021), Some((1206429347, 1218991343)));
        assert_eq!(factorize(2363612107535801713), Some((1518968219, 1556064227)));
    }

    #[test]
    fn small_and_even_inputs() {
        assert_eq!(factorize(15), Some((3, 5)));
        assert_eq!(factorize(2 * 1000003), Some((2, 1000003)));
        assert_eq!(factorize(3), None);
    }
}
