use async_trait::async_trait;
use num_bigint::BigUint;
use pylon_crypto::prime;

use super::{DhPrimeSource, Result, StoreError};

/// Always hands out the same vetted prime.
#[derive(Clone, Debug)]
pub struct FixedDhPrime(BigUint);

impl FixedDhPrime {
    pub fn new(prime: BigUint) -> Self {
        Self(prime)
    }
}

impl Default for FixedDhPrime {
    /// The 2048-bit prime Telegram's own servers use.
    fn default() -> Self {
        Self(prime::telegram_dh_prime())
    }
}

#[async_trait]
impl DhPrimeSource for FixedDhPrime {
    async fn next_prime(&self) -> Result<BigUint> {
        Ok(self.0.clone())
    }
}

/// Generates a fresh safe prime per request on the blocking pool.
///
/// A 2048-bit safe prime can take minutes; meant for development and
/// tests with small widths.
#[derive(Clone, Copy, Debug)]
pub struct GeneratedDhPrimes {
    bits: u64,
}

impl GeneratedDhPrimes {
    pub fn new(bits: u64) -> Self {
        Self { bits }
    }
}

#[async_trait]
impl DhPrimeSource for GeneratedDhPrimes {
    async fn next_prime(&self) -> Result<BigUint> {
        let bits = self.bits;
        log::debug!("[dh] generating a {bits}-bit safe prime");
        tokio::task::spawn_blocking(move || prime::generate_safe_prime(bits))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::Backend(format!("cannot generate a {bits}-bit safe prime")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_is_the_telegram_prime() {
        let p = FixedDhPrime::default().next_prime().await.unwrap();
        assert_eq!(p.bits(), 2048);
        assert_eq!(prime::good_generators(&p), vec![3, 4, 7]);
    }

    #[tokio::test]
    async fn generated_primes_are_safe() {
        let source = GeneratedDhPrimes::new(64);
        let p = source.next_prime().await.unwrap();
        assert_eq!(p.bits(), 64);
        assert!(prime::is_safe_prime(&p));
        assert!(GeneratedDhPrimes::new(4).next_prime().await.is_err());
    }
}
