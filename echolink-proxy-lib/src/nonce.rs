//! Authentication nonce source.
//!
//! Sourced from `rand`'s thread-local CSPRNG rather than a hand-rolled
//! generator, the same `rand::rng()` entry point the load-balancer's
//! random-pick path uses elsewhere in this codebase's ancestry.

use rand::{rng, Rng};

/// Draws a uniformly distributed `u32` challenge nonce.
pub fn draw_nonce() -> u32 {
    rng().random::<u32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_vary() {
        let samples: Vec<u32> = (0..64).map(|_| draw_nonce()).collect();
        let unique: std::collections::HashSet<_> = samples.iter().collect();
        assert!(unique.len() > 1, "nonce source produced the same value every time");
    }
}
