//! Token generator.
//!
//! Produces opaque per-agent bearer credentials: 256 bits of CSPRNG entropy,
//! encoded as RFC 4648 base32 without padding over the alphabet `[A-Z2-7]`.
//! The resulting 52-character string is valid both as an SSH username and as
//! an unescaped URL path segment. Token storage, revocation and lookup are
//! the external Validator's concern (see [`crate::adapters::TokenValidator`]);
//! this module only ever produces fresh tokens.

use data_encoding::{Encoding, Specification};
use rand::rngs::OsRng;
use rand::RngCore;

const TOKEN_ENTROPY_BYTES: usize = 32;

fn base32_nopad() -> Encoding {
    let mut spec = Specification::new();
    spec.symbols.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567");
    spec.encoding().expect("static base32 alphabet is valid")
}

/// Generate a fresh 52-character token over `[A-Z2-7]`.
///
/// Draws entropy from the OS CSPRNG. If the random source fails the process
/// is expected to abort rather than fall back to a weaker source (a
/// non-random token is never acceptable).
pub fn generate() -> String {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    base32_nopad().encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn token_matches_expected_shape() {
        let re_chars: Vec<char> = "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567".chars().collect();
        let token = generate();
        assert_eq!(token.len(), 52);
        assert!(token.chars().all(|c| re_chars.contains(&c)));
    }

    #[test]
    fn tokens_are_distinct_across_calls() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate()), "token collision within 1000 draws");
        }
    }
}
