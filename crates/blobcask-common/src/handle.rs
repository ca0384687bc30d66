//! Short-handle generation
//!
//! Derives a short printable identifier deterministically from a seed
//! string. The seed is MD5-hexed; each 8-hex-digit section yields one
//! candidate, first as a 6-character word from its low 30 bits, then as
//! an 8-character word from the full 32 bits. A collision-avoidance
//! callback vets each candidate; the default accepts the first one.

use crate::error::{Error, Result};

/// Alphanumeric charset used for handle characters
const CHARSET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Callback deciding whether a candidate handle is acceptable
pub type AcceptFn = dyn Fn(&str, &str) -> bool + Send + Sync;

/// Deterministic short-handle generator
pub struct HandleGen {
    accept: Box<AcceptFn>,
}

impl Default for HandleGen {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleGen {
    /// Generator that accepts the first candidate
    #[must_use]
    pub fn new() -> Self {
        Self {
            accept: Box::new(|_, _| true),
        }
    }

    /// Generator with a custom collision-avoidance callback
    ///
    /// The callback receives `(seed, candidate)` and returns whether the
    /// candidate may be used.
    pub fn with_validator(accept: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            accept: Box::new(accept),
        }
    }

    /// Generate a short handle for the given seed
    ///
    /// Fails with `InvalidArgument` for an empty seed and with
    /// `InvalidArgument` if every candidate is rejected by the callback.
    pub fn generate(&self, seed: &str) -> Result<String> {
        if seed.is_empty() {
            return Err(Error::invalid_argument("empty handle seed"));
        }

        let digest = format!("{:x}", md5::compute(seed.as_bytes()));

        // Four 8-hex-digit sections per MD5 digest.
        for section in digest.as_bytes().chunks_exact(8) {
            let bits = parse_section(section)?;
            let word = encode(u64::from(bits & 0x3FFF_FFFF), 6);
            if (self.accept)(seed, &word) {
                return Ok(word);
            }
        }
        for section in digest.as_bytes().chunks_exact(8) {
            let bits = parse_section(section)?;
            let word = encode(u64::from(bits), 8);
            if (self.accept)(seed, &word) {
                return Ok(word);
            }
        }

        Err(Error::invalid_argument(format!(
            "no acceptable handle for seed {seed:?}"
        )))
    }
}

fn parse_section(section: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(section)
        .map_err(|_| Error::corrupt("non-ascii md5 digest section"))?;
    u32::from_str_radix(text, 16).map_err(|_| Error::corrupt("non-hex md5 digest section"))
}

/// Base-62 decompose `bits` into exactly `len` characters
fn encode(mut bits: u64, len: usize) -> String {
    let mut word = String::with_capacity(len);
    for _ in 0..len {
        let idx = (bits % 62) as usize;
        word.push(CHARSET[idx] as char);
        bits /= 62;
    }
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let generator = HandleGen::new();
        let a = generator.generate("17:1700000000000000000").unwrap();
        let b = generator.generate("17:1700000000000000000").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_length_and_charset() {
        let generator = HandleGen::new();
        for seed in ["1:1", "2:99", "3:12345678901234567890"] {
            let handle = generator.generate(seed).unwrap();
            assert_eq!(handle.len(), 6);
            assert!(handle.bytes().all(|b| CHARSET.contains(&b)));
        }
    }

    #[test]
    fn test_distinct_seeds_differ() {
        let generator = HandleGen::new();
        let a = generator.generate("1:1700000000000000000").unwrap();
        let b = generator.generate("2:1700000000000000001").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_seed_rejected() {
        assert!(HandleGen::new().generate("").is_err());
    }

    #[test]
    fn test_validator_falls_through_sections() {
        // Reject 6-char candidates; the 8-char fallback must kick in.
        let generator = HandleGen::with_validator(|_, candidate| candidate.len() == 8);
        let handle = generator.generate("42:1234").unwrap();
        assert_eq!(handle.len(), 8);
    }

    #[test]
    fn test_validator_rejecting_all_errors() {
        let generator = HandleGen::with_validator(|_, _| false);
        assert!(generator.generate("42:1234").is_err());
    }
}
