//! Recovery code generation and matching.
//!
//! Codes are two 10-character segments of unambiguous uppercase characters.
//! The set is stored as an encrypted JSON array; a used code is removed from
//! the set, never marked.

use anyhow::{Context, Result};
use rand::Rng;
use rand::rngs::OsRng;

pub const RECOVERY_CODE_COUNT: usize = 8;
const SEGMENT_LEN: usize = 10;

// 0/O and 1/I excluded.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

fn segment() -> String {
    let mut rng = OsRng;
    (0..SEGMENT_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            char::from(ALPHABET[idx])
        })
        .collect()
}

/// Generate a fresh recovery set.
#[must_use]
pub fn generate_codes() -> Vec<String> {
    (0..RECOVERY_CODE_COUNT)
        .map(|_| format!("{}-{}", segment(), segment()))
        .collect()
}

/// Canonical form for comparison: uppercased, whitespace stripped.
#[must_use]
pub fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Serialize a set for encryption at rest.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode_set(codes: &[String]) -> Result<Vec<u8>> {
    serde_json::to_vec(codes).context("failed to encode recovery codes")
}

/// # Errors
/// Returns an error if the stored bytes are not a valid code set.
pub fn decode_set(bytes: &[u8]) -> Result<Vec<String>> {
    serde_json::from_slice(bytes).context("failed to decode recovery codes")
}

/// Remove `presented` from the set if it matches. Returns the updated set,
/// or `None` when no code matched.
#[must_use]
pub fn consume(codes: &[String], presented: &str) -> Option<Vec<String>> {
    let wanted = normalize(presented);
    let position = codes.iter().position(|code| normalize(code) == wanted)?;
    let mut remaining = codes.to_vec();
    remaining.remove(position);
    Some(remaining)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generates_a_full_distinct_set() {
        let codes = generate_codes();
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        for code in &codes {
            let (a, b) = code.split_once('-').unwrap();
            assert_eq!(a.len(), SEGMENT_LEN);
            assert_eq!(b.len(), SEGMENT_LEN);
            assert!(!code.contains('0') && !code.contains('O'));
            assert!(!code.contains('1') && !code.contains('I'));
        }
        let mut unique = codes.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn set_round_trips_through_json() {
        let codes = generate_codes();
        let encoded = encode_set(&codes).unwrap();
        assert_eq!(decode_set(&encoded).unwrap(), codes);
    }

    #[test]
    fn consume_is_case_and_whitespace_insensitive() {
        let codes = vec!["ABCDEFGHJK-LMNPQRSTUV".to_string()];
        let remaining = consume(&codes, " abcdefghjk-lmnpqrstuv ").unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn consume_removes_only_the_matched_code() {
        let codes = generate_codes();
        let remaining = consume(&codes, &codes[3]).unwrap();
        assert_eq!(remaining.len(), RECOVERY_CODE_COUNT - 1);
        assert!(!remaining.contains(&codes[3]));

        assert!(consume(&remaining, &codes[3]).is_none());
        assert!(consume(&codes, "NOTACODE99-NOTACODE99").is_none());
    }
}
