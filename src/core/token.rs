use crate::core::error::{TrapError, TrapResult};
use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Characters a token may contain. Lowercase only; extraction normalizes.
pub const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Fixed token length, ~129 bits of entropy over the 36-char alphabet.
pub const TOKEN_LENGTH: usize = 25;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!("(?i)[a-z0-9]{{{}}}", TOKEN_LENGTH)).expect("static token pattern")
    })
}

/// The opaque honeytoken identifier. Immutable once generated; equality is
/// by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Draws 25 characters uniformly from the alphabet using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let value: String = (0..TOKEN_LENGTH)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect();
        Token(value)
    }

    /// Scans `haystack` for the first contiguous 25-char alphanumeric run,
    /// case-insensitive, and returns it lowercased. Surrounding protocol
    /// framing (dots, padding, mixed case) is ignored.
    pub fn extract(haystack: &str) -> TrapResult<Self> {
        token_pattern()
            .find(haystack)
            .map(|m| Token(m.as_str().to_ascii_lowercase()))
            .ok_or(TrapError::TokenNotFound)
    }

    /// Parses an exact token value, e.g. from the CLI or a config file.
    pub fn parse(value: &str) -> TrapResult<Self> {
        let lowered = value.to_ascii_lowercase();
        if lowered.len() == TOKEN_LENGTH && lowered.bytes().all(|b| TOKEN_ALPHABET.contains(&b)) {
            Ok(Token(lowered))
        } else {
            Err(TrapError::TokenNotFound)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_well_formed() {
        for _ in 0..32 {
            let token = Token::generate();
            assert_eq!(token.as_str().len(), TOKEN_LENGTH);
            assert!(token.as_str().bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn extract_recovers_token_from_hostname() {
        let token = Token::generate();
        let hostname = format!("u123.{}.canary.example.com", token);
        assert_eq!(Token::extract(&hostname).unwrap(), token);
    }

    #[test]
    fn extract_normalizes_case() {
        let hostname = "ABC12def34GHI56jkl78MNO90.example.com";
        let token = Token::extract(hostname).unwrap();
        assert_eq!(token.as_str(), "abc12def34ghi56jkl78mno90");
    }

    #[test]
    fn extract_takes_first_match() {
        let first = Token::generate();
        let second = Token::generate();
        let haystack = format!("x.{}.{}.example.com", first, second);
        assert_eq!(Token::extract(&haystack).unwrap(), first);
    }

    #[test]
    fn extract_fails_without_token_shaped_run() {
        assert!(matches!(
            Token::extract("www.example.com"),
            Err(TrapError::TokenNotFound)
        ));
        // 24 chars, one short
        assert!(Token::extract("abc12def34ghi56jkl78mno9").is_err());
    }

    #[test]
    fn parse_rejects_wrong_shape() {
        assert!(Token::parse("not-a-token").is_err());
        let token = Token::generate();
        assert_eq!(Token::parse(token.as_str()).unwrap(), token);
    }
}
