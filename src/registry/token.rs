//! Session tokens
//!
//! A token is an opaque bearer credential. The registry only relies on
//! uniqueness; the generator hashes the client name with the current time and
//! a random digit suffix so tokens cannot be guessed from the name alone.

use std::borrow::Borrow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of the random digit suffix mixed into every token
const TOKEN_SUFFIX_DIGITS: usize = 8;

/// Opaque session credential
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(String);

impl Token {
    /// Wrap an existing token string
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh token for a client name
    pub fn generate(name: &str) -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let seed = format!(
            "{}_{}_{}",
            name,
            secs,
            random_digits(TOKEN_SUFFIX_DIGITS)
        );
        Self(sha256_hex(&seed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Token {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Hex-encoded SHA-256 digest of a string
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// String of `len` random decimal digits
pub fn random_digits(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("example"),
            "50d858e0985ecc7f60418aaf0cc5ab587f42c2570a884095a9e8ccacd0f6545c"
        );
    }

    #[test]
    fn test_random_digits_length() {
        for len in [0, 1, 5, 20] {
            let digits = random_digits(len);
            assert_eq!(digits.len(), len);
            assert!(digits.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let tokens: HashSet<Token> = (0..100).map(|_| Token::generate("Alice")).collect();
        assert_eq!(tokens.len(), 100);

        let token = tokens.into_iter().next().unwrap();
        assert_eq!(token.as_str().len(), 64);
    }

    #[test]
    fn test_token_borrows_as_str() {
        let mut set = HashSet::new();
        set.insert(Token::new("abc"));
        assert!(set.contains("abc"));
    }
}
