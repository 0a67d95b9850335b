//! Registry error types

use super::token::Token;

/// Error type for registry operations
///
/// Registry operations never fail on business input; these variants are
/// programmer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The token is already registered to a session
    #[error("token already registered: {0}")]
    DuplicateToken(Token),
}
