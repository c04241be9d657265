//! Identity collaborator seam.
//!
//! Credential issuance lives outside this crate; the sync core only needs
//! to resolve an opaque handshake token to a stable account id before a
//! connection may join its account's channel. Deployments plug their own
//! verifier; [`TokenRegistry`] is the in-memory implementation used by
//! tests and single-process setups.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

/// Resolves an opaque connection token to an account id.
pub trait IdentityProvider: Send + Sync {
    fn verify(&self, token: &str) -> Result<Uuid, IdentityError>;
}

/// Identity verification failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    Unauthenticated,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "not authenticated"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// In-memory token table: `token → account_id`.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<String, Uuid>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token for an account.
    pub fn issue(&self, account_id: Uuid) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.insert(token.clone(), account_id);
        token
    }

    /// Register an externally chosen token.
    pub fn insert(&self, token: String, account_id: Uuid) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.insert(token, account_id);
    }

    /// Invalidate a token. Returns whether it existed.
    pub fn revoke(&self, token: &str) -> bool {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.remove(token).is_some()
    }
}

impl IdentityProvider for TokenRegistry {
    fn verify(&self, token: &str) -> Result<Uuid, IdentityError> {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens
            .get(token)
            .copied()
            .ok_or(IdentityError::Unauthenticated)
    }
}
