//! Authentication-token bookkeeping.
//!
//! A bidirectional token↔user map. Minting a token for a user implicitly
//! invalidates whatever token that user held before, so a stolen or stale
//! token dies the moment its owner logs in again.

use crate::core::token::AuthToken;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Default)]
struct Maps {
    by_token: HashMap<AuthToken, String>,
    by_user: HashMap<String, AuthToken>,
}

/// Mutex-guarded token store, shared across connection tasks.
#[derive(Default)]
pub struct AuthTokenStore {
    inner: Mutex<Maps>,
}

impl AuthTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint and store a fresh token for `user`, invalidating any previous
    /// token for that user.
    pub fn login(&self, user: &str) -> AuthToken {
        let token = AuthToken::generate();
        let mut maps = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = maps.by_user.insert(user.to_string(), token.clone()) {
            maps.by_token.remove(&previous);
            debug!(user, "previous session token invalidated");
        }
        maps.by_token.insert(token.clone(), user.to_string());
        token
    }

    /// The user a token belongs to, if it is current.
    pub fn user_for(&self, token: &AuthToken) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_token
            .get(token)
            .cloned()
    }

    /// Whether the token is a currently valid credential.
    pub fn matches(&self, token: &AuthToken) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_token
            .contains_key(token)
    }

    /// Drop a user's token, ending token-based session restoration.
    pub fn logout(&self, user: &str) {
        let mut maps = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = maps.by_user.remove(user) {
            maps.by_token.remove(&token);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn login_mints_matching_token() {
        let store = AuthTokenStore::new();
        let token = store.login("ada");
        assert!(store.matches(&token));
        assert_eq!(store.user_for(&token).as_deref(), Some("ada"));
    }

    #[test]
    fn second_login_invalidates_first_token() {
        let store = AuthTokenStore::new();
        let first = store.login("ada");
        let second = store.login("ada");
        assert!(!store.matches(&first));
        assert!(store.matches(&second));
        assert_eq!(store.user_for(&second).as_deref(), Some("ada"));
        assert_eq!(store.user_for(&first), None);
    }

    #[test]
    fn tokens_are_per_user() {
        let store = AuthTokenStore::new();
        let ada = store.login("ada");
        let bob = store.login("bob");
        assert_eq!(store.user_for(&ada).as_deref(), Some("ada"));
        assert_eq!(store.user_for(&bob).as_deref(), Some("bob"));
    }

    #[test]
    fn logout_drops_token() {
        let store = AuthTokenStore::new();
        let token = store.login("ada");
        store.logout("ada");
        assert!(!store.matches(&token));
    }

    #[test]
    fn unknown_token_never_matches() {
        let store = AuthTokenStore::new();
        store.login("ada");
        assert!(!store.matches(&AuthToken::generate()));
    }
}
