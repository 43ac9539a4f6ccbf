//! Process-wide session registry.
//!
//! Sessions are opaque random ids mapped to usernames. The username is a weak
//! reference, never a cached identity: every resolution re-fetches the current
//! record from the credential store, so a deleted or disabled user loses all
//! existing sessions on their next request (lazy invalidation: there is no
//! sweeper and no expiry timer). The registry lives in `AppState` and dies
//! with the process.

use dashmap::DashMap;

use crate::auth::password;
use crate::store::{Identity, UserStore};

#[derive(Debug, Clone)]
struct Session {
    username: String,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a username and return its opaque id.
    pub fn create(&self, username: &str) -> String {
        let id = password::generate_session_id();
        self.sessions.insert(
            id.clone(),
            Session {
                username: username.to_string(),
            },
        );
        id
    }

    /// Resolve a session id into a usable identity.
    ///
    /// Returns the current identity only while it exists and is enabled;
    /// otherwise the stale session entry is evicted and resolution fails.
    pub async fn resolve(&self, id: &str, store: &UserStore) -> Option<Identity> {
        let username = self.sessions.get(id)?.username.clone();

        match store.get(&username).await {
            Some(user) if user.enabled => Some(user),
            _ => {
                self.sessions.remove(id);
                None
            }
        }
    }

    /// Remove a session unconditionally.
    pub fn destroy(&self, id: &str) {
        self.sessions.remove(id);
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
