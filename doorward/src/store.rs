//! File-backed credential store.
//!
//! The backing file is a JSON object mapping usernames to records
//! (`{"alice": {"enabled": true, "tags": ["admin"], "password": "..."}}`).
//! Every mutation is a whole-set read-modify-write: the full record set is
//! serialized to a temporary file and renamed into place, and the in-memory
//! view is replaced only after the write succeeded. Mutations are serialized
//! behind the write half of an `RwLock`, so concurrent administrative writes
//! cannot interleave.
//!
//! An unreadable or unparseable file at startup is fatal (`load` fails and the
//! process refuses to start); a failed write is surfaced to the caller.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::auth::password;
use crate::errors::{Error, Result};

/// An authenticated user's record: credentials, enablement, role tags.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub username: String,
    pub enabled: bool,
    pub tags: Vec<String>,
    /// Stored password: a hash descriptor, or legacy plaintext. Skipped during
    /// serialization so it can never leak into a rendered page.
    #[serde(skip_serializing)]
    pub password: String,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.tags.iter().any(|tag| tag == "admin")
    }
}

/// Replacement data for a create or update.
#[derive(Debug, Clone)]
pub struct UserData {
    pub enabled: bool,
    pub tags: Vec<String>,
    pub password: String,
}

/// On-disk record. The username is the map key and is attached on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredUser {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    password: String,
}

fn identity(username: &str, record: &StoredUser) -> Identity {
    Identity {
        username: username.to_string(),
        enabled: record.enabled,
        tags: record.tags.clone(),
        password: record.password.clone(),
    }
}

pub struct UserStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, StoredUser>>,
}

impl UserStore {
    /// Load the store from disk. Failure here is fatal for the process: the
    /// gateway cannot serve requests without a readable, parseable user set.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to load user database {}", path.display()))?;
        let records: BTreeMap<String, StoredUser> =
            serde_json::from_str(&raw).with_context(|| format!("invalid user database {}, please fix manually", path.display()))?;

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Exact-key lookup.
    pub async fn get(&self, username: &str) -> Option<Identity> {
        let records = self.records.read().await;
        records.get(username).map(|record| identity(username, record))
    }

    /// All records, sorted by case-insensitive, whitespace-trimmed username.
    pub async fn list(&self) -> Vec<Identity> {
        let records = self.records.read().await;
        let mut users: Vec<Identity> = records.iter().map(|(username, record)| identity(username, record)).collect();
        users.sort_by(|a, b| {
            a.username
                .trim()
                .to_lowercase()
                .cmp(&b.username.trim().to_lowercase())
        });
        users
    }

    /// Verify a username/password pair.
    ///
    /// Rejected when the user is unknown, disabled, has no password, or the
    /// password fails verification.
    pub async fn authenticate(&self, username: &str, plaintext: &str) -> Result<Option<Identity>> {
        let Some(user) = self.get(username).await else {
            return Ok(None);
        };
        if !user.enabled || user.password.is_empty() {
            return Ok(None);
        }

        // Argon2 verification is CPU-heavy; keep it off the async runtime.
        let stored = user.password.clone();
        let supplied = plaintext.to_string();
        let valid = tokio::task::spawn_blocking(move || password::verify_password(&supplied, &stored))
            .await
            .map_err(|e| Error::Internal {
                operation: format!("spawn password verification task: {e}"),
            })??;

        Ok(valid.then_some(user))
    }

    /// Insert a record, deriving a fresh salted hash from the plaintext
    /// password. Uniqueness is the caller's concern; an existing record with
    /// the same username is replaced.
    pub async fn create(&self, username: &str, mut data: UserData) -> Result<()> {
        data.password = hash_plaintext(data.password).await?;
        self.write_record(username, data).await
    }

    /// Replace a record. A password already in descriptor form is persisted
    /// verbatim; anything else is treated as new plaintext and re-derived with
    /// a fresh salt.
    pub async fn update(&self, username: &str, mut data: UserData) -> Result<()> {
        if !password::is_descriptor(&data.password) {
            data.password = hash_plaintext(data.password).await?;
        }
        self.write_record(username, data).await
    }

    /// Remove a record.
    pub async fn delete(&self, username: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let mut next = records.clone();
        next.remove(username);
        self.persist(&next).await?;
        *records = next;
        Ok(())
    }

    async fn write_record(&self, username: &str, data: UserData) -> Result<()> {
        let mut records = self.records.write().await;
        let mut next = records.clone();
        next.insert(
            username.to_string(),
            StoredUser {
                enabled: data.enabled,
                tags: data.tags,
                password: data.password,
            },
        );
        self.persist(&next).await?;
        *records = next;
        Ok(())
    }

    async fn persist(&self, records: &BTreeMap<String, StoredUser>) -> Result<()> {
        let json = serde_json::to_string_pretty(records).map_err(|e| Error::Internal {
            operation: format!("serialize user database: {e}"),
        })?;

        // Write-then-rename keeps the database whole if the process dies mid-write.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(Error::StorePersist)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(Error::StorePersist)?;
        Ok(())
    }
}

async fn hash_plaintext(plaintext: String) -> Result<String> {
    tokio::task::spawn_blocking(move || password::hash_password(&plaintext))
        .await
        .map_err(|e| Error::Internal {
            operation: format!("spawn password hashing task: {e}"),
        })?
}
