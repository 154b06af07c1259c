//! Credential record store
//!
//! Persists account credentials and OAuth token state in a single JSON
//! file. Lookups accept the address or the display alias, both
//! case-insensitive. Writes go through a temp-file-then-rename sequence so
//! a concurrent reader never observes a partially written store; across
//! concurrent operations the last writer wins.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::Mutex;

use crate::config::ProviderEndpoints;
use crate::errors::{AppError, AppResult};

/// How a credential authenticates against the mail servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Static password or app passcode
    Password,
    /// OAuth bearer token with optional refresh token
    OAuthBearer,
}

/// Server endpoints captured on the record
///
/// Resolved from the provider table at login time, never user-supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// IMAP server hostname
    pub imap_host: String,
    /// IMAP server port (implicit TLS)
    pub imap_port: u16,
    /// Submission server hostname
    pub smtp_host: String,
    /// Submission server port
    pub smtp_port: u16,
    /// Whether submission uses implicit TLS (false means STARTTLS)
    pub smtp_implicit_tls: bool,
}

impl From<&ProviderEndpoints> for ServerSettings {
    fn from(endpoints: &ProviderEndpoints) -> Self {
        Self {
            imap_host: endpoints.imap_host.to_owned(),
            imap_port: endpoints.imap_port,
            smtp_host: endpoints.smtp_host.to_owned(),
            smtp_port: endpoints.smtp_port,
            smtp_implicit_tls: endpoints.smtp_implicit_tls,
        }
    }
}

/// One stored account credential
///
/// Exactly one record exists per unique address. `secret` is populated only
/// in `Password` mode; the token fields only in `OAuthBearer` mode. Secrets
/// use [`SecretString`] so accidental `Debug` logging stays redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Unique mailbox address (compared case-insensitively)
    pub address: String,
    /// Optional alias, usable as a lookup key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Authentication mode
    pub auth_mode: AuthMode,
    /// Password or app passcode (`Password` mode only)
    #[serde(
        default,
        serialize_with = "serialize_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub secret: Option<SecretString>,
    /// Current OAuth access token (`OAuthBearer` mode only)
    #[serde(
        default,
        serialize_with = "serialize_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_token: Option<SecretString>,
    /// OAuth refresh token; absent means expiry is terminal
    #[serde(
        default,
        serialize_with = "serialize_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token: Option<SecretString>,
    /// Access token expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
    /// Server endpoints derived from the provider table
    pub server: ServerSettings,
    /// False after an irrecoverable refresh failure (needs re-auth)
    pub active: bool,
    /// Whether this record is the process-wide default
    #[serde(default)]
    pub is_default: bool,
    /// Last successful authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_authenticated_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Whether `key` addresses this record (address or alias, case-insensitive)
    pub fn matches(&self, key: &str) -> bool {
        self.address.eq_ignore_ascii_case(key)
            || self
                .display_name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(key))
    }
}

/// Persisting secrets is this file's entire purpose; expose on write only.
fn serialize_secret<S: Serializer>(
    value: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// On-disk shape of the store file
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    accounts: Vec<CredentialRecord>,
}

/// JSON-file-backed account store
///
/// The record list is held in memory behind a mutex; every mutation
/// rewrites the whole file atomically.
#[derive(Debug)]
pub struct AccountStore {
    path: PathBuf,
    records: Mutex<Vec<CredentialRecord>>,
}

impl AccountStore {
    /// Open the store at `path`, creating an empty one if the file is absent
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the file exists but cannot be read or parsed.
    pub fn open(path: &Path) -> AppResult<Self> {
        let records = match std::fs::read(path) {
            Ok(bytes) => {
                let file: StoreFile = serde_json::from_slice(&bytes).map_err(|e| {
                    AppError::Internal(format!("credential store {} is corrupt: {e}", path.display()))
                })?;
                file.accounts
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(AppError::Internal(format!(
                    "cannot read credential store {}: {e}",
                    path.display()
                )));
            }
        };

        Ok(Self {
            path: path.to_owned(),
            records: Mutex::new(records),
        })
    }

    /// Look up a record by address or display alias
    pub async fn get(&self, key: &str) -> Option<CredentialRecord> {
        let records = self.records.lock().await;
        records.iter().find(|r| r.matches(key)).cloned()
    }

    /// The process-wide default record, if one is designated
    pub async fn get_default(&self) -> Option<CredentialRecord> {
        let records = self.records.lock().await;
        records.iter().find(|r| r.is_default).cloned()
    }

    /// Resolve an optional lookup key to a record
    ///
    /// `None` selects the default account.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key matches nothing or no default exists.
    pub async fn resolve(&self, key: Option<&str>) -> AppResult<CredentialRecord> {
        match key {
            Some(key) => self
                .get(key)
                .await
                .ok_or_else(|| AppError::NotFound(format!("no account matches '{key}'"))),
            None => self
                .get_default()
                .await
                .ok_or_else(|| AppError::NotFound("no default account configured".to_owned())),
        }
    }

    /// Insert or replace a record, keyed by address
    ///
    /// The first record ever stored becomes the default; marking a record
    /// default clears the flag everywhere else, so at most one default
    /// exists at any time.
    pub async fn upsert(&self, mut record: CredentialRecord) -> AppResult<()> {
        let mut records = self.records.lock().await;
        let existing = records
            .iter()
            .position(|r| r.address.eq_ignore_ascii_case(&record.address));

        if records.is_empty() {
            record.is_default = true;
        }
        if record.is_default {
            for other in records.iter_mut() {
                other.is_default = false;
            }
        } else if let Some(idx) = existing {
            // Replacing the current default keeps it the default.
            record.is_default = records[idx].is_default;
        }

        match existing {
            Some(idx) => records[idx] = record,
            None => records.push(record),
        }
        persist(&self.path, &records)
    }

    /// All stored records
    pub async fn list_all(&self) -> Vec<CredentialRecord> {
        self.records.lock().await.clone()
    }

    /// Remove a record by address
    ///
    /// If the removed record was the default, the first remaining record
    /// (if any) inherits the flag.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no record has that address.
    pub async fn remove(&self, address: &str) -> AppResult<()> {
        let mut records = self.records.lock().await;
        let idx = records
            .iter()
            .position(|r| r.address.eq_ignore_ascii_case(address))
            .ok_or_else(|| AppError::NotFound(format!("no account matches '{address}'")))?;
        let removed = records.remove(idx);
        if removed.is_default && let Some(first) = records.first_mut() {
            first.is_default = true;
        }
        persist(&self.path, &records)
    }

    /// Designate the record with `address` as the process-wide default
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no record has that address.
    pub async fn set_default(&self, address: &str) -> AppResult<()> {
        let mut records = self.records.lock().await;
        if !records
            .iter()
            .any(|r| r.address.eq_ignore_ascii_case(address))
        {
            return Err(AppError::NotFound(format!("no account matches '{address}'")));
        }
        for record in records.iter_mut() {
            record.is_default = record.address.eq_ignore_ascii_case(address);
        }
        persist(&self.path, &records)
    }

    /// Whether `key` resolves to a record that is active
    pub async fn validate(&self, key: &str) -> bool {
        let records = self.records.lock().await;
        records.iter().any(|r| r.matches(key) && r.active)
    }
}

/// Write the store file atomically (temp file + rename)
fn persist(path: &Path, records: &[CredentialRecord]) -> AppResult<()> {
    let file = StoreFile {
        accounts: records.to_vec(),
    };
    let bytes = serde_json::to_vec_pretty(&file)
        .map_err(|e| AppError::Internal(format!("cannot serialize credential store: {e}")))?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            AppError::Internal(format!("cannot create {}: {e}", parent.display()))
        })?;
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes)
        .map_err(|e| AppError::Internal(format!("cannot write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| AppError::Internal(format!("cannot replace {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{AccountStore, AuthMode, CredentialRecord, ServerSettings};

    fn record(address: &str) -> CredentialRecord {
        CredentialRecord {
            address: address.to_owned(),
            display_name: None,
            auth_mode: AuthMode::Password,
            secret: Some(SecretString::new("hunter2".into())),
            access_token: None,
            refresh_token: None,
            token_expiry: None,
            server: ServerSettings {
                imap_host: "imap.example.com".to_owned(),
                imap_port: 993,
                smtp_host: "smtp.example.com".to_owned(),
                smtp_port: 465,
                smtp_implicit_tls: true,
            },
            active: true,
            is_default: false,
            last_authenticated_at: None,
        }
    }

    #[tokio::test]
    async fn first_record_becomes_default_and_lookup_is_case_insensitive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::open(&dir.path().join("accounts.json")).expect("open");

        store.upsert(record("User@Example.com")).await.expect("upsert");
        let found = store.get("user@example.com").await.expect("found");
        assert!(found.is_default);
        assert!(store.validate("USER@EXAMPLE.COM").await);
        assert!(!store.validate("other@example.com").await);
    }

    #[tokio::test]
    async fn alias_lookup_and_at_most_one_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::open(&dir.path().join("accounts.json")).expect("open");

        let mut first = record("a@example.com");
        first.display_name = Some("Work".to_owned());
        store.upsert(first).await.expect("upsert a");
        store.upsert(record("b@example.com")).await.expect("upsert b");

        assert_eq!(
            store.get("work").await.expect("alias hit").address,
            "a@example.com"
        );

        store.set_default("b@example.com").await.expect("set default");
        let defaults: Vec<_> = store
            .list_all()
            .await
            .into_iter()
            .filter(|r| r.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].address, "b@example.com");
    }

    #[tokio::test]
    async fn store_survives_reopen_and_remove_promotes_new_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("accounts.json");

        {
            let store = AccountStore::open(&path).expect("open");
            store.upsert(record("a@example.com")).await.expect("upsert a");
            store.upsert(record("b@example.com")).await.expect("upsert b");
            store.remove("a@example.com").await.expect("remove");
        }

        let reopened = AccountStore::open(&path).expect("reopen");
        let all = reopened.list_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].address, "b@example.com");
        assert!(all[0].is_default);
    }

    #[tokio::test]
    async fn upsert_replaces_by_address_and_keeps_default_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::open(&dir.path().join("accounts.json")).expect("open");

        store.upsert(record("a@example.com")).await.expect("upsert");
        let mut updated = record("A@EXAMPLE.COM");
        updated.display_name = Some("Main".to_owned());
        store.upsert(updated).await.expect("replace");

        let all = store.list_all().await;
        assert_eq!(all.len(), 1);
        assert!(all[0].is_default);
        assert_eq!(all[0].display_name.as_deref(), Some("Main"));
    }

    #[tokio::test]
    async fn resolve_prefers_key_then_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::open(&dir.path().join("accounts.json")).expect("open");
        assert!(store.resolve(None).await.is_err());

        store.upsert(record("a@example.com")).await.expect("upsert");
        assert_eq!(
            store.resolve(None).await.expect("default").address,
            "a@example.com"
        );
        assert!(store.resolve(Some("missing@example.com")).await.is_err());
    }
}
