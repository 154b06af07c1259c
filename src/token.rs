//! OAuth token lifecycle management
//!
//! Every network operation on an OAuth account goes through
//! [`TokenManager::ensure_usable`] first: a token expiring within the skew
//! window is refreshed and persisted before the connection opens, so an
//! operation never fails mid-flight on a stale credential. Refresh runs an
//! ordered strategy chain: the configured remote refresh endpoint first,
//! then the provider's own token endpoint with process-wide client
//! credentials. Only after every strategy is exhausted does the failure
//! surface as `AuthExpired`.
//!
//! Races between two operations refreshing the same record are not
//! serialized; the last writer to the store wins. Refresh is per-record,
//! so no cross-record coordination exists either.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{Settings, endpoints_for_address};
use crate::errors::{AppError, AppResult};
use crate::store::{AccountStore, AuthMode, CredentialRecord};

/// Tokens expiring within this window count as stale
const REFRESH_SKEW_MINUTES: i64 = 5;
/// Sweep threshold: expiry this far in the past marks a record for refresh
const SWEEP_STALE_MINUTES: i64 = 55;
/// Fallback token lifetime when a refresh response omits the expiry
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3_600;

/// Gates every network operation on a live, valid credential
pub struct TokenManager {
    settings: Arc<Settings>,
    store: Arc<AccountStore>,
    http: reqwest::Client,
}

/// Response of the remote refresh endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteRefreshResponse {
    #[serde(default)]
    success: Option<bool>,
    access_token: Option<String>,
    expires_at: Option<ExpiresAt>,
    refresh_token: Option<String>,
}

/// The endpoint reports expiry either as RFC 3339 or epoch milliseconds
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresAt {
    Rfc3339(DateTime<Utc>),
    EpochMillis(i64),
}

/// Response of a standard OAuth token endpoint
#[derive(Debug, Deserialize)]
struct ProviderRefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

/// Tokens produced by a successful refresh strategy
struct FreshTokens {
    access_token: SecretString,
    expiry: DateTime<Utc>,
    refresh_token: Option<SecretString>,
}

impl TokenManager {
    /// Create a manager with a bounded-timeout HTTP client
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the HTTP client cannot be constructed.
    pub fn new(settings: Arc<Settings>, store: Arc<AccountStore>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.refresh_http_timeout_ms))
            .build()
            .map_err(|e| AppError::Internal(format!("cannot build http client: {e}")))?;
        Ok(Self {
            settings,
            store,
            http,
        })
    }

    /// Return a record guaranteed usable for the next network operation
    ///
    /// Password-mode records pass through untouched (no expiry concept).
    /// OAuth records with more than the skew window of lifetime left pass
    /// through without any network call; anything staler is refreshed and
    /// the updated record persisted before it is returned.
    ///
    /// # Errors
    ///
    /// Returns `AuthExpired` when the record is disabled, has no refresh
    /// token, or every refresh strategy failed.
    pub async fn ensure_usable(&self, record: CredentialRecord) -> AppResult<CredentialRecord> {
        if record.auth_mode != AuthMode::OAuthBearer {
            return Ok(record);
        }
        if !record.active {
            return Err(AppError::AuthExpired(format!(
                "account '{}' is disabled after repeated refresh failures",
                record.address
            )));
        }

        let fresh_until = Utc::now() + ChronoDuration::minutes(REFRESH_SKEW_MINUTES);
        if record
            .token_expiry
            .is_some_and(|expiry| expiry > fresh_until)
        {
            return Ok(record);
        }

        self.refresh_and_persist(record).await
    }

    /// Scan all records and refresh long-expired tokens
    ///
    /// Runs at process start and optionally on an interval. A record whose
    /// refresh is exhausted is soft-disabled (`active = false`, never
    /// deleted) so later lookups report a clear needs-re-auth status
    /// instead of failing connection after connection.
    pub async fn sweep(&self) {
        let stale_before = Utc::now() - ChronoDuration::minutes(SWEEP_STALE_MINUTES);
        for record in self.store.list_all().await {
            if record.auth_mode != AuthMode::OAuthBearer || !record.active {
                continue;
            }
            let stale = match record.token_expiry {
                Some(expiry) => expiry < stale_before,
                None => true,
            };
            if !stale {
                continue;
            }

            let address = record.address.clone();
            match self.refresh_and_persist(record).await {
                Ok(_) => info!(account = %address, "stale token refreshed during sweep"),
                Err(e) => {
                    warn!(account = %address, error = %e, "refresh exhausted; disabling account until re-auth");
                    self.disable(&address).await;
                }
            }
        }
    }

    async fn disable(&self, address: &str) {
        if let Some(mut record) = self.store.get(address).await {
            record.active = false;
            if let Err(e) = self.store.upsert(record).await {
                warn!(account = %address, error = %e, "failed to persist disabled state");
            }
        }
    }

    async fn refresh_and_persist(&self, mut record: CredentialRecord) -> AppResult<CredentialRecord> {
        let Some(refresh_token) = record.refresh_token.clone() else {
            return Err(AppError::AuthExpired(format!(
                "access token for '{}' expired and no refresh token is stored",
                record.address
            )));
        };

        let tokens = self.run_refresh_chain(&record, &refresh_token).await?;
        record.access_token = Some(tokens.access_token);
        record.token_expiry = Some(tokens.expiry);
        if let Some(rotated) = tokens.refresh_token {
            record.refresh_token = Some(rotated);
        }
        record.last_authenticated_at = Some(Utc::now());
        self.store.upsert(record.clone()).await?;
        Ok(record)
    }

    /// Try each refresh strategy in order; first success wins
    async fn run_refresh_chain(
        &self,
        record: &CredentialRecord,
        refresh_token: &SecretString,
    ) -> AppResult<FreshTokens> {
        let mut failures: Vec<String> = Vec::new();

        match self.refresh_via_endpoint(record, refresh_token).await {
            Ok(Some(tokens)) => return Ok(tokens),
            Ok(None) => {}
            Err(e) => {
                debug!(account = %record.address, error = %e, "remote refresh endpoint failed; trying provider");
                failures.push(e.to_string());
            }
        }

        match self.refresh_via_provider(record, refresh_token).await {
            Ok(Some(tokens)) => return Ok(tokens),
            Ok(None) => {}
            Err(e) => {
                debug!(account = %record.address, error = %e, "provider token refresh failed");
                failures.push(e.to_string());
            }
        }

        let detail = if failures.is_empty() {
            "no refresh strategy is configured".to_owned()
        } else {
            failures.join("; ")
        };
        Err(AppError::AuthExpired(format!(
            "token refresh for '{}' exhausted: {detail}",
            record.address
        )))
    }

    /// Strategy 1: the configured remote refresh endpoint
    ///
    /// Returns `Ok(None)` when no endpoint is configured.
    async fn refresh_via_endpoint(
        &self,
        record: &CredentialRecord,
        refresh_token: &SecretString,
    ) -> AppResult<Option<FreshTokens>> {
        let Some(endpoint) = &self.settings.refresh_endpoint else {
            return Ok(None);
        };

        let response = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({
                "address": record.address,
                "refreshToken": refresh_token.expose_secret(),
            }))
            .send()
            .await
            .map_err(|e| {
                AppError::ConnectionFailed(format!("refresh endpoint unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            return Err(AppError::AuthExpired(format!(
                "refresh endpoint returned {}",
                response.status()
            )));
        }

        let payload: RemoteRefreshResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("malformed refresh payload: {e}")))?;
        if payload.success == Some(false) {
            return Err(AppError::AuthExpired(
                "refresh endpoint reported failure".to_owned(),
            ));
        }

        let access = payload
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AppError::Internal("refresh payload missing accessToken".to_owned()))?;
        let expiry = match payload.expires_at {
            Some(ExpiresAt::Rfc3339(at)) => at,
            Some(ExpiresAt::EpochMillis(ms)) => DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| AppError::Internal(format!("refresh payload expiry {ms} out of range")))?,
            None => Utc::now() + ChronoDuration::seconds(DEFAULT_TOKEN_LIFETIME_SECS),
        };

        Ok(Some(FreshTokens {
            access_token: SecretString::new(access.into()),
            expiry,
            refresh_token: payload
                .refresh_token
                .filter(|token| !token.is_empty())
                .map(|token| SecretString::new(token.into())),
        }))
    }

    /// Strategy 2: the provider's own token endpoint
    ///
    /// Returns `Ok(None)` when client credentials are missing or the
    /// provider has no known token endpoint.
    async fn refresh_via_provider(
        &self,
        record: &CredentialRecord,
        refresh_token: &SecretString,
    ) -> AppResult<Option<FreshTokens>> {
        let (Some(client_id), Some(client_secret)) = (
            &self.settings.oauth_client_id,
            &self.settings.oauth_client_secret,
        ) else {
            return Ok(None);
        };

        let token_url = match &self.settings.oauth_token_url {
            Some(url) => url.clone(),
            None => match endpoints_for_address(&record.address)
                .ok()
                .and_then(|endpoints| endpoints.token_url)
            {
                Some(url) => url.to_owned(),
                None => return Ok(None),
            },
        };

        let params = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.expose_secret()),
            ("refresh_token", refresh_token.expose_secret()),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .http
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                AppError::ConnectionFailed(format!("provider token endpoint unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            return Err(AppError::AuthExpired(format!(
                "provider token endpoint returned {}",
                response.status()
            )));
        }

        let payload: ProviderRefreshResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("malformed provider token payload: {e}")))?;

        Ok(Some(FreshTokens {
            access_token: SecretString::new(payload.access_token.into()),
            expiry: Utc::now()
                + ChronoDuration::seconds(
                    payload.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
                ),
            refresh_token: payload
                .refresh_token
                .filter(|token| !token.is_empty())
                .map(|token| SecretString::new(token.into())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, Utc};
    use secrecy::{ExposeSecret, SecretString};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::TokenManager;
    use crate::config::Settings;
    use crate::errors::AppError;
    use crate::store::{AccountStore, AuthMode, CredentialRecord, ServerSettings};

    fn settings() -> Settings {
        Settings {
            store_path: "unused.json".into(),
            refresh_endpoint: None,
            oauth_client_id: None,
            oauth_client_secret: None,
            oauth_token_url: None,
            connect_timeout_ms: 30_000,
            op_timeout_ms: 30_000,
            logout_timeout_ms: 3_000,
            smtp_connect_timeout_ms: 60_000,
            smtp_socket_timeout_ms: 60_000,
            refresh_http_timeout_ms: 5_000,
            tls_insecure: false,
            sweep_interval_secs: 0,
        }
    }

    fn oauth_record(expiry_offset_minutes: i64, with_refresh_token: bool) -> CredentialRecord {
        CredentialRecord {
            address: "user@gmail.com".to_owned(),
            display_name: None,
            auth_mode: AuthMode::OAuthBearer,
            secret: None,
            access_token: Some(SecretString::new("old-access".into())),
            refresh_token: with_refresh_token.then(|| SecretString::new("refresh-1".into())),
            token_expiry: Some(Utc::now() + ChronoDuration::minutes(expiry_offset_minutes)),
            server: ServerSettings {
                imap_host: "imap.gmail.com".to_owned(),
                imap_port: 993,
                smtp_host: "smtp.gmail.com".to_owned(),
                smtp_port: 465,
                smtp_implicit_tls: true,
            },
            active: true,
            is_default: true,
            last_authenticated_at: None,
        }
    }

    fn make_manager(settings: Settings, store_path: &Path) -> (TokenManager, Arc<AccountStore>) {
        let store = Arc::new(AccountStore::open(store_path).expect("open store"));
        let manager =
            TokenManager::new(Arc::new(settings), Arc::clone(&store)).expect("build manager");
        (manager, store)
    }

    /// Serve canned HTTP responses, one per accepted connection
    async fn spawn_http(responses: Vec<(&'static str, String)>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 16 * 1024];
                let mut total = 0;
                loop {
                    let Ok(n) = socket.read(&mut buf[total..]).await else {
                        break;
                    };
                    if n == 0 {
                        break;
                    }
                    total += n;
                    let text = String::from_utf8_lossy(&buf[..total]).into_owned();
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let content_length = text
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .and_then(|v| v.trim().parse::<usize>().ok())
                            })
                            .unwrap_or(0);
                        if total >= header_end + 4 + content_length {
                            break;
                        }
                    }
                    if total == buf.len() {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn password_records_bypass_the_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = make_manager(settings(), &dir.path().join("accounts.json"));

        let mut record = oauth_record(-120, true);
        record.auth_mode = AuthMode::Password;
        record.access_token = None;
        record.refresh_token = None;
        record.token_expiry = None;
        record.secret = Some(SecretString::new("pw".into()));

        let out = manager.ensure_usable(record).await.expect("usable");
        assert_eq!(out.auth_mode, AuthMode::Password);
    }

    #[tokio::test]
    async fn fresh_token_returns_unchanged_without_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        // No refresh endpoint and no client credentials: any refresh
        // attempt would fail, so success proves none happened.
        let (manager, _) = make_manager(settings(), &dir.path().join("accounts.json"));

        let record = oauth_record(10, true);
        let before_expiry = record.token_expiry;
        let out = manager.ensure_usable(record).await.expect("usable");
        assert_eq!(out.token_expiry, before_expiry);
        assert_eq!(out.access_token.expect("token").expose_secret(), "old-access");
    }

    #[tokio::test]
    async fn expired_without_refresh_token_is_auth_expired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, _) = make_manager(settings(), &dir.path().join("accounts.json"));

        let err = manager
            .ensure_usable(oauth_record(-10, false))
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn remote_endpoint_refresh_updates_and_persists_tokens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = spawn_http(vec![(
            "200 OK",
            r#"{"success":true,"accessToken":"new-access","expiresAt":4102444800000,"refreshToken":"refresh-2"}"#.to_owned(),
        )])
        .await;

        let mut cfg = settings();
        cfg.refresh_endpoint = Some(endpoint);
        let (manager, store) = make_manager(cfg, &dir.path().join("accounts.json"));
        let record = oauth_record(-10, true);
        let old_expiry = record.token_expiry.expect("expiry");
        store.upsert(record.clone()).await.expect("seed store");

        let out = manager.ensure_usable(record).await.expect("refreshed");
        assert!(out.token_expiry.expect("expiry") > old_expiry);
        assert_eq!(out.access_token.expect("token").expose_secret(), "new-access");
        assert_eq!(
            out.refresh_token.expect("rotated").expose_secret(),
            "refresh-2"
        );

        let persisted = store.get("user@gmail.com").await.expect("stored");
        assert_eq!(
            persisted.access_token.expect("token").expose_secret(),
            "new-access"
        );
    }

    #[tokio::test]
    async fn failed_endpoint_falls_back_to_provider_token_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = spawn_http(vec![("500 Internal Server Error", "{}".to_owned())]).await;
        let provider = spawn_http(vec![(
            "200 OK",
            r#"{"access_token":"provider-access","expires_in":3600,"token_type":"Bearer"}"#
                .to_owned(),
        )])
        .await;

        let mut cfg = settings();
        cfg.refresh_endpoint = Some(endpoint);
        cfg.oauth_client_id = Some("client-id".to_owned());
        cfg.oauth_client_secret = Some(SecretString::new("client-secret".into()));
        cfg.oauth_token_url = Some(provider);
        let (manager, store) = make_manager(cfg, &dir.path().join("accounts.json"));
        let record = oauth_record(-10, true);
        store.upsert(record.clone()).await.expect("seed store");

        let out = manager.ensure_usable(record).await.expect("fell back");
        assert_eq!(
            out.access_token.expect("token").expose_secret(),
            "provider-access"
        );
        assert!(out.token_expiry.expect("expiry") > Utc::now());
    }

    #[tokio::test]
    async fn exhausted_strategies_surface_auth_expired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = spawn_http(vec![(
            "200 OK",
            r#"{"success":false}"#.to_owned(),
        )])
        .await;

        let mut cfg = settings();
        cfg.refresh_endpoint = Some(endpoint);
        let (manager, _) = make_manager(cfg, &dir.path().join("accounts.json"));

        let err = manager
            .ensure_usable(oauth_record(-10, true))
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn sweep_disables_record_after_exhausted_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, store) = make_manager(settings(), &dir.path().join("accounts.json"));

        // Expired for hours, refresh token present but no strategy
        // configured: the sweep must soft-disable, not delete.
        let record = oauth_record(-120, true);
        store.upsert(record).await.expect("seed store");

        manager.sweep().await;

        let after = store.get("user@gmail.com").await.expect("still stored");
        assert!(!after.active);
        assert!(!store.validate("user@gmail.com").await);
    }

    #[tokio::test]
    async fn sweep_leaves_recent_tokens_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (manager, store) = make_manager(settings(), &dir.path().join("accounts.json"));

        // Expired, but not past the staleness horizon: not swept.
        let record = oauth_record(-30, true);
        store.upsert(record).await.expect("seed store");

        manager.sweep().await;

        let after = store.get("user@gmail.com").await.expect("still stored");
        assert!(after.active);
    }
}
