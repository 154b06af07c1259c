//! Process configuration and provider endpoint table
//!
//! All configuration is loaded from environment variables following the
//! pattern `MAIL_BRIDGE_<KEY>`. Account credentials live in the JSON store
//! (see [`crate::store`]); this module only holds process-wide settings and
//! the static provider-to-server lookup table.

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Process-wide settings
///
/// Cloned into tool handlers via `Arc` for thread-safe shared access.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the JSON credential store
    pub store_path: PathBuf,
    /// Optional remote token-refresh endpoint (tried before the provider)
    pub refresh_endpoint: Option<String>,
    /// OAuth client id for direct provider token refresh
    pub oauth_client_id: Option<String>,
    /// OAuth client secret for direct provider token refresh
    pub oauth_client_secret: Option<SecretString>,
    /// Override for the provider token endpoint (primarily for tests)
    pub oauth_token_url: Option<String>,
    /// TCP connect + TLS handshake budget in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-operation (fetch, search, select) budget in milliseconds
    pub op_timeout_ms: u64,
    /// Graceful logout budget in milliseconds; transport is dropped on miss
    pub logout_timeout_ms: u64,
    /// SMTP connect budget in milliseconds
    pub smtp_connect_timeout_ms: u64,
    /// SMTP socket budget in milliseconds (bodies may be large)
    pub smtp_socket_timeout_ms: u64,
    /// HTTP budget for token refresh calls in milliseconds
    pub refresh_http_timeout_ms: u64,
    /// Skip TLS certificate verification (the legacy default; off here)
    pub tls_insecure: bool,
    /// Interval between background token sweeps in seconds (0 disables)
    pub sweep_interval_secs: u64,
}

impl Settings {
    /// Load all settings from environment variables
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a variable is set to a malformed value.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_BRIDGE_STORE_PATH=/var/lib/mail-bridge/accounts.json
    /// MAIL_BRIDGE_REFRESH_ENDPOINT=https://auth.internal/refresh
    /// MAIL_BRIDGE_OAUTH_CLIENT_ID=...
    /// MAIL_BRIDGE_OAUTH_CLIENT_SECRET=...
    /// MAIL_BRIDGE_SWEEP_INTERVAL_SECS=3600
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Ok(Self {
            store_path: PathBuf::from(
                optional_env("MAIL_BRIDGE_STORE_PATH")?
                    .unwrap_or_else(|| "mail-accounts.json".to_owned()),
            ),
            refresh_endpoint: optional_env("MAIL_BRIDGE_REFRESH_ENDPOINT")?,
            oauth_client_id: optional_env("MAIL_BRIDGE_OAUTH_CLIENT_ID")?,
            oauth_client_secret: optional_env("MAIL_BRIDGE_OAUTH_CLIENT_SECRET")?
                .map(|v| SecretString::new(v.into())),
            oauth_token_url: optional_env("MAIL_BRIDGE_OAUTH_TOKEN_URL")?,
            connect_timeout_ms: parse_u64_env("MAIL_BRIDGE_CONNECT_TIMEOUT_MS", 30_000)?,
            op_timeout_ms: parse_u64_env("MAIL_BRIDGE_OP_TIMEOUT_MS", 30_000)?,
            logout_timeout_ms: parse_u64_env("MAIL_BRIDGE_LOGOUT_TIMEOUT_MS", 3_000)?,
            smtp_connect_timeout_ms: parse_u64_env("MAIL_BRIDGE_SMTP_CONNECT_TIMEOUT_MS", 60_000)?,
            smtp_socket_timeout_ms: parse_u64_env("MAIL_BRIDGE_SMTP_SOCKET_TIMEOUT_MS", 60_000)?,
            refresh_http_timeout_ms: parse_u64_env("MAIL_BRIDGE_REFRESH_HTTP_TIMEOUT_MS", 10_000)?,
            tls_insecure: parse_bool_env("MAIL_BRIDGE_TLS_INSECURE", false)?,
            sweep_interval_secs: parse_u64_env("MAIL_BRIDGE_SWEEP_INTERVAL_SECS", 0)?,
        })
    }
}

/// Server endpoints for one mail provider
///
/// Derived from the account address domain, never user-supplied.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    /// IMAP server hostname
    pub imap_host: &'static str,
    /// IMAP server port (implicit TLS)
    pub imap_port: u16,
    /// Submission server hostname
    pub smtp_host: &'static str,
    /// Submission server port
    pub smtp_port: u16,
    /// Whether the submission port uses implicit TLS (false means STARTTLS)
    pub smtp_implicit_tls: bool,
    /// OAuth token endpoint for direct refresh, if the provider has one
    pub token_url: Option<&'static str>,
}

/// Static provider table, matched by address domain
///
/// Runtime string comparisons stay confined to this single lookup; call
/// sites branch on the resolved endpoints instead.
const PROVIDERS: &[(&[&str], ProviderEndpoints)] = &[
    (
        &["gmail.com", "googlemail.com"],
        ProviderEndpoints {
            imap_host: "imap.gmail.com",
            imap_port: 993,
            smtp_host: "smtp.gmail.com",
            smtp_port: 465,
            smtp_implicit_tls: true,
            token_url: Some("https://oauth2.googleapis.com/token"),
        },
    ),
    (
        &["qq.com", "foxmail.com"],
        ProviderEndpoints {
            imap_host: "imap.qq.com",
            imap_port: 993,
            smtp_host: "smtp.qq.com",
            smtp_port: 465,
            smtp_implicit_tls: true,
            token_url: None,
        },
    ),
    (
        &["outlook.com", "hotmail.com", "live.com"],
        ProviderEndpoints {
            imap_host: "outlook.office365.com",
            imap_port: 993,
            smtp_host: "smtp-mail.outlook.com",
            smtp_port: 587,
            smtp_implicit_tls: false,
            token_url: Some("https://login.microsoftonline.com/common/oauth2/v2.0/token"),
        },
    ),
    (
        &["163.com", "126.com"],
        ProviderEndpoints {
            imap_host: "imap.163.com",
            imap_port: 993,
            smtp_host: "smtp.163.com",
            smtp_port: 465,
            smtp_implicit_tls: true,
            token_url: None,
        },
    ),
];

/// Resolve server endpoints for a mailbox address
///
/// # Errors
///
/// Returns `Validation` if the address has no domain part or the domain is
/// not in the provider table.
pub fn endpoints_for_address(address: &str) -> AppResult<&'static ProviderEndpoints> {
    let domain = address
        .rsplit_once('@')
        .map(|(_, d)| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| AppError::invalid(format!("address '{address}' has no domain part")))?;

    PROVIDERS
        .iter()
        .find(|(domains, _)| domains.contains(&domain.as_str()))
        .map(|(_, endpoints)| endpoints)
        .ok_or_else(|| {
            AppError::invalid(format!(
                "no known mail provider for domain '{domain}'; supported: gmail, qq, outlook, netease"
            ))
        })
}

/// Read an optional environment variable, treating empty as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
        Ok(_) | Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::invalid(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` environment variable with default fallback
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| AppError::invalid(format!("invalid u64 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{endpoints_for_address, parse_bool_value};

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn resolves_known_provider_domains() {
        let gmail = endpoints_for_address("user@gmail.com").expect("gmail resolves");
        assert_eq!(gmail.imap_host, "imap.gmail.com");
        assert!(gmail.token_url.is_some());

        let qq = endpoints_for_address("someone@QQ.com").expect("qq resolves case-insensitively");
        assert_eq!(qq.smtp_host, "smtp.qq.com");
        assert!(qq.smtp_implicit_tls);
    }

    #[test]
    fn rejects_unknown_domain_and_missing_domain() {
        assert!(endpoints_for_address("user@example.org").is_err());
        assert!(endpoints_for_address("not-an-address").is_err());
        assert!(endpoints_for_address("trailing@").is_err());
    }
}
