//! IMAP session lifecycle and timeout-bounded operations
//!
//! Wraps `async-imap` with the discipline every remote call needs here:
//! TLS is mandatory, every operation races a timeout, and teardown is
//! best-effort — a logout that misses its deadline is logged at debug and
//! the transport dropped, never surfaced as an operation failure.
//!
//! Mailbox access on one session is serialized through
//! [`MailSession::mailbox`]: the returned guard holds the session lock for
//! as long as it lives, so no two operation sequences interleave mailbox
//! state, and the lock is released on every exit path when the guard
//! drops.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::Fetch;
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::errors::{AppError, AppResult};
use crate::mime::{FetchedMessage, envelope_from_header_bytes};
use crate::store::{AuthMode, CredentialRecord};

/// Authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// SASL XOAUTH2 initial response
///
/// After the first response, any further challenge is an error payload from
/// the server; replying with an empty line lets the server finish the
/// handshake with its final NO/BAD.
struct Xoauth2Authenticator {
    response: Vec<u8>,
    sent: bool,
}

impl Xoauth2Authenticator {
    fn new(user: &str, access_token: &str) -> Self {
        Self {
            response: format!("user={user}\x01auth=Bearer {access_token}\x01\x01").into_bytes(),
            sent: false,
        }
    }
}

impl async_imap::Authenticator for Xoauth2Authenticator {
    type Response = Vec<u8>;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        if self.sent {
            Vec::new()
        } else {
            self.sent = true;
            self.response.clone()
        }
    }
}

/// One authenticated connection to an account's IMAP server
///
/// Opened per operation and closed (best-effort) when the operation's
/// result is already in hand.
pub struct MailSession {
    session: Mutex<Option<ImapSession>>,
    op_timeout: Duration,
    logout_timeout: Duration,
}

impl MailSession {
    /// Connect and authenticate
    ///
    /// Performs TCP connect, TLS handshake, greeting read, and LOGIN or
    /// XOAUTH2 authentication, each bounded by the configured budgets.
    ///
    /// # Errors
    ///
    /// - `AuthFailed` when password credentials are rejected
    /// - `AuthExpired` when the bearer token is rejected
    /// - `ConnectionFailed` for TCP, DNS, or TLS failures
    /// - `Timeout` when any phase misses its budget
    pub async fn open(settings: &Settings, record: &CredentialRecord) -> AppResult<Self> {
        let connect_timeout = Duration::from_millis(settings.connect_timeout_ms);
        let op_timeout = Duration::from_millis(settings.op_timeout_ms);
        let host = record.server.imap_host.clone();
        let port = record.server.imap_port;

        let tcp = timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| AppError::Timeout(format!("tcp connect to {host}:{port} timed out")))
            .and_then(|r| {
                r.map_err(|e| {
                    AppError::ConnectionFailed(format!("tcp connect to {host}:{port} failed: {e}"))
                })
            })?;

        if settings.tls_insecure {
            warn!(host = %host, "TLS certificate verification disabled by configuration");
        }
        let connector = tls_connector(settings.tls_insecure);
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| AppError::invalid(format!("invalid IMAP host '{host}' for TLS SNI")))?;
        let tls_stream = timeout(connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| AppError::Timeout("TLS handshake timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::ConnectionFailed(format!("TLS handshake failed: {e}")))
            })?;

        let mut client = Client::new(tls_stream);
        let greeting = timeout(op_timeout, client.read_response())
            .await
            .map_err(|_| AppError::Timeout("IMAP greeting timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::ConnectionFailed(format!("IMAP greeting failed: {e}")))
            })?;
        if greeting.is_none() {
            return Err(AppError::ConnectionFailed(
                "IMAP server closed connection before greeting".to_owned(),
            ));
        }

        let session = match record.auth_mode {
            AuthMode::Password => {
                let secret = record.secret.as_ref().ok_or_else(|| {
                    AppError::AuthFailed(format!(
                        "account '{}' has no stored password",
                        record.address
                    ))
                })?;
                timeout(
                    op_timeout,
                    client.login(record.address.as_str(), secret.expose_secret()),
                )
                .await
                .map_err(|_| AppError::Timeout("IMAP login timed out".to_owned()))?
                .map_err(|(e, _)| classify_password_error(e.to_string()))?
            }
            AuthMode::OAuthBearer => {
                let token = record.access_token.as_ref().ok_or_else(|| {
                    AppError::AuthExpired(format!(
                        "account '{}' has no access token",
                        record.address
                    ))
                })?;
                let authenticator =
                    Xoauth2Authenticator::new(&record.address, token.expose_secret());
                timeout(op_timeout, client.authenticate("XOAUTH2", authenticator))
                    .await
                    .map_err(|_| AppError::Timeout("IMAP authenticate timed out".to_owned()))?
                    .map_err(|(e, _)| {
                        AppError::AuthExpired(format!(
                            "bearer token rejected for '{}': {e}",
                            record.address
                        ))
                    })?
            }
        };

        Ok(Self {
            session: Mutex::new(Some(session)),
            op_timeout,
            logout_timeout: Duration::from_millis(settings.logout_timeout_ms),
        })
    }

    /// Acquire exclusive access to the named mailbox
    ///
    /// Locks the session, opens the mailbox read-only (`EXAMINE`), and
    /// returns a guard whose operations run against that mailbox. The lock
    /// lives exactly as long as the guard.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the mailbox cannot be examined.
    pub async fn mailbox(&self, name: &str) -> AppResult<MailboxGuard<'_>> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| AppError::Internal("session is already closed".to_owned()))?;

        timeout(self.op_timeout, session.examine(name))
            .await
            .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for mailbox '{name}'")))?
            .map_err(|e| AppError::NotFound(format!("cannot open mailbox '{name}': {e}")))?;

        Ok(MailboxGuard {
            guard,
            op_timeout: self.op_timeout,
        })
    }

    /// Best-effort bounded teardown
    ///
    /// Attempts a graceful LOGOUT within the teardown budget; on deadline
    /// miss or protocol error the underlying transport is dropped, which
    /// force-terminates the connection. Expected on providers that hang on
    /// logout, hence debug-level logging and no error return.
    pub async fn close(self) {
        let Some(mut session) = self.session.into_inner() else {
            return;
        };
        match timeout(self.logout_timeout, session.logout()).await {
            Ok(Ok(())) => debug!("imap logout completed"),
            Ok(Err(e)) => debug!(error = %e, "imap logout failed; dropping transport"),
            Err(_) => debug!("imap logout missed deadline; dropping transport"),
        }
    }
}

/// Exclusive handle on a selected mailbox
///
/// Dropping the guard releases the session lock on all exit paths.
pub struct MailboxGuard<'a> {
    guard: MutexGuard<'a, Option<ImapSession>>,
    op_timeout: Duration,
}

impl MailboxGuard<'_> {
    fn session(&mut self) -> AppResult<&mut ImapSession> {
        self.guard
            .as_mut()
            .ok_or_else(|| AppError::Internal("session is already closed".to_owned()))
    }

    /// UIDs of the most recent messages, newest first
    pub async fn recent_uids(&mut self, limit: usize) -> AppResult<Vec<u32>> {
        let op_timeout = self.op_timeout;
        let session = self.session()?;
        let set = timeout(op_timeout, session.uid_search("ALL"))
            .await
            .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::ConnectionFailed(format!("uid search failed: {e}")))
            })?;
        let mut uids: Vec<u32> = set.into_iter().collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        uids.truncate(limit);
        Ok(uids)
    }

    /// Fetch curated headers and flags for one message
    ///
    /// Uses `BODY.PEEK` so listing does not mark messages as read.
    pub async fn fetch_header_and_flags(&mut self, uid: u32) -> AppResult<(Vec<u8>, Vec<String>)> {
        let fetch = self
            .fetch_one(
                uid,
                "UID FLAGS BODY.PEEK[HEADER.FIELDS (DATE FROM TO CC SUBJECT)]",
            )
            .await?;
        let header_bytes = fetch
            .header()
            .or_else(|| fetch.body())
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        Ok((header_bytes, flags_to_strings(&fetch)))
    }

    /// Fetch one message with its full source, falling back to sections
    ///
    /// Prefers the complete RFC822 source. When the server returns a fetch
    /// without the literal, a second fetch collects the `HEADER` and `TEXT`
    /// sections so resolution can still proceed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the UID does not exist in the mailbox.
    pub async fn fetch_message(&mut self, uid: u32) -> AppResult<FetchedMessage> {
        let fetch = self.fetch_one(uid, "UID RFC822").await?;
        let mut message = FetchedMessage {
            uid,
            ..FetchedMessage::default()
        };
        if let Some(body) = fetch.body() {
            message.envelope = envelope_from_header_bytes(body);
            message.raw_source = Some(body.to_vec());
            return Ok(message);
        }

        debug!(uid, "no RFC822 literal in fetch; retrying with body sections");
        let fetch = self
            .fetch_one(uid, "UID BODY.PEEK[HEADER] BODY.PEEK[TEXT]")
            .await?;
        let mut parts = BTreeMap::new();
        if let Some(header) = fetch.header() {
            message.envelope = envelope_from_header_bytes(header);
            parts.insert("HEADER".to_owned(), header.to_vec());
        }
        if let Some(text) = fetch.text() {
            parts.insert("TEXT".to_owned(), text.to_vec());
        }
        message.body_parts = parts;
        Ok(message)
    }

    /// Run a `UID FETCH` for a single UID and return the first result
    async fn fetch_one(&mut self, uid: u32, query: &str) -> AppResult<Fetch> {
        let op_timeout = self.op_timeout;
        let session = self.session()?;
        let stream = timeout(op_timeout, session.uid_fetch(uid.to_string(), query))
            .await
            .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::ConnectionFailed(format!("uid fetch failed: {e}")))
            })?;
        let fetches: Vec<Fetch> = timeout(op_timeout, stream.try_collect())
            .await
            .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::ConnectionFailed(format!("uid fetch stream failed: {e}")))
            })?;

        fetches
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))
    }
}

/// Convert fetch flags to string representation
fn flags_to_strings(fetch: &Fetch) -> Vec<String> {
    fetch.flags().map(|flag| format!("{flag:?}")).collect()
}

/// Distinguish rejected credentials from transport trouble on LOGIN
fn classify_password_error(msg: String) -> AppError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("auth") || lower.contains("login") || lower.contains("credential") {
        AppError::AuthFailed(msg)
    } else {
        AppError::ConnectionFailed(msg)
    }
}

/// Build the TLS connector, strict by default
///
/// The relaxed mode skips certificate verification entirely; it exists for
/// parity with deployments that pinned broken provider chains and is off
/// unless `MAIL_BRIDGE_TLS_INSECURE=true`.
fn tls_connector(insecure: bool) -> TlsConnector {
    let config = if insecure {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

mod danger {
    use rustls::DigitallySignedStruct;
    use rustls::SignatureScheme;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    /// Certificate verifier that accepts any chain
    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use async_imap::Authenticator;

    use super::{Xoauth2Authenticator, classify_password_error};
    use crate::errors::AppError;

    #[test]
    fn xoauth2_initial_response_carries_user_and_bearer_token() {
        let mut auth = Xoauth2Authenticator::new("user@gmail.com", "token-abc");
        let first = auth.process(b"");
        assert_eq!(
            first,
            b"user=user@gmail.com\x01auth=Bearer token-abc\x01\x01".to_vec()
        );
        // Error challenges get an empty acknowledgement.
        assert!(auth.process(b"eyJzdGF0dXMiOiI0MDEifQ==").is_empty());
    }

    #[test]
    fn login_errors_split_into_auth_and_connection() {
        assert!(matches!(
            classify_password_error("NO LOGIN failed".to_owned()),
            AppError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_password_error("Authentication rejected".to_owned()),
            AppError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_password_error("connection reset by peer".to_owned()),
            AppError::ConnectionFailed(_)
        ));
    }
}
