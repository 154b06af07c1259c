//! MCP server implementation with tool handlers
//!
//! Registers the mail tools and orchestrates the pipeline behind each one:
//! resolve the credential record, run it through the token lifecycle, open
//! an authenticated session, operate under the mailbox lock, and tear the
//! session down best-effort once the result is in hand. Input validation
//! happens before any network call.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use secrecy::SecretString;

use crate::config::{Settings, endpoints_for_address};
use crate::errors::{AppError, AppResult};
use crate::imap::MailSession;
use crate::mime;
use crate::models::{
    AccountAddressInput, AccountInfo, GetMessageInput, ListRecentInput, LoginInput, MessageDetail,
    MessageSummary, Meta, SendMailInput, ToolEnvelope,
};
use crate::smtp;
use crate::store::{AccountStore, AuthMode, CredentialRecord, ServerSettings};
use crate::text::normalize;
use crate::token::TokenManager;

/// Maximum messages per listing
const MAX_LIST_COUNT: usize = 50;
/// Maximum attachments reported per message
const MAX_ATTACHMENTS: usize = 50;

/// Mail bridge MCP server
///
/// Holds shared settings, the credential store, and the token lifecycle
/// manager. Tool handlers are registered via the `#[tool]` attribute macro.
#[derive(Clone)]
pub struct MailBridgeServer {
    settings: Arc<Settings>,
    store: Arc<AccountStore>,
    tokens: Arc<TokenManager>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailBridgeServer {
    /// Create a new MCP server instance
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<AccountStore>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            settings,
            store,
            tokens,
            tool_router: Self::tool_router(),
        }
    }

    /// Tool: Store and verify a password-mode account
    ///
    /// Derives server endpoints from the address domain, verifies the
    /// credential by opening a session, and persists the record. OAuth
    /// accounts are provisioned externally and arrive in the store with
    /// tokens already issued.
    #[tool(
        name = "mail_login",
        description = "Add or update an email account with a password or app passcode"
    )]
    async fn login(
        &self,
        Parameters(input): Parameters<LoginInput>,
    ) -> Result<Json<ToolEnvelope<AccountInfo>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.login_impl(input)
                .await
                .map(|data| (format!("Account '{}' verified and stored", data.address), data)),
        )
    }

    /// Tool: List stored accounts
    ///
    /// Returns account metadata without credentials or tokens.
    #[tool(name = "mail_list_accounts", description = "List stored email accounts")]
    async fn list_accounts(&self) -> Result<Json<ToolEnvelope<Vec<AccountInfo>>>, ErrorData> {
        let started = Instant::now();
        let data = self
            .store
            .list_all()
            .await
            .iter()
            .map(account_info)
            .collect::<Vec<_>>();
        finalize_tool(
            started,
            Ok((format!("{} account(s) stored", data.len()), data)),
        )
    }

    /// Tool: Remove a stored account
    #[tool(name = "mail_remove_account", description = "Remove a stored email account")]
    async fn remove_account(
        &self,
        Parameters(input): Parameters<AccountAddressInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result = async {
            validate_address(&input.address)?;
            self.store.remove(&input.address).await?;
            Ok((
                format!("Account '{}' removed", input.address),
                serde_json::json!({ "address": input.address }),
            ))
        }
        .await;
        finalize_tool(started, result)
    }

    /// Tool: Designate the default account
    #[tool(
        name = "mail_set_default_account",
        description = "Designate the default email account"
    )]
    async fn set_default_account(
        &self,
        Parameters(input): Parameters<AccountAddressInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result = async {
            validate_address(&input.address)?;
            self.store.set_default(&input.address).await?;
            Ok((
                format!("Account '{}' is now the default", input.address),
                serde_json::json!({ "address": input.address }),
            ))
        }
        .await;
        finalize_tool(started, result)
    }

    /// Tool: List recent messages
    ///
    /// Results are sorted by message date, newest first; server-returned
    /// order is not trusted.
    #[tool(
        name = "mail_list_recent",
        description = "List recent messages in a mailbox, newest first"
    )]
    async fn list_recent(
        &self,
        Parameters(input): Parameters<ListRecentInput>,
    ) -> Result<Json<ToolEnvelope<Vec<MessageSummary>>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.list_recent_impl(input)
                .await
                .map(|data| (format!("{} message(s)", data.len()), data)),
        )
    }

    /// Tool: Fetch one message's resolved body and detail
    ///
    /// The body is the resolved plain-text representation (plain part
    /// preferred, HTML converted as fallback), normalized for reading.
    #[tool(
        name = "mail_get_message",
        description = "Fetch a message body and details by UID"
    )]
    async fn get_message(
        &self,
        Parameters(input): Parameters<GetMessageInput>,
    ) -> Result<Json<ToolEnvelope<MessageDetail>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.get_message_impl(input)
                .await
                .map(|data| (format!("Message {} retrieved", data.uid), data)),
        )
    }

    /// Tool: Compose and send a message
    #[tool(name = "mail_send", description = "Send an email from a stored account")]
    async fn send(
        &self,
        Parameters(input): Parameters<SendMailInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.send_impl(input)
                .await
                .map(|data| ("Message sent".to_owned(), data)),
        )
    }
}

/// MCP server handler implementation
#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailBridgeServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.instructions = Some(
            "Multi-account IMAP/SMTP bridge. Accounts live in a local store; \
             OAuth tokens are refreshed automatically before every operation."
                .to_owned(),
        );
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

/// Tool implementation methods
///
/// Private methods hold the business logic; the public `#[tool]` methods
/// only shape responses.
impl MailBridgeServer {
    async fn login_impl(&self, input: LoginInput) -> AppResult<AccountInfo> {
        let address = input.address.trim().to_owned();
        validate_address(&address)?;
        if input.secret.trim().is_empty() {
            return Err(AppError::invalid("secret must not be empty"));
        }
        let endpoints = endpoints_for_address(&address)?;

        let mut record = CredentialRecord {
            address,
            display_name: input
                .display_name
                .filter(|name| !name.trim().is_empty()),
            auth_mode: AuthMode::Password,
            secret: Some(SecretString::new(input.secret.into())),
            access_token: None,
            refresh_token: None,
            token_expiry: None,
            server: ServerSettings::from(endpoints),
            active: true,
            is_default: input.make_default,
            last_authenticated_at: None,
        };

        // Prove the credential works before persisting it.
        let session = MailSession::open(&self.settings, &record).await?;
        session.close().await;
        record.last_authenticated_at = Some(Utc::now());

        self.store.upsert(record.clone()).await?;
        Ok(account_info(&record))
    }

    async fn list_recent_impl(&self, input: ListRecentInput) -> AppResult<Vec<MessageSummary>> {
        validate_mailbox(&input.mailbox)?;
        let count = input.count.clamp(1, MAX_LIST_COUNT);

        let record = self.store.resolve(input.account.as_deref()).await?;
        ensure_active(&record)?;
        let record = self.tokens.ensure_usable(record).await?;

        let session = MailSession::open(&self.settings, &record).await?;
        let result: AppResult<Vec<MessageSummary>> = async {
            let mut mailbox = session.mailbox(&input.mailbox).await?;
            let uids = mailbox.recent_uids(count).await?;
            let mut summaries = Vec::with_capacity(uids.len());
            for uid in uids {
                let (header_bytes, flags) = mailbox.fetch_header_and_flags(uid).await?;
                let envelope = mime::envelope_from_header_bytes(&header_bytes);
                summaries.push(MessageSummary {
                    uid,
                    date: envelope.date,
                    from: envelope.from,
                    subject: envelope.subject,
                    flags,
                });
            }
            Ok(summaries)
        }
        .await;
        session.close().await;

        let mut summaries = result?;
        summaries.sort_by_key(|summary| {
            std::cmp::Reverse(
                summary
                    .date
                    .as_deref()
                    .and_then(mime::envelope_timestamp)
                    .unwrap_or(0),
            )
        });
        Ok(summaries)
    }

    async fn get_message_impl(&self, input: GetMessageInput) -> AppResult<MessageDetail> {
        validate_mailbox(&input.mailbox)?;
        if input.uid == 0 {
            return Err(AppError::invalid("uid must be positive"));
        }
        validate_chars(input.body_max_chars, 100, 50_000, "body_max_chars")?;

        let record = self.store.resolve(input.account.as_deref()).await?;
        ensure_active(&record)?;
        let record = self.tokens.ensure_usable(record).await?;

        let session = MailSession::open(&self.settings, &record).await?;
        let uid = input.uid;
        let result = async {
            let mut mailbox = session.mailbox(&input.mailbox).await?;
            mailbox.fetch_message(uid).await
        }
        .await;
        session.close().await;
        let message = result?;

        let body = mime::resolve_text(&message)
            .map(|raw| mime::truncate_chars(normalize(&raw), input.body_max_chars));
        let attachments = message
            .raw_source
            .as_deref()
            .map(mime::enumerate_attachments)
            .unwrap_or_default()
            .into_iter()
            .take(MAX_ATTACHMENTS)
            .collect();

        Ok(MessageDetail {
            uid,
            mailbox: input.mailbox,
            date: message.envelope.date,
            from: message.envelope.from,
            to: message.envelope.to,
            subject: message.envelope.subject,
            body,
            attachments,
        })
    }

    async fn send_impl(&self, input: SendMailInput) -> AppResult<serde_json::Value> {
        smtp::validate_compose(&input)?;
        for recipient in &input.to {
            validate_address(recipient)?;
        }

        let record = self.store.resolve(input.account.as_deref()).await?;
        ensure_active(&record)?;
        let record = self.tokens.ensure_usable(record).await?;

        let message_id = smtp::deliver(&self.settings, &record, input).await?;
        Ok(serde_json::json!({
            "from": record.address,
            "message_id": message_id,
        }))
    }
}

/// Elapsed milliseconds since the tool started
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Shape a business-logic result into the standard tool envelope or error
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

/// Project a credential record into its secret-free public shape
fn account_info(record: &CredentialRecord) -> AccountInfo {
    AccountInfo {
        address: record.address.clone(),
        display_name: record.display_name.clone(),
        auth_mode: match record.auth_mode {
            AuthMode::Password => "password",
            AuthMode::OAuthBearer => "oauth_bearer",
        }
        .to_owned(),
        imap_host: record.server.imap_host.clone(),
        smtp_host: record.server.smtp_host.clone(),
        active: record.active,
        is_default: record.is_default,
    }
}

/// A disabled record must surface as needs-re-auth, not as a login attempt
fn ensure_active(record: &CredentialRecord) -> AppResult<()> {
    if !record.active {
        return Err(AppError::AuthExpired(format!(
            "account '{}' is disabled; re-authenticate to enable it",
            record.address
        )));
    }
    Ok(())
}

/// Validate mailbox address shape
fn validate_address(address: &str) -> AppResult<()> {
    if address.is_empty() || address.len() > 254 {
        return Err(AppError::invalid("address must be 1..254 characters"));
    }
    if !address.contains('@') {
        return Err(AppError::invalid(format!(
            "'{address}' is not a mail address"
        )));
    }
    if address
        .chars()
        .any(|ch| ch.is_ascii_control() || ch.is_whitespace())
    {
        return Err(AppError::invalid(
            "address must not contain whitespace or control characters",
        ));
    }
    Ok(())
}

/// Validate mailbox name format
fn validate_mailbox(mailbox: &str) -> AppResult<()> {
    if mailbox.is_empty() || mailbox.len() > 256 {
        return Err(AppError::invalid("mailbox must be 1..256 characters"));
    }
    if mailbox.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::invalid(
            "mailbox must not contain control characters",
        ));
    }
    Ok(())
}

/// Validate numeric value in range
fn validate_chars(value: usize, min: usize, max: usize, field: &str) -> AppResult<()> {
    if value < min || value > max {
        return Err(AppError::invalid(format!(
            "{field} must be in range {min}..{max}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{account_info, ensure_active, validate_address, validate_chars, validate_mailbox};
    use crate::errors::AppError;
    use crate::store::{AuthMode, CredentialRecord, ServerSettings};

    fn record() -> CredentialRecord {
        CredentialRecord {
            address: "user@example.com".to_owned(),
            display_name: Some("User".to_owned()),
            auth_mode: AuthMode::Password,
            secret: Some(SecretString::new("pw".into())),
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
            is_default: true,
            last_authenticated_at: None,
        }
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(validate_address("user@example.com").is_ok());
        assert!(validate_address("no-at-sign").is_err());
        assert!(validate_address("has space@example.com").is_err());
        assert!(validate_address("ctrl\r@example.com").is_err());
        assert!(validate_address("").is_err());
    }

    #[test]
    fn rejects_control_chars_in_mailbox() {
        assert!(validate_mailbox("INBOX").is_ok());
        let err = validate_mailbox("INBOX\r").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn validates_numeric_ranges() {
        assert!(validate_chars(100, 100, 50_000, "body_max_chars").is_ok());
        assert!(validate_chars(99, 100, 50_000, "body_max_chars").is_err());
        assert!(validate_chars(50_001, 100, 50_000, "body_max_chars").is_err());
    }

    #[test]
    fn disabled_record_reports_auth_expired() {
        let mut disabled = record();
        disabled.active = false;
        let err = ensure_active(&disabled).expect_err("must fail");
        assert!(matches!(err, AppError::AuthExpired(_)));
        assert!(ensure_active(&record()).is_ok());
    }

    #[test]
    fn account_info_carries_no_secret_material() {
        let info = account_info(&record());
        assert_eq!(info.auth_mode, "password");
        let serialized = serde_json::to_string(&info).expect("serializes");
        assert!(!serialized.contains("pw"));
        assert!(!serialized.contains("secret"));
    }
}
