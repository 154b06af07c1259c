//! Tool input and output types
//!
//! Every type in the MCP tool contracts lives here, annotated with
//! `JsonSchema` so the schemas are generated rather than hand-written.
//! Credential secrets never appear in any output type.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Execution metadata attached to every tool response
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// UTC timestamp at response time, RFC 3339 with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Metadata stamped with the current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Response envelope shared by every tool
///
/// Pairs the tool payload with a one-line summary and execution metadata
/// so responses have one consistent shape.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// One-line human-readable outcome
    pub summary: String,
    /// Tool-specific payload
    pub data: T,
    /// Timestamp and duration
    pub meta: Meta,
}

/// Account metadata (no credentials)
///
/// Returned by account tools. Secrets and tokens are intentionally
/// excluded.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountInfo {
    /// Mailbox address
    pub address: String,
    /// Optional display alias
    pub display_name: Option<String>,
    /// Authentication mode (`password` or `oauth_bearer`)
    pub auth_mode: String,
    /// IMAP server hostname
    pub imap_host: String,
    /// Submission server hostname
    pub smtp_host: String,
    /// Whether the account is usable (false after refresh exhaustion)
    pub active: bool,
    /// Whether this is the process-wide default account
    pub is_default: bool,
}

/// Message summary for listings
///
/// Lightweight representation returned by `mail_list_recent`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageSummary {
    /// Message UID within the mailbox
    pub uid: u32,
    /// Parsed Date header
    pub date: Option<String>,
    /// Parsed From header
    pub from: Option<String>,
    /// Parsed Subject header
    pub subject: Option<String>,
    /// IMAP flags (e.g., `\Seen`, `\Flagged`)
    pub flags: Vec<String>,
}

/// Attachment metadata
///
/// Payload bytes are not included; enumeration is metadata-only.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentInfo {
    /// Filename from disposition params, content-type params, or `unknown`
    pub filename: String,
    /// MIME content type, `application/octet-stream` when undeclared
    pub content_type: String,
    /// Decoded payload size in bytes
    pub size_bytes: usize,
    /// Part ID within the MIME structure (e.g., `1`, `1.2`)
    pub part_id: String,
}

/// Full message detail
///
/// Returned by `mail_get_message`. `body` is `null` when the message could
/// not be resolved at all, and an empty string when the message exists but
/// has no textual content.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageDetail {
    /// Message UID within the mailbox
    pub uid: u32,
    /// Mailbox the message was read from
    pub mailbox: String,
    /// Parsed Date header
    pub date: Option<String>,
    /// Parsed From header
    pub from: Option<String>,
    /// Parsed To header
    pub to: Option<String>,
    /// Parsed Subject header
    pub subject: Option<String>,
    /// Resolved and normalized body text
    pub body: Option<String>,
    /// Attachment metadata
    pub attachments: Vec<AttachmentInfo>,
}

/// Input: add or update a password-mode account
///
/// Used by `mail_login`. Server endpoints are derived from the address
/// domain; OAuth accounts are provisioned externally and land in the store
/// with tokens already issued.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct LoginInput {
    /// Mailbox address (e.g., `user@gmail.com`)
    pub address: String,
    /// Password or provider app passcode
    pub secret: String,
    /// Optional display alias usable as a lookup key
    pub display_name: Option<String>,
    /// Make this the default account (first account always becomes default)
    #[serde(default)]
    pub make_default: bool,
}

/// Input: address-only account operations
///
/// Used by `mail_remove_account` and `mail_set_default_account`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AccountAddressInput {
    /// Mailbox address of the stored account
    pub address: String,
}

/// Input: list recent messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListRecentInput {
    /// Account address or alias (defaults to the default account)
    pub account: Option<String>,
    /// Mailbox to list (defaults to `INBOX`)
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Maximum messages to return (1..50, default 10)
    #[serde(default = "default_count")]
    pub count: usize,
}

/// Input: fetch one message's resolved body and detail
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetMessageInput {
    /// Account address or alias (defaults to the default account)
    pub account: Option<String>,
    /// Mailbox containing the message (defaults to `INBOX`)
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Message UID within the mailbox
    pub uid: u32,
    /// Maximum body characters (100..50000, default 20000)
    #[serde(default = "default_body_max_chars")]
    pub body_max_chars: usize,
}

/// Outbound attachment payload
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct OutgoingAttachment {
    /// Filename shown to the recipient
    pub filename: String,
    /// MIME content type (e.g., `application/pdf`)
    pub content_type: String,
    /// Base64-encoded payload
    pub content_base64: String,
}

/// Input: compose and send a message
///
/// At least one of `text`/`html` is required.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendMailInput {
    /// Account address or alias (defaults to the default account)
    pub account: Option<String>,
    /// Recipient addresses
    pub to: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub text: Option<String>,
    /// HTML body
    pub html: Option<String>,
    /// Optional attachments
    #[serde(default)]
    pub attachments: Vec<OutgoingAttachment>,
}

/// Default mailbox for listing and fetch inputs
pub fn default_mailbox() -> String {
    "INBOX".to_owned()
}

/// Default value for `count` in listings
fn default_count() -> usize {
    10
}

/// Default value for `body_max_chars` in message fetch
///
/// Large enough for nearly every human-written message while bounding the
/// output against megabyte-scale marketing bodies.
fn default_body_max_chars() -> usize {
    20_000
}
