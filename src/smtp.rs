//! Outbound message composition and submission
//!
//! Builds RFC5322 messages with `lettre` and submits them over the
//! account's submission endpoint, authenticating the same way the inbound
//! path does (password or XOAUTH2 bearer). Compose input is validated
//! before any network traffic, and provider rejections are classified so
//! the caller can distinguish a dead token from a wrong password from a
//! garden-variety rejection.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Body, Mailbox, MessageBuilder, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use tokio::time::timeout;
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::errors::{AppError, AppResult};
use crate::models::SendMailInput;
use crate::store::{AuthMode, CredentialRecord};

/// Validate a compose request before any network call
///
/// # Errors
///
/// Returns `Validation` when no recipient is given or both body forms are
/// absent.
pub fn validate_compose(input: &SendMailInput) -> AppResult<()> {
    if input.to.is_empty() {
        return Err(AppError::invalid("at least one recipient is required"));
    }
    if input.text.is_none() && input.html.is_none() {
        return Err(AppError::invalid(
            "at least one of text/html body is required",
        ));
    }
    Ok(())
}

/// Compose and dispatch a message via the account's submission server
///
/// Returns the generated Message-ID on acceptance.
///
/// # Errors
///
/// - `Validation` for malformed compose input
/// - `AuthExpired` / `AuthFailed` / `SendFailed` per rejection wording
/// - `Timeout` when the overall send budget is exceeded
pub async fn deliver(
    settings: &Settings,
    record: &CredentialRecord,
    input: SendMailInput,
) -> AppResult<String> {
    let (message, message_id) = build_message(record, &input)?;
    let transport = build_transport(settings, record)?;

    let overall = Duration::from_millis(
        settings.smtp_connect_timeout_ms + settings.smtp_socket_timeout_ms,
    );
    timeout(overall, transport.send(message))
        .await
        .map_err(|_| AppError::Timeout("smtp send timed out".to_owned()))?
        .map_err(|e| classify_send_rejection(&e.to_string()))?;

    info!(account = %record.address, message_id = %message_id, "message submitted");
    Ok(message_id)
}

/// Build the outgoing message and its Message-ID
///
/// Split from [`deliver`] so composition is testable without a server.
pub(crate) fn build_message(
    record: &CredentialRecord,
    input: &SendMailInput,
) -> AppResult<(Message, String)> {
    validate_compose(input)?;

    let from: Mailbox = match &record.display_name {
        Some(name) => format!("{name} <{}>", record.address),
        None => record.address.clone(),
    }
    .parse()
    .map_err(|e| {
        AppError::invalid(format!("invalid sender address '{}': {e}", record.address))
    })?;

    let message_id = format!("<{}@{}>", Uuid::new_v4(), address_domain(&record.address));
    let mut builder = Message::builder()
        .from(from)
        .subject(input.subject.clone())
        .message_id(Some(message_id.clone()));
    for recipient in &input.to {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| AppError::invalid(format!("invalid recipient '{recipient}': {e}")))?;
        builder = builder.to(to);
    }

    let message = assemble_body(builder, input)?;
    Ok((message, message_id))
}

/// Attach the body parts in the right MIME shape
fn assemble_body(builder: MessageBuilder, input: &SendMailInput) -> AppResult<Message> {
    let build_err =
        |e: lettre::error::Error| AppError::Internal(format!("cannot build message: {e}"));

    if input.attachments.is_empty() {
        return match (&input.text, &input.html) {
            (Some(text), None) => builder.body(text.clone()).map_err(build_err),
            (None, Some(html)) => builder
                .singlepart(SinglePart::html(html.clone()))
                .map_err(build_err),
            (Some(text), Some(html)) => builder
                .multipart(MultiPart::alternative_plain_html(
                    text.clone(),
                    html.clone(),
                ))
                .map_err(build_err),
            (None, None) => Err(AppError::invalid(
                "at least one of text/html body is required",
            )),
        };
    }

    let mut mixed = match (&input.text, &input.html) {
        (Some(text), None) => MultiPart::mixed().singlepart(SinglePart::plain(text.clone())),
        (None, Some(html)) => MultiPart::mixed().singlepart(SinglePart::html(html.clone())),
        (Some(text), Some(html)) => MultiPart::mixed().multipart(
            MultiPart::alternative_plain_html(text.clone(), html.clone()),
        ),
        (None, None) => {
            return Err(AppError::invalid(
                "at least one of text/html body is required",
            ));
        }
    };

    for attachment in &input.attachments {
        let payload = BASE64.decode(&attachment.content_base64).map_err(|e| {
            AppError::invalid(format!(
                "attachment '{}' is not valid base64: {e}",
                attachment.filename
            ))
        })?;
        let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
            AppError::invalid(format!(
                "attachment '{}' has invalid content type '{}': {e}",
                attachment.filename, attachment.content_type
            ))
        })?;
        mixed = mixed.singlepart(
            Attachment::new(attachment.filename.clone()).body(Body::new(payload), content_type),
        );
    }

    builder.multipart(mixed).map_err(build_err)
}

/// Build the submission transport for an account
fn build_transport(
    settings: &Settings,
    record: &CredentialRecord,
) -> AppResult<AsyncSmtpTransport<Tokio1Executor>> {
    let host = record.server.smtp_host.as_str();
    let relay = if record.server.smtp_implicit_tls {
        AsyncSmtpTransport::<Tokio1Executor>::relay(host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
    }
    .map_err(|e| {
        AppError::ConnectionFailed(format!("smtp transport setup for '{host}' failed: {e}"))
    })?;

    let relay = relay
        .port(record.server.smtp_port)
        .timeout(Some(Duration::from_millis(settings.smtp_socket_timeout_ms)));

    let relay = match record.auth_mode {
        AuthMode::Password => {
            let secret = record.secret.as_ref().ok_or_else(|| {
                AppError::AuthFailed(format!(
                    "account '{}' has no stored password",
                    record.address
                ))
            })?;
            relay.credentials(Credentials::new(
                record.address.clone(),
                secret.expose_secret().to_owned(),
            ))
        }
        AuthMode::OAuthBearer => {
            let token = record.access_token.as_ref().ok_or_else(|| {
                AppError::AuthExpired(format!(
                    "account '{}' has no access token",
                    record.address
                ))
            })?;
            relay
                .credentials(Credentials::new(
                    record.address.clone(),
                    token.expose_secret().to_owned(),
                ))
                .authentication(vec![Mechanism::Xoauth2])
        }
    };

    Ok(relay.build())
}

/// Classify a provider rejection by its wording
///
/// Token/OAuth wording means the bearer credential died (re-auth); login
/// wording means the static credential is wrong (re-check password);
/// everything else is a plain send failure (retry).
fn classify_send_rejection(msg: &str) -> AppError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("oauth")
        || lower.contains("token")
        || lower.contains("xoauth")
        || lower.contains("534")
    {
        return AppError::AuthExpired(msg.to_owned());
    }
    if lower.contains("auth")
        || lower.contains("login")
        || lower.contains("password")
        || lower.contains("credential")
        || lower.contains("535")
    {
        return AppError::AuthFailed(msg.to_owned());
    }
    AppError::SendFailed(msg.to_owned())
}

fn address_domain(address: &str) -> &str {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
        .unwrap_or("localhost")
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use secrecy::SecretString;

    use super::{build_message, classify_send_rejection, validate_compose};
    use crate::errors::AppError;
    use crate::models::{OutgoingAttachment, SendMailInput};
    use crate::store::{AuthMode, CredentialRecord, ServerSettings};

    fn record() -> CredentialRecord {
        CredentialRecord {
            address: "sender@example.com".to_owned(),
            display_name: Some("Sender".to_owned()),
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

    fn compose() -> SendMailInput {
        SendMailInput {
            account: None,
            to: vec!["rcpt@example.org".to_owned()],
            subject: "Greetings".to_owned(),
            text: Some("hello".to_owned()),
            html: None,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn compose_requires_recipient_and_some_body() {
        let mut missing_body = compose();
        missing_body.text = None;
        let err = validate_compose(&missing_body).expect_err("must fail");
        assert!(matches!(err, AppError::Validation(_)));

        let mut missing_rcpt = compose();
        missing_rcpt.to.clear();
        assert!(validate_compose(&missing_rcpt).is_err());

        assert!(validate_compose(&compose()).is_ok());
    }

    #[test]
    fn builds_plain_message_with_generated_message_id() {
        let (message, message_id) = build_message(&record(), &compose()).expect("builds");
        assert!(message_id.starts_with('<'));
        assert!(message_id.ends_with("@example.com>"));

        let rendered = String::from_utf8(message.formatted()).expect("utf8");
        assert!(rendered.contains("Subject: Greetings"));
        assert!(rendered.contains("hello"));
    }

    #[test]
    fn builds_alternative_with_attachment_as_mixed() {
        let mut input = compose();
        input.html = Some("<p>hello</p>".to_owned());
        input.attachments.push(OutgoingAttachment {
            filename: "note.txt".to_owned(),
            content_type: "text/plain".to_owned(),
            content_base64: BASE64.encode("attached"),
        });

        let (message, _) = build_message(&record(), &input).expect("builds");
        let rendered = String::from_utf8(message.formatted()).expect("utf8");
        assert!(rendered.contains("multipart/mixed"));
        assert!(rendered.contains("multipart/alternative"));
        assert!(rendered.contains("note.txt"));
    }

    #[test]
    fn bad_base64_attachment_is_a_validation_error() {
        let mut input = compose();
        input.attachments.push(OutgoingAttachment {
            filename: "x.bin".to_owned(),
            content_type: "application/octet-stream".to_owned(),
            content_base64: "!!not-base64!!".to_owned(),
        });
        let err = build_message(&record(), &input).expect_err("must fail");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn rejections_classify_by_wording() {
        assert!(matches!(
            classify_send_rejection("454 4.7.0 Token expired, re-authenticate"),
            AppError::AuthExpired(_)
        ));
        assert!(matches!(
            classify_send_rejection("535 5.7.8 Username and Password not accepted"),
            AppError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_send_rejection("552 message size exceeds limit"),
            AppError::SendFailed(_)
        ));
    }
}
