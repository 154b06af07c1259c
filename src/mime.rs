//! MIME body resolution and attachment enumeration
//!
//! Given a fetched message, [`resolve_text`] selects the best readable
//! representation in strict priority order: a plain-text part always wins,
//! HTML is converted as a fallback, and a structurally odd message degrades
//! to an empty string rather than an error. `None` means the message was
//! not fetchable at all, which is distinct from "fetched but empty".
//!
//! Parsing uses `mailparse`; HTML conversion lives in [`crate::html`].

use std::collections::BTreeMap;

use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

use crate::html::{html_to_text, looks_like_html};
use crate::models::AttachmentInfo;
use crate::text::strip_envelope_artifacts;

/// Best-effort envelope headers; any field may be absent
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Parsed Date header
    pub date: Option<String>,
    /// Parsed From header
    pub from: Option<String>,
    /// Parsed To header
    pub to: Option<String>,
    /// Parsed Subject header
    pub subject: Option<String>,
}

/// One fetched message, constructed per fetch call and never cached
///
/// `raw_source` is present only when the full source was fetched;
/// `body_parts` maps IMAP section labels (`TEXT`, `HEADER`, `1`, `1.1`) to
/// raw section bytes for servers that only returned sections.
#[derive(Debug, Default)]
pub struct FetchedMessage {
    /// Server-assigned UID within the mailbox
    pub uid: u32,
    /// Envelope headers
    pub envelope: Envelope,
    /// Full RFC822 source, if fetched
    pub raw_source: Option<Vec<u8>>,
    /// Section label to raw content
    pub body_parts: BTreeMap<String, Vec<u8>>,
}

/// Resolve the readable text representation of a message
///
/// Returns `None` when the message carries neither a raw source nor body
/// sections (not fetchable), and `Some(String::new())` when the message
/// exists but has no textual content. Output is pre-normalization; callers
/// run [`crate::text::normalize`] on it.
pub fn resolve_text(message: &FetchedMessage) -> Option<String> {
    if let Some(raw) = &message.raw_source {
        return Some(resolve_from_raw(raw));
    }
    if !message.body_parts.is_empty() {
        return Some(match labeled_content(&message.body_parts) {
            Some(content) => resolve_labeled(content),
            // Only HEADER sections came back; the message has no body text.
            None => String::new(),
        });
    }
    None
}

/// Resolve from a full RFC822 source
fn resolve_from_raw(raw: &[u8]) -> String {
    let Ok(parsed) = mailparse::parse_mail(raw) else {
        // Unparseable source: sniff the lossy text directly.
        let lossy = String::from_utf8_lossy(raw);
        return if looks_like_html(&lossy) {
            html_to_text(&lossy)
        } else {
            lossy.into_owned()
        };
    };

    let mut plain = None;
    let mut html = None;
    collect_bodies(&parsed, &mut plain, &mut html);

    if let Some(text) = plain {
        return text;
    }
    if let Some(markup) = html {
        return html_to_text(&markup);
    }
    String::new()
}

/// Walk the part tree for the first plain and first HTML body
///
/// Attachment parts never contribute body text regardless of their type.
fn collect_bodies(part: &ParsedMail<'_>, plain: &mut Option<String>, html: &mut Option<String>) {
    if part.subparts.is_empty() {
        let disp = part.get_content_disposition();
        if disp.disposition == DispositionType::Attachment {
            return;
        }

        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        if ctype == "text/plain"
            && plain.is_none()
            && let Ok(text) = part.get_body()
        {
            *plain = Some(text);
        }
        if ctype == "text/html"
            && html.is_none()
            && let Ok(markup) = part.get_body()
        {
            *html = Some(markup);
        }
        return;
    }

    for sub in &part.subparts {
        collect_bodies(sub, plain, html);
    }
}

/// Pick the body content from labeled sections: `TEXT` first, then any
/// label that is not `HEADER`
fn labeled_content(parts: &BTreeMap<String, Vec<u8>>) -> Option<&[u8]> {
    if let Some(content) = parts.get("TEXT") {
        return Some(content);
    }
    parts
        .iter()
        .find(|(label, _)| label.as_str() != "HEADER")
        .map(|(_, content)| content.as_slice())
}

/// Resolve a raw section body, sniffing for HTML
fn resolve_labeled(content: &[u8]) -> String {
    let text = String::from_utf8_lossy(content);
    let text = strip_envelope_artifacts(&text);
    if looks_like_html(&text) {
        html_to_text(&text)
    } else {
        text
    }
}

/// Parse best-effort envelope headers from a raw source or header section
pub fn envelope_from_header_bytes(raw: &[u8]) -> Envelope {
    match mailparse::parse_headers(raw) {
        Ok((headers, _)) => Envelope {
            date: headers.get_first_value("Date"),
            from: headers.get_first_value("From"),
            to: headers.get_first_value("To"),
            subject: headers.get_first_value("Subject"),
        },
        Err(_) => Envelope::default(),
    }
}

/// Parse an RFC2822 Date header into epoch seconds for sorting
pub fn envelope_timestamp(date: &str) -> Option<i64> {
    mailparse::dateparse(date).ok()
}

/// Enumerate attachments from a message source
///
/// A node is an attachment only when its disposition says so. Filenames
/// fall back from disposition params to content-type params to the literal
/// `unknown`. Sizes reflect the decoded payload; the payload itself is not
/// returned.
pub fn enumerate_attachments(raw: &[u8]) -> Vec<AttachmentInfo> {
    let Ok(parsed) = mailparse::parse_mail(raw) else {
        return Vec::new();
    };
    let mut attachments = Vec::new();
    walk_attachments(&parsed, "1".to_owned(), &mut attachments);
    attachments
}

/// Walk the structure tree recursively recording attachment nodes
fn walk_attachments(part: &ParsedMail<'_>, part_id: String, out: &mut Vec<AttachmentInfo>) {
    if part.subparts.is_empty() {
        let disp = part.get_content_disposition();
        if disp.disposition == DispositionType::Attachment {
            let filename = disp
                .params
                .get("filename")
                .cloned()
                .or_else(|| part.ctype.params.get("name").cloned())
                .unwrap_or_else(|| "unknown".to_owned());
            let content_type = if has_content_type_header(part) {
                part.ctype.mimetype.to_ascii_lowercase()
            } else {
                "application/octet-stream".to_owned()
            };
            let size_bytes = part.get_body_raw().map(|body| body.len()).unwrap_or(0);
            out.push(AttachmentInfo {
                filename,
                content_type,
                size_bytes,
                part_id,
            });
        }
        return;
    }

    for (idx, sub) in part.subparts.iter().enumerate() {
        walk_attachments(sub, format!("{part_id}.{}", idx + 1), out);
    }
}

fn has_content_type_header(part: &ParsedMail<'_>) -> bool {
    part.headers
        .iter()
        .any(|h| h.get_key().eq_ignore_ascii_case("content-type"))
}

/// Truncate string to maximum characters (Unicode-aware)
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
