//! HTML-to-text conversion for message bodies
//!
//! Turns marketing-grade HTML into readable plain text: block-level tags
//! become line breaks, list items become bullet lines, table cells become
//! tab-separated columns, links render as `label (url)`, and images as
//! `[image: alt]`. Script, style, and head content is dropped before any
//! tag stripping so none of it leaks into the output. Entity decoding runs
//! last, after tags are gone, so `&lt;b&gt;` stays literal text.
//!
//! Conversion never fails; malformed markup degrades to tag-stripped text.

use std::sync::OnceLock;

use regex::{Captures, Regex};

fn dropped_content_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<script\b[^>]*>.*?</script>|<style\b[^>]*>.*?</style>|<head\b[^>]*>.*?</head>|<!--.*?-->")
            .expect("valid regex")
    })
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a\b[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))[^>]*>(.*?)</a>"#)
            .expect("valid regex")
    })
}

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<img\b[^>]*>").expect("valid regex"))
}

fn image_alt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\balt\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).expect("valid regex")
    })
}

fn cell_close_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</t[dh]\s*>").expect("valid regex"))
}

fn row_close_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</tr\s*>").expect("valid regex"))
}

fn line_break_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<(?:br|hr)\b[^>]*>").expect("valid regex"))
}

fn list_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<li\b[^>]*>").expect("valid regex"))
}

fn block_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)</?(?:p|div|h[1-6]|ul|ol|table|thead|tbody|tfoot|blockquote|section|article|header|footer|pre|form)\b[^>]*>",
        )
        .expect("valid regex")
    })
}

fn any_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"))
}

fn named_entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"&([a-zA-Z]+);").expect("valid regex"))
}

fn numeric_entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"&#(?:[xX]([0-9a-fA-F]{1,6})|([0-9]{1,7}));").expect("valid regex")
    })
}

/// Convert an HTML body to plain text
///
/// Output is raw conversion; callers run [`crate::text::normalize`] on it.
pub fn html_to_text(html: &str) -> String {
    let text = dropped_content_re().replace_all(html, "");

    let text = link_re().replace_all(&text, |caps: &Captures<'_>| {
        let url = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map_or("", |m| m.as_str())
            .trim();
        let label = any_tag_re()
            .replace_all(caps.get(4).map_or("", |m| m.as_str()), "")
            .trim()
            .to_owned();
        render_link(&label, url)
    });

    let text = image_re().replace_all(&text, |caps: &Captures<'_>| {
        let alt = image_alt_re()
            .captures(caps.get(0).map_or("", |m| m.as_str()))
            .and_then(|alt| alt.get(1).or_else(|| alt.get(2)).or_else(|| alt.get(3)))
            .map(|m| m.as_str().trim().to_owned())
            .unwrap_or_default();
        if alt.is_empty() {
            "[image]".to_owned()
        } else {
            format!("[image: {alt}]")
        }
    });

    let text = cell_close_re().replace_all(&text, "\t");
    let text = row_close_re().replace_all(&text, "\n");
    let text = line_break_re().replace_all(&text, "\n");
    let text = list_item_re().replace_all(&text, "\n\u{2022} ");
    let text = block_tag_re().replace_all(&text, "\n");
    let text = any_tag_re().replace_all(&text, "");

    decode_entities(&text)
}

fn render_link(label: &str, url: &str) -> String {
    if label.is_empty() {
        return url.to_owned();
    }
    if url.is_empty() || url.starts_with('#') || label == url {
        return label.to_owned();
    }
    format!("{label} ({url})")
}

/// Decode HTML entities
///
/// Named entities cover the common set; numeric entities decode by
/// codepoint. Unknown or malformed entities pass through unchanged. Each
/// pass scans left to right without re-examining replacements, so escaped
/// sequences like `&amp;lt;` correctly yield the literal `&lt;`.
pub fn decode_entities(input: &str) -> String {
    let text = named_entity_re().replace_all(input, |caps: &Captures<'_>| {
        match named_entity(&caps[1]) {
            Some(decoded) => decoded.to_owned(),
            None => caps[0].to_owned(),
        }
    });

    numeric_entity_re()
        .replace_all(&text, |caps: &Captures<'_>| {
            let parsed = match (caps.get(1), caps.get(2)) {
                (Some(hex), _) => u32::from_str_radix(hex.as_str(), 16).ok(),
                (None, Some(dec)) => dec.as_str().parse::<u32>().ok(),
                _ => None,
            };
            match parsed.and_then(char::from_u32) {
                Some(ch) => ch.to_string(),
                None => caps[0].to_owned(),
            }
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<&'static str> {
    let decoded = match name {
        "nbsp" => " ",
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "copy" => "\u{00A9}",
        "reg" => "\u{00AE}",
        "trade" => "\u{2122}",
        "mdash" => "\u{2014}",
        "ndash" => "\u{2013}",
        "hellip" => "\u{2026}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201C}",
        "rdquo" => "\u{201D}",
        "bull" => "\u{2022}",
        "middot" => "\u{00B7}",
        "laquo" => "\u{00AB}",
        "raquo" => "\u{00BB}",
        "deg" => "\u{00B0}",
        "euro" => "\u{20AC}",
        "pound" => "\u{00A3}",
        "yen" => "\u{00A5}",
        "sect" => "\u{00A7}",
        "times" => "\u{00D7}",
        _ => return None,
    };
    Some(decoded)
}

/// Sniff whether body content is HTML rather than plain text
///
/// A cheap structural-tag check for content fetched without MIME type
/// information; deliberately not a parser.
pub fn looks_like_html(content: &str) -> bool {
    let probe: String = content
        .chars()
        .take(4096)
        .collect::<String>()
        .to_ascii_lowercase();
    [
        "<!doctype", "<html", "<body", "<div", "<p>", "<p ", "<br", "<table", "<span", "<a href",
        "<td", "<center",
    ]
    .iter()
    .any(|tag| probe.contains(tag))
}
