//! Plain-text cleanup for resolved message bodies
//!
//! [`normalize`] runs an ordered pipeline over resolved body text: tracking
//! and bare URLs go first, then invisible characters, then whitespace
//! shaping. Each step assumes the previous step's output, and the whole
//! pipeline is idempotent. URLs rendered as `label (url)` by the HTML
//! converter survive because only whitespace-led URLs are treated as bare.
//!
//! [`strip_envelope_artifacts`] handles MIME envelope lines (boundaries,
//! `Content-Type:` headers) that leak into body text when a server returns
//! a raw `TEXT` section instead of a decoded part.

use std::sync::OnceLock;

use regex::Regex;

fn bracketed_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[https?://[^\]\s]*\]").expect("valid regex"))
}

fn url_only_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*https?://\S+[ \t]*$").expect("valid regex"))
}

fn inline_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?P<lead>^|\s)https?://\S+").expect("valid regex"))
}

fn blank_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]+$").expect("valid regex"))
}

fn newline_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
}

fn space_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]+").expect("valid regex"))
}

fn line_edge_space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]+|[ \t]+$").expect("valid regex"))
}

fn boundary_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^--[^\s]+(?:--)?[ \t]*$").expect("valid regex"))
}

fn envelope_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?mi)^(?:Content-Type|Content-Transfer-Encoding|Content-Disposition|MIME-Version):[^\n]*$|^[ \t]+[a-z0-9_-]+=(?:"[^"\n]*"|[^\s;]+);?[ \t]*$"#,
        )
        .expect("valid regex")
    })
}

/// Characters that are invisible in rendered text
///
/// Zero-width space/joiners, the BOM, and the combining grapheme joiner.
const INVISIBLE: [char; 5] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}', '\u{034F}'];

/// Clean resolved body text for human consumption
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(input: &str) -> String {
    let text = input.replace("\r\n", "\n").replace('\r', "\n");
    let text = text.trim();
    let text = bracketed_url_re().replace_all(text, "");
    let text = url_only_line_re().replace_all(&text, "");
    let text = inline_url_re().replace_all(&text, "$lead");
    let text: String = text.chars().filter(|c| !INVISIBLE.contains(c)).collect();
    let text = blank_line_re().replace_all(&text, "");
    let text = newline_run_re().replace_all(&text, "\n\n");
    let text = space_run_re().replace_all(&text, " ");
    let text = line_edge_space_re().replace_all(&text, "");
    text.trim().to_owned()
}

/// Drop MIME envelope lines that leaked into a body section
///
/// Applied to content recovered from raw `TEXT` sections before
/// [`normalize`]; boundary delimiters and `Content-*` header lines carry no
/// readable text.
pub fn strip_envelope_artifacts(input: &str) -> String {
    let text = boundary_line_re().replace_all(input, "");
    envelope_header_re().replace_all(&text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::{normalize, strip_envelope_artifacts};

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            "  Hello\u{200B} world  \n\n\n\nhttp://track.example/pixel\nbye ",
            "[https://u.example/c?id=1]Sale!\n\n\nLine with https://x.example inline",
            "plain text, nothing to do",
            "",
            "Click here (http://ad.example/x)",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn bracket_wrapped_urls_are_removed_entirely() {
        assert_eq!(normalize("before [http://t.example/abc] after"), "before after");
    }

    #[test]
    fn url_only_lines_disappear() {
        let input = "first paragraph\n\nhttps://unsubscribe.example/very/long/path\n\nsecond";
        assert_eq!(normalize(input), "first paragraph\n\nsecond");
    }

    #[test]
    fn inline_urls_vanish_but_words_remain() {
        assert_eq!(normalize("See http://x.com for more"), "See for more");
    }

    #[test]
    fn parenthesized_link_targets_survive() {
        // The HTML converter renders links as `label (url)`; those stay.
        let input = "Special offer! Click here (http://ad.example/x)";
        assert_eq!(normalize(input), input);
    }

    #[test]
    fn zero_width_characters_are_stripped_without_touching_visible_text() {
        assert_eq!(normalize("he\u{200B}llo"), "hello");
        assert_eq!(normalize("a\u{200C}b\u{200D}c\u{FEFF}d\u{034F}e"), "abcde");
    }

    #[test]
    fn paragraph_breaks_survive_newline_collapsing() {
        assert_eq!(normalize("A\n\n\n\n\nB"), "A\n\nB");
        assert_eq!(normalize("A\nB"), "A\nB");
    }

    #[test]
    fn carriage_returns_are_unified() {
        assert_eq!(normalize("Hello\r\n\r\nWorld\r\n"), "Hello\n\nWorld");
    }

    #[test]
    fn space_runs_collapse_and_line_edges_are_trimmed() {
        assert_eq!(normalize("a   b\t\tc  \n   d"), "a b c\nd");
    }

    #[test]
    fn whitespace_only_lines_become_empty_without_losing_breaks() {
        assert_eq!(normalize("A\n   \nB"), "A\n\nB");
    }

    #[test]
    fn envelope_artifacts_are_dropped() {
        let input = concat!(
            "--=_Part_12345\n",
            "Content-Type: text/plain;\n",
            "  charset=\"utf-8\"\n",
            "Content-Transfer-Encoding: quoted-printable\n",
            "\n",
            "Actual body\n",
            "--=_Part_12345--\n",
        );
        let cleaned = normalize(&strip_envelope_artifacts(input));
        assert_eq!(cleaned, "Actual body");
    }
}
