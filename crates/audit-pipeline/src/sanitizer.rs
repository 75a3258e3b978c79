//! Size ceiling and markup stripping
//!
//! A pure text transform. The output never exceeds the configured byte
//! ceiling and sanitizing an already-sanitized document changes nothing.
//!
//! Removed:
//! - `<script>`, `<style>` blocks (unterminated ones run to end of input)
//! - frames, objects, media and canvas elements with their content
//! - comments
//! - `style` and `on*` attributes
//! - `<link>` tags and `<meta>` tags other than charset/viewport

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use shared_types::ErrorKind;

use crate::config::SanitizeConfig;
use crate::error::PipelineError;
use crate::fetcher::FetchedDocument;

/// Appended after truncation so the parser sees a closed document
pub const CLOSING_TAGS: &str = "</body></html>";

/// Elements removed together with everything between their tags
const BLOCK_ELEMENTS: &[&str] = &[
    "script", "style", "iframe", "frameset", "object", "video", "audio", "canvas", "applet",
];

/// Elements whose content is raw text; an unterminated one swallows the rest of the input
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// Void or stray tags removed on their own
const VOID_ELEMENTS: &[&str] = &["embed", "frame", "source", "track", "param"];

lazy_static! {
    static ref COMMENT: Regex = Regex::new(r"(?s)<!--.*?-->").unwrap();
    static ref UNTERMINATED_COMMENT: Regex = Regex::new(r"(?s)<!--.*$").unwrap();
    static ref BLOCKS: Vec<Regex> = BLOCK_ELEMENTS
        .iter()
        .map(|name| Regex::new(&format!(r"(?is)<{name}\b[^>]*>.*?</{name}\s*>")).unwrap())
        .collect();
    static ref UNTERMINATED_RAW_TEXT: Vec<Regex> = RAW_TEXT_ELEMENTS
        .iter()
        .map(|name| Regex::new(&format!(r"(?is)<{name}\b.*$")).unwrap())
        .collect();
    static ref STRAY_TAGS: Regex = {
        let names: Vec<&str> = BLOCK_ELEMENTS.iter().chain(VOID_ELEMENTS).copied().collect();
        Regex::new(&format!(r"(?i)</?(?:{})\b[^>]*>", names.join("|"))).unwrap()
    };
    static ref LINK: Regex = Regex::new(r"(?i)<link\b[^>]*>").unwrap();
    static ref META: Regex = Regex::new(r"(?i)<meta\b[^>]*>").unwrap();
    static ref ESSENTIAL_META: Regex =
        Regex::new(r#"(?i)\bcharset\s*=|\bname\s*=\s*["']?viewport\b"#).unwrap();
    /// An opening tag; quoted attribute values may contain `>`
    static ref OPEN_TAG: Regex =
        Regex::new(r#"<[a-zA-Z](?:"[^"]*"|'[^']*'|[^'">])*>"#).unwrap();
    /// One attribute with its leading separator; the tag name matches too and is kept
    static ref ATTRIBUTE: Regex = Regex::new(
        r#"[\s/]*([^\s"'<>/=]+)(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'<>]+))?"#
    )
    .unwrap();
    static ref RAW_TEXT_OPEN: Vec<(Regex, Regex)> = RAW_TEXT_ELEMENTS
        .iter()
        .map(|name| {
            (
                Regex::new(&format!(r"(?i)<{name}\b")).unwrap(),
                Regex::new(&format!(r"(?i)</{name}\s*>")).unwrap(),
            )
        })
        .collect();
}

/// Markup ready for the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedDocument {
    pub markup: String,
    /// True if the input was cut to fit the ceiling
    pub truncated: bool,
    pub original_bytes: usize,
    pub sanitized_bytes: usize,
}

/// Decode a fetched body into text, refusing empty or binary payloads
pub fn decode_body(document: &FetchedDocument) -> Result<String, PipelineError> {
    if let Some(content_type) = &document.content_type {
        if !is_textual(content_type) {
            return Err(PipelineError::new(
                ErrorKind::InvalidContent,
                format!("Expected an HTML document, got '{}'", content_type),
            )
            .with_details(content_type.clone()));
        }
    }

    let sniff = &document.body[..document.body.len().min(1024)];
    if sniff.contains(&0) {
        return Err(PipelineError::new(
            ErrorKind::InvalidContent,
            "Response body is binary, not text",
        ));
    }

    let text = String::from_utf8_lossy(&document.body).into_owned();
    if text.trim().is_empty() {
        return Err(PipelineError::new(
            ErrorKind::InvalidContent,
            "Response body is empty",
        ));
    }
    Ok(text)
}

fn is_textual(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime.is_empty() || mime.starts_with("text/") || mime.contains("html") || mime.contains("xml")
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    max_html_bytes: usize,
}

impl Sanitizer {
    pub fn new(config: &SanitizeConfig) -> Self {
        Self {
            max_html_bytes: config.max_html_bytes.max(CLOSING_TAGS.len()),
        }
    }

    pub fn max_html_bytes(&self) -> usize {
        self.max_html_bytes
    }

    /// Enforce the size ceiling, then strip high-risk and high-cost markup
    pub fn sanitize(&self, raw: &str) -> Result<SanitizedDocument, PipelineError> {
        if raw.trim().is_empty() {
            return Err(PipelineError::new(
                ErrorKind::InvalidContent,
                "Document is empty",
            ));
        }

        let original_bytes = raw.len();
        let truncated = original_bytes > self.max_html_bytes;
        let bounded = if truncated {
            truncate_markup(raw, self.max_html_bytes)
        } else {
            raw.to_string()
        };

        let markup = strip_to_fixpoint(bounded);
        if markup.trim().is_empty() {
            return Err(PipelineError::new(
                ErrorKind::InvalidContent,
                "Document has no content left after sanitizing",
            ));
        }

        Ok(SanitizedDocument {
            sanitized_bytes: markup.len(),
            markup,
            truncated,
            original_bytes,
        })
    }
}

/// Cut to fit `max_bytes` including the closing tags
///
/// The cut never lands inside a tag, a comment or a raw-text element.
pub fn truncate_markup(raw: &str, max_bytes: usize) -> String {
    let budget = max_bytes.saturating_sub(CLOSING_TAGS.len());
    let mut cut = budget.min(raw.len());
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut head = &raw[..cut];
    loop {
        let before = head.len();
        head = trim_open_tag(head);
        head = trim_open_comment(head);
        head = trim_open_raw_text(head);
        if head.len() == before {
            break;
        }
    }

    let mut out = String::with_capacity(head.len() + CLOSING_TAGS.len());
    out.push_str(head);
    out.push_str(CLOSING_TAGS);
    out
}

fn trim_open_tag(head: &str) -> &str {
    match head.rfind('<') {
        Some(lt) if !head[lt..].contains('>') => &head[..lt],
        _ => head,
    }
}

fn trim_open_comment(head: &str) -> &str {
    match head.rfind("<!--") {
        Some(start) if !head[start..].contains("-->") => &head[..start],
        _ => head,
    }
}

fn trim_open_raw_text(head: &str) -> &str {
    let mut cut = head.len();
    for (open, close) in RAW_TEXT_OPEN.iter() {
        let last_open = open.find_iter(head).last().map(|m| m.start());
        let last_close = close.find_iter(head).last().map(|m| m.start());
        if let Some(start) = last_open {
            if last_close.map_or(true, |end| end < start) {
                cut = cut.min(start);
            }
        }
    }
    &head[..cut]
}

/// Apply [`strip_once`] until the text stops changing
///
/// Every changing pass removes bytes, so this terminates.
fn strip_to_fixpoint(mut markup: String) -> String {
    loop {
        let next = strip_once(&markup);
        if next == markup {
            return next;
        }
        markup = next;
    }
}

fn strip_once(input: &str) -> String {
    let mut out = COMMENT.replace_all(input, "").into_owned();
    out = UNTERMINATED_COMMENT.replace_all(&out, "").into_owned();

    for block in BLOCKS.iter() {
        out = block.replace_all(&out, "").into_owned();
    }
    for raw_text in UNTERMINATED_RAW_TEXT.iter() {
        out = raw_text.replace_all(&out, "").into_owned();
    }
    out = STRAY_TAGS.replace_all(&out, "").into_owned();

    out = LINK.replace_all(&out, "").into_owned();
    out = META
        .replace_all(&out, |caps: &Captures| {
            let tag = &caps[0];
            if ESSENTIAL_META.is_match(tag) {
                tag.to_string()
            } else {
                String::new()
            }
        })
        .into_owned();

    OPEN_TAG
        .replace_all(&out, |caps: &Captures| strip_risky_attributes(&caps[0]))
        .into_owned()
}

/// Drop event handlers and inline styles from one opening tag
fn strip_risky_attributes(tag: &str) -> String {
    ATTRIBUTE
        .replace_all(tag, |caps: &Captures| {
            let name = caps[1].to_ascii_lowercase();
            if name.starts_with("on") || name == "style" {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}
