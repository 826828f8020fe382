//! Markup detection and extraction
//!
//! Everything here is a heuristic. It decides how a result is *presented*
//! and never whether content is safe to render verbatim.

use once_cell::sync::Lazy;
use regex::Regex;

/// Patterns searched in the (case-folded) snippet source
static SOURCE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"<html[^>]*>",
        r"<body[^>]*>",
        r"<div[^>]*>",
        r"<h[1-6][^>]*>",
        r"<p[^>]*>",
        r"<style[^>]*>",
        r"<!doctype",
        r#"print\s*\(\s*["']<.*?["']"#,
        r#"f["']<.*?["']"#,
        r#"(?s)""".*?<.*?""""#,
        r"(?s)'''.*?<.*?'''",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("static regex"))
    .collect()
});

/// Any tag at all in the captured output
static OUTPUT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("static regex"));

/// Where an embedded document starts
static DOCUMENT_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<!DOCTYPE|<html|<div|<style").expect("static regex"));

const WRAPPER_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Sandbox Output</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        .output { background-color: #f5f5f5; padding: 15px; border-radius: 5px; }
    </style>
</head>
<body>
    <div class="output">
        <pre>"#;

const WRAPPER_TAIL: &str = r"</pre>
    </div>
</body>
</html>";

/// Whether the snippet appears to generate markup.
///
/// Checks the source for document-level tags and markup-building idioms
/// first, then the output for any tag. Pass an empty `output` to classify a
/// saved snippet without running it.
#[must_use]
pub fn looks_like_markup(source: &str, output: &str) -> bool {
    SOURCE_PATTERNS.iter().any(|re| re.is_match(source)) || OUTPUT_TAG.is_match(output)
}

/// Turn captured output into a standalone document.
///
/// Returns everything from the first document-level tag on, or, when there
/// is none, the escaped text wrapped in a small styled page. Blank output
/// yields `None`.
#[must_use]
pub fn extract(output: &str) -> Option<String> {
    if let Some(start) = DOCUMENT_START.find(output) {
        let document = output[start.start()..].trim();
        return Some(document.to_owned());
    }

    if output.trim().is_empty() {
        return None;
    }

    let escaped = escape(output);
    let mut document =
        String::with_capacity(WRAPPER_HEAD.len() + escaped.len() + WRAPPER_TAIL.len());
    document.push_str(WRAPPER_HEAD);
    document.push_str(&escaped);
    document.push_str(WRAPPER_TAIL);
    Some(document)
}

/// Minimal HTML escaping for text placed inside `<pre>`
fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
